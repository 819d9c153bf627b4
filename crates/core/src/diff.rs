//! Comparing two content stores to decide what must be transferred

use crate::hash::ChecksumKey;
use crate::store::{ContentLocation, ContentStore};

/// Checksum-level differences between a local and a remote store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreDiff {
    /// Content only the local side has
    pub only_local: Vec<ChecksumKey>,
    /// Content only the remote side has
    pub only_remote: Vec<ChecksumKey>,
    /// Number of checksums both sides have
    pub shared: usize,
}

impl StoreDiff {
    /// Compare by checksum set; paths and metadata are irrelevant
    #[must_use]
    pub fn between(local: &ContentStore, remote: &ContentStore) -> Self {
        let only_local = local.missing_from(remote);
        let only_remote = remote.missing_from(local);
        let shared = local.len() - only_local.len();

        Self {
            only_local,
            only_remote,
            shared,
        }
    }

    /// Check if both sides hold the same content
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.only_local.is_empty() && self.only_remote.is_empty()
    }

    /// Number of checksums present on only one side
    #[must_use]
    pub fn len(&self) -> usize {
        self.only_local.len() + self.only_remote.len()
    }

    /// One local source file for every checksum the remote lacks.
    ///
    /// Each content is sent once even if it lives at several local paths.
    #[must_use]
    pub fn transfer_plan(&self, local: &ContentStore) -> Vec<(ChecksumKey, ContentLocation)> {
        self.only_local
            .iter()
            .filter_map(|key| {
                let source = local.locations(key)?.iter().next()?;
                Some((*key, source.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn entry(device: &str, path: &str, content: &[u8]) -> (ChecksumKey, ContentLocation) {
        (
            ChecksumKey::from_bytes(content),
            ContentLocation::new(
                device,
                path,
                content.len() as u64,
                UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            ),
        )
    }

    #[test]
    fn test_diff_ignores_paths() {
        let local: ContentStore = [entry("l", "/l/a.txt", b"a")].into_iter().collect();
        let remote: ContentStore = [entry("r", "/r/renamed.txt", b"a")].into_iter().collect();

        let diff = StoreDiff::between(&local, &remote);
        assert!(diff.is_empty());
        assert_eq!(diff.shared, 1);
    }

    #[test]
    fn test_diff_both_directions() {
        let local: ContentStore = [entry("l", "/l/a", b"a"), entry("l", "/l/b", b"b")]
            .into_iter()
            .collect();
        let remote: ContentStore = [entry("r", "/r/b", b"b"), entry("r", "/r/c", b"c")]
            .into_iter()
            .collect();

        let diff = StoreDiff::between(&local, &remote);
        assert_eq!(diff.only_local, vec![ChecksumKey::from_bytes(b"a")]);
        assert_eq!(diff.only_remote, vec![ChecksumKey::from_bytes(b"c")]);
        assert_eq!(diff.shared, 1);
        assert_eq!(diff.len(), 2);
    }

    #[test]
    fn test_transfer_plan_sends_duplicates_once() {
        let local: ContentStore = [
            entry("l", "/l/copy1", b"dup"),
            entry("l", "/l/copy2", b"dup"),
            entry("l", "/l/shared", b"shared"),
        ]
        .into_iter()
        .collect();
        let remote: ContentStore = [entry("r", "/r/shared", b"shared")].into_iter().collect();

        let plan = StoreDiff::between(&local, &remote).transfer_plan(&local);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].0, ChecksumKey::from_bytes(b"dup"));
        assert_eq!(plan[0].1.path, std::path::PathBuf::from("/l/copy1"));
    }
}
