//! Incremental indexing of filesystem trees into a [`ContentStore`]
//!
//! Each walked file goes `Unvisited → Matched → SkippedUnchanged | Hashed`.
//! Hashing is the expensive step, so a file whose size and modification time
//! match the baseline store reuses the baseline checksum.

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::hash::ChecksumKey;
use crate::pattern::{Pattern, PatternMatcher};
use crate::store::{ContentLocation, ContentStore};

/// Walker behaviour switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOptions {
    /// Honour `.gitignore`, `.ignore` and git excludes on top of the patterns
    pub git_ignore: bool,
    /// Follow symbolic links
    pub follow_links: bool,
    /// Rehash baseline hits and report entries whose stored checksum is wrong
    pub verify_unchanged: bool,
}

/// What happened to one matched file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    SkippedUnchanged,
    Hashed,
}

/// Why an entry is missing from the resulting store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The file or directory could not be read
    Unreadable(String),
    /// A fresh hash disagreed with the baseline checksum
    ChecksumMismatch {
        expected: ChecksumKey,
        actual: ChecksumKey,
    },
}

/// A per-entry failure; the rest of the walk carries on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFailure {
    pub path: PathBuf,
    pub kind: FailureKind,
}

impl std::fmt::Display for EntryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            FailureKind::Unreadable(reason) => write!(f, "{}: {reason}", self.path.display()),
            FailureKind::ChecksumMismatch { expected, actual } => write!(
                f,
                "{}: checksum mismatch (expected {expected}, got {actual})",
                self.path.display()
            ),
        }
    }
}

/// Counters for one index run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    /// Files seen by the walker
    pub visited: u64,
    /// Files rejected by the patterns
    pub excluded: u64,
    /// Files whose checksum was copied from the baseline
    pub skipped_unchanged: u64,
    /// Files whose checksum was computed
    pub hashed: u64,
    /// Entries that ended up in `failures`
    pub failed: u64,
    /// Bytes read for hashing
    pub bytes_hashed: u64,
}

/// Result of an index run: a best-effort store plus what went wrong
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub store: ContentStore,
    pub failures: Vec<EntryFailure>,
    pub stats: IndexStats,
}

impl IndexReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Walks configured roots and produces content stores
#[derive(Debug, Clone)]
pub struct IndexAgent {
    device: String,
    roots: Vec<PathBuf>,
    options: IndexOptions,
}

impl IndexAgent {
    /// Create an agent that records locations under `device`
    #[must_use]
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            roots: Vec::new(),
            options: IndexOptions::default(),
        }
    }

    /// Add a root directory to walk
    #[must_use]
    pub fn root(mut self, path: impl Into<PathBuf>) -> Self {
        self.roots.push(path.into());
        self
    }

    #[must_use]
    pub fn options(mut self, options: IndexOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }

    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Index with an uncompiled pattern list
    ///
    /// # Errors
    /// Returns a configuration error for a bad pattern or a missing root
    pub fn index(&self, patterns: &[Pattern], baseline: &ContentStore) -> Result<IndexReport> {
        let matcher = PatternMatcher::from_patterns(patterns)?;
        self.index_with(&matcher, baseline)
    }

    /// Index every matched file under the roots.
    ///
    /// # Errors
    /// Returns a configuration error if there are no roots or a root is not
    /// a readable directory. Per-file problems land in the report instead.
    pub fn index_with(&self, matcher: &PatternMatcher, baseline: &ContentStore) -> Result<IndexReport> {
        let roots = self.resolved_roots()?;
        let mut report = IndexReport::default();

        for root in &roots {
            self.index_root(root, matcher, baseline, &mut report);
        }

        let stats = &report.stats;
        info!(
            "Indexed {} files on {}: {} hashed, {} unchanged, {} excluded, {} failed",
            stats.visited - stats.excluded,
            self.device,
            stats.hashed,
            stats.skipped_unchanged,
            stats.excluded,
            stats.failed
        );
        Ok(report)
    }

    /// List matched files without hashing anything
    ///
    /// # Errors
    /// Returns a configuration error if a root is missing
    pub fn matched_paths(&self, matcher: &PatternMatcher) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for root in self.resolved_roots()? {
            for entry in self.walk_builder(&root).build().flatten() {
                if !entry.file_type().is_some_and(|t| t.is_file()) {
                    continue;
                }
                if let Ok(relative) = entry.path().strip_prefix(&root) {
                    if matcher.matches(relative) {
                        paths.push(entry.path().to_path_buf());
                    }
                }
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn resolved_roots(&self) -> Result<Vec<PathBuf>> {
        if self.roots.is_empty() {
            return Err(Error::config("no root directories configured"));
        }

        self.roots
            .iter()
            .map(|root| {
                let canonical = std::fs::canonicalize(root).map_err(|e| {
                    Error::config(format!("root {} is not accessible: {e}", root.display()))
                })?;
                if !canonical.is_dir() {
                    return Err(Error::config(format!(
                        "root {} is not a directory",
                        root.display()
                    )));
                }
                Ok(canonical)
            })
            .collect()
    }

    fn walk_builder(&self, root: &Path) -> WalkBuilder {
        let git_ignore = self.options.git_ignore;
        let mut builder = WalkBuilder::new(root);
        builder
            .standard_filters(false)
            .hidden(false)
            .git_ignore(git_ignore)
            .git_global(git_ignore)
            .git_exclude(git_ignore)
            .ignore(git_ignore)
            .require_git(false)
            .follow_links(self.options.follow_links)
            .sort_by_file_name(|a, b| a.cmp(b));

        if git_ignore {
            builder.filter_entry(|e| e.file_name() != ".git");
        }

        builder
    }

    fn index_root(
        &self,
        root: &Path,
        matcher: &PatternMatcher,
        baseline: &ContentStore,
        report: &mut IndexReport,
    ) {
        debug!("Walking {}", root.display());

        for result in self.walk_builder(root).build() {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    let path = error_path(&e).unwrap_or(root).to_path_buf();
                    warn!("Skipping {}: {e}", path.display());
                    fail(report, path, FailureKind::Unreadable(e.to_string()));
                    continue;
                }
            };

            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }

            report.stats.visited += 1;
            let path = entry.path();
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };

            if !matcher.matches(relative) {
                trace!("Excluded {}", relative.display());
                report.stats.excluded += 1;
                continue;
            }

            match self.index_file(path, baseline) {
                Ok((key, location, outcome)) => {
                    match outcome {
                        EntryOutcome::SkippedUnchanged => report.stats.skipped_unchanged += 1,
                        EntryOutcome::Hashed => {
                            report.stats.hashed += 1;
                            report.stats.bytes_hashed += location.size;
                        }
                    }
                    trace!("{outcome:?} {} -> {key}", relative.display());
                    report.store.record(key, location);
                }
                Err(kind) => {
                    warn!("Skipping {}: {kind:?}", path.display());
                    fail(report, path.to_path_buf(), kind);
                }
            }
        }
    }

    /// Checksum one matched file, reusing the baseline when metadata agrees
    fn index_file(
        &self,
        path: &Path,
        baseline: &ContentStore,
    ) -> Result<(ChecksumKey, ContentLocation, EntryOutcome), FailureKind> {
        let unreadable = |e: std::io::Error| FailureKind::Unreadable(e.to_string());

        let metadata = std::fs::metadata(path).map_err(unreadable)?;
        let location =
            ContentLocation::from_metadata(&self.device, path, &metadata).map_err(unreadable)?;

        let previous = baseline
            .lookup(&self.device, path)
            .filter(|(_, old)| old.unchanged(location.size, location.modified))
            .map(|(key, _)| *key);

        match previous {
            Some(expected) if self.options.verify_unchanged => {
                let actual = ChecksumKey::from_file(path).map_err(unreadable)?;
                if actual != expected {
                    return Err(FailureKind::ChecksumMismatch { expected, actual });
                }
                Ok((expected, location, EntryOutcome::SkippedUnchanged))
            }
            Some(expected) => Ok((expected, location, EntryOutcome::SkippedUnchanged)),
            None => {
                let key = ChecksumKey::from_file(path).map_err(unreadable)?;
                Ok((key, location, EntryOutcome::Hashed))
            }
        }
    }
}

fn fail(report: &mut IndexReport, path: PathBuf, kind: FailureKind) {
    report.stats.failed += 1;
    report.failures.push(EntryFailure { path, kind });
}

/// Dig the offending path out of a walker error, if it carries one
fn error_path(err: &ignore::Error) -> Option<&Path> {
    match err {
        ignore::Error::WithPath { path, .. } => Some(path.as_path()),
        ignore::Error::WithDepth { err, .. } | ignore::Error::WithLineNumber { err, .. } => {
            error_path(err)
        }
        ignore::Error::Partial(errs) => errs.iter().find_map(error_path),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, UNIX_EPOCH};

    use filetime::FileTime;
    use tempfile::TempDir;

    fn everything() -> Vec<Pattern> {
        vec![Pattern::include("**/*")]
    }

    fn agent(dir: &TempDir) -> IndexAgent {
        IndexAgent::new("test-device").root(dir.path())
    }

    fn abs(dir: &TempDir, rel: &str) -> PathBuf {
        fs::canonicalize(dir.path()).unwrap().join(rel)
    }

    #[test]
    fn test_index_simple_directory() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("file1.txt"), "hello").unwrap();
        fs::create_dir_all(dir.path().join("sub/dir")).unwrap();
        fs::write(dir.path().join("sub/dir/deep.txt"), "deep").unwrap();

        let report = agent(&dir).index(&everything(), &ContentStore::new()).unwrap();

        assert!(report.is_complete());
        assert_eq!(report.stats.hashed, 2);
        assert_eq!(report.store.location_count(), 2);
        assert!(report.store.content_exists(&ChecksumKey::from_bytes(b"hello")));
        let (key, location) = report
            .store
            .lookup("test-device", &abs(&dir, "sub/dir/deep.txt"))
            .unwrap();
        assert_eq!(*key, ChecksumKey::from_bytes(b"deep"));
        assert_eq!(location.size, 4);
    }

    #[test]
    fn test_index_large_repeated_content() {
        let dir = TempDir::new().unwrap();
        let content = b"abagadavaza".repeat(100_000);
        fs::write(dir.path().join("big.txt"), &content).unwrap();

        let report = agent(&dir).index(&everything(), &ContentStore::new()).unwrap();
        let (key, _) = report
            .store
            .lookup("test-device", &abs(&dir, "big.txt"))
            .unwrap();

        assert_eq!(*key, ChecksumKey::from_bytes(&content));
        assert_eq!(report.stats.bytes_hashed, content.len() as u64);
    }

    #[test]
    fn test_exclude_headers() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("main.c"), "int main() {}").unwrap();
        fs::write(dir.path().join("main.h"), "int main();").unwrap();

        let patterns = vec![Pattern::include("**/*"), Pattern::exclude("**/*.h")];
        let report = agent(&dir).index(&patterns, &ContentStore::new()).unwrap();

        assert!(report.store.lookup("test-device", &abs(&dir, "main.c")).is_some());
        assert!(report.store.lookup("test-device", &abs(&dir, "main.h")).is_none());
        assert_eq!(report.stats.excluded, 1);
        assert_eq!(report.stats.visited, 2);
    }

    #[test]
    fn test_identical_files_share_a_checksum() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "same bytes").unwrap();
        fs::write(dir.path().join("b.txt"), "same bytes").unwrap();

        let report = agent(&dir).index(&everything(), &ContentStore::new()).unwrap();
        assert_eq!(report.store.len(), 1);
        assert_eq!(report.store.location_count(), 2);
    }

    #[test]
    fn test_reindex_unchanged_tree_hashes_nothing() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/b.txt"), "beta").unwrap();

        let agent = agent(&dir);
        let first = agent.index(&everything(), &ContentStore::new()).unwrap();
        assert_eq!(first.stats.hashed, 2);

        let second = agent.index(&everything(), &first.store).unwrap();
        assert_eq!(second.stats.hashed, 0);
        assert_eq!(second.stats.skipped_unchanged, 2);
        assert_eq!(second.store, first.store);
    }

    #[test]
    fn test_changed_mtime_triggers_rehash() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "alpha").unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();

        let agent = agent(&dir);
        let first = agent.index(&everything(), &ContentStore::new()).unwrap();

        fs::write(&path, "omega").unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(1_700_000_000, 0)).unwrap();

        let second = agent.index(&everything(), &first.store).unwrap();
        assert_eq!(second.stats.hashed, 1);
        assert!(second.store.content_exists(&ChecksumKey::from_bytes(b"omega")));
        assert!(!second.store.content_exists(&ChecksumKey::from_bytes(b"alpha")));
    }

    #[test]
    fn test_baseline_is_trusted_without_verification() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "real").unwrap();
        let mtime = UNIX_EPOCH + Duration::from_secs(1_650_000_000);
        filetime::set_file_mtime(&path, FileTime::from_system_time(mtime)).unwrap();

        let canonical = abs(&dir, "a.txt");
        let stale = ChecksumKey::from_bytes(b"fake");
        let mut baseline = ContentStore::new();
        baseline.record(stale, ContentLocation::new("test-device", &canonical, 4, mtime));

        let report = agent(&dir).index(&everything(), &baseline).unwrap();
        assert_eq!(report.stats.hashed, 0);
        assert_eq!(*report.store.lookup("test-device", &canonical).unwrap().0, stale);
    }

    #[test]
    fn test_verify_reports_checksum_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "real").unwrap();
        let mtime = UNIX_EPOCH + Duration::from_secs(1_650_000_000);
        filetime::set_file_mtime(&path, FileTime::from_system_time(mtime)).unwrap();

        let canonical = abs(&dir, "a.txt");
        let stale = ChecksumKey::from_bytes(b"fake");
        let mut baseline = ContentStore::new();
        baseline.record(stale, ContentLocation::new("test-device", &canonical, 4, mtime));

        let report = agent(&dir)
            .options(IndexOptions {
                verify_unchanged: true,
                ..IndexOptions::default()
            })
            .index(&everything(), &baseline)
            .unwrap();

        assert!(report.store.is_empty());
        assert_eq!(report.stats.failed, 1);
        assert_eq!(
            report.failures[0].kind,
            FailureKind::ChecksumMismatch {
                expected: stale,
                actual: ChecksumKey::from_bytes(b"real"),
            }
        );
    }

    #[test]
    fn test_baseline_from_other_device_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "alpha").unwrap();

        let first = IndexAgent::new("other")
            .root(dir.path())
            .index(&everything(), &ContentStore::new())
            .unwrap();
        let second = agent(&dir).index(&everything(), &first.store).unwrap();
        assert_eq!(second.stats.hashed, 1);
    }

    #[test]
    fn test_missing_root_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let missing = IndexAgent::new("d").root(dir.path().join("nope"));
        let err = missing.index(&everything(), &ContentStore::new()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)), "{err}");

        let no_roots = IndexAgent::new("d");
        assert!(no_roots.index(&everything(), &ContentStore::new()).is_err());
    }

    #[test]
    fn test_bad_pattern_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let err = agent(&dir)
            .index(&[Pattern::include("[")], &ContentStore::new())
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_file_is_skipped_not_fatal() {
        use std::os::unix::fs::PermissionsExt as _;

        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("ok.txt"), "fine").unwrap();
        let locked = dir.path().join("locked.txt");
        fs::write(&locked, "secret").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Root can read anything; nothing to assert in that case
        if fs::read(&locked).is_ok() {
            return;
        }

        let report = agent(&dir).index(&everything(), &ContentStore::new()).unwrap();
        assert!(report.store.content_exists(&ChecksumKey::from_bytes(b"fine")));
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].path.ends_with("locked.txt"));
        assert!(matches!(report.failures[0].kind, FailureKind::Unreadable(_)));
    }

    #[test]
    fn test_git_ignore_option() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".gitignore"), "*.log\n").unwrap();
        fs::write(dir.path().join("keep.txt"), "keep").unwrap();
        fs::write(dir.path().join("debug.log"), "noise").unwrap();

        let plain = agent(&dir).index(&everything(), &ContentStore::new()).unwrap();
        assert!(plain.store.lookup("test-device", &abs(&dir, "debug.log")).is_some());

        let with_git = agent(&dir)
            .options(IndexOptions {
                git_ignore: true,
                ..IndexOptions::default()
            })
            .index(&everything(), &ContentStore::new())
            .unwrap();
        assert!(with_git.store.lookup("test-device", &abs(&dir, "debug.log")).is_none());
        assert!(with_git.store.lookup("test-device", &abs(&dir, "keep.txt")).is_some());
    }

    #[test]
    fn test_matched_paths_dry_run() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();
        fs::write(dir.path().join("b.md"), "# b").unwrap();

        let matcher = PatternMatcher::from_patterns(&[Pattern::include("*.rs")]).unwrap();
        let paths = agent(&dir).matched_paths(&matcher).unwrap();
        assert_eq!(paths, vec![abs(&dir, "a.rs")]);
    }
}
