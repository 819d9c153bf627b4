//! Content-addressed store: checksum → physical locations
//!
//! Wire format (all integers big-endian, `str` = `len:u32` + bytes):
//!
//! ```text
//! record_count: u32
//! for each record (ascending checksum order):
//!   checksum: [u8; 20]
//!   location_count: u32
//!   for each location:
//!     device: str
//!     path: str
//!     size: u64
//!     mtime_secs: i64
//!     mtime_nanos: u32
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::codec::{self, Decoder};
use crate::error::{Error, Result};
use crate::hash::ChecksumKey;

/// Where a piece of content physically lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentLocation {
    /// Host or device identifier
    pub device: String,
    /// Absolute path on that device
    pub path: PathBuf,
    /// File size in bytes
    pub size: u64,
    /// Last modification time
    pub modified: SystemTime,
}

impl ContentLocation {
    #[must_use]
    pub fn new(device: impl Into<String>, path: impl Into<PathBuf>, size: u64, modified: SystemTime) -> Self {
        Self {
            device: device.into(),
            path: path.into(),
            size,
            modified,
        }
    }

    /// Build a location from filesystem metadata
    ///
    /// # Errors
    /// Returns an error if the platform cannot report a modification time
    pub fn from_metadata(
        device: impl Into<String>,
        path: impl Into<PathBuf>,
        metadata: &std::fs::Metadata,
    ) -> std::io::Result<Self> {
        Ok(Self::new(device, path, metadata.len(), metadata.modified()?))
    }

    /// Whether `other` describes the same file with the same metadata
    #[must_use]
    pub fn unchanged(&self, size: u64, modified: SystemTime) -> bool {
        self.size == size && self.modified == modified
    }

    fn id(&self) -> LocationId {
        LocationId {
            device: self.device.clone(),
            path: self.path.clone(),
        }
    }
}

/// Identity of a physical location, ignoring its metadata
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LocationId {
    device: String,
    path: PathBuf,
}

/// Content-addressed index of checksums to locations.
///
/// Equality is structural over the checksum mapping.
#[derive(Debug, Clone, Default)]
pub struct ContentStore {
    entries: BTreeMap<ChecksumKey, BTreeSet<ContentLocation>>,
    by_location: HashMap<LocationId, (ChecksumKey, ContentLocation)>,
}

impl PartialEq for ContentStore {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for ContentStore {}

impl ContentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `location` under `checksum`.
    ///
    /// A location already known under another checksum, or with different
    /// metadata, is moved. Returns whether the store changed.
    pub fn record(&mut self, checksum: ChecksumKey, location: ContentLocation) -> bool {
        let id = location.id();
        if let Some((old_key, old_location)) = self.by_location.get(&id) {
            if *old_key == checksum && *old_location == location {
                return false;
            }
            let (old_key, old_location) = (*old_key, old_location.clone());
            self.detach(&old_key, &old_location);
        }

        self.entries
            .entry(checksum)
            .or_default()
            .insert(location.clone());
        self.by_location.insert(id, (checksum, location));
        true
    }

    /// Forget whatever is recorded at `(device, path)`
    pub fn remove(&mut self, device: &str, path: &Path) -> Option<(ChecksumKey, ContentLocation)> {
        let id = LocationId {
            device: device.to_string(),
            path: path.to_path_buf(),
        };
        let (key, location) = self.by_location.remove(&id)?;
        self.detach(&key, &location);
        Some((key, location))
    }

    fn detach(&mut self, key: &ChecksumKey, location: &ContentLocation) {
        if let Some(set) = self.entries.get_mut(key) {
            set.remove(location);
            if set.is_empty() {
                self.entries.remove(key);
            }
        }
        self.by_location.remove(&location.id());
    }

    #[must_use]
    pub fn content_exists(&self, checksum: &ChecksumKey) -> bool {
        self.entries.contains_key(checksum)
    }

    #[must_use]
    pub fn locations(&self, checksum: &ChecksumKey) -> Option<&BTreeSet<ContentLocation>> {
        self.entries.get(checksum)
    }

    /// Find what is recorded for a physical location
    #[must_use]
    pub fn lookup(&self, device: &str, path: &Path) -> Option<(&ChecksumKey, &ContentLocation)> {
        let id = LocationId {
            device: device.to_string(),
            path: path.to_path_buf(),
        };
        self.by_location.get(&id).map(|(key, location)| (key, location))
    }

    /// Union of both stores.
    ///
    /// Location sets under the same checksum are unioned. When the two sides
    /// record one location under different checksums or metadata, the entry
    /// with the greatest `(modified, size, checksum)` is kept, so the result
    /// does not depend on argument order.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        merged.merge_from(other);
        merged
    }

    /// In-place variant of [`merge`](Self::merge)
    pub fn merge_from(&mut self, other: &Self) {
        for (key, locations) in &other.entries {
            for location in locations {
                self.absorb(*key, location);
            }
        }
    }

    fn absorb(&mut self, key: ChecksumKey, location: &ContentLocation) {
        if let Some((existing_key, existing)) = self.by_location.get(&location.id()) {
            let incoming_rank = (location.modified, location.size, key);
            let existing_rank = (existing.modified, existing.size, *existing_key);
            if incoming_rank <= existing_rank {
                return;
            }
        }
        self.record(key, location.clone());
    }

    /// Checksums present here but absent from `other`
    #[must_use]
    pub fn missing_from(&self, other: &Self) -> Vec<ChecksumKey> {
        self.entries
            .keys()
            .filter(|key| !other.content_exists(key))
            .copied()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ChecksumKey, &BTreeSet<ContentLocation>)> {
        self.entries.iter()
    }

    pub fn checksums(&self) -> impl Iterator<Item = &ChecksumKey> {
        self.entries.keys()
    }

    /// Number of distinct checksums
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Number of recorded locations across all checksums
    #[must_use]
    pub fn location_count(&self) -> usize {
        self.by_location.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes across every recorded location
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.by_location.values().map(|(_, l)| l.size).sum()
    }

    /// Encode to the wire representation described in the module docs
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        use bytes::BufMut as _;

        buf.put_u32(self.entries.len() as u32);
        for (key, locations) in &self.entries {
            buf.put_slice(key.as_bytes());
            buf.put_u32(locations.len() as u32);
            for location in locations {
                codec::put_str(buf, &location.device);
                codec::put_path(buf, &location.path);
                buf.put_u64(location.size);
                codec::put_time(buf, location.modified);
            }
        }
    }

    /// Decode the wire representation
    ///
    /// # Errors
    /// Returns a protocol error on truncated, trailing or inconsistent input
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut decoder = Decoder::new(data);
        let store = Self::decode_from(&mut decoder)?;
        decoder.finish()?;
        Ok(store)
    }

    pub(crate) fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self> {
        let mut store = Self::new();
        let record_count = decoder.u32()?;

        for _ in 0..record_count {
            let key = decoder.checksum()?;
            let location_count = decoder.u32()?;
            if location_count == 0 {
                return Err(Error::protocol(format!("record {key} has no locations")));
            }
            for _ in 0..location_count {
                let device = decoder.string()?;
                let path = decoder.path()?;
                let size = decoder.u64()?;
                let modified = decoder.time()?;
                let location = ContentLocation {
                    device,
                    path,
                    size,
                    modified,
                };
                if store.lookup(&location.device, &location.path).is_some() {
                    return Err(Error::protocol(format!(
                        "location {}:{} recorded twice",
                        location.device,
                        location.path.display()
                    )));
                }
                store.record(key, location);
            }
        }

        Ok(store)
    }

    fn from_entries(entries: BTreeMap<ChecksumKey, BTreeSet<ContentLocation>>) -> Self {
        let mut store = Self::new();
        for (key, locations) in entries {
            for location in locations {
                store.record(key, location);
            }
        }
        store
    }
}

impl Serialize for ContentStore {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ContentStore {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        BTreeMap::deserialize(deserializer).map(Self::from_entries)
    }
}

impl FromIterator<(ChecksumKey, ContentLocation)> for ContentStore {
    fn from_iter<I: IntoIterator<Item = (ChecksumKey, ContentLocation)>>(iter: I) -> Self {
        let mut store = Self::new();
        for (key, location) in iter {
            store.record(key, location);
        }
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn loc(device: &str, path: &str, size: u64, secs: u64) -> ContentLocation {
        ContentLocation::new(device, path, size, at(secs))
    }

    fn key(data: &[u8]) -> ChecksumKey {
        ChecksumKey::from_bytes(data)
    }

    #[test]
    fn test_record_is_idempotent() {
        let mut once = ContentStore::new();
        assert!(once.record(key(b"a"), loc("d", "/x/a", 1, 10)));

        let mut twice = once.clone();
        assert!(!twice.record(key(b"a"), loc("d", "/x/a", 1, 10)));

        assert_eq!(once, twice);
        assert_eq!(twice.location_count(), 1);
    }

    #[test]
    fn test_deduplicates_identical_content() {
        let mut store = ContentStore::new();
        store.record(key(b"same"), loc("d", "/x/one", 4, 10));
        store.record(key(b"same"), loc("d", "/x/two", 4, 11));

        assert_eq!(store.len(), 1);
        assert_eq!(store.location_count(), 2);
        assert_eq!(store.locations(&key(b"same")).unwrap().len(), 2);
        assert!(store.content_exists(&key(b"same")));
        assert!(!store.content_exists(&key(b"other")));
    }

    #[test]
    fn test_location_lives_under_one_checksum() {
        let mut store = ContentStore::new();
        store.record(key(b"old"), loc("d", "/x/a", 3, 10));
        store.record(key(b"new"), loc("d", "/x/a", 3, 20));

        assert!(!store.content_exists(&key(b"old")));
        let (k, l) = store.lookup("d", Path::new("/x/a")).unwrap();
        assert_eq!(*k, key(b"new"));
        assert_eq!(l.modified, at(20));
        assert_eq!(store.location_count(), 1);
    }

    #[test]
    fn test_same_path_on_different_devices_is_distinct() {
        let mut store = ContentStore::new();
        store.record(key(b"a"), loc("laptop", "/x/a", 1, 10));
        store.record(key(b"b"), loc("server", "/x/a", 1, 10));
        assert_eq!(store.location_count(), 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_remove() {
        let mut store = ContentStore::new();
        store.record(key(b"a"), loc("d", "/x/a", 1, 10));
        let (k, _) = store.remove("d", Path::new("/x/a")).unwrap();
        assert_eq!(k, key(b"a"));
        assert!(store.is_empty());
        assert!(store.remove("d", Path::new("/x/a")).is_none());
    }

    fn sample_stores() -> (ContentStore, ContentStore, ContentStore) {
        let a: ContentStore = [
            (key(b"1"), loc("d", "/a/1", 1, 10)),
            (key(b"2"), loc("d", "/a/2", 1, 10)),
            (key(b"conflict-old"), loc("d", "/shared", 5, 10)),
        ]
        .into_iter()
        .collect();
        let b: ContentStore = [
            (key(b"2"), loc("e", "/b/2", 1, 12)),
            (key(b"3"), loc("e", "/b/3", 1, 12)),
            (key(b"conflict-new"), loc("d", "/shared", 6, 30)),
        ]
        .into_iter()
        .collect();
        let c: ContentStore = [
            (key(b"1"), loc("f", "/c/1", 1, 15)),
            (key(b"conflict-mid"), loc("d", "/shared", 5, 20)),
        ]
        .into_iter()
        .collect();
        (a, b, c)
    }

    #[test]
    fn test_merge_unions_location_sets() {
        let (a, b, _) = sample_stores();
        let merged = a.merge(&b);
        let twos = merged.locations(&key(b"2")).unwrap();
        assert_eq!(twos.len(), 2);
        assert!(merged.content_exists(&key(b"3")));
        assert!(merged.content_exists(&key(b"1")));
    }

    #[test]
    fn test_merge_conflict_keeps_newest() {
        let (a, b, _) = sample_stores();
        let merged = a.merge(&b);
        let (k, l) = merged.lookup("d", Path::new("/shared")).unwrap();
        assert_eq!(*k, key(b"conflict-new"));
        assert_eq!(l.size, 6);
        assert!(!merged.content_exists(&key(b"conflict-old")));
    }

    #[test]
    fn test_merge_is_commutative() {
        let (a, b, c) = sample_stores();
        assert_eq!(a.merge(&b), b.merge(&a));
        assert_eq!(a.merge(&c), c.merge(&a));
        assert_eq!(b.merge(&c), c.merge(&b));
    }

    #[test]
    fn test_merge_is_associative() {
        let (a, b, c) = sample_stores();
        assert_eq!(a.merge(&b.merge(&c)), a.merge(&b).merge(&c));
        assert_eq!(c.merge(&a.merge(&b)), c.merge(&a).merge(&b));
    }

    #[test]
    fn test_merge_with_empty_is_identity() {
        let (a, _, _) = sample_stores();
        assert_eq!(a.merge(&ContentStore::new()), a);
        assert_eq!(ContentStore::new().merge(&a), a);
    }

    #[test]
    fn test_missing_from() {
        let (a, b, _) = sample_stores();
        let missing = a.missing_from(&b);
        assert!(missing.contains(&key(b"1")));
        assert!(!missing.contains(&key(b"2")));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let (a, b, c) = sample_stores();
        let mut store = a.merge(&b).merge(&c);
        store.record(
            key(b"precise"),
            ContentLocation::new("d", "/p", 9, UNIX_EPOCH + Duration::new(1_700_000_000, 42)),
        );

        let decoded = ContentStore::deserialize(&store.serialize()).unwrap();
        assert_eq!(decoded, store);
        assert_eq!(decoded.location_count(), store.location_count());
        assert_eq!(
            decoded.lookup("d", Path::new("/p")).unwrap().1.modified,
            UNIX_EPOCH + Duration::new(1_700_000_000, 42)
        );
    }

    #[test]
    fn test_empty_store_roundtrip() {
        let empty = ContentStore::new();
        assert_eq!(empty.serialize(), vec![0, 0, 0, 0]);
        assert_eq!(ContentStore::deserialize(&empty.serialize()).unwrap(), empty);
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        let (a, _, _) = sample_stores();
        let bytes = a.serialize();
        assert!(ContentStore::deserialize(&bytes[..bytes.len() - 1]).is_err());

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(ContentStore::deserialize(&trailing).is_err());

        // A record claiming zero locations is not a valid store
        let mut empty_record = vec![0, 0, 0, 1];
        empty_record.extend_from_slice(key(b"x").as_bytes());
        empty_record.extend_from_slice(&[0, 0, 0, 0]);
        assert!(ContentStore::deserialize(&empty_record).is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let (a, _, _) = sample_stores();
        let json = serde_json::to_string(&a).unwrap();
        assert!(json.contains(&key(b"1").to_hex()));
        let back: ContentStore = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
        assert!(back.lookup("d", Path::new("/a/1")).is_some());
    }
}
