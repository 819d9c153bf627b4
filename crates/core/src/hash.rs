//! Content checksums using SHA-1 (160-bit)

use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::Error;

/// Read buffer size used when streaming files through the hasher.
pub const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Length of a checksum in bytes.
pub const CHECKSUM_LEN: usize = 20;

/// Content fingerprint, independent of file name or location.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ChecksumKey([u8; CHECKSUM_LEN]);

impl ChecksumKey {
    /// Hash an in-memory buffer
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = ChecksumHasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// Hash everything a reader yields, 64 KiB at a time
    ///
    /// # Errors
    /// Returns an error if reading fails
    pub fn from_reader<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut hasher = ChecksumHasher::new();
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

        loop {
            let bytes_read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(hasher.finalize())
    }

    /// Hash a file by path
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or read
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    /// Wrap a raw digest
    #[must_use]
    pub fn from_raw(bytes: [u8; CHECKSUM_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a 40-character hex string
    ///
    /// # Errors
    /// Returns a protocol error if the string is not a valid digest
    pub fn from_hex(hex_str: &str) -> Result<Self, Error> {
        let mut bytes = [0u8; CHECKSUM_LEN];
        hex::decode_to_slice(hex_str, &mut bytes)
            .map_err(|e| Error::protocol(format!("invalid checksum `{hex_str}`: {e}")))?;
        Ok(Self(bytes))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; CHECKSUM_LEN] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ChecksumKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "ChecksumKey({})", hex.get(..12).unwrap_or(&hex))
    }
}

impl fmt::Display for ChecksumKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ChecksumKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<ChecksumKey> for String {
    fn from(key: ChecksumKey) -> Self {
        key.to_hex()
    }
}

impl TryFrom<String> for ChecksumKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

/// Incremental hasher for content that arrives in pieces (e.g. off a socket).
///
/// Feeding the same bytes in any chunking yields the same key as
/// [`ChecksumKey::from_bytes`].
#[derive(Clone, Default)]
pub struct ChecksumHasher {
    inner: Sha1,
    len: u64,
}

impl ChecksumHasher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.len += data.len() as u64;
    }

    /// Number of bytes fed so far
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn finalize(self) -> ChecksumKey {
        ChecksumKey(self.inner.finalize().into())
    }
}
