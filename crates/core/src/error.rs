//! Error taxonomy shared by every cadex component

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by cadex operations.
///
/// Per-entry problems during an index run are not errors; they are collected
/// as [`EntryFailure`](crate::index::EntryFailure)s in the report.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad pattern, missing root, invalid configuration. Fatal.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// I/O failure on a stream or file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O failure tied to a specific path.
    #[error("I/O error on {}: {source}", path.display())]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The remote end could not be reached in time.
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// Malformed frame or store encoding.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer answered with an error frame.
    #[error("remote error: {0}")]
    Remote(String),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn path(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Path {
            path: path.into(),
            source,
        }
    }

    /// Whether this error should abort the caller's whole run.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_configuration_is_fatal() {
        assert!(Error::config("missing root").is_fatal());
        assert!(!Error::protocol("short frame").is_fatal());
        assert!(!Error::RemoteUnavailable("timeout".into()).is_fatal());
    }

    #[test]
    fn test_path_error_mentions_path() {
        let err = Error::path(
            "/data/a.txt",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/data/a.txt"));
    }
}
