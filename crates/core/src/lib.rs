//! cadex-core: content-addressed indexing
//!
//! Provides pattern matching, checksum stores, incremental indexing and the
//! remote index protocol.

pub mod codec;
pub mod config;
pub mod diff;
pub mod error;
pub mod hash;
pub mod index;
pub mod pattern;
pub mod protocol;
pub mod service;
pub mod store;

pub use config::CadexConfig;
pub use diff::StoreDiff;
pub use error::{Error, Result};
pub use hash::{ChecksumHasher, ChecksumKey};
pub use index::{EntryFailure, FailureKind, IndexAgent, IndexOptions, IndexReport, IndexStats};
pub use pattern::{Pattern, PatternMatcher};
pub use protocol::{IndexRequest, Message, Operation, ProtocolReader, ProtocolWriter};
pub use service::{Handler, IndexService};
pub use store::{ContentLocation, ContentStore};
