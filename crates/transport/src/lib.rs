//! cadex-transport: network layer
//!
//! Remote index service client/server, in-process sessions, and the
//! streaming file transfer receiver with its delivery queue.

pub mod frame;
pub mod local;
pub mod queue;
pub mod remote;
pub mod transfer;

use async_trait::async_trait;

use cadex_core::{ContentStore, IndexReport, Pattern, Result};

pub use local::LocalSession;
pub use queue::{DeliveryQueue, QueuePusher};
pub use remote::{RemoteIndexClient, RemoteIndexServer};
pub use transfer::{ReceivedFile, Receiver, ReceiverOptions, Sender, TransferMessage};

/// A place an index can be computed: this process or a remote agent
#[async_trait]
pub trait IndexSession: Send {
    /// Check that the other side answers
    async fn ping(&mut self) -> Result<()>;

    /// Index the session's roots against a baseline store
    async fn index(&mut self, patterns: &[Pattern], baseline: &ContentStore) -> Result<IndexReport>;
}
