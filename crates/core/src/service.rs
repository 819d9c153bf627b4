//! Request handling for the remote index service
//!
//! Each operation has a [`Handler`]; [`IndexService::dispatch`] maps request
//! messages onto them. Handlers run synchronously, so async servers call
//! dispatch from a blocking task.

use tracing::{debug, warn};

use crate::error::Result;
use crate::index::{IndexAgent, IndexReport};
use crate::protocol::{IndexRequest, Message, Operation};

/// One service operation
pub trait Handler {
    type Request;
    type Response;

    const OPERATION: Operation;

    /// Handle one request
    ///
    /// # Errors
    /// Any error is reported to the caller as an error frame
    fn handle(&self, request: Self::Request) -> Result<Self::Response>;
}

/// Liveness check
#[derive(Debug, Clone, Copy, Default)]
pub struct PingHandler;

impl Handler for PingHandler {
    type Request = ();
    type Response = ();

    const OPERATION: Operation = Operation::Ping;

    fn handle(&self, (): ()) -> Result<()> {
        Ok(())
    }
}

/// Runs an index pass over the agent's roots
#[derive(Debug, Clone)]
pub struct IndexHandler {
    agent: IndexAgent,
}

impl IndexHandler {
    #[must_use]
    pub fn new(agent: IndexAgent) -> Self {
        Self { agent }
    }
}

impl Handler for IndexHandler {
    type Request = IndexRequest;
    type Response = IndexReport;

    const OPERATION: Operation = Operation::Index;

    fn handle(&self, request: IndexRequest) -> Result<IndexReport> {
        self.agent.index(&request.patterns, &request.baseline)
    }
}

/// Serves index requests for one local agent
#[derive(Debug, Clone)]
pub struct IndexService {
    ping: PingHandler,
    index: IndexHandler,
}

impl IndexService {
    #[must_use]
    pub fn new(agent: IndexAgent) -> Self {
        Self {
            ping: PingHandler,
            index: IndexHandler::new(agent),
        }
    }

    /// Device name of the served agent
    #[must_use]
    pub fn device(&self) -> &str {
        self.index.agent.device()
    }

    /// Answer one request message; failures become error frames
    #[must_use]
    pub fn dispatch(&self, request: Message) -> Message {
        let operation = request.operation();
        debug!(?operation, "dispatching request");

        let response = match request {
            Message::Ping => self.ping.handle(()).map(|()| Message::Pong),
            Message::IndexReq(req) => self.index.handle(req).map(Message::IndexResp),
            other => {
                warn!(msg_type = other.msg_type(), "not a request");
                return Message::Error(format!(
                    "unexpected message type {:#04x}",
                    other.msg_type()
                ));
            }
        };

        response.unwrap_or_else(|e| {
            warn!(?operation, "request failed: {e}");
            Message::Error(e.to_string())
        })
    }
}
