//! In-process index session
//!
//! Runs the same service the remote agent runs, without a socket. Used when
//! both trees live on this machine and in tests.

use std::sync::Arc;

use async_trait::async_trait;

use cadex_core::{ContentStore, Error, IndexAgent, IndexReport, IndexRequest, IndexService, Message, Pattern, Result};

use crate::IndexSession;

/// Session backed by a local [`IndexService`]
#[derive(Debug, Clone)]
pub struct LocalSession {
    service: Arc<IndexService>,
}

impl LocalSession {
    #[must_use]
    pub fn new(agent: IndexAgent) -> Self {
        Self {
            service: Arc::new(IndexService::new(agent)),
        }
    }

    async fn call(&self, request: Message) -> Result<Message> {
        let service = Arc::clone(&self.service);
        let response = tokio::task::spawn_blocking(move || service.dispatch(request))
            .await
            .map_err(|e| Error::protocol(format!("index task failed: {e}")))?;

        match response {
            Message::Error(message) => Err(Error::Remote(message)),
            response => Ok(response),
        }
    }
}

#[async_trait]
impl IndexSession for LocalSession {
    async fn ping(&mut self) -> Result<()> {
        match self.call(Message::Ping).await? {
            Message::Pong => Ok(()),
            other => Err(Error::protocol(format!(
                "unexpected response type {:#04x}",
                other.msg_type()
            ))),
        }
    }

    async fn index(&mut self, patterns: &[Pattern], baseline: &ContentStore) -> Result<IndexReport> {
        let request = Message::IndexReq(IndexRequest {
            patterns: patterns.to_vec(),
            baseline: baseline.clone(),
        });
        match self.call(request).await? {
            Message::IndexResp(report) => Ok(report),
            other => Err(Error::protocol(format!(
                "unexpected response type {:#04x}",
                other.msg_type()
            ))),
        }
    }
}
