//! Remote index service over TCP

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cadex_core::{
    ContentStore, Error, IndexReport, IndexRequest, IndexService, Message, Pattern, Result,
};

use crate::IndexSession;
use crate::frame::{read_message, write_message};

/// Accepts index requests from remote clients
pub struct RemoteIndexServer {
    listener: TcpListener,
    service: Arc<IndexService>,
    shutdown: CancellationToken,
}

impl RemoteIndexServer {
    /// Bind the listening socket
    ///
    /// # Errors
    /// Returns an error if the address cannot be bound
    pub async fn bind(addr: impl ToSocketAddrs, service: IndexService) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            service: Arc::new(service),
            shutdown: CancellationToken::new(),
        })
    }

    /// Address actually bound (useful with port 0)
    ///
    /// # Errors
    /// Returns an error if the socket has no local address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Cancel this token to stop the server
    #[must_use]
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve connections until shut down
    ///
    /// # Errors
    /// Returns an error only if accepting fails
    pub async fn run(self) -> Result<()> {
        info!(
            addr = ?self.listener.local_addr().ok(),
            device = self.service.device(),
            "index service listening"
        );
        let mut connections = JoinSet::new();

        let result = loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break Ok(()),
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted index connection");
                        let service = Arc::clone(&self.service);
                        let shutdown = self.shutdown.child_token();
                        connections.spawn(async move {
                            if let Err(e) = serve_connection(stream, service, shutdown).await {
                                warn!(%peer, "index connection failed: {e}");
                            }
                            debug!(%peer, "index connection closed");
                        });
                    }
                    Err(e) => break Err(Error::from(e)),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        };

        self.shutdown.cancel();
        while connections.join_next().await.is_some() {}
        info!("index service stopped");
        result
    }
}

async fn serve_connection(
    stream: TcpStream,
    service: Arc<IndexService>,
    shutdown: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    loop {
        let request = tokio::select! {
            biased;
            () = shutdown.cancelled() => return Ok(()),
            request = read_message(&mut reader) => request,
        };

        let request = match request {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e) => {
                // Best effort: tell the peer why before dropping it
                let _ = write_message(&mut writer, &Message::Error(e.to_string())).await;
                return Err(e);
            }
        };

        let service = Arc::clone(&service);
        let response = tokio::task::spawn_blocking(move || service.dispatch(request))
            .await
            .unwrap_or_else(|e| Message::Error(format!("handler panicked: {e}")));
        write_message(&mut writer, &response).await?;
    }
}

/// Client for a remote index service
///
/// Every call is bounded by the timeout given at connect time. A call that
/// times out leaves the stream mid-exchange, so the client refuses further
/// calls afterwards.
#[derive(Debug)]
pub struct RemoteIndexClient {
    stream: TcpStream,
    peer: String,
    timeout: Duration,
    poisoned: bool,
}

impl RemoteIndexClient {
    /// Connect within `timeout`
    ///
    /// # Errors
    /// Returns `RemoteUnavailable` if the peer refuses or does not answer in time
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::RemoteUnavailable(format!("{addr}: {e}"))),
            Err(_) => {
                return Err(Error::RemoteUnavailable(format!(
                    "{addr}: connect timed out after {timeout:?}"
                )));
            }
        };
        stream.set_nodelay(true)?;
        debug!(peer = addr, "connected to index service");

        Ok(Self {
            stream,
            peer: addr.to_string(),
            timeout,
            poisoned: false,
        })
    }

    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send one request and wait for its response
    ///
    /// # Errors
    /// `RemoteUnavailable` on timeout or a dropped connection, `Remote` when
    /// the peer answers with an error frame
    pub async fn call(&mut self, request: &Message) -> Result<Message> {
        if self.poisoned {
            return Err(Error::RemoteUnavailable(format!(
                "{}: connection abandoned after an earlier failure",
                self.peer
            )));
        }

        let (mut reader, mut writer) = self.stream.split();
        let exchange = async {
            write_message(&mut writer, request).await?;
            read_message(&mut reader).await
        };

        let response = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(Some(response))) => response,
            Ok(Ok(None)) => {
                self.poisoned = true;
                return Err(Error::RemoteUnavailable(format!(
                    "{}: connection closed",
                    self.peer
                )));
            }
            Ok(Err(Error::Io(e))) => {
                self.poisoned = true;
                return Err(Error::RemoteUnavailable(format!("{}: {e}", self.peer)));
            }
            Ok(Err(e)) => {
                self.poisoned = true;
                return Err(e);
            }
            Err(_) => {
                self.poisoned = true;
                return Err(Error::RemoteUnavailable(format!(
                    "{}: no response within {:?}",
                    self.peer, self.timeout
                )));
            }
        };

        match response {
            Message::Error(message) => Err(Error::Remote(message)),
            response => Ok(response),
        }
    }
}

#[async_trait]
impl IndexSession for RemoteIndexClient {
    async fn ping(&mut self) -> Result<()> {
        match self.call(&Message::Ping).await? {
            Message::Pong => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn index(&mut self, patterns: &[Pattern], baseline: &ContentStore) -> Result<IndexReport> {
        let request = Message::IndexReq(IndexRequest {
            patterns: patterns.to_vec(),
            baseline: baseline.clone(),
        });
        match self.call(&request).await? {
            Message::IndexResp(report) => Ok(report),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(message: &Message) -> Error {
    Error::protocol(format!("unexpected response type {:#04x}", message.msg_type()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadex_core::IndexAgent;

    async fn spawn_server(agent: IndexAgent) -> (SocketAddr, CancellationToken) {
        let server = RemoteIndexServer::bind("127.0.0.1:0", IndexService::new(agent))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        tokio::spawn(server.run());
        (addr, shutdown)
    }

    #[tokio::test]
    async fn test_ping() {
        let (addr, shutdown) = spawn_server(IndexAgent::new("remote")).await;
        let mut client = RemoteIndexClient::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        client.ping().await.unwrap();
        client.ping().await.unwrap();
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_error_frame_keeps_connection() {
        let (addr, shutdown) = spawn_server(IndexAgent::new("remote")).await;
        let mut client = RemoteIndexClient::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();

        // No roots configured on the remote side
        let err = client.index(&[], &ContentStore::new()).await.unwrap_err();
        assert!(matches!(err, Error::Remote(_)));
        client.ping().await.unwrap();
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = RemoteIndexClient::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RemoteUnavailable(_)));
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let server = RemoteIndexServer::bind("127.0.0.1:0", IndexService::new(IndexAgent::new("r")))
            .await
            .unwrap();
        let shutdown = server.shutdown_handle();
        let task = tokio::spawn(server.run());
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
