//! Streaming file and text transfer over TCP
//!
//! Wire format (big-endian):
//!
//! ```text
//! +--------+---------+------------------------------+
//! | tag    | length  | payload                      |
//! | 1 byte | 8 bytes | length bytes                 |
//! +--------+---------+------------------------------+
//! ```
//!
//! - 0x01 Text: UTF-8 bytes
//! - 0x02 File: `name_len:u32`, name, then the file contents
//!
//! A connection carries any number of messages; closing it between messages
//! is the normal way to finish.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWriteExt as _, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use cadex_core::config::TransferConfig;
use cadex_core::protocol::MAX_FRAME_LEN;
use cadex_core::{ChecksumHasher, ChecksumKey, Error, Result};

use crate::frame::read_exact_or_eof;
use crate::queue::{self, DeliveryQueue, QueuePusher};

/// Message tags
pub mod tag {
    pub const TEXT: u8 = 0x01;
    pub const FILE: u8 = 0x02;
}

const HEADER_LEN: usize = 9;
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A file spooled into the staging directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Name announced by the sender, reduced to its last component
    pub name: String,
    /// Where the contents now live
    pub path: PathBuf,
    pub size: u64,
    pub checksum: ChecksumKey,
    pub peer: SocketAddr,
}

/// One delivered unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferMessage {
    Text { text: String, peer: SocketAddr },
    File(ReceivedFile),
}

impl TransferMessage {
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        match self {
            Self::Text { peer, .. } => *peer,
            Self::File(file) => file.peer,
        }
    }
}

/// Sending side of one transfer connection
pub struct Sender {
    stream: BufWriter<TcpStream>,
    chunk_size: usize,
    /// Set while a frame is half written; stays set if the write fails
    poisoned: bool,
}

impl Sender {
    /// Connect to a receiver
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream: BufWriter::new(stream),
            chunk_size: DEFAULT_CHUNK_SIZE,
            poisoned: false,
        })
    }

    /// Bytes read from disk per write
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Send a text message
    ///
    /// # Errors
    /// Propagates socket errors
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.ensure_usable()?;
        self.write_header(tag::TEXT, text.len() as u64).await?;
        self.stream.write_all(text.as_bytes()).await?;
        self.stream.flush().await?;
        self.poisoned = false;
        Ok(())
    }

    /// Send a file under its own file name
    ///
    /// # Errors
    /// Returns an error if the path has no file name or cannot be read
    pub async fn send_file(&mut self, path: &Path) -> Result<u64> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::config(format!("{} has no file name", path.display())))?;
        self.send_file_as(path, &name).await
    }

    /// Send a file under the given name
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or changes size mid-send
    pub async fn send_file_as(&mut self, path: &Path, name: &str) -> Result<u64> {
        self.send_file_with(path, name, |_| {}).await
    }

    /// Send a file, reporting the bytes sent after each chunk
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or changes size mid-send
    pub async fn send_file_with(
        &mut self,
        path: &Path,
        name: &str,
        mut on_progress: impl FnMut(u64) + Send,
    ) -> Result<u64> {
        self.ensure_usable()?;
        let mut file = File::open(path).await.map_err(|e| Error::path(path, e))?;
        let size = file.metadata().await.map_err(|e| Error::path(path, e))?.len();

        let name_len = u32::try_from(name.len())
            .map_err(|_| Error::config(format!("file name too long: {} bytes", name.len())))?;
        self.write_header(tag::FILE, 4 + u64::from(name_len) + size)
            .await?;
        self.stream.write_u32(name_len).await?;
        self.stream.write_all(name.as_bytes()).await?;

        let mut buf = vec![0u8; self.chunk_size];
        let mut sent = 0u64;
        while sent < size {
            let want = usize::try_from(size - sent).map_or(buf.len(), |left| left.min(buf.len()));
            let n = file.read(&mut buf[..want]).await.map_err(|e| Error::path(path, e))?;
            if n == 0 {
                return Err(Error::path(
                    path,
                    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "file shrank while sending"),
                ));
            }
            self.stream.write_all(&buf[..n]).await?;
            sent += n as u64;
            on_progress(sent);
        }
        self.stream.flush().await?;
        self.poisoned = false;

        debug!(name, size, "sent file");
        Ok(size)
    }

    /// Flush and close the connection
    ///
    /// # Errors
    /// Propagates socket errors, and fails if an earlier send left a frame
    /// half written
    pub async fn close(mut self) -> Result<()> {
        if self.poisoned {
            let _ = self.stream.get_mut().shutdown().await;
            return Err(abandoned());
        }
        self.stream.flush().await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(abandoned());
        }
        Ok(())
    }

    /// Every caller completes the frame or leaves the sender poisoned
    async fn write_header(&mut self, tag: u8, len: u64) -> Result<()> {
        self.poisoned = true;
        self.stream.write_u8(tag).await?;
        self.stream.write_u64(len).await?;
        Ok(())
    }
}

/// The stream holds a partial frame, so nothing more can be sent on it
fn abandoned() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "sender abandoned after a failed send",
    ))
}

/// Receiver settings
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    /// Directory incoming files are spooled into
    pub staging_dir: PathBuf,
    /// Undelivered messages held before connections stall
    pub queue_capacity: usize,
    /// Bytes read from the socket per write to disk
    pub chunk_size: usize,
}

impl ReceiverOptions {
    #[must_use]
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            ..Self::default()
        }
    }
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        TransferConfig::default().into()
    }
}

impl From<TransferConfig> for ReceiverOptions {
    fn from(config: TransferConfig) -> Self {
        Self {
            staging_dir: config.staging_dir,
            queue_capacity: config.queue_capacity,
            chunk_size: config.chunk_size,
        }
    }
}

/// Accepts transfer connections and feeds a [`DeliveryQueue`]
pub struct Receiver {
    listener: TcpListener,
    options: Arc<ReceiverOptions>,
    run_id: Arc<str>,
    pusher: QueuePusher<TransferMessage>,
    shutdown: CancellationToken,
}

impl Receiver {
    /// Bind the listener and create the staging directory
    ///
    /// # Errors
    /// Returns an error on invalid options or if binding fails
    pub async fn bind(
        addr: impl ToSocketAddrs,
        options: ReceiverOptions,
    ) -> Result<(Self, DeliveryQueue<TransferMessage>)> {
        if options.queue_capacity == 0 || options.chunk_size == 0 {
            return Err(Error::config("queue capacity and chunk size must be positive"));
        }
        tokio::fs::create_dir_all(&options.staging_dir)
            .await
            .map_err(|e| Error::path(&options.staging_dir, e))?;

        let listener = TcpListener::bind(addr).await?;
        let shutdown = CancellationToken::new();
        let (pusher, queue) = queue::channel(options.queue_capacity, shutdown.clone());

        Ok((
            Self {
                listener,
                options: Arc::new(options),
                run_id: run_id().into(),
                pusher,
                shutdown,
            },
            queue,
        ))
    }

    /// Address actually bound
    ///
    /// # Errors
    /// Returns an error if the socket has no local address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Cancelling stops the receiver and closes its queue
    #[must_use]
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until shut down
    ///
    /// # Errors
    /// Returns an error only if accepting fails
    pub async fn run(self) -> Result<()> {
        info!(
            addr = ?self.listener.local_addr().ok(),
            staging = %self.options.staging_dir.display(),
            run = %self.run_id,
            "receiver listening"
        );
        let mut connections = JoinSet::new();
        let mut next_conn = 0u64;

        let result = loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break Ok(()),
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        next_conn += 1;
                        let conn = Connection {
                            id: next_conn,
                            run_id: Arc::clone(&self.run_id),
                            peer,
                            options: Arc::clone(&self.options),
                            pusher: self.pusher.clone(),
                        };
                        let shutdown = self.shutdown.child_token();
                        debug!(%peer, conn = conn.id, "accepted transfer connection");
                        connections.spawn(async move {
                            match conn.serve(stream, shutdown).await {
                                Ok(count) => debug!(%peer, count, "sender finished"),
                                Err(e) => warn!(%peer, "transfer connection failed: {e}"),
                            }
                        });
                    }
                    Err(e) => break Err(Error::from(e)),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        };

        self.shutdown.cancel();
        while connections.join_next().await.is_some() {}
        info!("receiver stopped");
        result
    }
}

/// State for one accepted sender
struct Connection {
    id: u64,
    run_id: Arc<str>,
    peer: SocketAddr,
    options: Arc<ReceiverOptions>,
    pusher: QueuePusher<TransferMessage>,
}

impl Connection {
    /// Read messages until the sender closes; returns how many were delivered
    async fn serve(&self, stream: TcpStream, shutdown: CancellationToken) -> Result<u64> {
        let mut reader = BufReader::new(stream);
        let mut seq = 0u64;

        loop {
            let message = tokio::select! {
                biased;
                () = shutdown.cancelled() => return Ok(seq),
                message = self.read_message(&mut reader, seq + 1) => message?,
            };
            let Some(message) = message else {
                return Ok(seq);
            };

            seq += 1;
            if self.pusher.push(message).await.is_err() {
                debug!(peer = %self.peer, "queue closed, dropping connection");
                return Ok(seq - 1);
            }
        }
    }

    async fn read_message<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
        seq: u64,
    ) -> Result<Option<TransferMessage>> {
        let mut header = [0u8; HEADER_LEN];
        if !read_exact_or_eof(reader, &mut header).await? {
            return Ok(None);
        }
        let tag = header[0];
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&header[1..]);
        let len = u64::from_be_bytes(len_bytes);

        let message = match tag {
            tag::TEXT => {
                let len = bounded_len(len)?;
                let mut payload = vec![0u8; len];
                reader.read_exact(&mut payload).await?;
                let text = String::from_utf8(payload)
                    .map_err(|_| Error::protocol("text message is not valid UTF-8"))?;
                trace!(peer = %self.peer, len, "received text");
                TransferMessage::Text {
                    text,
                    peer: self.peer,
                }
            }
            tag::FILE => TransferMessage::File(self.receive_file(reader, len, seq).await?),
            other => return Err(Error::protocol(format!("unknown transfer tag {other:#04x}"))),
        };
        Ok(Some(message))
    }

    async fn receive_file<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
        len: u64,
        seq: u64,
    ) -> Result<ReceivedFile> {
        if len < 4 {
            return Err(Error::protocol("file message shorter than its name header"));
        }
        let name_len = u64::from(reader.read_u32().await?);
        if name_len > len - 4 {
            return Err(Error::protocol("file name longer than the message"));
        }
        let mut raw_name = vec![0u8; bounded_len(name_len)?];
        reader.read_exact(&mut raw_name).await?;
        let name = sanitize_name(&String::from_utf8_lossy(&raw_name));
        let size = len - 4 - name_len;

        let staging = &self.options.staging_dir;
        let stem = format!("{}-{}-{seq}-{name}", self.run_id, self.id);
        let part_path = staging.join(format!(".{stem}.part"));
        let final_path = staging.join(stem);

        let part = PartFile(part_path);
        let checksum = self.spool(reader, &part.0, size).await?;
        if tokio::fs::try_exists(&final_path).await.unwrap_or(true) {
            return Err(Error::path(
                &final_path,
                std::io::Error::new(std::io::ErrorKind::AlreadyExists, "refusing to replace a received file"),
            ));
        }
        tokio::fs::rename(&part.0, &final_path)
            .await
            .map_err(|e| Error::path(&final_path, e))?;

        debug!(peer = %self.peer, name = %name, size, %checksum, "received file");
        Ok(ReceivedFile {
            name,
            path: final_path,
            size,
            checksum,
            peer: self.peer,
        })
    }

    /// Copy `size` bytes into `path`, hashing them on the way
    async fn spool<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
        path: &Path,
        size: u64,
    ) -> Result<ChecksumKey> {
        let mut file = File::create(path).await.map_err(|e| Error::path(path, e))?;
        let mut hasher = ChecksumHasher::new();
        let mut buf = vec![0u8; self.options.chunk_size];
        let mut remaining = size;

        while remaining > 0 {
            let want = usize::try_from(remaining).map_or(buf.len(), |left| left.min(buf.len()));
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "sender closed mid-file",
                )
                .into());
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await.map_err(|e| Error::path(path, e))?;
            remaining -= n as u64;
        }
        file.flush().await.map_err(|e| Error::path(path, e))?;

        Ok(hasher.finalize())
    }
}

/// Partially received file, removed unless renamed into place
struct PartFile(PathBuf);

impl Drop for PartFile {
    fn drop(&mut self) {
        // After a successful rename this is a no-op NotFound
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Distinguishes one receiver run from another sharing a staging directory
fn run_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    format!("{:x}{:x}", std::process::id(), nanos & u128::from(u64::MAX))
}

fn bounded_len(len: u64) -> Result<usize> {
    usize::try_from(len)
        .ok()
        .filter(|&len| len <= MAX_FRAME_LEN)
        .ok_or_else(|| Error::protocol(format!("message of {len} bytes exceeds limit")))
}

/// Keep only the final path component so senders cannot escape staging
fn sanitize_name(raw: &str) -> String {
    Path::new(raw)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map_or_else(|| "unnamed".to_string(), str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_name("/abs/path/x.bin"), "x.bin");
        assert_eq!(sanitize_name(".."), "unnamed");
        assert_eq!(sanitize_name(""), "unnamed");
    }

    #[test]
    fn test_bounded_len() {
        assert_eq!(bounded_len(10).unwrap(), 10);
        assert!(bounded_len(u64::MAX).is_err());
    }

    #[tokio::test]
    async fn test_text_and_file_roundtrip() {
        let staging = tempfile::tempdir().unwrap();
        let (receiver, mut queue) = Receiver::bind("127.0.0.1:0", ReceiverOptions::new(staging.path()))
            .await
            .unwrap();
        let addr = receiver.local_addr().unwrap();
        let shutdown = receiver.shutdown_handle();
        let server = tokio::spawn(receiver.run());

        let src = tempfile::tempdir().unwrap();
        let file = src.path().join("data.bin");
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&file, &content).unwrap();

        let mut sender = Sender::connect(addr).await.unwrap().with_chunk_size(4096);
        sender.send_text("hello").await.unwrap();
        assert_eq!(sender.send_file(&file).await.unwrap(), content.len() as u64);
        sender.close().await.unwrap();

        let Some(TransferMessage::Text { text, .. }) = queue.pop().await else {
            panic!("expected text first");
        };
        assert_eq!(text, "hello");

        let Some(TransferMessage::File(received)) = queue.pop().await else {
            panic!("expected file second");
        };
        assert_eq!(received.name, "data.bin");
        assert_eq!(received.size, content.len() as u64);
        assert_eq!(received.checksum, ChecksumKey::from_bytes(&content));
        assert_eq!(std::fs::read(&received.path).unwrap(), content);

        shutdown.cancel();
        assert_eq!(queue.pop().await, None);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_hostile_name_stays_in_staging() {
        let staging = tempfile::tempdir().unwrap();
        let (receiver, mut queue) = Receiver::bind("127.0.0.1:0", ReceiverOptions::new(staging.path()))
            .await
            .unwrap();
        let addr = receiver.local_addr().unwrap();
        let shutdown = receiver.shutdown_handle();
        tokio::spawn(receiver.run());

        let src = tempfile::tempdir().unwrap();
        let file = src.path().join("x");
        std::fs::write(&file, b"payload").unwrap();

        let mut sender = Sender::connect(addr).await.unwrap();
        sender.send_file_as(&file, "../../escape.txt").await.unwrap();
        sender.close().await.unwrap();

        let Some(TransferMessage::File(received)) = queue.pop().await else {
            panic!("expected file");
        };
        assert_eq!(received.name, "escape.txt");
        assert_eq!(received.path.parent().unwrap(), staging.path());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_truncated_file_is_discarded() {
        let staging = tempfile::tempdir().unwrap();
        let (receiver, mut queue) = Receiver::bind("127.0.0.1:0", ReceiverOptions::new(staging.path()))
            .await
            .unwrap();
        let addr = receiver.local_addr().unwrap();
        let shutdown = receiver.shutdown_handle();
        tokio::spawn(receiver.run());

        // Announce 100 bytes of content, deliver 3
        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_u8(tag::FILE).await.unwrap();
        raw.write_u64(4 + 1 + 100).await.unwrap();
        raw.write_u32(1).await.unwrap();
        raw.write_all(b"f").await.unwrap();
        raw.write_all(b"abc").await.unwrap();
        drop(raw);

        // A later, well-formed sender is unaffected
        let mut sender = Sender::connect(addr).await.unwrap();
        sender.send_text("still here").await.unwrap();
        sender.close().await.unwrap();

        let Some(TransferMessage::Text { text, .. }) = queue.pop().await else {
            panic!("expected text");
        };
        assert_eq!(text, "still here");

        let mut leftovers = usize::MAX;
        for _ in 0..250 {
            leftovers = std::fs::read_dir(staging.path()).unwrap().count();
            if leftovers == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(leftovers, 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_failed_send_poisons_sender() {
        let staging = tempfile::tempdir().unwrap();
        let (receiver, _queue) = Receiver::bind("127.0.0.1:0", ReceiverOptions::new(staging.path()))
            .await
            .unwrap();
        let addr = receiver.local_addr().unwrap();
        let shutdown = receiver.shutdown_handle();
        tokio::spawn(receiver.run());

        let src = tempfile::tempdir().unwrap();
        let file = src.path().join("big.bin");
        std::fs::write(&file, vec![7u8; 2 * 1024 * 1024]).unwrap();

        let mut sender = Sender::connect(addr).await.unwrap().with_chunk_size(4096);
        let mut truncated = false;
        let err = sender
            .send_file_with(&file, "big.bin", |_| {
                if !truncated {
                    truncated = true;
                    let f = std::fs::OpenOptions::new().write(true).open(&file).unwrap();
                    f.set_len(10).unwrap();
                }
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("shrank"), "{err}");

        // The stream holds half a frame, so nothing else may follow it
        let err = sender.send_text("after").await.unwrap_err();
        assert!(err.to_string().contains("abandoned"), "{err}");
        assert!(sender.send_file(&file).await.is_err());
        assert!(sender.close().await.is_err());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_later_run_does_not_overwrite_earlier_files() {
        let staging = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let file = src.path().join("same.txt");

        let mut paths = Vec::new();
        for content in ["first run", "second run"] {
            std::fs::write(&file, content).unwrap();
            let (receiver, mut queue) =
                Receiver::bind("127.0.0.1:0", ReceiverOptions::new(staging.path()))
                    .await
                    .unwrap();
            let addr = receiver.local_addr().unwrap();
            let shutdown = receiver.shutdown_handle();
            let server = tokio::spawn(receiver.run());

            let mut sender = Sender::connect(addr).await.unwrap();
            sender.send_file(&file).await.unwrap();
            sender.close().await.unwrap();

            let Some(TransferMessage::File(received)) = queue.pop().await else {
                panic!("expected file");
            };
            assert_eq!(received.name, "same.txt");
            paths.push(received.path);

            shutdown.cancel();
            server.await.unwrap().unwrap();
        }

        assert_ne!(paths[0], paths[1]);
        assert_eq!(std::fs::read_to_string(&paths[0]).unwrap(), "first run");
        assert_eq!(std::fs::read_to_string(&paths[1]).unwrap(), "second run");
    }
}
