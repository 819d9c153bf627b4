//! Binary protocol for the remote index service
//!
//! Wire format (all integers are big-endian, `str` = `len:u32` + bytes):
//!
//! ```text
//! +--------+---------+------------------+
//! | type   | length  | payload          |
//! | 1 byte | 4 bytes | variable         |
//! +--------+---------+------------------+
//! ```
//!
//! Message types:
//! - 0x01: Ping (no payload)
//! - 0x02: Pong (no payload)
//! - 0x10: IndexReq (pattern_count:4, (include:1, recursive:1, expr:str)*count, baseline store)
//! - 0x11: IndexResp (store_len:4, store, stats:8*6, failure_count:4, failures)
//! - 0x7f: Error (UTF-8 message)
//!
//! A failure is `path:str kind:1` followed by `message:str` (kind 0,
//! unreadable) or `expected:20 actual:20` (kind 1, checksum mismatch).

use std::io::{Read, Write};

use bytes::BufMut as _;

use crate::codec::{self, Decoder};
use crate::error::{Error, Result};
use crate::index::{EntryFailure, FailureKind, IndexReport, IndexStats};
use crate::pattern::Pattern;
use crate::store::ContentStore;

/// Message type identifiers
pub mod msg {
    pub const PING: u8 = 0x01;
    pub const PONG: u8 = 0x02;
    pub const INDEX_REQ: u8 = 0x10;
    pub const INDEX_RESP: u8 = 0x11;
    pub const ERROR: u8 = 0x7f;
}

/// Frame header size: type + length
pub const HEADER_LEN: usize = 5;

/// Largest payload accepted from a peer
pub const MAX_FRAME_LEN: usize = 1 << 30;

const FAILURE_UNREADABLE: u8 = 0;
const FAILURE_MISMATCH: u8 = 1;

/// Operations the service exposes, by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Ping,
    Index,
}

impl Operation {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Index => "index",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Arguments of a remote `index` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexRequest {
    pub patterns: Vec<Pattern>,
    pub baseline: ContentStore,
}

/// Message exchanged with the remote index service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping,
    Pong,
    IndexReq(IndexRequest),
    IndexResp(IndexReport),
    Error(String),
}

impl Message {
    #[must_use]
    pub fn msg_type(&self) -> u8 {
        match self {
            Self::Ping => msg::PING,
            Self::Pong => msg::PONG,
            Self::IndexReq(_) => msg::INDEX_REQ,
            Self::IndexResp(_) => msg::INDEX_RESP,
            Self::Error(_) => msg::ERROR,
        }
    }

    /// Operation a request message invokes
    #[must_use]
    pub fn operation(&self) -> Option<Operation> {
        match self {
            Self::Ping => Some(Operation::Ping),
            Self::IndexReq(_) => Some(Operation::Index),
            _ => None,
        }
    }

    /// Encode as a complete frame (header + payload)
    ///
    /// # Errors
    /// Returns a protocol error if the payload exceeds the frame limit
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut frame = vec![self.msg_type(), 0, 0, 0, 0];

        match self {
            Self::Ping | Self::Pong => {}
            Self::IndexReq(request) => encode_request(&mut frame, request),
            Self::IndexResp(report) => encode_report(&mut frame, report),
            Self::Error(message) => frame.put_slice(message.as_bytes()),
        }

        let payload_len = frame.len() - HEADER_LEN;
        if payload_len > MAX_FRAME_LEN {
            return Err(Error::protocol(format!(
                "frame of {payload_len} bytes exceeds limit"
            )));
        }
        frame[1..HEADER_LEN].copy_from_slice(&(payload_len as u32).to_be_bytes());
        Ok(frame)
    }

    /// Decode a payload whose header has already been read
    ///
    /// # Errors
    /// Returns a protocol error on unknown types or malformed payloads
    pub fn decode(msg_type: u8, payload: &[u8]) -> Result<Self> {
        let mut decoder = Decoder::new(payload);

        let message = match msg_type {
            msg::PING => Self::Ping,
            msg::PONG => Self::Pong,
            msg::INDEX_REQ => Self::IndexReq(decode_request(&mut decoder)?),
            msg::INDEX_RESP => Self::IndexResp(decode_report(&mut decoder)?),
            msg::ERROR => {
                let raw = decoder.take(decoder.remaining())?;
                Self::Error(String::from_utf8_lossy(raw).into_owned())
            }
            other => return Err(Error::protocol(format!("unknown message type: {other:#04x}"))),
        };

        decoder.finish()?;
        Ok(message)
    }
}

/// Split a frame header into (type, payload length)
///
/// # Errors
/// Returns a protocol error if the announced length exceeds the limit
pub fn parse_header(header: [u8; HEADER_LEN]) -> Result<(u8, usize)> {
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::protocol(format!("frame of {len} bytes exceeds limit")));
    }
    Ok((header[0], len))
}

fn encode_request(buf: &mut Vec<u8>, request: &IndexRequest) {
    buf.put_u32(request.patterns.len() as u32);
    for pattern in &request.patterns {
        buf.put_u8(u8::from(pattern.include));
        buf.put_u8(u8::from(pattern.recursive));
        codec::put_str(buf, &pattern.expression);
    }
    request.baseline.encode_into(buf);
}

fn decode_request(decoder: &mut Decoder<'_>) -> Result<IndexRequest> {
    let count = decoder.u32()?;
    let mut patterns = Vec::new();
    for _ in 0..count {
        let include = decoder.bool()?;
        let recursive = decoder.bool()?;
        let expression = decoder.string()?;
        patterns.push(Pattern {
            expression,
            include,
            recursive,
        });
    }
    let baseline = ContentStore::decode_from(decoder)?;
    Ok(IndexRequest { patterns, baseline })
}

fn encode_report(buf: &mut Vec<u8>, report: &IndexReport) {
    let store = report.store.serialize();
    codec::put_bytes(buf, &store);

    let stats = &report.stats;
    for counter in [
        stats.visited,
        stats.excluded,
        stats.skipped_unchanged,
        stats.hashed,
        stats.failed,
        stats.bytes_hashed,
    ] {
        buf.put_u64(counter);
    }

    buf.put_u32(report.failures.len() as u32);
    for failure in &report.failures {
        codec::put_path(buf, &failure.path);
        match &failure.kind {
            FailureKind::Unreadable(reason) => {
                buf.put_u8(FAILURE_UNREADABLE);
                codec::put_str(buf, reason);
            }
            FailureKind::ChecksumMismatch { expected, actual } => {
                buf.put_u8(FAILURE_MISMATCH);
                buf.put_slice(expected.as_bytes());
                buf.put_slice(actual.as_bytes());
            }
        }
    }
}

fn decode_report(decoder: &mut Decoder<'_>) -> Result<IndexReport> {
    let store = ContentStore::deserialize(decoder.bytes()?)?;

    let stats = IndexStats {
        visited: decoder.u64()?,
        excluded: decoder.u64()?,
        skipped_unchanged: decoder.u64()?,
        hashed: decoder.u64()?,
        failed: decoder.u64()?,
        bytes_hashed: decoder.u64()?,
    };

    let count = decoder.u32()?;
    let mut failures = Vec::new();
    for _ in 0..count {
        let path = decoder.path()?;
        let kind = match decoder.u8()? {
            FAILURE_UNREADABLE => FailureKind::Unreadable(decoder.string()?),
            FAILURE_MISMATCH => FailureKind::ChecksumMismatch {
                expected: decoder.checksum()?,
                actual: decoder.checksum()?,
            },
            other => return Err(Error::protocol(format!("unknown failure kind {other}"))),
        };
        failures.push(EntryFailure { path, kind });
    }

    Ok(IndexReport {
        store,
        failures,
        stats,
    })
}

/// Protocol writer for sending messages over a blocking stream
pub struct ProtocolWriter<W> {
    inner: W,
}

impl<W: Write> ProtocolWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send one message and flush
    pub fn send(&mut self, message: &Message) -> Result<()> {
        self.inner.write_all(&message.encode()?)?;
        self.inner.flush()?;
        Ok(())
    }

    /// Send error response
    pub fn send_error(&mut self, message: &str) -> Result<()> {
        self.send(&Message::Error(message.to_string()))
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Protocol reader for receiving messages from a blocking stream
pub struct ProtocolReader<R> {
    inner: R,
}

impl<R: Read> ProtocolReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read next message; `None` when the peer closed between frames
    pub fn read_message(&mut self) -> Result<Option<Message>> {
        let mut header = [0u8; HEADER_LEN];
        if !read_exact_or_eof(&mut self.inner, &mut header)? {
            return Ok(None);
        }

        let (msg_type, len) = parse_header(header)?;
        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload)?;

        Message::decode(msg_type, &payload).map(Some)
    }

    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Fill `buf`, returning false on EOF before the first byte
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
