//! Async framing of index protocol messages over a byte stream

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use cadex_core::protocol::{self, HEADER_LEN};
use cadex_core::{Message, Result};

/// Read one message; `None` on clean EOF between frames
///
/// # Errors
/// EOF inside a frame is an I/O error; malformed payloads are protocol errors
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    let mut header = [0u8; HEADER_LEN];
    if !read_exact_or_eof(reader, &mut header).await? {
        return Ok(None);
    }

    let (msg_type, len) = protocol::parse_header(header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Message::decode(msg_type, &payload).map(Some)
}

/// Write one message and flush
///
/// # Errors
/// Propagates encoding and socket errors
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    writer.write_all(&message.encode()?).await?;
    writer.flush().await?;
    Ok(())
}

/// Fill `buf`, returning false if the stream ended before the first byte
pub(crate) async fn read_exact_or_eof<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await? {
            0 if filled == 0 => return Ok(false),
            0 => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            n => filled += n,
        }
    }
    Ok(true)
}
