//! Big-endian wire primitives shared by the store encoding and the protocols

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};
use crate::hash::{CHECKSUM_LEN, ChecksumKey};

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// Append a length-prefixed byte string
pub fn put_bytes<B: BufMut>(buf: &mut B, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

pub fn put_str<B: BufMut>(buf: &mut B, s: &str) {
    put_bytes(buf, s.as_bytes());
}

/// Append a path; lossless on Unix, lossy UTF-8 elsewhere
pub fn put_path<B: BufMut>(buf: &mut B, path: &std::path::Path) {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt as _;
        put_bytes(buf, path.as_os_str().as_bytes());
    }
    #[cfg(not(unix))]
    put_str(buf, &path.to_string_lossy());
}

/// Append a timestamp as `secs:i64` + `nanos:u32`, with nanos always in
/// `0..1e9` so pre-epoch times round-trip exactly.
pub fn put_time<B: BufMut>(buf: &mut B, time: SystemTime) {
    let (secs, nanos) = match time.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(e) => {
            let d = e.duration();
            if d.subsec_nanos() == 0 {
                (-(d.as_secs() as i64), 0)
            } else {
                (-(d.as_secs() as i64) - 1, NANOS_PER_SEC - d.subsec_nanos())
            }
        }
    };
    buf.put_i64(secs);
    buf.put_u32(nanos);
}

/// Bounds-checked reader over an encoded buffer.
///
/// Every accessor fails with a protocol error instead of panicking when the
/// input is short.
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::protocol(format!(
                "truncated {what}: need {n} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.need(8, "u64")?;
        Ok(self.buf.get_u64())
    }

    pub fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::protocol(format!("invalid bool byte {other}"))),
        }
    }

    /// Take `n` raw bytes
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n, "bytes")?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub fn string(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|e| Error::protocol(format!("invalid UTF-8: {e}")))
    }

    pub fn path(&mut self) -> Result<PathBuf> {
        let raw = self.bytes()?;
        #[cfg(unix)]
        {
            use std::os::unix::ffi::OsStrExt as _;
            Ok(PathBuf::from(std::ffi::OsStr::from_bytes(raw)))
        }
        #[cfg(not(unix))]
        Ok(PathBuf::from(String::from_utf8_lossy(raw).into_owned()))
    }

    pub fn checksum(&mut self) -> Result<ChecksumKey> {
        let raw = self.take(CHECKSUM_LEN)?;
        let mut bytes = [0u8; CHECKSUM_LEN];
        bytes.copy_from_slice(raw);
        Ok(ChecksumKey::from_raw(bytes))
    }

    pub fn time(&mut self) -> Result<SystemTime> {
        self.need(12, "timestamp")?;
        let secs = self.buf.get_i64();
        let nanos = self.buf.get_u32();
        if nanos >= NANOS_PER_SEC {
            return Err(Error::protocol(format!("invalid nanoseconds {nanos}")));
        }

        let time = if secs >= 0 {
            UNIX_EPOCH.checked_add(Duration::new(secs as u64, nanos))
        } else {
            UNIX_EPOCH
                .checked_sub(Duration::from_secs(secs.unsigned_abs()))
                .and_then(|t| t.checked_add(Duration::from_nanos(u64::from(nanos))))
        };
        time.ok_or_else(|| Error::protocol(format!("timestamp out of range: {secs}s")))
    }

    /// Fail unless the whole buffer was consumed
    pub fn finish(self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(Error::protocol(format!(
                "{} trailing bytes",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_roundtrip_including_pre_epoch() {
        let times = [
            UNIX_EPOCH,
            UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789),
            UNIX_EPOCH - Duration::from_secs(86_400),
            UNIX_EPOCH - Duration::new(5, 250_000_000),
        ];

        for time in times {
            let mut buf = Vec::new();
            put_time(&mut buf, time);
            let mut decoder = Decoder::new(&buf);
            assert_eq!(decoder.time().unwrap(), time);
            decoder.finish().unwrap();
        }
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let mut buf = Vec::new();
        put_str(&mut buf, "hello");
        buf.truncate(6);

        let mut decoder = Decoder::new(&buf);
        assert!(matches!(decoder.string(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let buf = [0u8, 0, 0, 1, 9];
        let mut decoder = Decoder::new(&buf);
        assert_eq!(decoder.u32().unwrap(), 1);
        assert!(decoder.finish().is_err());
    }
}
