//! Wire-level building blocks for the swarm event protocol.
//!
//! This crate knows nothing about peers or services. It provides:
//! - fixed-header chunk framing over a byte stream (`frame`)
//! - the closed, tag-indexed set of message variants (`message`)
//!
//! All integers on the wire are little-endian. Ids and names travel as
//! UTF-8 NUL-padded to a fixed width so frame headers stay fixed-size.

use std::fmt;

pub mod frame;
pub mod message;

pub use frame::{split_chunks, FrameHeader, Reassembler, FRAME_HEADER_BYTES};
pub use message::{
    pipe_key, EventField, EventInvoke, Handshake, HandshakeResult, KeepAlive, Message,
    RETURN_FIELD,
};

// Hard limits enforced while decoding untrusted network payloads. Length
// prefixes are checked against these before any buffer is reserved.

/// Maximum size of a single reassembled message (not counting frame headers).
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024; // 64 MiB

/// Maximum number of declared fields in one `EventInvoke`.
pub const MAX_FIELD_COUNT: usize = 1024;

/// Width of a correlation/peer id on the wire.
pub const ID_WIDTH: usize = 32;

/// Width of an event or field name on the wire.
pub const NAME_WIDTH: usize = 128;

/// Default chunk size for frame splitting. Payloads above this are split
/// into multiple frames sharing one correlation id.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024; // 1 MiB

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("{what} too long: {len} bytes (max {max})")]
    TooLong {
        what: &'static str,
        len: usize,
        max: usize,
    },

    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },

    #[error("unknown message tag {0}")]
    UnknownTag(u32),

    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("message exceeds limit: {len} bytes (max {max})")]
    MessageTooLarge { len: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, WireError>;

/// Encode `s` as UTF-8 NUL-padded to exactly `width` bytes.
pub(crate) fn encode_padded(s: &str, width: usize, what: &'static str) -> Result<Vec<u8>> {
    let bytes = s.as_bytes();
    if bytes.len() > width {
        return Err(WireError::TooLong {
            what,
            len: bytes.len(),
            max: width,
        });
    }
    let mut out = vec![0u8; width];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

/// Decode a NUL-padded fixed-width string, stopping at the first NUL.
pub(crate) fn decode_padded(raw: &[u8], what: &'static str) -> Result<String> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..end])
        .map(str::to_owned)
        .map_err(|_| WireError::InvalidUtf8(what))
}

/// A bounds-checked cursor over a received payload.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8]> {
        let have = self.buf.len() - self.pos;
        if have < n {
            return Err(WireError::Truncated { what, need: n, have });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn u8(&mut self, what: &'static str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    pub(crate) fn u32(&mut self, what: &'static str) -> Result<u32> {
        let raw = self.take(4, what)?;
        Ok(u32::from_le_bytes(raw.try_into().expect("4-byte slice")))
    }

    pub(crate) fn u64(&mut self, what: &'static str) -> Result<u64> {
        let raw = self.take(8, what)?;
        Ok(u64::from_le_bytes(raw.try_into().expect("8-byte slice")))
    }

    pub(crate) fn padded_str(&mut self, width: usize, what: &'static str) -> Result<String> {
        let raw = self.take(width, what)?;
        decode_padded(raw, what)
    }

    /// Length-prefixed UTF-8 string; a zero length decodes as `None`.
    ///
    /// The wire cannot tell an empty string from an absent one, so
    /// `Some("")` written by [`put_opt_lp_str`] comes back as `None`.
    /// Optional handshake fields treat empty as absent.
    pub(crate) fn opt_lp_str(&mut self, what: &'static str) -> Result<Option<String>> {
        let len = self.u32(what)? as usize;
        if len == 0 {
            return Ok(None);
        }
        if len > MAX_MESSAGE_BYTES {
            return Err(WireError::TooLong {
                what,
                len,
                max: MAX_MESSAGE_BYTES,
            });
        }
        let raw = self.take(len, what)?;
        std::str::from_utf8(raw)
            .map(|s| Some(s.to_owned()))
            .map_err(|_| WireError::InvalidUtf8(what))
    }

    pub(crate) fn lp_str(&mut self, what: &'static str) -> Result<String> {
        Ok(self.opt_lp_str(what)?.unwrap_or_default())
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

/// Append a length-prefixed UTF-8 string; `None` encodes as length 0,
/// and so does `Some("")`. Empty means absent on this wire.
pub(crate) fn put_opt_lp_str(buf: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        None => buf.extend_from_slice(&0u32.to_le_bytes()),
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}
