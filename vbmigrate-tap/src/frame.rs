//! Memcached binary frame codec.
//!
//! Every request and response shares a 24-byte header followed by a body of
//! `extras || key || value`. All multibyte fields are network byte order:
//!
//! ```text
//!   0: magic (0x80 request | 0x81 response)
//!   1: opcode
//! 2-3: key length
//!   4: extras length
//!   5: datatype (always 0)
//! 6-7: vbucket id (request) | status (response)
//! 8-11: total body length
//! 12-15: opaque
//! 16-23: cas
//! ```

use std::fmt;

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use vbmigrate_core::MigrateError;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 24;

/// Largest body a peer may advertise. Anything bigger is treated as a
/// corrupt stream and is fatal to the pipe.
pub const MAX_FRAME: usize = 20 * 1024 * 1024;

pub mod magic {
    pub const REQUEST: u8 = 0x80;
    pub const RESPONSE: u8 = 0x81;
}

pub mod opcode {
    pub const NOOP: u8 = 0x0a;
    pub const FLUSHQ: u8 = 0x18;
    pub const SASL_LIST_MECHS: u8 = 0x20;
    pub const SASL_AUTH: u8 = 0x21;
    pub const SASL_STEP: u8 = 0x22;
    pub const GET_VBUCKET: u8 = 0x3b;
    /// Response opcode some server generations use for GET_VBUCKET.
    pub const GET_VBUCKET_ALT: u8 = 0x84;
    pub const TAP_CONNECT: u8 = 0x40;
    pub const TAP_MUTATION: u8 = 0x41;
    pub const TAP_DELETE: u8 = 0x42;
    pub const TAP_FLUSH: u8 = 0x43;
    pub const TAP_OPAQUE: u8 = 0x44;
    pub const TAP_VBUCKET_SET: u8 = 0x45;
}

pub mod status {
    pub const SUCCESS: u16 = 0x00;
    pub const AUTH_ERROR: u16 = 0x20;
    pub const AUTH_CONTINUE: u16 = 0x21;
}

/// Frame-level protocol errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid package detected on the wire (magic {0:#04x})")]
    InvalidMagic(u8),

    #[error("Frame size too large: {0} bytes")]
    TooLarge(usize),
}

impl From<FrameError> for MigrateError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::InvalidMagic(_) => Self::Protocol(err.to_string()),
            FrameError::TooLarge(size) => Self::FrameTooLarge {
                size,
                max: MAX_FRAME,
            },
        }
    }
}

/// A complete binary message: header plus body in one contiguous buffer.
///
/// Ownership is single. Whoever holds a `Message` either forwards it
/// (transferring ownership) or drops it; nothing aliases the buffer.
pub struct Message {
    data: BytesMut,
}

impl Message {
    /// Start assembling a message from a wire header. The body is
    /// zero-filled and expected to be written in place by the reader.
    pub fn from_wire_header(header: &[u8; HEADER_LEN]) -> Result<Self, FrameError> {
        let m = header[0];
        if m != magic::REQUEST && m != magic::RESPONSE {
            return Err(FrameError::InvalidMagic(m));
        }
        let bodylen = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        if bodylen > MAX_FRAME {
            return Err(FrameError::TooLarge(bodylen));
        }

        let mut data = BytesMut::with_capacity(HEADER_LEN + bodylen);
        data.extend_from_slice(header);
        data.resize(HEADER_LEN + bodylen, 0);
        Ok(Self { data })
    }

    /// Build a request frame.
    #[must_use]
    pub fn request(
        opcode: u8,
        vbucket: u16,
        opaque: u32,
        extras: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> Self {
        let bodylen = extras.len() + key.len() + value.len();
        let mut data = BytesMut::with_capacity(HEADER_LEN + bodylen);
        data.put_u8(magic::REQUEST);
        data.put_u8(opcode);
        data.put_u16(key.len() as u16);
        data.put_u8(extras.len() as u8);
        data.put_u8(0); // datatype
        data.put_u16(vbucket);
        data.put_u32(bodylen as u32);
        data.put_u32(opaque);
        data.put_u64(0); // cas
        data.put_slice(extras);
        data.put_slice(key);
        data.put_slice(value);
        Self { data }
    }

    /// Build a response frame. The agent itself only forwards responses, but
    /// the scripted peers in the test suite speak both directions.
    #[must_use]
    pub fn response(
        opcode: u8,
        status: u16,
        opaque: u32,
        extras: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> Self {
        let mut msg = Self::request(opcode, status, opaque, extras, key, value);
        msg.data[0] = magic::RESPONSE;
        msg
    }

    fn be16(&self, off: usize) -> u16 {
        u16::from_be_bytes([self.data[off], self.data[off + 1]])
    }

    fn be32(&self, off: usize) -> u32 {
        u32::from_be_bytes([
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ])
    }

    #[must_use]
    pub fn magic(&self) -> u8 {
        self.data[0]
    }

    #[must_use]
    pub fn is_response(&self) -> bool {
        self.data[0] == magic::RESPONSE
    }

    #[must_use]
    pub fn opcode(&self) -> u8 {
        self.data[1]
    }

    #[must_use]
    pub fn keylen(&self) -> usize {
        self.be16(2) as usize
    }

    #[must_use]
    pub fn extlen(&self) -> usize {
        self.data[4] as usize
    }

    /// Request interpretation of bytes 6-7.
    #[must_use]
    pub fn vbucket(&self) -> u16 {
        self.be16(6)
    }

    /// Response interpretation of bytes 6-7.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.be16(6)
    }

    #[must_use]
    pub fn bodylen(&self) -> usize {
        self.be32(8) as usize
    }

    #[must_use]
    pub fn opaque(&self) -> u32 {
        self.be32(12)
    }

    #[must_use]
    pub fn cas(&self) -> u64 {
        u64::from_be_bytes(self.data[16..24].try_into().expect("header is 24 bytes"))
    }

    /// Total frame size on the wire.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.bodylen()
    }

    #[must_use]
    pub fn extras(&self) -> &[u8] {
        &self.data[HEADER_LEN..HEADER_LEN + self.extlen()]
    }

    #[must_use]
    pub fn key(&self) -> &[u8] {
        let start = HEADER_LEN + self.extlen();
        &self.data[start..start + self.keylen()]
    }

    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.data[HEADER_LEN + self.extlen() + self.keylen()..]
    }

    /// The full wire image.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[ V: {} k: <{}> ]",
            self.vbucket(),
            String::from_utf8_lossy(self.key())
        )
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("magic", &self.magic())
            .field("opcode", &self.opcode())
            .field("vbucket", &self.vbucket())
            .field("bodylen", &self.bodylen())
            .finish()
    }
}
