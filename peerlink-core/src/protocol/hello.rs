/*
   0               7 8                            23 24
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |  type (u8)     |       payload length (u16)     |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |        version (16 bytes, NUL padded ASCII)     |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  | capabilities   |
  +-+-+-+-+-+-+-+-+-+
*/

use bytes::{BufMut, BytesMut};
use std::fmt;

use crate::error::{Error, Result};
use crate::protocol::message_type::MessageType;

pub const HEADER_LEN: usize = 3;
pub const VERSION_FIELD_LEN: usize = 16;
pub const SESSION_HELLO_PAYLOAD_LEN: usize = VERSION_FIELD_LEN + 1;

#[derive(Hash, Eq, PartialEq, Copy, Clone, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    /// The sender understands the password-protected session flow.
    pub const PASSWORD: Capabilities = Capabilities(0b0000_0001);

    pub const fn empty() -> Capabilities {
        Capabilities(0)
    }
    pub const fn from_bits(bits: u8) -> Capabilities {
        Capabilities(bits)
    }
    pub const fn bits(&self) -> u8 {
        self.0
    }
    pub const fn contains(&self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
    pub fn insert(&mut self, other: Capabilities) {
        self.0 |= other.0
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capabilities({:#010b})", self.0)
    }
}

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub struct MessageHeader {
    pub message_type: MessageType,
    /// Payload length following the header, big endian on the wire
    pub length: u16,
}

impl MessageHeader {
    pub fn parse(buf: &[u8]) -> Result<MessageHeader> {
        if buf.len() < HEADER_LEN {
            return Err(Error::ShortPacket {
                len: buf.len(),
                required: HEADER_LEN,
            });
        }
        Ok(MessageHeader {
            message_type: buf[0].into(),
            length: u16::from_be_bytes([buf[1], buf[2]]),
        })
    }
    pub fn write(&self, out: &mut BytesMut) {
        out.put_u8(self.message_type.into());
        out.put_u16(self.length);
    }
}

#[derive(Eq, PartialEq, Clone, Debug, Default)]
pub struct SessionHello {
    /// Empty when the remote sent no (or a truncated) payload
    pub version: String,
    pub capabilities: Capabilities,
}

impl SessionHello {
    pub fn new<S: Into<String>>(version: S, capabilities: Capabilities) -> SessionHello {
        Self {
            version: version.into(),
            capabilities,
        }
    }
    /// Serialize header and payload. The version is cut to 15 bytes so the
    /// field always keeps a terminating NUL.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + SESSION_HELLO_PAYLOAD_LEN);
        MessageHeader {
            message_type: MessageType::SessionHello,
            length: SESSION_HELLO_PAYLOAD_LEN as u16,
        }
        .write(&mut buf);
        let mut version = [0u8; VERSION_FIELD_LEN];
        let bytes = self.version.as_bytes();
        let len = bytes.len().min(VERSION_FIELD_LEN - 1);
        version[..len].copy_from_slice(&bytes[..len]);
        buf.put_slice(&version);
        buf.put_u8(self.capabilities.bits());
        buf
    }
    /// Parse a hello message. Only a missing header is an error; a declared or
    /// available payload shorter than expected yields an empty hello.
    pub fn decode(buf: &[u8]) -> Result<SessionHello> {
        let header = MessageHeader::parse(buf)?;
        let available = &buf[HEADER_LEN..];
        if (header.length as usize) < SESSION_HELLO_PAYLOAD_LEN
            || available.len() < SESSION_HELLO_PAYLOAD_LEN
        {
            return Ok(SessionHello::default());
        }
        let field = &available[..VERSION_FIELD_LEN];
        let end = field.iter().position(|v| *v == 0).unwrap_or(field.len());
        let version = String::from_utf8_lossy(&field[..end])
            .trim_end_matches(|c| c == '\0' || c == ' ')
            .to_string();
        Ok(SessionHello {
            version,
            capabilities: Capabilities::from_bits(available[VERSION_FIELD_LEN]),
        })
    }
}
