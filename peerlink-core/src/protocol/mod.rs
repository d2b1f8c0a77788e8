/*
   0               7 8                                                                      55
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |  tag (0x02)    |                    client id (6 x ASCII alphanumeric)                    |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                                  raw udp payload(n)                                      |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/

use bytes::{BufMut, BytesMut};
use std::io;

pub mod client_id;
pub mod hello;
pub mod message_type;
pub mod version;

use client_id::{ClientId, CLIENT_ID_LEN};

/// Leading byte of every UDP tunnel message. Any other value belongs to the stream multiplexer.
pub const UDP_TUNNEL_TAG: u8 = 0x02;
pub const TUNNEL_HEAD_LEN: usize = 1 + CLIENT_ID_LEN;

pub fn is_tunnel_packet(buf: &[u8]) -> bool {
    buf.first() == Some(&UDP_TUNNEL_TAG)
}

/// Split a tag-stripped tunnel body into its client id and payload.
///
/// Returns `None` for bodies shorter than the id or carrying a malformed id.
pub fn parse_tunnel_body(body: &[u8]) -> Option<(ClientId, &[u8])> {
    if body.len() < CLIENT_ID_LEN {
        return None;
    }
    let (id, payload) = body.split_at(CLIENT_ID_LEN);
    let id = ClientId::try_from(id).ok()?;
    Some((id, payload))
}

pub struct TunnelPacket<B> {
    buffer: B,
}

impl<B: AsRef<[u8]>> TunnelPacket<B> {
    pub fn new(buffer: B) -> io::Result<TunnelPacket<B>> {
        let len = buffer.as_ref().len();
        if len < TUNNEL_HEAD_LEN {
            return Err(crate::error::Error::ShortPacket {
                len,
                required: TUNNEL_HEAD_LEN,
            }
            .into());
        }
        let tag = buffer.as_ref()[0];
        if tag != UDP_TUNNEL_TAG {
            return Err(crate::error::Error::InvalidTag(tag).into());
        }
        Ok(Self { buffer })
    }
    pub fn client_id(&self) -> io::Result<ClientId> {
        Ok(ClientId::try_from(&self.buffer.as_ref()[1..TUNNEL_HEAD_LEN])?)
    }
    /// Everything after the tag, as handed to the forwarder.
    pub fn body(&self) -> &[u8] {
        &self.buffer.as_ref()[1..]
    }
    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[TUNNEL_HEAD_LEN..]
    }
    pub fn buffer(&self) -> &[u8] {
        self.buffer.as_ref()
    }
    pub fn into_inner(self) -> B {
        self.buffer
    }
}

pub struct Builder;

impl Builder {
    pub fn build_tunnel_packet(id: &ClientId, payload: &[u8]) -> BytesMut {
        let mut packet = BytesMut::with_capacity(TUNNEL_HEAD_LEN + payload.len());
        packet.put_u8(UDP_TUNNEL_TAG);
        packet.put_slice(id.as_ref());
        packet.put_slice(payload);
        packet
    }
}
