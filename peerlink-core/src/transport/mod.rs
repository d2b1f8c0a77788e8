//! Boundary to the peer-to-peer message transport.
//!
//! The transport itself (NAT traversal, relaying, encryption, congestion
//! control) lives outside this workspace. Everything the tunnel layer needs
//! from it is captured by the [`Transport`] trait; [`memory`] provides an
//! in-process implementation for tests and demos.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::SocketAddr;

pub mod memory;

/// Stable identity of a peer, supplied by the transport.
#[repr(transparent)]
#[derive(Hash, Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(u64);

impl From<u64> for PeerId {
    fn from(value: u64) -> Self {
        PeerId(value)
    }
}
impl From<PeerId> for u64 {
    fn from(value: PeerId) -> Self {
        value.0
    }
}
impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of a connection-oriented transport session.
#[repr(transparent)]
#[derive(Hash, Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Debug)]
pub struct ConnectionId(u32);

impl ConnectionId {
    pub const INVALID: ConnectionId = ConnectionId(0);

    pub fn is_valid(&self) -> bool {
        self != &Self::INVALID
    }
}
impl From<u32> for ConnectionId {
    fn from(value: u32) -> Self {
        ConnectionId(value)
    }
}
impl From<ConnectionId> for u32 {
    fn from(value: ConnectionId) -> Self {
        value.0
    }
}
impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub enum Delivery {
    Reliable,
    /// Reliable, and transparently re-establish a broken session before sending
    ReliableAutoRestart,
    /// Unreliable, unordered, bypassing any send coalescing
    UnreliableNoDelay,
}

impl Delivery {
    pub fn is_reliable(&self) -> bool {
        !matches!(self, Delivery::UnreliableNoDelay)
    }
}

#[derive(Eq, PartialEq, Copy, Clone, Debug, Default)]
pub enum ConnectionState {
    #[default]
    None,
    Connecting,
    Connected,
    ClosedByPeer,
    ProblemDetectedLocally,
}

#[derive(Eq, PartialEq, Copy, Clone, Debug, Default)]
pub struct SessionStatus {
    pub state: ConnectionState,
    /// Round trip estimate in milliseconds, only meaningful when connected
    pub ping: i32,
    /// Traffic goes through a relay rather than a direct path
    pub relayed: bool,
    pub remote_addr: Option<SocketAddr>,
}

impl SessionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

#[derive(Eq, PartialEq, Clone, Debug)]
pub enum SessionEvent {
    /// A peer opened a session we did not initiate
    Request(PeerId),
    Failed { peer: PeerId, reason: String },
}

/// Capabilities the tunnel layer consumes from the peer-to-peer transport.
///
/// All methods are non-blocking: sends are queued by the transport and
/// receives only drain what is already buffered.
pub trait Transport: Send + Sync {
    fn local_identity(&self) -> PeerId;
    /// Whether this instance hosts the larger session (host role) or joined it (client role).
    fn is_host(&self) -> bool;
    fn is_connected(&self) -> bool;
    /// The connection to the host, when acting as a client.
    fn connection(&self) -> Option<ConnectionId>;
    fn connections(&self) -> Vec<ConnectionId>;
    fn send_to_connection(&self, conn: ConnectionId, buf: &[u8], delivery: Delivery)
        -> io::Result<()>;
    /// Append at most `max` pending messages of `conn` to `out`, returning how many were appended.
    fn receive_on_connection(&self, conn: ConnectionId, max: usize, out: &mut Vec<BytesMut>)
        -> usize;
    fn send_to_peer(&self, peer: PeerId, buf: &[u8], delivery: Delivery) -> io::Result<()>;
    fn receive_peer_messages(&self, max: usize, out: &mut Vec<(PeerId, BytesMut)>) -> usize;
    fn poll_session_events(&self, out: &mut Vec<SessionEvent>);
    fn session_status(&self, peer: PeerId) -> SessionStatus;
    fn accept_session(&self, peer: PeerId) -> bool;
    fn close_session(&self, peer: PeerId) -> bool;
}
