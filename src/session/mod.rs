//! Identity-addressed peer membership and the session hello handshake.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use peerlink_core::protocol::hello::{Capabilities, MessageHeader, SessionHello};
use peerlink_core::protocol::message_type::MessageType;
use peerlink_core::protocol::version::compare_version;
use peerlink_core::transport::{Delivery, PeerId, SessionEvent, Transport};

use crate::config::TunnelConfig;
use crate::events::{Event, EventSender};

/// How traffic to a peer currently travels.
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub enum ConnectionKind {
    Direct,
    Relayed,
    NotApplicable,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionKind::Direct => "direct",
            ConnectionKind::Relayed => "relay",
            ConnectionKind::NotApplicable => "N/A",
        };
        f.write_str(s)
    }
}

/// Outcome of processing a peer's session hello.
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub enum HelloVerdict {
    Accepted,
    VersionTooOld,
    PasswordRequired,
    /// Not even a message header, nothing was done
    Malformed,
}

impl HelloVerdict {
    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            HelloVerdict::VersionTooOld | HelloVerdict::PasswordRequired
        )
    }
}

struct LocalSettings {
    version: String,
    capabilities: Capabilities,
    password_protected: bool,
    min_peer_version: String,
}

pub struct PeerSessionManager {
    transport: Arc<dyn Transport>,
    peers: Mutex<BTreeSet<PeerId>>,
    settings: RwLock<LocalSettings>,
    events: EventSender,
    batch_size: usize,
}

impl PeerSessionManager {
    pub fn new(config: &TunnelConfig, transport: Arc<dyn Transport>, events: EventSender) -> Self {
        Self {
            transport,
            peers: Mutex::new(BTreeSet::new()),
            settings: RwLock::new(LocalSettings {
                version: config.local_version.clone(),
                capabilities: config.capabilities(),
                password_protected: config.password_protected,
                min_peer_version: config.min_peer_version.clone(),
            }),
            events,
            batch_size: config.poll_batch_size,
        }
    }
    pub fn set_local_version<S: Into<String>>(&self, version: S) {
        self.settings.write().version = version.into();
    }
    pub fn set_password_protected(&self, password_protected: bool) {
        self.settings.write().password_protected = password_protected;
    }
    pub fn local_version(&self) -> String {
        self.settings.read().version.clone()
    }
    fn hello(&self) -> BytesMut {
        let settings = self.settings.read();
        SessionHello::new(settings.version.as_str(), settings.capabilities).encode()
    }

    /// Track `peer`, (re)open its session and greet it.
    ///
    /// Always emits [`Event::PeerJoined`], even when the hello could not be queued.
    pub fn add_peer(&self, peer: PeerId) {
        if peer == self.transport.local_identity() {
            return;
        }
        self.peers.lock().insert(peer);
        self.transport.close_session(peer);
        self.transport.accept_session(peer);
        let hello = self.hello();
        match self
            .transport
            .send_to_peer(peer, &hello, Delivery::ReliableAutoRestart)
        {
            Ok(_) => log::debug!("sent session hello to {peer}"),
            Err(e) => log::warn!("send session hello to {peer} failed: {e:?}"),
        }
        self.events.send(Event::PeerJoined(peer));
    }
    pub fn remove_peer(&self, peer: PeerId) {
        let removed = self.peers.lock().remove(&peer);
        if removed {
            self.transport.close_session(peer);
            self.events.send(Event::PeerLeft(peer));
        }
    }
    pub fn clear_peers(&self) {
        let peers = std::mem::take(&mut *self.peers.lock());
        for peer in peers {
            self.transport.close_session(peer);
            self.events.send(Event::PeerLeft(peer));
        }
    }
    /// Converge on `desired`. Peers present in both sets are left alone.
    pub fn sync_peers(&self, desired: &BTreeSet<PeerId>) {
        let (to_add, to_remove) = {
            let current = self.peers.lock();
            let to_add: Vec<PeerId> = desired.difference(&current).copied().collect();
            let to_remove: Vec<PeerId> = current.difference(desired).copied().collect();
            (to_add, to_remove)
        };
        for peer in to_remove {
            self.remove_peer(peer);
        }
        for peer in to_add {
            self.add_peer(peer);
        }
    }
    pub fn peers(&self) -> BTreeSet<PeerId> {
        self.peers.lock().clone()
    }

    /// Dispatch an identity-addressed message by its header.
    pub fn handle_peer_message(&self, sender: PeerId, data: &[u8]) {
        let header = match MessageHeader::parse(data) {
            Ok(header) => header,
            Err(e) => {
                log::trace!("drop message from {sender}: {e}");
                return;
            }
        };
        match header.message_type {
            MessageType::SessionHello => {
                self.handle_session_hello(data, sender);
            }
            _ => self.events.send(Event::PeerMessage {
                peer: sender,
                data: BytesMut::from(data),
            }),
        }
    }
    /// Apply the version and password gates to a peer's hello.
    pub fn handle_session_hello(&self, data: &[u8], sender: PeerId) -> HelloVerdict {
        let hello = match SessionHello::decode(data) {
            Ok(hello) => hello,
            Err(e) => {
                log::debug!("malformed session hello from {sender}: {e}");
                return HelloVerdict::Malformed;
            }
        };
        let verdict = {
            let settings = self.settings.read();
            if !hello.version.is_empty()
                && compare_version(&hello.version, &settings.min_peer_version) == Ordering::Less
            {
                HelloVerdict::VersionTooOld
            } else if settings.password_protected
                && !hello.capabilities.contains(Capabilities::PASSWORD)
            {
                HelloVerdict::PasswordRequired
            } else {
                HelloVerdict::Accepted
            }
        };
        let addr = remote_addr_label(self.transport.session_status(sender).remote_addr);
        let version = if hello.version.is_empty() {
            "unknown"
        } else {
            hello.version.as_str()
        };
        if verdict.is_blocked() {
            self.peers.lock().remove(&sender);
            self.transport.close_session(sender);
            log::warn!(
                "[{}] blocked peer {sender} addr={addr} version={version}: {verdict:?}",
                unix_timestamp()
            );
            self.events.send(Event::ClientBlocked {
                peer: sender,
                version: version.to_string(),
            });
        } else {
            log::info!(
                "[{}] accepted peer {sender} addr={addr} version={version} capabilities={:?}",
                unix_timestamp(),
                hello.capabilities
            );
        }
        verdict
    }

    pub fn on_session_request(&self, peer: PeerId) {
        log::debug!("session request from {peer}");
        self.transport.accept_session(peer);
    }
    pub fn on_session_failed(&self, peer: PeerId, reason: &str) {
        log::info!("session with {peer} failed: {reason}");
        self.remove_peer(peer);
    }
    /// Handle pending session events and identity-addressed messages.
    ///
    /// Returns how many items were processed.
    pub fn pump(&self) -> usize {
        let mut events = Vec::new();
        self.transport.poll_session_events(&mut events);
        let mut processed = events.len();
        for event in events {
            match event {
                SessionEvent::Request(peer) => self.on_session_request(peer),
                SessionEvent::Failed { peer, reason } => self.on_session_failed(peer, &reason),
            }
        }
        let mut messages = Vec::new();
        processed += self
            .transport
            .receive_peer_messages(self.batch_size, &mut messages);
        for (sender, data) in messages {
            self.handle_peer_message(sender, &data);
        }
        processed
    }

    /// Round trip in milliseconds, or -1 when not connected.
    pub fn peer_ping(&self, peer: PeerId) -> i32 {
        let status = self.transport.session_status(peer);
        if status.is_connected() {
            status.ping
        } else {
            -1
        }
    }
    pub fn is_peer_connected(&self, peer: PeerId) -> bool {
        self.transport.session_status(peer).is_connected()
    }
    pub fn peer_connection_kind(&self, peer: PeerId) -> ConnectionKind {
        let status = self.transport.session_status(peer);
        if !status.is_connected() {
            ConnectionKind::NotApplicable
        } else if status.relayed {
            ConnectionKind::Relayed
        } else {
            ConnectionKind::Direct
        }
    }

    pub fn send_message_to_peer(&self, peer: PeerId, data: &[u8], delivery: Delivery) -> bool {
        match self.transport.send_to_peer(peer, data, delivery) {
            Ok(_) => true,
            Err(e) => {
                log::debug!("send to peer {peer} failed: {e:?}");
                false
            }
        }
    }
    /// Send to every tracked peer, returning how many sends were queued.
    pub fn broadcast_message(&self, data: &[u8], delivery: Delivery) -> usize {
        let peers = self.peers();
        peers
            .into_iter()
            .filter(|peer| self.send_message_to_peer(*peer, data, delivery))
            .count()
    }
    /// Close every session and forget all peers without emitting events.
    pub fn shutdown(&self) {
        let peers = std::mem::take(&mut *self.peers.lock());
        for peer in peers {
            self.transport.close_session(peer);
        }
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn remote_addr_label(addr: Option<SocketAddr>) -> String {
    addr.map(|addr| addr.to_string())
        .unwrap_or_else(|| "N/A".to_string())
}
