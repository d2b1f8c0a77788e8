//! In-process [`Transport`] used by tests and demos.
//!
//! A [`MemoryNetwork`] owns a set of endpoints keyed by [`PeerId`].
//! Connections are created explicitly with [`MemoryNetwork::connect`];
//! identity-addressed sends open a session on the fly and raise a
//! [`SessionEvent::Request`] on the receiving side the first time. Delivery is
//! lossless and ordered regardless of the requested [`Delivery`].

use bytes::BytesMut;
use crossbeam_queue::SegQueue;
use crossbeam_utils::atomic::AtomicCell;
use dashmap::{DashMap, DashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::transport::{
    ConnectionId, ConnectionState, Delivery, PeerId, SessionEvent, SessionStatus, Transport,
};

const DEFAULT_PING: i32 = 1;

#[derive(Copy, Clone, Debug)]
struct LinkInfo {
    ping: i32,
    relayed: bool,
}

impl Default for LinkInfo {
    fn default() -> Self {
        Self {
            ping: DEFAULT_PING,
            relayed: false,
        }
    }
}

struct ConnectionSlot {
    remote: PeerId,
    remote_conn: ConnectionId,
    queue: SegQueue<BytesMut>,
}

struct Endpoint {
    identity: PeerId,
    host: AtomicCell<bool>,
    primary: AtomicCell<Option<ConnectionId>>,
    public_addr: AtomicCell<Option<SocketAddr>>,
    connections: DashMap<ConnectionId, Arc<ConnectionSlot>>,
    sessions: DashSet<PeerId>,
    pending_sessions: DashSet<PeerId>,
    peer_inbox: SegQueue<(PeerId, BytesMut)>,
    session_events: SegQueue<SessionEvent>,
}

impl Endpoint {
    fn new(identity: PeerId) -> Self {
        Self {
            identity,
            host: AtomicCell::new(false),
            primary: AtomicCell::new(None),
            public_addr: AtomicCell::new(None),
            connections: Default::default(),
            sessions: Default::default(),
            pending_sessions: Default::default(),
            peer_inbox: SegQueue::new(),
            session_events: SegQueue::new(),
        }
    }
}

#[derive(Default)]
struct NetworkInner {
    endpoints: DashMap<PeerId, Arc<Endpoint>>,
    links: DashMap<(PeerId, PeerId), LinkInfo>,
    next_connection: AtomicU32,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

fn link_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }
    /// Return the endpoint for `identity`, creating it on first use.
    pub fn endpoint(&self, identity: PeerId) -> Arc<MemoryTransport> {
        let endpoint = self
            .inner
            .endpoints
            .entry(identity)
            .or_insert_with(|| Arc::new(Endpoint::new(identity)))
            .clone();
        Arc::new(MemoryTransport {
            network: self.clone(),
            endpoint,
        })
    }
    fn get(&self, identity: &PeerId) -> Option<Arc<Endpoint>> {
        self.inner.endpoints.get(identity).map(|v| v.value().clone())
    }
    fn get_or_create(&self, identity: PeerId) -> Arc<Endpoint> {
        self.inner
            .endpoints
            .entry(identity)
            .or_insert_with(|| Arc::new(Endpoint::new(identity)))
            .clone()
    }
    fn allocate_connection(&self) -> ConnectionId {
        ConnectionId::from(self.inner.next_connection.fetch_add(1, Ordering::Relaxed) + 1)
    }
    /// Open a connection between two endpoints and return `(a's handle, b's handle)`.
    ///
    /// The first connection an endpoint gets becomes its primary one.
    pub fn connect(&self, a: PeerId, b: PeerId) -> (ConnectionId, ConnectionId) {
        let left = self.get_or_create(a);
        let right = self.get_or_create(b);
        let left_conn = self.allocate_connection();
        let right_conn = self.allocate_connection();
        left.connections.insert(
            left_conn,
            Arc::new(ConnectionSlot {
                remote: b,
                remote_conn: right_conn,
                queue: SegQueue::new(),
            }),
        );
        right.connections.insert(
            right_conn,
            Arc::new(ConnectionSlot {
                remote: a,
                remote_conn: left_conn,
                queue: SegQueue::new(),
            }),
        );
        _ = left.primary.compare_exchange(None, Some(left_conn));
        _ = right.primary.compare_exchange(None, Some(right_conn));
        log::debug!("memory connect {a}{left_conn} <-> {b}{right_conn}");
        (left_conn, right_conn)
    }
    /// Tear down every connection between `a` and `b` and fail their sessions.
    pub fn disconnect(&self, a: PeerId, b: PeerId) {
        for (this, other) in [(a, b), (b, a)] {
            let Some(endpoint) = self.get(&this) else {
                continue;
            };
            endpoint.connections.retain(|_, slot| slot.remote != other);
            if endpoint.primary.load().is_some_and(|v| !endpoint.connections.contains_key(&v)) {
                endpoint.primary.store(None);
            }
            endpoint.pending_sessions.remove(&other);
            if endpoint.sessions.remove(&other).is_some() {
                endpoint.session_events.push(SessionEvent::Failed {
                    peer: other,
                    reason: "link closed".to_string(),
                });
            }
        }
    }
    pub fn set_link(&self, a: PeerId, b: PeerId, ping: i32, relayed: bool) {
        self.inner
            .links
            .insert(link_key(a, b), LinkInfo { ping, relayed });
    }
    fn link(&self, a: PeerId, b: PeerId) -> LinkInfo {
        self.inner
            .links
            .get(&link_key(a, b))
            .map(|v| *v.value())
            .unwrap_or_default()
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    endpoint: Arc<Endpoint>,
}

impl MemoryTransport {
    pub fn set_host(&self, host: bool) {
        self.endpoint.host.store(host);
    }
    /// Address reported to peers through [`SessionStatus::remote_addr`].
    pub fn set_public_addr(&self, addr: SocketAddr) {
        self.endpoint.public_addr.store(Some(addr));
    }
    pub fn has_session(&self, peer: PeerId) -> bool {
        self.endpoint.sessions.contains(&peer)
    }
    pub fn pending_messages(&self, conn: ConnectionId) -> usize {
        self.endpoint
            .connections
            .get(&conn)
            .map(|v| v.queue.len())
            .unwrap_or(0)
    }
    fn slot(&self, conn: &ConnectionId) -> Option<Arc<ConnectionSlot>> {
        self.endpoint.connections.get(conn).map(|v| v.value().clone())
    }
}

impl Transport for MemoryTransport {
    fn local_identity(&self) -> PeerId {
        self.endpoint.identity
    }

    fn is_host(&self) -> bool {
        self.endpoint.host.load()
    }

    fn is_connected(&self) -> bool {
        !self.endpoint.connections.is_empty()
    }

    fn connection(&self) -> Option<ConnectionId> {
        match self.endpoint.primary.load() {
            Some(conn) if self.endpoint.connections.contains_key(&conn) => Some(conn),
            _ => self.connections().into_iter().next(),
        }
    }

    fn connections(&self) -> Vec<ConnectionId> {
        let mut list: Vec<ConnectionId> = self.endpoint.connections.iter().map(|v| *v.key()).collect();
        list.sort();
        list
    }

    fn send_to_connection(
        &self,
        conn: ConnectionId,
        buf: &[u8],
        _delivery: Delivery,
    ) -> io::Result<()> {
        let slot = self
            .slot(&conn)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection not found"))?;
        let remote = self
            .network
            .get(&slot.remote)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "remote endpoint gone"))?;
        let remote_slot = remote
            .connections
            .get(&slot.remote_conn)
            .map(|v| v.value().clone())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))?;
        remote_slot.queue.push(buf.into());
        Ok(())
    }

    fn receive_on_connection(
        &self,
        conn: ConnectionId,
        max: usize,
        out: &mut Vec<BytesMut>,
    ) -> usize {
        let Some(slot) = self.slot(&conn) else {
            return 0;
        };
        let mut count = 0;
        while count < max {
            let Some(buf) = slot.queue.pop() else {
                break;
            };
            out.push(buf);
            count += 1;
        }
        count
    }

    fn send_to_peer(&self, peer: PeerId, buf: &[u8], _delivery: Delivery) -> io::Result<()> {
        let remote = self
            .network
            .get(&peer)
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "peer not found"))?;
        let identity = self.endpoint.identity;
        self.endpoint.sessions.insert(peer);
        if !remote.sessions.contains(&identity) && remote.pending_sessions.insert(identity) {
            remote.session_events.push(SessionEvent::Request(identity));
        }
        remote.peer_inbox.push((identity, buf.into()));
        Ok(())
    }

    fn receive_peer_messages(&self, max: usize, out: &mut Vec<(PeerId, BytesMut)>) -> usize {
        let mut count = 0;
        while count < max {
            let Some(message) = self.endpoint.peer_inbox.pop() else {
                break;
            };
            out.push(message);
            count += 1;
        }
        count
    }

    fn poll_session_events(&self, out: &mut Vec<SessionEvent>) {
        while let Some(event) = self.endpoint.session_events.pop() {
            out.push(event);
        }
    }

    fn session_status(&self, peer: PeerId) -> SessionStatus {
        if !self.endpoint.sessions.contains(&peer) {
            return SessionStatus::default();
        }
        let Some(remote) = self.network.get(&peer) else {
            return SessionStatus {
                state: ConnectionState::Connecting,
                ..Default::default()
            };
        };
        let link = self.network.link(self.endpoint.identity, peer);
        SessionStatus {
            state: ConnectionState::Connected,
            ping: link.ping,
            relayed: link.relayed,
            remote_addr: remote.public_addr.load(),
        }
    }

    fn accept_session(&self, peer: PeerId) -> bool {
        self.endpoint.pending_sessions.remove(&peer);
        self.endpoint.sessions.insert(peer);
        true
    }

    fn close_session(&self, peer: PeerId) -> bool {
        self.endpoint.pending_sessions.remove(&peer);
        self.endpoint.sessions.remove(&peer).is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_connection_roundtrip() {
        let network = MemoryNetwork::new();
        let host = network.endpoint(1.into());
        let client = network.endpoint(2.into());
        assert!(!client.is_connected());
        let (host_conn, client_conn) = network.connect(1.into(), 2.into());
        assert_eq!(client.connection(), Some(client_conn));
        assert_eq!(host.connections(), vec![host_conn]);

        client
            .send_to_connection(client_conn, b"ping", Delivery::UnreliableNoDelay)
            .unwrap();
        client
            .send_to_connection(client_conn, b"ping2", Delivery::UnreliableNoDelay)
            .unwrap();
        assert_eq!(host.pending_messages(host_conn), 2);
        let mut out = Vec::new();
        assert_eq!(host.receive_on_connection(host_conn, 1, &mut out), 1);
        assert_eq!(host.receive_on_connection(host_conn, 16, &mut out), 1);
        assert_eq!(&out[0][..], b"ping");
        assert_eq!(&out[1][..], b"ping2");
        assert_eq!(host.receive_on_connection(host_conn, 16, &mut out), 0);
    }

    #[test]
    fn test_unknown_connection() {
        let network = MemoryNetwork::new();
        let client = network.endpoint(2.into());
        let err = client
            .send_to_connection(ConnectionId::from(42), b"x", Delivery::Reliable)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(client.connection().is_none());
    }

    #[test]
    fn test_peer_session_request() {
        let network = MemoryNetwork::new();
        let a = network.endpoint(1.into());
        let b = network.endpoint(2.into());
        a.send_to_peer(2.into(), b"hello", Delivery::Reliable).unwrap();
        a.send_to_peer(2.into(), b"again", Delivery::Reliable).unwrap();

        let mut events = Vec::new();
        b.poll_session_events(&mut events);
        assert_eq!(events, vec![SessionEvent::Request(1.into())]);
        assert!(b.accept_session(1.into()));
        assert!(b.session_status(1.into()).is_connected());

        let mut messages = Vec::new();
        assert_eq!(b.receive_peer_messages(8, &mut messages), 2);
        assert_eq!(messages[0].0, PeerId::from(1));
        assert_eq!(&messages[1].1[..], b"again");
    }

    #[test]
    fn test_session_status() {
        let network = MemoryNetwork::new();
        let a = network.endpoint(1.into());
        let b = network.endpoint(2.into());
        b.set_public_addr("10.0.0.2:27015".parse().unwrap());
        assert_eq!(a.session_status(2.into()).state, ConnectionState::None);
        a.accept_session(2.into());
        network.set_link(2.into(), 1.into(), 42, true);
        let status = a.session_status(2.into());
        assert!(status.is_connected());
        assert_eq!(status.ping, 42);
        assert!(status.relayed);
        assert_eq!(status.remote_addr, Some("10.0.0.2:27015".parse().unwrap()));
        assert!(a.close_session(2.into()));
        assert!(!a.close_session(2.into()));
        assert!(!a.session_status(2.into()).is_connected());
    }

    #[test]
    fn test_disconnect_fails_session() {
        let network = MemoryNetwork::new();
        let a = network.endpoint(1.into());
        let _b = network.endpoint(2.into());
        network.connect(1.into(), 2.into());
        a.accept_session(2.into());
        network.disconnect(1.into(), 2.into());
        assert!(!a.is_connected());
        assert!(a.connection().is_none());
        let mut events = Vec::new();
        a.poll_session_events(&mut events);
        assert!(matches!(
            events.as_slice(),
            [SessionEvent::Failed { peer, .. }] if *peer == PeerId::from(2)
        ));
    }
}
