use parking_lot::Mutex;
use peerlink_core::protocol::client_id::ClientId;
use peerlink_core::transport::ConnectionId;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Notify;

/// Host-side socket standing in for one remote client towards the local target.
pub(crate) struct TargetSession {
    pub(crate) socket: UdpSocket,
    receiving: AtomicBool,
    closed: Notify,
}

impl TargetSession {
    pub(crate) fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            receiving: AtomicBool::new(false),
            closed: Notify::new(),
        }
    }
    /// Claim the receive loop; false if one is already running.
    pub(crate) fn begin_receive(&self) -> bool {
        !self.receiving.swap(true, Ordering::AcqRel)
    }
    pub(crate) fn end_receive(&self) {
        self.receiving.store(false, Ordering::Release);
    }
    pub(crate) fn close(&self) {
        self.closed.notify_one();
    }
    pub(crate) async fn wait_closed(&self) {
        self.closed.notified().await
    }
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Assigned {
    Existing(ClientId),
    New { id: ClientId, count: usize },
    Full,
}

pub(crate) enum Route {
    Existing(Arc<TargetSession>),
    Missing,
    Full,
}

#[derive(Default)]
struct RegistryInner {
    client_to_id: BTreeMap<SocketAddr, ClientId>,
    id_to_client: HashMap<ClientId, SocketAddr>,
    id_to_conn: HashMap<ClientId, ConnectionId>,
    target_sessions: HashMap<ClientId, Arc<TargetSession>>,
}

/// Every map the forwarder keeps, behind one lock.
///
/// No method awaits, so the lock is never held across a socket operation.
pub(crate) struct ClientRegistry {
    inner: Mutex<RegistryInner>,
    capacity: usize,
}

impl ClientRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            capacity,
        }
    }
    fn is_full(&self, len: usize) -> bool {
        self.capacity != 0 && len >= self.capacity
    }
    /// Look up the id of a local sender, assigning a fresh unique one on first sight.
    pub(crate) fn assign(&self, key: SocketAddr) -> Assigned {
        let mut guard = self.inner.lock();
        if let Some(id) = guard.client_to_id.get(&key) {
            return Assigned::Existing(*id);
        }
        if self.is_full(guard.client_to_id.len()) {
            return Assigned::Full;
        }
        let id = loop {
            let id = ClientId::random();
            if !guard.id_to_client.contains_key(&id) {
                break id;
            }
        };
        guard.client_to_id.insert(key, id);
        guard.id_to_client.insert(id, key);
        Assigned::New {
            id,
            count: guard.client_to_id.len(),
        }
    }
    pub(crate) fn client_addr(&self, id: &ClientId) -> Option<SocketAddr> {
        self.inner.lock().id_to_client.get(id).copied()
    }
    pub(crate) fn client_count(&self) -> usize {
        self.inner.lock().client_to_id.len()
    }
    pub(crate) fn connection(&self, id: &ClientId) -> Option<ConnectionId> {
        self.inner.lock().id_to_conn.get(id).copied()
    }
    /// Point `id` at `conn` (latest wins) and return its target session if one exists.
    pub(crate) fn update_route(&self, id: ClientId, conn: ConnectionId) -> Route {
        let mut guard = self.inner.lock();
        if let Some(session) = guard.target_sessions.get(&id).cloned() {
            guard.id_to_conn.insert(id, conn);
            return Route::Existing(session);
        }
        if self.is_full(guard.target_sessions.len()) {
            return Route::Full;
        }
        guard.id_to_conn.insert(id, conn);
        Route::Missing
    }
    /// Insert `session` unless another caller got there first; returns the one kept.
    pub(crate) fn insert_session(
        &self,
        id: ClientId,
        session: Arc<TargetSession>,
    ) -> Arc<TargetSession> {
        self.inner
            .lock()
            .target_sessions
            .entry(id)
            .or_insert(session)
            .clone()
    }
    pub(crate) fn session_count(&self) -> usize {
        self.inner.lock().target_sessions.len()
    }
    /// Drop every trace of `id`, closing its target session.
    pub(crate) fn forget(&self, id: &ClientId) -> bool {
        let (found, session) = {
            let mut guard = self.inner.lock();
            let mut found = guard.id_to_conn.remove(id).is_some();
            if let Some(key) = guard.id_to_client.remove(id) {
                guard.client_to_id.remove(&key);
                found = true;
            }
            let session = guard.target_sessions.remove(id);
            (found || session.is_some(), session)
        };
        if let Some(session) = session {
            session.close();
        }
        found
    }
    pub(crate) fn clear(&self) {
        let sessions: Vec<Arc<TargetSession>> = {
            let mut guard = self.inner.lock();
            guard.client_to_id.clear();
            guard.id_to_client.clear();
            guard.id_to_conn.clear();
            guard.target_sessions.drain().map(|(_, v)| v).collect()
        };
        for session in sessions {
            session.close();
        }
    }
}
