//! UDP relay between local datagram clients and the peer transport.
//!
//! The same type plays both roles:
//!
//! - relay side (client peer): a local socket on `bind_port` receives game
//!   traffic, tags each sender with a [`ClientId`] and ships it to the host
//!   inside a tunnel packet.
//! - target side (host peer): every client id gets its own socket towards
//!   `127.0.0.1:target_port`, so the local server sees one address per
//!   remote client; replies travel back through the same connection.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_shutdown::ShutdownManager;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use peerlink_core::protocol::client_id::ClientId;
use peerlink_core::protocol::{parse_tunnel_body, Builder};
use peerlink_core::socket::{bind_udp, should_ignore_error};
use peerlink_core::transport::{ConnectionId, Delivery, Transport};
use tokio::net::UdpSocket;

use crate::config::TunnelConfig;
use crate::error::{Error, Result};
use crate::events::{Event, EventSender};
use registry::{Assigned, ClientRegistry, Route, TargetSession};

mod registry;

const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Receiver of tunnel bodies, i.e. datagrams with the leading tag already stripped.
#[async_trait]
pub trait TunnelSink: Send + Sync {
    async fn handle_tunnel_packet(&self, conn: ConnectionId, body: &[u8]);
}

/// Shared, swappable reference to the active forwarder.
///
/// The poller reads it on every tunnel packet; the owner installs or removes
/// the forwarder as sessions come and go.
#[derive(Clone, Default)]
pub struct ForwarderSlot {
    inner: Arc<RwLock<Option<Arc<dyn TunnelSink>>>>,
}

impl ForwarderSlot {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set<S: TunnelSink + 'static>(&self, sink: Arc<S>) {
        *self.inner.write() = Some(sink);
    }
    pub fn take(&self) -> Option<Arc<dyn TunnelSink>> {
        self.inner.write().take()
    }
    pub fn forwarder(&self) -> Option<Arc<dyn TunnelSink>> {
        self.inner.read().clone()
    }
}

#[derive(Clone)]
struct ForwarderContext {
    transport: Arc<dyn Transport>,
    registry: Arc<ClientRegistry>,
    events: EventSender,
    shutdown_manager: ShutdownManager<()>,
    socket: Arc<UdpSocket>,
    target_port: u16,
    recv_buffer_size: usize,
    socket_buffer_size: usize,
}

pub struct UdpForwarder {
    bind_port: u16,
    target_port: u16,
    recv_buffer_size: usize,
    socket_buffer_size: usize,
    transport: Arc<dyn Transport>,
    registry: Arc<ClientRegistry>,
    events: EventSender,
    running: Mutex<Option<ForwarderContext>>,
}

impl UdpForwarder {
    pub fn new(config: &TunnelConfig, transport: Arc<dyn Transport>, events: EventSender) -> Self {
        Self {
            bind_port: config.bind_port,
            target_port: config.target_port,
            recv_buffer_size: config.recv_buffer_size,
            socket_buffer_size: config.socket_buffer_size,
            transport,
            registry: Arc::new(ClientRegistry::new(config.max_clients)),
            events,
            running: Mutex::new(None),
        }
    }
    /// Bind the local socket and, when `bind_port` is non-zero, start accepting clients.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut guard = self.running.lock();
        if guard.is_some() {
            return Err(Error::AlreadyRunning);
        }
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.bind_port));
        let socket = match bind_udp(addr, self.socket_buffer_size) {
            Ok(socket) => socket,
            Err(e) => {
                log::warn!("udp forwarder failed to bind {addr}: {e:?}");
                return Err(e.into());
            }
        };
        let socket = Arc::new(UdpSocket::from_std(socket)?);
        let context = ForwarderContext {
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            events: self.events.clone(),
            shutdown_manager: ShutdownManager::new(),
            socket,
            target_port: self.target_port,
            recv_buffer_size: self.recv_buffer_size,
            socket_buffer_size: self.socket_buffer_size,
        };
        if self.bind_port != 0 {
            context.spawn(ingress_loop(context.clone()));
        }
        log::info!(
            "udp forwarder started, local={:?} target_port={} host={}",
            context.socket.local_addr(),
            self.target_port,
            self.transport.is_host()
        );
        *guard = Some(context);
        Ok(())
    }
    /// Stop every task and close every socket. Calling it again is a no-op.
    pub async fn stop(&self) {
        let Some(context) = self.running.lock().take() else {
            return;
        };
        _ = context.shutdown_manager.trigger_shutdown(());
        context.shutdown_manager.wait_shutdown_complete().await;
        context.registry.clear();
        log::info!("udp forwarder stopped");
    }
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .as_ref()
            .and_then(|context| context.socket.local_addr().ok())
    }
    /// Distinct local senders seen on the relay side.
    pub fn client_count(&self) -> usize {
        self.registry.client_count()
    }
    /// Remove all state for one client id, closing its target socket if any.
    pub fn forget_client(&self, id: &ClientId) -> bool {
        self.registry.forget(id)
    }
    fn context(&self) -> Option<ForwarderContext> {
        self.running.lock().clone()
    }
    /// Route a tunnel body that arrived on `conn`.
    ///
    /// Malformed bodies and packets received while stopped are dropped.
    pub async fn handle_tunnel_packet(&self, conn: ConnectionId, body: &[u8]) {
        let Some((id, payload)) = parse_tunnel_body(body) else {
            log::trace!("drop malformed tunnel body, len={} {conn}", body.len());
            return;
        };
        let Some(context) = self.context() else {
            return;
        };
        // stop() waits for this token, so nothing is inserted after it clears the registry
        let Ok(_token) = context.shutdown_manager.delay_shutdown_token() else {
            return;
        };
        if context.shutdown_manager.is_shutdown_triggered() {
            return;
        }
        if context.transport.is_host() {
            context.forward_to_target(conn, id, payload).await;
        } else {
            context.forward_to_client(&id, payload).await;
        }
    }
}

#[async_trait]
impl TunnelSink for UdpForwarder {
    async fn handle_tunnel_packet(&self, conn: ConnectionId, body: &[u8]) {
        UdpForwarder::handle_tunnel_packet(self, conn, body).await
    }
}

impl Drop for UdpForwarder {
    fn drop(&mut self) {
        if let Some(context) = self.running.get_mut().take() {
            _ = context.shutdown_manager.trigger_shutdown(());
            context.registry.clear();
        }
    }
}

impl ForwarderContext {
    /// Returns false when the forwarder is shutting down and `fut` was dropped.
    fn spawn<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown_manager.is_shutdown_triggered() {
            log::debug!("udp forwarder shutting down, task not started");
            return false;
        }
        let Ok(task) = self
            .shutdown_manager
            .wrap_delay_shutdown(self.shutdown_manager.wrap_cancel(fut))
        else {
            log::debug!("udp forwarder already shut down, task not started");
            return false;
        };
        tokio::spawn(async move {
            if task.await.is_err() {
                log::debug!("recv shutdown signal: udp forwarder task stopped");
            }
        });
        true
    }
    fn send_tunnel_packet(&self, id: &ClientId, payload: &[u8]) {
        if !self.transport.is_connected() {
            return;
        }
        let conn = if self.transport.is_host() {
            self.registry.connection(id)
        } else {
            self.transport.connection()
        };
        let Some(conn) = conn.filter(ConnectionId::is_valid) else {
            log::trace!("no connection for client {id}");
            return;
        };
        let packet = Builder::build_tunnel_packet(id, payload);
        if let Err(e) = self
            .transport
            .send_to_connection(conn, &packet, Delivery::UnreliableNoDelay)
        {
            log::debug!("send tunnel packet to {conn} failed: {e:?}");
        }
    }
    async fn forward_to_client(&self, id: &ClientId, payload: &[u8]) {
        let Some(addr) = self.registry.client_addr(id) else {
            log::trace!("drop tunnel packet for unknown client {id}");
            return;
        };
        if let Err(e) = self.socket.send_to(payload, addr).await {
            log::debug!("send to udp client {addr} failed: {e:?}");
        }
    }
    async fn forward_to_target(&self, conn: ConnectionId, id: ClientId, payload: &[u8]) {
        if !conn.is_valid() {
            return;
        }
        let session = match self.registry.update_route(id, conn) {
            Route::Existing(session) => session,
            Route::Full => {
                log::debug!("client limit reached, drop tunnel packet from {id}");
                return;
            }
            Route::Missing => match self.bind_target_session() {
                Ok(session) => {
                    log::info!("new target session for client {id} via {conn}");
                    self.registry.insert_session(id, Arc::new(session))
                }
                Err(e) => {
                    log::warn!("bind target session for client {id} failed: {e:?}");
                    return;
                }
            },
        };
        if session.begin_receive()
            && !self.spawn(target_receive_loop(self.clone(), id, session.clone()))
        {
            session.end_receive();
            return;
        }
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, self.target_port));
        if let Err(e) = session.socket.send_to(payload, target).await {
            log::debug!("send to target {target} failed: {e:?}");
        }
    }
    fn bind_target_session(&self) -> Result<TargetSession> {
        let socket = bind_udp(
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            self.socket_buffer_size,
        )?;
        Ok(TargetSession::new(UdpSocket::from_std(socket)?))
    }
}

async fn ingress_loop(context: ForwarderContext) {
    let mut buf = vec![0u8; context.recv_buffer_size];
    loop {
        let (len, addr) = match context.socket.recv_from(&mut buf).await {
            Ok(rs) => rs,
            Err(e) => {
                if let Some(backoff) = recv_error_backoff(&e) {
                    log::debug!("udp forwarder recv_from failed: {e:?}");
                    tokio::time::sleep(backoff).await;
                }
                continue;
            }
        };
        if len == 0 {
            continue;
        }
        let id = match context.registry.assign(addr) {
            Assigned::Existing(id) => id,
            Assigned::New { id, count } => {
                log::info!("new udp client {addr} assigned {id}");
                context.events.send(Event::ClientCountChanged(count));
                id
            }
            Assigned::Full => {
                log::debug!("client limit reached, drop datagram from {addr}");
                continue;
            }
        };
        context.send_tunnel_packet(&id, &buf[..len]);
    }
}

/// Pause before the next receive, or `None` for errors that are safe to skip right away.
fn recv_error_backoff(e: &io::Error) -> Option<Duration> {
    if should_ignore_error(e) {
        None
    } else {
        Some(RECV_ERROR_BACKOFF)
    }
}

async fn target_receive_loop(context: ForwarderContext, id: ClientId, session: Arc<TargetSession>) {
    let mut buf = vec![0u8; context.recv_buffer_size];
    loop {
        let rs = tokio::select! {
            _ = session.wait_closed() => break,
            rs = session.socket.recv_from(&mut buf) => rs,
        };
        match rs {
            Ok((0, _)) => {}
            Ok((len, _)) => context.send_tunnel_packet(&id, &buf[..len]),
            Err(e) => {
                if should_ignore_error(&e) {
                    continue;
                }
                log::debug!("target session {id} recv_from failed: {e:?}");
                break;
            }
        }
    }
    session.end_receive();
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::events;
    use peerlink_core::protocol::{is_tunnel_packet, TUNNEL_HEAD_LEN};
    use peerlink_core::transport::memory::MemoryNetwork;
    use peerlink_core::transport::PeerId;
    use std::time::Duration;

    fn free_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn echo_server() -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((len, addr)) = socket.recv_from(&mut buf).await {
                _ = socket.send_to(&buf[..len], addr).await;
            }
        });
        port
    }

    /// Move tunnel packets from `transport` into `forwarder`, like the poller does.
    fn pump(transport: Arc<dyn Transport>, forwarder: Arc<UdpForwarder>) {
        tokio::spawn(async move {
            let mut messages = Vec::new();
            loop {
                for conn in transport.connections() {
                    transport.receive_on_connection(conn, 64, &mut messages);
                    for message in messages.drain(..) {
                        if is_tunnel_packet(&message) {
                            forwarder.handle_tunnel_packet(conn, &message[1..]).await;
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });
    }

    #[tokio::test]
    async fn test_round_trip() {
        let network = MemoryNetwork::new();
        let host = network.endpoint(PeerId::from(1));
        host.set_host(true);
        let client = network.endpoint(PeerId::from(2));
        network.connect(PeerId::from(1), PeerId::from(2));

        let target_port = echo_server().await;
        let host_forwarder = Arc::new(UdpForwarder::new(
            &TunnelConfig::empty().set_target_port(target_port),
            host.clone(),
            EventSender::discard(),
        ));
        host_forwarder.start().unwrap();
        let bind_port = free_port();
        let (sender, receiver) = events::channel();
        let client_forwarder = Arc::new(UdpForwarder::new(
            &TunnelConfig::empty().set_bind_port(bind_port),
            client.clone(),
            sender,
        ));
        client_forwarder.start().unwrap();
        pump(host, host_forwarder.clone());
        pump(client, client_forwarder.clone());

        let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 2048];
        for payload in [&b"hello"[..], &b"second datagram"[..]] {
            app.send_to(payload, ("127.0.0.1", bind_port)).await.unwrap();
            let (len, from) = tokio::time::timeout(Duration::from_secs(5), app.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..len], payload);
            assert_eq!(from.port(), bind_port);
        }
        assert_eq!(client_forwarder.client_count(), 1);
        assert_eq!(host_forwarder.registry.session_count(), 1);
        assert_eq!(
            receiver.recv().await.unwrap(),
            Event::ClientCountChanged(1)
        );

        client_forwarder.stop().await;
        host_forwarder.stop().await;
        assert_eq!(host_forwarder.registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown() {
        let network = MemoryNetwork::new();
        let host = network.endpoint(PeerId::from(1));
        host.set_host(true);
        let client = network.endpoint(PeerId::from(2));
        let (conn, _) = network.connect(PeerId::from(1), PeerId::from(2));

        let host_forwarder = UdpForwarder::new(&TunnelConfig::empty(), host, EventSender::discard());
        // ignored while stopped
        host_forwarder
            .handle_tunnel_packet(conn, b"ABCDEFpayload")
            .await;
        host_forwarder.start().unwrap();
        for body in [&b""[..], b"ABC", b"ABCDE", b"AB#DEFpayload"] {
            host_forwarder.handle_tunnel_packet(conn, body).await;
        }
        host_forwarder
            .handle_tunnel_packet(ConnectionId::INVALID, b"ABCDEFpayload")
            .await;
        assert_eq!(host_forwarder.registry.session_count(), 0);
        // an empty payload is still a valid body
        host_forwarder.handle_tunnel_packet(conn, b"ABCDEF").await;
        assert_eq!(host_forwarder.registry.session_count(), 1);
        assert!(host_forwarder.forget_client(&"ABCDEF".parse().unwrap()));
        assert_eq!(host_forwarder.registry.session_count(), 0);
        host_forwarder.stop().await;

        let client_forwarder =
            UdpForwarder::new(&TunnelConfig::empty(), client, EventSender::discard());
        client_forwarder.start().unwrap();
        client_forwarder
            .handle_tunnel_packet(conn, b"ZZZZZZdata")
            .await;
        assert_eq!(client_forwarder.client_count(), 0);
        client_forwarder.stop().await;
    }

    #[tokio::test]
    async fn test_host_session_per_client() {
        let network = MemoryNetwork::new();
        let host = network.endpoint(PeerId::from(1));
        host.set_host(true);
        network.endpoint(PeerId::from(2));
        let (conn, peer_conn) = network.connect(PeerId::from(1), PeerId::from(2));
        let target_port = echo_server().await;
        let forwarder = UdpForwarder::new(
            &TunnelConfig::empty().set_target_port(target_port).set_max_clients(2),
            host.clone(),
            EventSender::discard(),
        );
        forwarder.start().unwrap();
        let mut body = Vec::from(&b"AAAAAA"[..]);
        body.extend_from_slice(b"ping");
        forwarder.handle_tunnel_packet(conn, &body).await;
        forwarder.handle_tunnel_packet(conn, b"BBBBBBping").await;
        forwarder.handle_tunnel_packet(conn, b"CCCCCCping").await;
        assert_eq!(forwarder.registry.session_count(), 2);

        let peer = network.endpoint(PeerId::from(2));
        let mut replies = Vec::new();
        for _ in 0..500 {
            peer.receive_on_connection(peer_conn, 16, &mut replies);
            if replies.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(replies.len(), 2);
        for reply in &replies {
            assert!(is_tunnel_packet(reply));
            assert_eq!(&reply[TUNNEL_HEAD_LEN..], b"ping");
        }
        forwarder.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_during_packet() {
        let network = MemoryNetwork::new();
        let host = network.endpoint(PeerId::from(1));
        host.set_host(true);
        network.endpoint(PeerId::from(2));
        let (conn, peer_conn) = network.connect(PeerId::from(1), PeerId::from(2));
        let target_port = echo_server().await;
        let forwarder = Arc::new(UdpForwarder::new(
            &TunnelConfig::empty().set_target_port(target_port),
            host,
            EventSender::discard(),
        ));
        for _ in 0..50 {
            forwarder.start().unwrap();
            let racing = forwarder.clone();
            let packet = tokio::spawn(async move {
                racing.handle_tunnel_packet(conn, b"AAAAAAping").await;
            });
            forwarder.stop().await;
            packet.await.unwrap();
            assert_eq!(forwarder.registry.session_count(), 0);
        }

        // the same client id gets a working receive loop after a restart
        forwarder.start().unwrap();
        forwarder.handle_tunnel_packet(conn, b"AAAAAAping").await;
        let peer = network.endpoint(PeerId::from(2));
        let mut replies = Vec::new();
        for _ in 0..500 {
            peer.receive_on_connection(peer_conn, 16, &mut replies);
            if !replies.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(replies.len(), 1);
        assert_eq!(&replies[0][TUNNEL_HEAD_LEN..], b"ping");
        forwarder.stop().await;
    }

    #[test]
    fn test_recv_error_backoff() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(recv_error_backoff(&refused), Some(RECV_ERROR_BACKOFF));
        let would_block = io::Error::from(io::ErrorKind::WouldBlock);
        assert_eq!(
            recv_error_backoff(&would_block).is_none(),
            should_ignore_error(&would_block)
        );
    }

    #[tokio::test]
    async fn test_stop_idempotent() {
        let network = MemoryNetwork::new();
        let transport = network.endpoint(PeerId::from(1));
        let forwarder = UdpForwarder::new(
            &TunnelConfig::empty().set_bind_port(free_port()),
            transport,
            EventSender::discard(),
        );
        forwarder.stop().await;
        forwarder.start().unwrap();
        assert!(forwarder.is_running());
        assert!(forwarder.local_addr().is_some());
        assert!(matches!(forwarder.start(), Err(Error::AlreadyRunning)));
        forwarder.stop().await;
        forwarder.stop().await;
        assert!(!forwarder.is_running());
        assert!(forwarder.local_addr().is_none());
        forwarder.start().unwrap();
        forwarder.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let occupied = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let network = MemoryNetwork::new();
        let forwarder = UdpForwarder::new(
            &TunnelConfig::empty().set_bind_port(port),
            network.endpoint(PeerId::from(1)),
            EventSender::discard(),
        );
        assert!(forwarder.start().is_err());
        assert!(!forwarder.is_running());
    }

    #[tokio::test]
    async fn test_slot() {
        let network = MemoryNetwork::new();
        let forwarder = Arc::new(UdpForwarder::new(
            &TunnelConfig::empty(),
            network.endpoint(PeerId::from(1)),
            EventSender::discard(),
        ));
        let slot = ForwarderSlot::new();
        assert!(slot.forwarder().is_none());
        slot.set(forwarder);
        assert!(slot.clone().forwarder().is_some());
        assert!(slot.take().is_some());
        assert!(slot.forwarder().is_none());
    }
}
