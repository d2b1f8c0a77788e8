//! Single background loop that drains the transport and routes each message.
//!
//! Tunnel packets (leading [`UDP_TUNNEL_TAG`]) go to the installed forwarder,
//! everything else to a per-connection [`StreamHandler`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_shutdown::ShutdownManager;
use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use peerlink_core::protocol::UDP_TUNNEL_TAG;
use peerlink_core::transport::{ConnectionId, Transport};

use crate::config::TunnelConfig;
use crate::forwarder::ForwarderSlot;
use crate::session::PeerSessionManager;
pub use delay::AdaptiveDelay;

mod delay;

/// Consumer of non-tunnel traffic on one connection.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle_packet(&self, data: &[u8]);
}

pub trait StreamHandlerFactory: Send + Sync {
    fn create(&self, conn: ConnectionId, transport: Arc<dyn Transport>) -> Arc<dyn StreamHandler>;
}

/// Factory whose handlers drop everything they receive.
#[derive(Clone, Copy, Default)]
pub struct DiscardStreams;

struct DiscardHandler(ConnectionId);

#[async_trait]
impl StreamHandler for DiscardHandler {
    async fn handle_packet(&self, data: &[u8]) {
        log::trace!("discard stream packet on {}, len={}", self.0, data.len());
    }
}

impl StreamHandlerFactory for DiscardStreams {
    fn create(&self, conn: ConnectionId, _transport: Arc<dyn Transport>) -> Arc<dyn StreamHandler> {
        Arc::new(DiscardHandler(conn))
    }
}

pub struct MessagePoller {
    batch_size: usize,
    max_delay: u32,
    unit: Duration,
    transport: Arc<dyn Transport>,
    forwarder: ForwarderSlot,
    factory: Arc<dyn StreamHandlerFactory>,
    session_manager: Option<Arc<PeerSessionManager>>,
    running: Mutex<Option<ShutdownManager<()>>>,
}

impl MessagePoller {
    pub fn new(
        config: &TunnelConfig,
        transport: Arc<dyn Transport>,
        forwarder: ForwarderSlot,
        factory: Arc<dyn StreamHandlerFactory>,
    ) -> Self {
        Self {
            batch_size: config.poll_batch_size,
            max_delay: config.poll_max_delay,
            unit: config.poll_unit(),
            transport,
            forwarder,
            factory,
            session_manager: None,
            running: Mutex::new(None),
        }
    }
    /// Also pump session events and identity-addressed messages each cycle.
    pub fn with_session_manager(mut self, session_manager: Arc<PeerSessionManager>) -> Self {
        self.session_manager = Some(session_manager);
        self
    }
    fn poll_loop(&self) -> PollLoop {
        PollLoop {
            transport: self.transport.clone(),
            forwarder: self.forwarder.clone(),
            factory: self.factory.clone(),
            session_manager: self.session_manager.clone(),
            batch_size: self.batch_size,
            streams: HashMap::new(),
            messages: Vec::with_capacity(self.batch_size),
        }
    }
    /// Spawn the loop onto the current tokio runtime. No-op while running.
    pub fn start(&self) {
        let mut guard = self.running.lock();
        if guard.is_some() {
            return;
        }
        let shutdown_manager = ShutdownManager::new();
        let poll_loop = self.poll_loop();
        let task = run(poll_loop, AdaptiveDelay::new(self.max_delay), self.unit);
        match shutdown_manager.wrap_delay_shutdown(shutdown_manager.wrap_cancel(task)) {
            Ok(task) => {
                tokio::spawn(async move {
                    if task.await.is_err() {
                        log::debug!("recv shutdown signal: message poller stopped");
                    }
                });
            }
            Err(_) => return,
        }
        log::debug!("message poller started");
        *guard = Some(shutdown_manager);
    }
    /// Cancel the pending wait and join the loop. Safe to call repeatedly.
    pub async fn stop(&self) {
        let Some(shutdown_manager) = self.running.lock().take() else {
            return;
        };
        _ = shutdown_manager.trigger_shutdown(());
        shutdown_manager.wait_shutdown_complete().await;
    }
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

impl Drop for MessagePoller {
    fn drop(&mut self) {
        if let Some(shutdown_manager) = self.running.get_mut().take() {
            _ = shutdown_manager.trigger_shutdown(());
        }
    }
}

fn run(mut poll_loop: PollLoop, mut delay: AdaptiveDelay, unit: Duration) -> impl Future<Output = ()> {
    async move {
        loop {
            let processed = poll_loop.poll_once().await;
            match delay.next(processed) {
                0 => tokio::task::yield_now().await,
                n => tokio::time::sleep(unit * n).await,
            }
        }
    }
}

pub(crate) struct PollLoop {
    transport: Arc<dyn Transport>,
    forwarder: ForwarderSlot,
    factory: Arc<dyn StreamHandlerFactory>,
    session_manager: Option<Arc<PeerSessionManager>>,
    batch_size: usize,
    streams: HashMap<ConnectionId, Arc<dyn StreamHandler>>,
    messages: Vec<BytesMut>,
}

impl PollLoop {
    /// One pass over every connection; returns the number of items processed.
    pub(crate) async fn poll_once(&mut self) -> usize {
        let mut processed = 0;
        if let Some(session_manager) = &self.session_manager {
            processed += session_manager.pump();
        }
        let connections = self.transport.connections();
        self.streams.retain(|conn, _| connections.contains(conn));
        for conn in connections {
            self.messages.clear();
            processed += self
                .transport
                .receive_on_connection(conn, self.batch_size, &mut self.messages);
            let messages = std::mem::take(&mut self.messages);
            for message in &messages {
                self.dispatch(conn, message).await;
            }
            self.messages = messages;
        }
        processed
    }
    async fn dispatch(&mut self, conn: ConnectionId, message: &[u8]) {
        let Some(tag) = message.first() else {
            return;
        };
        if *tag == UDP_TUNNEL_TAG {
            if let Some(forwarder) = self.forwarder.forwarder() {
                forwarder.handle_tunnel_packet(conn, &message[1..]).await;
            }
            return;
        }
        let handler = self
            .streams
            .entry(conn)
            .or_insert_with(|| self.factory.create(conn, self.transport.clone()))
            .clone();
        handler.handle_packet(message).await;
    }
}
