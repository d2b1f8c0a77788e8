//! # peerlink
//!
//! Carries local UDP traffic between peers over an existing peer-to-peer
//! message transport and negotiates compatibility between those peers.
//!
//! - [`forwarder::UdpForwarder`] relays datagrams between local UDP clients
//!   and the transport, in both host and client roles.
//! - [`poller::MessagePoller`] drains the transport and routes each message.
//! - [`session::PeerSessionManager`] tracks identity-addressed peers and runs
//!   the version/password hello handshake.
//!
//! [`Builder`] wires all three together into a [`TunnelNode`]:
//!
//! ```rust,no_run
//! use peerlink::config::TunnelConfig;
//! use peerlink::Builder;
//! use peerlink_core::transport::memory::MemoryNetwork;
//!
//! # async fn run() -> peerlink::error::Result<()> {
//! let network = MemoryNetwork::new();
//! let (node, events) = Builder::new(network.endpoint(1.into()))
//!     .config(TunnelConfig::empty().set_bind_port(27015))
//!     .build()?;
//! node.start()?;
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! node.stop().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use peerlink_core::transport::Transport;

use crate::config::TunnelConfig;
use crate::error::Result;
use crate::events::EventReceiver;
use crate::forwarder::{ForwarderSlot, UdpForwarder};
use crate::poller::{DiscardStreams, MessagePoller, StreamHandlerFactory};
use crate::session::PeerSessionManager;

pub mod config;
pub mod error;
pub mod events;
pub mod forwarder;
pub mod poller;
pub mod session;

pub use peerlink_core::protocol::client_id::ClientId;
pub use peerlink_core::transport::{ConnectionId, Delivery, PeerId};

pub struct Builder {
    transport: Arc<dyn Transport>,
    config: Option<TunnelConfig>,
    stream_factory: Option<Arc<dyn StreamHandlerFactory>>,
}

impl Builder {
    pub fn new<T: Transport + 'static>(transport: Arc<T>) -> Self {
        Self {
            transport,
            config: None,
            stream_factory: None,
        }
    }
    pub fn config(mut self, config: TunnelConfig) -> Self {
        self.config = Some(config);
        self
    }
    pub fn stream_factory<F: StreamHandlerFactory + 'static>(mut self, factory: F) -> Self {
        self.stream_factory = Some(Arc::new(factory));
        self
    }
    pub fn build(self) -> Result<(TunnelNode, EventReceiver)> {
        let config = self.config.unwrap_or_default();
        config.check()?;
        let (sender, receiver) = events::channel();
        let sessions = Arc::new(PeerSessionManager::new(
            &config,
            self.transport.clone(),
            sender.clone(),
        ));
        let forwarder = Arc::new(UdpForwarder::new(&config, self.transport.clone(), sender));
        let slot = ForwarderSlot::new();
        let poller = MessagePoller::new(
            &config,
            self.transport,
            slot.clone(),
            self.stream_factory
                .unwrap_or_else(|| Arc::new(DiscardStreams)),
        )
        .with_session_manager(sessions.clone());
        Ok((
            TunnelNode {
                forwarder,
                slot,
                poller,
                sessions,
            },
            receiver,
        ))
    }
}

/// A forwarder, a poller and a session manager sharing one transport.
pub struct TunnelNode {
    forwarder: Arc<UdpForwarder>,
    slot: ForwarderSlot,
    poller: MessagePoller,
    sessions: Arc<PeerSessionManager>,
}

impl TunnelNode {
    /// Start forwarding and polling. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        self.forwarder.start()?;
        self.slot.set(self.forwarder.clone());
        self.poller.start();
        Ok(())
    }
    /// Stop polling and forwarding and close every peer session.
    pub async fn stop(&self) {
        self.poller.stop().await;
        _ = self.slot.take();
        self.forwarder.stop().await;
        self.sessions.shutdown();
    }
    pub fn forwarder(&self) -> &Arc<UdpForwarder> {
        &self.forwarder
    }
    pub fn sessions(&self) -> &Arc<PeerSessionManager> {
        &self.sessions
    }
}
