//! # peerlink-core
//!
//! Building blocks shared by the peerlink tunnel layer:
//!
//! - [`protocol`] - wire formats: the UDP tunnel packet, client ids, the
//!   session hello handshake and version comparison
//! - [`transport`] - the boundary trait to the external peer-to-peer
//!   transport, plus an in-memory implementation
//! - [`socket`] - UDP socket construction helpers
//!
//! ## Tunnel packets
//!
//! ```rust
//! use peerlink_core::protocol::client_id::ClientId;
//! use peerlink_core::protocol::{Builder, TunnelPacket};
//!
//! let id = ClientId::random();
//! let packet = Builder::build_tunnel_packet(&id, b"datagram");
//! let view = TunnelPacket::new(&packet[..]).unwrap();
//! assert_eq!(view.client_id().unwrap(), id);
//! assert_eq!(view.payload(), b"datagram");
//! ```
//!
//! ## Version gate
//!
//! ```rust
//! use peerlink_core::protocol::version::compare_version;
//! use std::cmp::Ordering;
//!
//! assert_eq!(compare_version("0.7.9", "0.8.0"), Ordering::Less);
//! assert_eq!(compare_version("1.0", "0.9.9"), Ordering::Greater);
//! ```

pub mod error;
pub mod protocol;
pub mod socket;
pub mod transport;
