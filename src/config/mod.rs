use std::path::Path;
use std::time::Duration;

use peerlink_core::protocol::hello::Capabilities;
use peerlink_core::protocol::version::is_numeric_version;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Oldest peer version whose hello is still accepted.
pub const MIN_SUPPORTED_VERSION: &str = "0.8.0";
pub(crate) const POLL_BATCH_SIZE: usize = 256;
pub(crate) const POLL_MAX_DELAY: u32 = 2;
pub(crate) const POLL_UNIT_MS: u64 = 1;
pub(crate) const RECV_BUFFER_SIZE: usize = 65536;
pub(crate) const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Local UDP port clients send to. 0 binds an ephemeral socket without ingress.
    pub bind_port: u16,
    /// Loopback port the host forwards decapsulated datagrams to.
    pub target_port: u16,
    pub local_version: String,
    /// Capability bits advertised in our hello.
    pub capabilities: u8,
    /// Reject peers that do not advertise the password capability.
    pub password_protected: bool,
    pub min_peer_version: String,
    /// Upper bound on tracked tunnel clients, 0 means unbounded.
    pub max_clients: usize,
    pub poll_batch_size: usize,
    pub poll_max_delay: u32,
    pub poll_unit_ms: u64,
    pub recv_buffer_size: usize,
    pub socket_buffer_size: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            bind_port: 0,
            target_port: 0,
            local_version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: Capabilities::PASSWORD.bits(),
            password_protected: false,
            min_peer_version: MIN_SUPPORTED_VERSION.to_string(),
            max_clients: 0,
            poll_batch_size: POLL_BATCH_SIZE,
            poll_max_delay: POLL_MAX_DELAY,
            poll_unit_ms: POLL_UNIT_MS,
            recv_buffer_size: RECV_BUFFER_SIZE,
            socket_buffer_size: SOCKET_BUFFER_SIZE,
        }
    }
}

impl TunnelConfig {
    pub fn empty() -> Self {
        Self::default()
    }
    /// Read a JSON file; absent fields keep their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: TunnelConfig = serde_json::from_slice(&data)?;
        config.check()?;
        Ok(config)
    }
    pub fn set_bind_port(mut self, bind_port: u16) -> Self {
        self.bind_port = bind_port;
        self
    }
    pub fn set_target_port(mut self, target_port: u16) -> Self {
        self.target_port = target_port;
        self
    }
    pub fn set_local_version<S: Into<String>>(mut self, local_version: S) -> Self {
        self.local_version = local_version.into();
        self
    }
    pub fn set_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities.bits();
        self
    }
    pub fn set_password_protected(mut self, password_protected: bool) -> Self {
        self.password_protected = password_protected;
        self
    }
    pub fn set_min_peer_version<S: Into<String>>(mut self, min_peer_version: S) -> Self {
        self.min_peer_version = min_peer_version.into();
        self
    }
    pub fn set_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }
    pub fn set_poll_batch_size(mut self, poll_batch_size: usize) -> Self {
        self.poll_batch_size = poll_batch_size;
        self
    }
    pub fn set_poll_max_delay(mut self, poll_max_delay: u32) -> Self {
        self.poll_max_delay = poll_max_delay;
        self
    }
    pub fn set_poll_unit(mut self, unit: Duration) -> Self {
        self.poll_unit_ms = unit.as_millis() as u64;
        self
    }
    pub fn set_recv_buffer_size(mut self, recv_buffer_size: usize) -> Self {
        self.recv_buffer_size = recv_buffer_size;
        self
    }
    pub fn set_socket_buffer_size(mut self, socket_buffer_size: usize) -> Self {
        self.socket_buffer_size = socket_buffer_size;
        self
    }
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::from_bits(self.capabilities)
    }
    pub fn poll_unit(&self) -> Duration {
        Duration::from_millis(self.poll_unit_ms)
    }
    pub fn check(&self) -> Result<()> {
        if self.poll_batch_size == 0 {
            return Err(Error::InvalidConfig("poll_batch_size must be > 0".into()));
        }
        if self.recv_buffer_size < peerlink_core::protocol::TUNNEL_HEAD_LEN {
            return Err(Error::InvalidConfig(format!(
                "recv_buffer_size {} is smaller than a tunnel header",
                self.recv_buffer_size
            )));
        }
        if !is_numeric_version(&self.min_peer_version) {
            return Err(Error::InvalidConfig(format!(
                "min_peer_version {:?} is not a dotted numeric version",
                self.min_peer_version
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default() {
        let config = TunnelConfig::default();
        assert_eq!(config.min_peer_version, "0.8.0");
        assert_eq!(config.poll_batch_size, 256);
        assert_eq!(config.poll_max_delay, 2);
        assert_eq!(config.poll_unit(), Duration::from_millis(1));
        assert!(config.capabilities().contains(Capabilities::PASSWORD));
        assert!(!config.password_protected);
        config.check().unwrap();
    }

    #[test]
    fn test_builder() {
        let config = TunnelConfig::empty()
            .set_bind_port(27015)
            .set_target_port(7777)
            .set_password_protected(true)
            .set_local_version("1.2.0")
            .set_poll_unit(Duration::from_millis(5));
        assert_eq!(config.bind_port, 27015);
        assert_eq!(config.target_port, 7777);
        assert_eq!(config.poll_unit_ms, 5);
        assert_eq!(config.local_version, "1.2.0");
    }

    #[test]
    fn test_check() {
        assert!(TunnelConfig::empty().set_poll_batch_size(0).check().is_err());
        assert!(TunnelConfig::empty().set_recv_buffer_size(3).check().is_err());
        assert!(TunnelConfig::empty()
            .set_min_peer_version("latest")
            .check()
            .is_err());
        assert!(TunnelConfig::empty().set_min_peer_version("").check().is_err());
    }

    #[test]
    fn test_partial_json() {
        let config: TunnelConfig =
            serde_json::from_str(r#"{"bind_port": 4000, "password_protected": true}"#).unwrap();
        assert_eq!(config.bind_port, 4000);
        assert!(config.password_protected);
        assert_eq!(config.poll_batch_size, POLL_BATCH_SIZE);
        let text = serde_json::to_string(&config).unwrap();
        let back: TunnelConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_load() {
        let path = std::env::temp_dir().join(format!("peerlink-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"target_port": 7777, "min_peer_version": "1.0"}"#).unwrap();
        let config = TunnelConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.target_port, 7777);
        assert_eq!(config.min_peer_version, "1.0");

        let missing = TunnelConfig::load(std::env::temp_dir().join("peerlink-missing.json"));
        assert!(matches!(missing, Err(Error::Io(_))));
    }
}
