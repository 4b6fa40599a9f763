//! Node bootstrap configuration
//!
//! The small per-node TOML file read once at startup: identity of this
//! node and its peer, interface and socket paths, HA and sync tuning.
//! Cluster (vserver) configuration never lives here; it arrives from the
//! fetcher as versioned snapshots.

use ballast_core::AccessPolicy;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{ConfigError, Result};

fn default_advert_interval_ms() -> u64 {
    1000
}

fn default_sync_port() -> u16 {
    10258
}

fn default_priority() -> u8 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    /// Name of this node
    pub name: String,
    /// Address the peer uses to reach this node
    pub address: IpAddr,
    /// Address of the peer node
    pub peer_address: IpAddr,

    /// Interface VIPs are bound to while leading
    pub lb_interface: String,

    /// VRRP virtual router id shared by both nodes
    pub vrid: u8,
    /// VRRP priority of this node
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Whether a backup with higher priority preempts the leader
    #[serde(default)]
    pub preempt: bool,
    /// VRRP advertisement interval in milliseconds
    #[serde(default = "default_advert_interval_ms")]
    pub advert_interval_ms: u64,

    /// TCP port of the peer sync channel
    #[serde(default = "default_sync_port")]
    pub sync_port: u16,
    /// Cluster CA bundle plus this node's cert and key, PEM encoded
    pub ca_cert: PathBuf,
    pub node_cert: PathBuf,
    pub node_key: PathBuf,

    /// Engine IPC socket path; also the HA liveness watch target
    pub engine_socket: PathBuf,
    /// Privileged network-control helper socket path
    pub ncc_socket: PathBuf,

    /// First mark of the firewall-mark pool
    pub fwmark_base: u32,
    /// Pool size
    pub fwmark_size: u32,

    /// Groups gating IPC reads and writes
    #[serde(default)]
    pub access: AccessPolicy,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("node name is empty".to_string()));
        }
        if self.address == self.peer_address {
            return Err(ConfigError::Invalid(
                "node and peer share an address".to_string(),
            ));
        }
        if self.vrid == 0 {
            return Err(ConfigError::Invalid("vrid must be 1-255".to_string()));
        }
        if self.priority == 0 {
            // Priority 0 is reserved for abdication on the wire.
            return Err(ConfigError::Invalid(
                "priority 0 is reserved; use 1-255".to_string(),
            ));
        }
        if self.advert_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "advert interval must be non-zero".to_string(),
            ));
        }
        if self.fwmark_size == 0 {
            return Err(ConfigError::Invalid(
                "firewall-mark pool is empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn advert_interval(&self) -> Duration {
        Duration::from_millis(self.advert_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const EXAMPLE: &str = r#"
name = "lb-a"
address = "192.0.2.10"
peer_address = "192.0.2.11"
lb_interface = "eth1"
vrid = 60
priority = 200
preempt = true
ca_cert = "/etc/ballast/ca.pem"
node_cert = "/etc/ballast/node.pem"
node_key = "/etc/ballast/node.key"
engine_socket = "/var/run/ballast/engine"
ncc_socket = "/var/run/ballast/ncc"
fwmark_base = 3000
fwmark_size = 100

[access]
reader_groups = ["lb-readers"]
admin_groups = ["lb-admins"]
"#;

    #[test]
    fn test_load_example_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(EXAMPLE.as_bytes()).unwrap();

        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.name, "lb-a");
        assert_eq!(config.priority, 200);
        assert_eq!(config.sync_port, 10258);
        assert_eq!(config.advert_interval(), Duration::from_secs(1));
        assert_eq!(config.access.admin_groups, vec!["lb-admins".to_string()]);
    }

    #[test]
    fn test_priority_zero_rejected() {
        let raw = EXAMPLE.replace("priority = 200", "priority = 0");
        let config: NodeConfig = toml::from_str(&raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_same_address_rejected() {
        let raw = EXAMPLE.replace("192.0.2.11", "192.0.2.10");
        let config: NodeConfig = toml::from_str(&raw).unwrap();
        assert!(config.validate().is_err());
    }
}
