//! Cluster configuration model
//!
//! A `ClusterConfig` is an immutable snapshot delivered by the config
//! fetcher. The engine never edits a snapshot in place; it diffs the new
//! snapshot against the applied one and drives vservers toward it.

use ballast_core::{
    AddressFamily, Backend, CheckerSpec, ForwardingMethod, Scheduler, ServiceKey, Vip,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::{ConfigError, Result};

/// One service (port/protocol or firewall-mark entry) of a vserver
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    pub key: ServiceKey,
    pub scheduler: Scheduler,
    pub mode: ForwardingMethod,
    /// IPVS persistence timeout; `None` disables persistence
    pub persistence: Option<Duration>,
    /// Retain unhealthy destinations at weight zero instead of removing
    pub quiescent: bool,
    /// One-packet scheduling for UDP services
    pub one_packet: bool,
    /// Fraction of healthy destinations below which an active service
    /// deactivates
    pub low_watermark: f64,
    /// Fraction of healthy destinations required to (re)activate an
    /// inactive service. Defaults to the low watermark when unset.
    pub high_watermark: Option<f64>,
    /// Upper/lower connection thresholds passed through to IPVS
    pub conn_threshold_upper: u32,
    pub conn_threshold_lower: u32,
    /// Service-level health checks, on top of the vserver-level ones
    pub healthchecks: Vec<CheckerSpec>,
}

impl ServiceConfig {
    pub fn effective_high_watermark(&self) -> f64 {
        self.high_watermark.unwrap_or(self.low_watermark)
    }
}

/// A named load-balanced service group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VserverConfig {
    pub name: String,
    pub enabled: bool,
    /// Unify all services of this vserver under one firewall mark
    pub use_firewall_mark: bool,
    pub vips: Vec<Vip>,
    pub services: BTreeMap<ServiceKey, ServiceConfig>,
    /// Backends shared by all services of this vserver, keyed by hostname
    pub backends: BTreeMap<String, Backend>,
    /// Vserver-level health checks applied to every service
    pub healthchecks: Vec<CheckerSpec>,
    /// SSO groups granted override access to this vserver
    pub access_grants: Vec<String>,
}

impl VserverConfig {
    /// Address families this vserver serves, derived from its VIPs.
    pub fn families(&self) -> BTreeSet<AddressFamily> {
        self.vips
            .iter()
            .map(|vip| AddressFamily::of(&vip.addr))
            .collect()
    }
}

/// A complete, versioned cluster snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfig {
    pub version: u64,
    pub vservers: BTreeMap<String, VserverConfig>,
}

impl ClusterConfig {
    /// Validate the snapshot as a whole. A snapshot that fails validation
    /// is rejected in its entirety and the previous config stays
    /// authoritative.
    pub fn validate(&self) -> Result<()> {
        for (name, vserver) in &self.vservers {
            if name.is_empty() {
                return Err(ConfigError::Invalid("vserver with empty name".to_string()));
            }
            if name != &vserver.name {
                return Err(ConfigError::Invalid(format!(
                    "vserver key {} does not match name {}",
                    name, vserver.name
                )));
            }
            if vserver.vips.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "vserver {} has no entry addresses",
                    name
                )));
            }
            for (key, service) in &vserver.services {
                if key != &service.key {
                    return Err(ConfigError::Invalid(format!(
                        "vserver {}: service key mismatch ({} vs {})",
                        name, key, service.key
                    )));
                }
                if let ServiceKey::Inet { port: 0, .. } = key {
                    return Err(ConfigError::Invalid(format!(
                        "vserver {}: service {} has port zero",
                        name, key
                    )));
                }
                let low = service.low_watermark;
                let high = service.effective_high_watermark();
                if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) {
                    return Err(ConfigError::Invalid(format!(
                        "vserver {}: service {} watermarks out of range",
                        name, key
                    )));
                }
                if high < low {
                    return Err(ConfigError::Invalid(format!(
                        "vserver {}: service {} high watermark below low",
                        name, key
                    )));
                }
                // Every backend must have an address for the service family.
                for backend in vserver.backends.values() {
                    if backend.address(key.af()).is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "vserver {}: backend {} has no {} address for service {}",
                            name, backend.hostname, key.af(), key
                        )));
                    }
                }
            }
        }
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_core::{Protocol, VipKind};

    fn backend(hostname: &str, last_octet: u8) -> Backend {
        Backend {
            hostname: hostname.to_string(),
            ipv4: Some(format!("10.0.0.{}", last_octet).parse().unwrap()),
            ipv6: None,
            enabled: true,
            weight: 1,
        }
    }

    fn service(port: u16) -> ServiceConfig {
        ServiceConfig {
            key: ServiceKey::Inet {
                af: AddressFamily::V4,
                proto: Protocol::Tcp,
                port,
            },
            scheduler: Scheduler::WeightedRoundRobin,
            mode: ForwardingMethod::DirectReturn,
            persistence: None,
            quiescent: false,
            one_packet: false,
            low_watermark: 0.25,
            high_watermark: Some(0.5),
            conn_threshold_upper: 0,
            conn_threshold_lower: 0,
            healthchecks: Vec::new(),
        }
    }

    fn vserver(name: &str) -> VserverConfig {
        let svc = service(80);
        VserverConfig {
            name: name.to_string(),
            enabled: true,
            use_firewall_mark: false,
            vips: vec![Vip {
                addr: "192.0.2.1".parse().unwrap(),
                kind: VipKind::Unicast,
            }],
            services: [(svc.key, svc)].into_iter().collect(),
            backends: [("web1".to_string(), backend("web1", 5))].into_iter().collect(),
            healthchecks: Vec::new(),
            access_grants: Vec::new(),
        }
    }

    #[test]
    fn test_valid_snapshot_passes() {
        let config = ClusterConfig {
            version: 1,
            vservers: [("web".to_string(), vserver("web"))].into_iter().collect(),
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_watermark_inversion_rejected() {
        let mut vs = vserver("web");
        let key = *vs.services.keys().next().unwrap();
        let svc = vs.services.get_mut(&key).unwrap();
        svc.low_watermark = 0.8;
        svc.high_watermark = Some(0.2);
        let config = ClusterConfig {
            version: 1,
            vservers: [("web".to_string(), vs)].into_iter().collect(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_missing_family_address_rejected() {
        let mut vs = vserver("web");
        vs.backends.get_mut("web1").unwrap().ipv4 = None;
        let config = ClusterConfig {
            version: 1,
            vservers: [("web".to_string(), vs)].into_iter().collect(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_high_watermark_defaults_to_low() {
        let mut svc = service(80);
        svc.high_watermark = None;
        svc.low_watermark = 0.4;
        assert_eq!(svc.effective_high_watermark(), 0.4);
    }
}
