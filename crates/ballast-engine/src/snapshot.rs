//! Engine snapshots served to IPC callers
//!
//! Snapshots are copy-on-read: vserver tasks push fresh copies on the
//! snapshot tick and after notable transitions, the coordinator merges
//! them, and readers get cheap clones without touching live state.

use ballast_core::{
    Backend, CheckerDef, CheckerId, HaStatus, HealthState, OverrideState, ServiceKey, Stats, Vip,
};
use ballast_config::ConfigSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// A component warning surfaced to operators
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Warning {
    pub component: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Warning {
    pub fn new(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// One destination as last reconciled
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DestinationSnapshot {
    pub hostname: String,
    pub address: IpAddr,
    pub weight: i32,
    pub health: HealthState,
    pub override_state: OverrideState,
    /// True iff currently installed in IPVS
    pub active: bool,
    pub stats: Stats,
}

/// One service of a vserver
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSnapshot {
    pub key: ServiceKey,
    pub active: bool,
    pub healthy_destinations: usize,
    pub total_destinations: usize,
    pub destinations: Vec<DestinationSnapshot>,
    pub stats: Stats,
}

/// Complete view of one vserver
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VserverSnapshot {
    pub name: String,
    pub enabled: bool,
    pub active: bool,
    pub override_state: OverrideState,
    pub vips: Vec<Vip>,
    pub firewall_mark: Option<u32>,
    pub services: Vec<ServiceSnapshot>,
    pub warnings: Vec<Warning>,
}

/// Deduplicated checker set plus staleness marker for the external
/// prober subsystem
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChecksSnapshot {
    pub generation: u64,
    pub checks: BTreeMap<CheckerId, CheckerDef>,
}

/// Aggregated engine state served over IPC
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineSnapshot {
    pub ha: HaStatus,
    pub config_version: u64,
    pub config_source: ConfigSource,
    pub vservers: Vec<VserverSnapshot>,
    pub backends: Vec<Backend>,
    pub checks: ChecksSnapshot,
    pub warnings: Vec<Warning>,
    pub generated: DateTime<Utc>,
}

impl EngineSnapshot {
    pub fn empty() -> Self {
        Self {
            ha: HaStatus::new(ballast_core::HaState::Unknown),
            config_version: 0,
            config_source: ConfigSource::Disk,
            vservers: Vec::new(),
            backends: Vec::new(),
            checks: ChecksSnapshot::default(),
            warnings: Vec::new(),
            generated: Utc::now(),
        }
    }
}
