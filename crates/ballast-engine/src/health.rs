//! Health-aggregation bridge
//!
//! The external check subsystem executes probers and pushes batched
//! (checker-id, status) notifications over IPC. The bridge owns the
//! id-to-destination index, fans transitions out to the owning vservers,
//! and publishes the deduplicated checker set the prober side polls.

use ballast_core::{CheckNotification, CheckerDef, CheckerId, ServiceKey};
use ballast_config::VserverConfig;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use crate::snapshot::ChecksSnapshot;

/// One instantiated check bound to a destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckBinding {
    pub id: CheckerId,
    pub def: CheckerDef,
    pub service: ServiceKey,
    pub hostname: String,
}

/// Instantiate every check template of a vserver against its backends.
///
/// Vserver-level templates apply to all services; service-level templates
/// only to their own. The probe target is the backend address for the
/// service's family, the fallback port the service port (zero for
/// firewall-mark keys, where the template must name a port).
pub fn vserver_checks(config: &VserverConfig) -> Vec<CheckBinding> {
    let mut bindings = Vec::new();
    for (key, service) in &config.services {
        let fallback_port = match key {
            ServiceKey::Inet { port, .. } => *port,
            ServiceKey::FirewallMark { .. } => 0,
        };
        for backend in config.backends.values() {
            let Some(target) = backend.address(key.af()) else {
                continue;
            };
            for spec in config.healthchecks.iter().chain(service.healthchecks.iter()) {
                let def = spec.instantiate(target, fallback_port);
                bindings.push(CheckBinding {
                    id: def.id(),
                    def,
                    service: *key,
                    hostname: backend.hostname.clone(),
                });
            }
        }
    }
    bindings
}

/// Engine-side routing table from checker id to owning vservers.
#[derive(Debug, Default)]
pub struct HealthBridge {
    index: HashMap<CheckerId, HashSet<String>>,
    checks: ChecksSnapshot,
}

impl HealthBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the index and the deduplicated checker set from the
    /// current vserver configs. Bumps the generation so the prober side
    /// can detect staleness.
    pub fn rebuild<'a>(&mut self, configs: impl Iterator<Item = &'a VserverConfig>) {
        let mut index: HashMap<CheckerId, HashSet<String>> = HashMap::new();
        let mut checks: BTreeMap<CheckerId, CheckerDef> = BTreeMap::new();
        for config in configs {
            for binding in vserver_checks(config) {
                index
                    .entry(binding.id)
                    .or_default()
                    .insert(config.name.clone());
                checks.insert(binding.id, binding.def);
            }
        }
        self.index = index;
        self.checks = ChecksSnapshot {
            generation: self.checks.generation + 1,
            checks,
        };
        debug!(
            generation = self.checks.generation,
            checks = self.checks.checks.len(),
            "Rebuilt health-check index"
        );
    }

    /// Route a batch of notifications: returns (vserver, notification)
    /// pairs for the coordinator to fan out. Unknown checker ids are
    /// dropped; the prober side is running against a stale generation.
    pub fn route(&self, batch: &[CheckNotification]) -> Vec<(String, CheckNotification)> {
        let mut out = Vec::new();
        for note in batch {
            match self.index.get(&note.id) {
                Some(vservers) => {
                    for vserver in vservers {
                        out.push((vserver.clone(), note.clone()));
                    }
                }
                None => {
                    debug!(id = %note.id, "Dropping notification for unknown checker");
                }
            }
        }
        out
    }

    pub fn checks(&self) -> &ChecksSnapshot {
        &self.checks
    }
}
