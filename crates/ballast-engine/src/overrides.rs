//! Override store
//!
//! Single-writer store of operator overrides, owned by the engine
//! coordinator. Overrides are memory-only and final: the most specific
//! override for a destination wins (destination > backend > vserver),
//! and `Default` entries are erased rather than stored so re-applying a
//! default restores purely config/health-driven state.

use ballast_core::{Override, OverrideState, ServiceKey};
use std::collections::HashMap;

/// Effective override view for one destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveOverride {
    pub vserver: OverrideState,
    pub destination: OverrideState,
}

#[derive(Debug, Default)]
pub struct OverrideStore {
    vservers: HashMap<String, OverrideState>,
    backends: HashMap<String, OverrideState>,
    destinations: HashMap<(String, String, ServiceKey), OverrideState>,
}

impl OverrideStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an override. Returns false when the store already held the
    /// same state for the same target (idempotence).
    pub fn apply(&mut self, o: &Override) -> bool {
        match o {
            Override::Vserver { name, state } => {
                Self::set(&mut self.vservers, name.clone(), *state)
            }
            Override::Backend { hostname, state } => {
                Self::set(&mut self.backends, hostname.clone(), *state)
            }
            Override::Destination {
                vserver,
                hostname,
                service,
                state,
            } => Self::set(
                &mut self.destinations,
                (vserver.clone(), hostname.clone(), *service),
                *state,
            ),
        }
    }

    fn set<K: std::hash::Hash + Eq>(
        map: &mut HashMap<K, OverrideState>,
        key: K,
        state: OverrideState,
    ) -> bool {
        if state == OverrideState::Default {
            map.remove(&key).is_some()
        } else {
            map.insert(key, state) != Some(state)
        }
    }

    /// Drop every override.
    pub fn reset(&mut self) {
        self.vservers.clear();
        self.backends.clear();
        self.destinations.clear();
    }

    pub fn vserver(&self, name: &str) -> OverrideState {
        self.vservers
            .get(name)
            .copied()
            .unwrap_or(OverrideState::Default)
    }

    /// Most specific override affecting one destination.
    pub fn destination(&self, vserver: &str, hostname: &str, service: ServiceKey) -> OverrideState {
        if let Some(state) = self
            .destinations
            .get(&(vserver.to_string(), hostname.to_string(), service))
        {
            return *state;
        }
        self.backends
            .get(hostname)
            .copied()
            .unwrap_or(OverrideState::Default)
    }

    /// All overrides relevant to one vserver, for replay into a newly
    /// created vserver task.
    pub fn for_vserver(&self, name: &str) -> Vec<Override> {
        let mut out = Vec::new();
        if let Some(state) = self.vservers.get(name) {
            out.push(Override::Vserver {
                name: name.to_string(),
                state: *state,
            });
        }
        for (hostname, state) in &self.backends {
            out.push(Override::Backend {
                hostname: hostname.clone(),
                state: *state,
            });
        }
        for ((vs, hostname, service), state) in &self.destinations {
            if vs == name {
                out.push(Override::Destination {
                    vserver: vs.clone(),
                    hostname: hostname.clone(),
                    service: *service,
                    state: *state,
                });
            }
        }
        out
    }

    /// Default-state counterparts for every stored override, used to fan
    /// out a reset to the vservers currently honoring them.
    pub fn defaults(&self) -> Vec<Override> {
        let mut out = Vec::new();
        for name in self.vservers.keys() {
            out.push(Override::Vserver {
                name: name.clone(),
                state: OverrideState::Default,
            });
        }
        for hostname in self.backends.keys() {
            out.push(Override::Backend {
                hostname: hostname.clone(),
                state: OverrideState::Default,
            });
        }
        for (vserver, hostname, service) in self.destinations.keys() {
            out.push(Override::Destination {
                vserver: vserver.clone(),
                hostname: hostname.clone(),
                service: *service,
                state: OverrideState::Default,
            });
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.vservers.is_empty() && self.backends.is_empty() && self.destinations.is_empty()
    }
}
