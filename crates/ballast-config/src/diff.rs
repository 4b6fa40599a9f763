//! Config diff and per-cycle apply planning
//!
//! Applying a new snapshot is rate limited: at most `limit` vserver
//! additions and `limit` deletions per cycle, deletions first so churn
//! cannot exhaust the firewall-mark pool. Excess changes are deferred;
//! the coordinator re-plans on the next cycle until the applied set
//! converges on the snapshot.

use std::collections::BTreeSet;

use crate::cluster::ClusterConfig;

/// One rate-limited application cycle
#[derive(Debug, Clone, Default)]
pub struct CyclePlan {
    /// Vservers to shut down this cycle (applied before additions)
    pub remove: Vec<String>,
    /// Vservers to create this cycle
    pub add: Vec<String>,
    /// Vservers that already exist and receive the new config. Includes
    /// unchanged vservers so per-destination weight changes propagate.
    pub update: Vec<String>,
    /// Changes pushed out to a later cycle by the rate limit
    pub deferred: usize,
}

impl CyclePlan {
    /// True when this cycle leaves nothing deferred.
    pub fn converges(&self) -> bool {
        self.deferred == 0
    }
}

/// Diff a desired snapshot against the set of currently-instantiated
/// vservers and plan one application cycle.
pub fn plan_cycle(current: &BTreeSet<String>, desired: &ClusterConfig, limit: usize) -> CyclePlan {
    let desired_names: BTreeSet<String> = desired.vservers.keys().cloned().collect();

    let mut remove: Vec<String> = current.difference(&desired_names).cloned().collect();
    let mut add: Vec<String> = desired_names.difference(current).cloned().collect();
    let update: Vec<String> = current.intersection(&desired_names).cloned().collect();

    let mut deferred = 0;
    if remove.len() > limit {
        deferred += remove.len() - limit;
        remove.truncate(limit);
    }
    if add.len() > limit {
        deferred += add.len() - limit;
        add.truncate(limit);
    }

    CyclePlan {
        remove,
        add,
        update,
        deferred,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::VserverConfig;
    use ballast_core::{Vip, VipKind};
    use std::collections::BTreeMap;

    fn snapshot(names: &[&str]) -> ClusterConfig {
        let vservers: BTreeMap<String, VserverConfig> = names
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    VserverConfig {
                        name: name.to_string(),
                        enabled: true,
                        use_firewall_mark: false,
                        vips: vec![Vip {
                            addr: "192.0.2.1".parse().unwrap(),
                            kind: VipKind::Unicast,
                        }],
                        services: BTreeMap::new(),
                        backends: BTreeMap::new(),
                        healthchecks: Vec::new(),
                        access_grants: Vec::new(),
                    },
                )
            })
            .collect();
        ClusterConfig {
            version: 1,
            vservers,
        }
    }

    #[test]
    fn test_rate_limit_defers_excess_additions() {
        // 0 current, 25 desired: 10 per cycle, then 10, then 5.
        let names: Vec<String> = (0..25).map(|i| format!("vs{:02}", i)).collect();
        let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let desired = snapshot(&name_refs);

        let mut current = BTreeSet::new();
        let plan = plan_cycle(&current, &desired, 10);
        assert_eq!(plan.add.len(), 10);
        assert_eq!(plan.deferred, 15);
        current.extend(plan.add);

        let plan = plan_cycle(&current, &desired, 10);
        assert_eq!(plan.add.len(), 10);
        assert_eq!(plan.deferred, 5);
        current.extend(plan.add);

        let plan = plan_cycle(&current, &desired, 10);
        assert_eq!(plan.add.len(), 5);
        assert!(plan.converges());
        current.extend(plan.add);
        assert_eq!(current.len(), 25);
    }

    #[test]
    fn test_deletions_run_before_additions_and_both_are_limited() {
        let current: BTreeSet<String> = (0..12).map(|i| format!("old{:02}", i)).collect();
        let names: Vec<String> = (0..12).map(|i| format!("new{:02}", i)).collect();
        let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let desired = snapshot(&name_refs);

        let plan = plan_cycle(&current, &desired, 10);
        assert_eq!(plan.remove.len(), 10);
        assert_eq!(plan.add.len(), 10);
        assert_eq!(plan.deferred, 4);
    }

    #[test]
    fn test_existing_vservers_always_get_updates() {
        let current: BTreeSet<String> = ["a".to_string(), "b".to_string()].into();
        let desired = snapshot(&["a", "b", "c"]);
        let plan = plan_cycle(&current, &desired, 10);
        assert_eq!(plan.update, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(plan.add, vec!["c".to_string()]);
        assert!(plan.remove.is_empty());
    }

    #[test]
    fn test_identical_snapshots_plan_to_updates_only() {
        let current: BTreeSet<String> = ["a".to_string(), "b".to_string()].into();
        let desired = snapshot(&["a", "b"]);
        let plan = plan_cycle(&current, &desired, 10);
        assert!(plan.add.is_empty());
        assert!(plan.remove.is_empty());
        assert!(plan.converges());
        assert_eq!(plan.update.len(), 2);
    }
}
