//! Vserver state machine
//!
//! One task per vserver, single writer over its own services,
//! destinations, and VIPs. Every event mutates desired-state inputs
//! (config, health, overrides, leadership) and then reconciles the
//! kernel mirror toward the desired state through the network-control
//! helper. Failed helper calls leave the mirror untouched so the next
//! reconciliation retries them; retries back off exponentially to a
//! ceiling and never block event processing.

use ballast_core::{
    Backend, CheckNotification, CheckerId, HaState, HealthState, Override, OverrideState,
    ServiceKey, Stats, Vip, VipKind,
};
use ballast_config::{ServiceConfig, VserverConfig};
use ballast_ncc::{IpvsDestination, IpvsService, NccRequest, NccResponse, VserverRules};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::health::vserver_checks;
use crate::netctl::NetControl;
use crate::snapshot::{DestinationSnapshot, ServiceSnapshot, VserverSnapshot, Warning};

const EVENT_QUEUE_DEPTH: usize = 64;
const WARNING_RING: usize = 16;
const RETRY_INITIAL: Duration = Duration::from_millis(500);
const RETRY_CEILING: Duration = Duration::from_secs(30);

/// Events accepted by a vserver task
#[derive(Debug)]
pub enum VserverEvent {
    ConfigUpdate(Box<VserverConfig>),
    HealthCheck(CheckNotification),
    Override(Override),
    HaState(HaState),
    /// Push a fresh snapshot to the coordinator
    Notify,
    /// Pull per-service counters from the kernel
    StatsTick,
    /// Graceful teardown; acknowledged once kernel state is released
    Quit(oneshot::Sender<()>),
}

/// Coordinator-side handle to a running vserver task.
pub struct VserverHandle {
    name: String,
    tx: mpsc::Sender<VserverEvent>,
    join: JoinHandle<()>,
}

impl VserverHandle {
    pub fn spawn(
        name: String,
        lb_interface: String,
        firewall_mark: Option<u32>,
        ncc: Box<dyn NetControl>,
        snapshots: mpsc::Sender<VserverSnapshot>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let task = VserverTask::new(name.clone(), lb_interface, firewall_mark, ncc, snapshots);
        let join = tokio::spawn(task.run(rx));
        Self { name, tx, join }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking send. Overflow drops the event with a warning; the
    /// next config or snapshot tick reasserts authoritative state.
    pub fn try_send(&self, event: VserverEvent) {
        if let Err(err) = self.tx.try_send(event) {
            warn!(vserver = %self.name, %err, "Vserver queue full, dropping event");
        }
    }

    /// Graceful shutdown: ask the task to tear down kernel state and wait
    /// up to `grace` for the acknowledgement. Returns true when teardown
    /// was confirmed.
    pub async fn quit(self, grace: Duration) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(VserverEvent::Quit(ack_tx)).await.is_err() {
            return false;
        }
        let confirmed = tokio::time::timeout(grace, ack_rx).await.is_ok();
        if !confirmed {
            warn!(vserver = %self.name, "Vserver did not confirm teardown in time");
            self.join.abort();
        }
        confirmed
    }
}

#[derive(Debug, Clone)]
struct DestState {
    backend: Backend,
    health: HealthState,
}

#[derive(Debug)]
struct ServiceState {
    config: ServiceConfig,
    active: bool,
    destinations: BTreeMap<String, DestState>,
    stats: Stats,
}

impl ServiceState {
    fn healthy(&self) -> usize {
        self.destinations
            .values()
            .filter(|d| d.health == HealthState::Healthy)
            .count()
    }

    fn healthy_fraction(&self) -> f64 {
        if self.destinations.is_empty() {
            return 0.0;
        }
        self.healthy() as f64 / self.destinations.len() as f64
    }

    /// Apply watermark hysteresis to the active flag. Returns true on a
    /// transition.
    fn refresh_active(&mut self) -> bool {
        let f = self.healthy_fraction();
        let was = self.active;
        if self.active {
            if f < self.config.low_watermark {
                self.active = false;
            }
        } else if f >= self.config.effective_high_watermark() {
            self.active = true;
        }
        was != self.active
    }
}

/// Kernel-state mirror: what we believe is installed.
#[derive(Debug, Default, PartialEq)]
struct KernelState {
    rules: bool,
    services: BTreeMap<(IpAddr, ServiceKey), InstalledService>,
    vips: BTreeSet<Vip>,
}

#[derive(Debug, Clone, PartialEq)]
struct InstalledService {
    svc: IpvsService,
    dests: BTreeMap<IpAddr, IpvsDestination>,
}

struct VserverTask {
    name: String,
    lb_interface: String,
    firewall_mark: Option<u32>,
    config: Option<VserverConfig>,
    services: BTreeMap<ServiceKey, ServiceState>,
    vserver_override: OverrideState,
    backend_overrides: HashMap<String, OverrideState>,
    dest_overrides: HashMap<(ServiceKey, String), OverrideState>,
    checker_index: HashMap<CheckerId, Vec<(ServiceKey, String)>>,
    leader: bool,
    kernel: KernelState,
    ncc: Box<dyn NetControl>,
    snapshots: mpsc::Sender<VserverSnapshot>,
    warnings: Vec<Warning>,
    backoff: Duration,
    retry_at: Option<Instant>,
}

impl VserverTask {
    fn new(
        name: String,
        lb_interface: String,
        firewall_mark: Option<u32>,
        ncc: Box<dyn NetControl>,
        snapshots: mpsc::Sender<VserverSnapshot>,
    ) -> Self {
        Self {
            name,
            lb_interface,
            firewall_mark,
            config: None,
            services: BTreeMap::new(),
            vserver_override: OverrideState::Default,
            backend_overrides: HashMap::new(),
            dest_overrides: HashMap::new(),
            checker_index: HashMap::new(),
            leader: false,
            kernel: KernelState::default(),
            ncc,
            snapshots,
            warnings: Vec::new(),
            backoff: RETRY_INITIAL,
            retry_at: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<VserverEvent>) {
        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(VserverEvent::Quit(ack)) => {
                            self.teardown().await;
                            let _ = ack.send(());
                            break;
                        }
                        Some(event) => self.handle(event).await,
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)),
                    if retry_at.is_some() =>
                {
                    self.retry_at = None;
                    self.reconcile().await;
                }
            }
        }
    }

    async fn handle(&mut self, event: VserverEvent) {
        match event {
            VserverEvent::ConfigUpdate(config) => self.apply_config(*config).await,
            VserverEvent::HealthCheck(note) => self.apply_health(note).await,
            VserverEvent::Override(o) => self.apply_override(o).await,
            VserverEvent::HaState(state) => {
                let leader = state == HaState::Leader;
                if leader != self.leader {
                    info!(vserver = %self.name, %state, "Leadership changed");
                    self.leader = leader;
                    self.reconcile().await;
                }
            }
            VserverEvent::Notify => self.push_snapshot(),
            VserverEvent::StatsTick => self.pull_stats().await,
            VserverEvent::Quit(_) => unreachable!("handled in run loop"),
        }
    }

    async fn apply_config(&mut self, config: VserverConfig) {
        // Rebuild service state, carrying over health and the hysteresis
        // flag for surviving (service, backend) pairs.
        let mut services = BTreeMap::new();
        for (key, svc_cfg) in &config.services {
            let previous = self.services.remove(key);
            let mut state = ServiceState {
                config: svc_cfg.clone(),
                active: previous.as_ref().map(|s| s.active).unwrap_or(false),
                destinations: BTreeMap::new(),
                stats: previous.as_ref().map(|s| s.stats).unwrap_or_default(),
            };
            let mut old_dests = previous.map(|s| s.destinations).unwrap_or_default();
            for (hostname, backend) in &config.backends {
                let health = old_dests
                    .remove(hostname)
                    .map(|d| d.health)
                    .unwrap_or(HealthState::Unknown);
                state.destinations.insert(
                    hostname.clone(),
                    DestState {
                        backend: backend.clone(),
                        health,
                    },
                );
            }
            services.insert(*key, state);
        }
        self.services = services;

        self.checker_index.clear();
        for binding in vserver_checks(&config) {
            self.checker_index
                .entry(binding.id)
                .or_default()
                .push((binding.service, binding.hostname));
        }

        self.config = Some(config);
        for service in self.services.values_mut() {
            service.refresh_active();
        }
        self.reconcile().await;
    }

    async fn apply_health(&mut self, note: CheckNotification) {
        let Some(targets) = self.checker_index.get(&note.id) else {
            debug!(vserver = %self.name, id = %note.id, "Notification for unknown checker");
            return;
        };
        let mut changed = false;
        for (key, hostname) in targets.clone() {
            let Some(service) = self.services.get_mut(&key) else {
                continue;
            };
            let Some(dest) = service.destinations.get_mut(&hostname) else {
                continue;
            };
            // Only transitions matter; repeated reports are no-ops.
            if dest.health == note.status.state {
                continue;
            }
            info!(
                vserver = %self.name,
                service = %key,
                backend = %hostname,
                from = %dest.health,
                to = %note.status.state,
                message = %note.status.message,
                "Destination health changed"
            );
            dest.health = note.status.state;
            if service.refresh_active() {
                info!(
                    vserver = %self.name,
                    service = %key,
                    active = service.active,
                    healthy = service.healthy(),
                    total = service.destinations.len(),
                    "Service activity changed"
                );
            }
            changed = true;
        }
        if changed {
            self.reconcile().await;
        }
    }

    async fn apply_override(&mut self, o: Override) {
        match &o {
            Override::Vserver { state, .. } => {
                self.vserver_override = *state;
            }
            Override::Backend { hostname, state } => {
                if *state == OverrideState::Default {
                    self.backend_overrides.remove(hostname);
                } else {
                    self.backend_overrides.insert(hostname.clone(), *state);
                }
            }
            Override::Destination {
                hostname,
                service,
                state,
                ..
            } => {
                let key = (*service, hostname.clone());
                if *state == OverrideState::Default {
                    self.dest_overrides.remove(&key);
                } else {
                    self.dest_overrides.insert(key, *state);
                }
            }
        }
        self.reconcile().await;
    }

    fn destination_override(&self, key: ServiceKey, hostname: &str) -> OverrideState {
        if let Some(state) = self.dest_overrides.get(&(key, hostname.to_string())) {
            return *state;
        }
        self.backend_overrides
            .get(hostname)
            .copied()
            .unwrap_or(OverrideState::Default)
    }

    fn vserver_enabled(&self) -> bool {
        let configured = self.config.as_ref().map(|c| c.enabled).unwrap_or(false);
        match self.vserver_override {
            OverrideState::Default => configured,
            OverrideState::Enabled => true,
            OverrideState::Disabled => false,
        }
    }

    fn vserver_active(&self) -> bool {
        self.services.values().any(|s| s.active)
    }

    /// Desired weight for one destination, or `None` when it must not be
    /// installed. Override-disabled always removes; quiescent weight-0
    /// retention applies only to health-induced inactivity.
    fn desired_weight(&self, service: &ServiceState, key: ServiceKey, hostname: &str) -> Option<i32> {
        let dest = service.destinations.get(hostname)?;
        if !dest.backend.enabled {
            return None;
        }
        let ov = self.destination_override(key, hostname);
        if ov == OverrideState::Disabled {
            return None;
        }
        if ov == OverrideState::Enabled || dest.health == HealthState::Healthy {
            return Some(dest.backend.weight);
        }
        if service.config.quiescent {
            return Some(0);
        }
        None
    }

    fn ipvs_instances(&self, key: ServiceKey, config: &VserverConfig) -> Vec<IpvsService> {
        let svc = &config.services[&key];
        let mut out = Vec::new();
        if config.use_firewall_mark {
            let Some(mark) = self.firewall_mark else {
                return out;
            };
            for vip in &config.vips {
                let af = ballast_core::AddressFamily::of(&vip.addr);
                if af != key.af() {
                    continue;
                }
                out.push(IpvsService {
                    vip: vip.addr,
                    key: ServiceKey::FirewallMark { af, mark },
                    scheduler: svc.scheduler,
                    persistence: svc.persistence,
                    one_packet: svc.one_packet,
                    conn_threshold_upper: svc.conn_threshold_upper,
                    conn_threshold_lower: svc.conn_threshold_lower,
                });
                // One firewall-mark service per family, not per VIP.
                break;
            }
        } else {
            for vip in &config.vips {
                if ballast_core::AddressFamily::of(&vip.addr) != key.af() {
                    continue;
                }
                out.push(IpvsService {
                    vip: vip.addr,
                    key,
                    scheduler: svc.scheduler,
                    persistence: svc.persistence,
                    one_packet: svc.one_packet,
                    conn_threshold_upper: svc.conn_threshold_upper,
                    conn_threshold_lower: svc.conn_threshold_lower,
                });
            }
        }
        out
    }

    fn desired(&self) -> KernelState {
        let mut desired = KernelState::default();
        let Some(config) = self.config.as_ref() else {
            return desired;
        };
        if !self.leader || !self.vserver_enabled() {
            return desired;
        }

        for (key, service) in &self.services {
            if !service.active {
                continue;
            }
            for instance in self.ipvs_instances(*key, config) {
                let ipvs_port = match instance.key {
                    ServiceKey::Inet { port, .. } => port,
                    ServiceKey::FirewallMark { .. } => 0,
                };
                let entry = desired
                    .services
                    .entry((instance.vip, instance.key))
                    .or_insert_with(|| InstalledService {
                        svc: instance.clone(),
                        dests: BTreeMap::new(),
                    });
                for (hostname, dest) in &service.destinations {
                    let Some(weight) = self.desired_weight(service, *key, hostname) else {
                        continue;
                    };
                    let Some(address) = dest.backend.address(key.af()) else {
                        continue;
                    };
                    entry.dests.insert(
                        address,
                        IpvsDestination {
                            address,
                            port: ipvs_port,
                            weight,
                            method: service.config.mode,
                        },
                    );
                }
            }
        }

        if self.vserver_active() {
            desired.rules = true;
            desired.vips = config.vips.iter().copied().collect();
        }
        desired
    }

    fn rules(&self, config: &VserverConfig) -> VserverRules {
        VserverRules {
            vserver: self.name.clone(),
            vips: config.vips.clone(),
            firewall_mark: self.firewall_mark,
            nat_services: config
                .services
                .values()
                .filter(|s| s.mode == ballast_core::ForwardingMethod::Nat)
                .map(|s| s.key)
                .collect(),
        }
    }

    /// Issue one helper call and fold the outcome into the mirror via
    /// `apply`. Failures record a warning and flag a retry.
    async fn submit(
        &mut self,
        request: NccRequest,
        apply: impl FnOnce(&mut KernelState),
    ) -> bool {
        match self.ncc.call(request).await {
            Ok(NccResponse::Ok) | Ok(NccResponse::Stats(_)) => {
                apply(&mut self.kernel);
                true
            }
            Ok(NccResponse::Error { message, .. }) => {
                self.push_warning(format!("helper refused: {}", message));
                false
            }
            Err(err) => {
                self.push_warning(format!("network control: {}", err));
                false
            }
        }
    }

    /// Drive the kernel mirror toward the desired state. Install order is
    /// rules, services, destinations, VIPs; removal is the reverse.
    async fn reconcile(&mut self) {
        let desired = self.desired();
        let mut ok = true;

        // VIP removals first so traffic stops before services go.
        let vip_removals: Vec<Vip> = self.kernel.vips.difference(&desired.vips).copied().collect();
        for vip in vip_removals {
            ok &= self.remove_vip(vip).await;
        }

        // Service and destination removals / updates / additions.
        let gone: Vec<(IpAddr, ServiceKey)> = self
            .kernel
            .services
            .keys()
            .filter(|id| !desired.services.contains_key(*id))
            .copied()
            .collect();
        for id in gone {
            ok &= self.remove_service(id).await;
        }

        for (id, want) in &desired.services {
            match self.kernel.services.get(id) {
                None => {
                    ok &= self.install_service(*id, want.clone()).await;
                }
                Some(have) => {
                    if have.svc != want.svc {
                        let svc = want.svc.clone();
                        ok &= self
                            .submit(NccRequest::UpdateService(svc.clone()), move |k| {
                                k.services.get_mut(&(svc.vip, svc.key)).unwrap().svc = svc.clone();
                            })
                            .await;
                    }
                    ok &= self.sync_destinations(*id, want).await;
                }
            }
        }

        // Rules and VIP additions once services are in place.
        if desired.rules && !self.kernel.rules {
            if let Some(config) = self.config.clone() {
                let rules = self.rules(&config);
                ok &= self
                    .submit(NccRequest::AddVserverRules(rules), |k| k.rules = true)
                    .await;
            }
        } else if !desired.rules && self.kernel.rules {
            if let Some(config) = self.config.clone() {
                let rules = self.rules(&config);
                ok &= self
                    .submit(NccRequest::DeleteVserverRules(rules), |k| k.rules = false)
                    .await;
            }
        }

        let vip_additions: Vec<Vip> = desired.vips.difference(&self.kernel.vips).copied().collect();
        for vip in vip_additions {
            ok &= self.add_vip(vip).await;
        }

        if ok {
            self.backoff = RETRY_INITIAL;
            self.retry_at = None;
        } else {
            self.retry_at = Some(Instant::now() + self.backoff);
            self.backoff = (self.backoff * 2).min(RETRY_CEILING);
        }
        self.push_snapshot();
    }

    async fn install_service(&mut self, id: (IpAddr, ServiceKey), want: InstalledService) -> bool {
        let svc = want.svc.clone();
        let mut ok = self
            .submit(NccRequest::AddService(svc.clone()), move |k| {
                k.services.insert(
                    id,
                    InstalledService {
                        svc,
                        dests: BTreeMap::new(),
                    },
                );
            })
            .await;
        if !ok {
            return false;
        }
        for dest in want.dests.values() {
            let svc = want.svc.clone();
            let dest = dest.clone();
            ok &= self
                .submit(
                    NccRequest::AddDestination(svc, dest.clone()),
                    move |k| {
                        k.services.get_mut(&id).unwrap().dests.insert(dest.address, dest.clone());
                    },
                )
                .await;
        }
        ok
    }

    async fn remove_service(&mut self, id: (IpAddr, ServiceKey)) -> bool {
        let Some(have) = self.kernel.services.get(&id).cloned() else {
            return true;
        };
        let mut ok = true;
        for dest in have.dests.values() {
            let svc = have.svc.clone();
            let dest = dest.clone();
            ok &= self
                .submit(
                    NccRequest::DeleteDestination(svc, dest.clone()),
                    move |k| {
                        k.services.get_mut(&id).unwrap().dests.remove(&dest.address);
                    },
                )
                .await;
        }
        if !ok {
            return false;
        }
        let svc = have.svc.clone();
        self.submit(NccRequest::DeleteService(svc), move |k| {
            k.services.remove(&id);
        })
        .await
    }

    async fn sync_destinations(&mut self, id: (IpAddr, ServiceKey), want: &InstalledService) -> bool {
        let have = self.kernel.services.get(&id).cloned().unwrap();
        let mut ok = true;
        for (addr, dest) in &have.dests {
            if !want.dests.contains_key(addr) {
                let svc = have.svc.clone();
                let dest = dest.clone();
                ok &= self
                    .submit(
                        NccRequest::DeleteDestination(svc, dest.clone()),
                        move |k| {
                            k.services.get_mut(&id).unwrap().dests.remove(&dest.address);
                        },
                    )
                    .await;
            }
        }
        for (addr, dest) in &want.dests {
            match have.dests.get(addr) {
                None => {
                    let svc = have.svc.clone();
                    let dest = dest.clone();
                    ok &= self
                        .submit(
                            NccRequest::AddDestination(svc, dest.clone()),
                            move |k| {
                                k.services
                                    .get_mut(&id)
                                    .unwrap()
                                    .dests
                                    .insert(dest.address, dest.clone());
                            },
                        )
                        .await;
                }
                Some(existing) if existing != dest => {
                    // Weight and parameter changes update in place.
                    let svc = have.svc.clone();
                    let dest = dest.clone();
                    ok &= self
                        .submit(
                            NccRequest::UpdateDestination(svc, dest.clone()),
                            move |k| {
                                k.services
                                    .get_mut(&id)
                                    .unwrap()
                                    .dests
                                    .insert(dest.address, dest.clone());
                            },
                        )
                        .await;
                }
                Some(_) => {}
            }
        }
        ok
    }

    async fn add_vip(&mut self, vip: Vip) -> bool {
        let request = match vip.kind {
            VipKind::Unicast => NccRequest::AddVip {
                vip,
                interface: self.lb_interface.clone(),
            },
            VipKind::Anycast => NccRequest::AdvertiseBgpPrefix(vip.addr),
        };
        self.submit(request, move |k| {
            k.vips.insert(vip);
        })
        .await
    }

    async fn remove_vip(&mut self, vip: Vip) -> bool {
        let request = match vip.kind {
            VipKind::Unicast => NccRequest::DeleteVip {
                vip,
                interface: self.lb_interface.clone(),
            },
            VipKind::Anycast => NccRequest::WithdrawBgpPrefix(vip.addr),
        };
        self.submit(request, move |k| {
            k.vips.remove(&vip);
        })
        .await
    }

    /// Full teardown for shutdown or removal: VIPs, then destinations and
    /// services, then rules. Best effort; remaining state is logged.
    async fn teardown(&mut self) {
        let vips: Vec<Vip> = self.kernel.vips.iter().copied().collect();
        for vip in vips {
            self.remove_vip(vip).await;
        }
        let ids: Vec<(IpAddr, ServiceKey)> = self.kernel.services.keys().copied().collect();
        for id in ids {
            self.remove_service(id).await;
        }
        if self.kernel.rules {
            if let Some(config) = self.config.clone() {
                let rules = self.rules(&config);
                self.submit(NccRequest::DeleteVserverRules(rules), |k| k.rules = false)
                    .await;
            }
        }
        if self.kernel != KernelState::default() {
            warn!(vserver = %self.name, "Teardown left kernel state behind");
        } else {
            info!(vserver = %self.name, "Teardown complete");
        }
    }

    async fn pull_stats(&mut self) {
        let installed: Vec<IpvsService> = self
            .kernel
            .services
            .values()
            .map(|s| s.svc.clone())
            .collect();
        for svc in installed {
            match self.ncc.call(NccRequest::QueryStats(svc.clone())).await {
                Ok(NccResponse::Stats(stats)) => {
                    for service in self.services.values_mut() {
                        if service.config.key == svc.key
                            || matches!(svc.key, ServiceKey::FirewallMark { .. })
                        {
                            service.stats = stats.service;
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    self.push_warning(format!("stats query: {}", err));
                }
            }
        }
        self.push_snapshot();
    }

    fn push_warning(&mut self, message: String) {
        warn!(vserver = %self.name, "{}", message);
        self.warnings.push(Warning::new(self.name.clone(), message));
        if self.warnings.len() > WARNING_RING {
            self.warnings.remove(0);
        }
    }

    fn snapshot(&self) -> VserverSnapshot {
        let mut services = Vec::new();
        for (key, service) in &self.services {
            let installed_addrs: BTreeSet<IpAddr> = self
                .kernel
                .services
                .iter()
                .filter(|((_, k), _)| k == key || matches!(k, ServiceKey::FirewallMark { .. }))
                .flat_map(|(_, s)| s.dests.keys().copied())
                .collect();
            let destinations = service
                .destinations
                .iter()
                .filter_map(|(hostname, dest)| {
                    let address = dest.backend.address(key.af())?;
                    Some(DestinationSnapshot {
                        hostname: hostname.clone(),
                        address,
                        weight: dest.backend.weight,
                        health: dest.health,
                        override_state: self.destination_override(*key, hostname),
                        active: installed_addrs.contains(&address),
                        stats: Stats::default(),
                    })
                })
                .collect();
            services.push(ServiceSnapshot {
                key: *key,
                active: service.active,
                healthy_destinations: service.healthy(),
                total_destinations: service.destinations.len(),
                destinations,
                stats: service.stats,
            });
        }
        VserverSnapshot {
            name: self.name.clone(),
            enabled: self.vserver_enabled(),
            active: self.vserver_active(),
            override_state: self.vserver_override,
            vips: self.kernel.vips.iter().copied().collect(),
            firewall_mark: self.firewall_mark,
            services,
            warnings: self.warnings.clone(),
        }
    }

    fn push_snapshot(&self) {
        if self.snapshots.try_send(self.snapshot()).is_err() {
            debug!(vserver = %self.name, "Snapshot channel full");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netctl::testing::SharedNetControl;
    use ballast_core::{AddressFamily, CheckerKind, CheckerMode, CheckerParams, CheckerSpec,
        HealthStatus, Protocol, Scheduler};

    fn key() -> ServiceKey {
        ServiceKey::Inet {
            af: AddressFamily::V4,
            proto: Protocol::Tcp,
            port: 80,
        }
    }

    fn config(backends: usize, low: f64, high: f64, quiescent: bool) -> VserverConfig {
        let service = ServiceConfig {
            key: key(),
            scheduler: Scheduler::WeightedRoundRobin,
            mode: ballast_core::ForwardingMethod::DirectReturn,
            persistence: None,
            quiescent,
            one_packet: false,
            low_watermark: low,
            high_watermark: Some(high),
            conn_threshold_upper: 0,
            conn_threshold_lower: 0,
            healthchecks: Vec::new(),
        };
        VserverConfig {
            name: "web".to_string(),
            enabled: true,
            use_firewall_mark: false,
            vips: vec![Vip {
                addr: "192.0.2.1".parse().unwrap(),
                kind: VipKind::Unicast,
            }],
            services: [(key(), service)].into_iter().collect(),
            backends: (0..backends)
                .map(|i| {
                    let hostname = format!("web{}", i + 1);
                    (
                        hostname.clone(),
                        Backend {
                            hostname,
                            ipv4: Some(format!("10.0.0.{}", i + 1).parse().unwrap()),
                            ipv6: None,
                            enabled: true,
                            weight: 1,
                        },
                    )
                })
                .collect(),
            healthchecks: vec![CheckerSpec {
                kind: CheckerKind::Http,
                port: None,
                interval: Duration::from_secs(5),
                timeout: Duration::from_secs(2),
                retries: 1,
                mode: CheckerMode::Plain,
                params: CheckerParams::default(),
            }],
            access_grants: Vec::new(),
        }
    }

    fn task(ncc: SharedNetControl) -> (VserverTask, mpsc::Receiver<VserverSnapshot>) {
        let (tx, rx) = mpsc::channel(64);
        let mut task = VserverTask::new(
            "web".to_string(),
            "eth1".to_string(),
            None,
            Box::new(ncc),
            tx,
        );
        task.leader = true;
        (task, rx)
    }

    /// Health notification for the checker bound to `hostname`.
    fn health_note(config: &VserverConfig, hostname: &str, state: HealthState) -> CheckNotification {
        let binding = vserver_checks(config)
            .into_iter()
            .find(|b| b.hostname == hostname)
            .unwrap();
        CheckNotification {
            id: binding.id,
            status: HealthStatus::new(state),
        }
    }

    async fn mark(task: &mut VserverTask, cfg: &VserverConfig, hostname: &str, state: HealthState) {
        task.handle(VserverEvent::HealthCheck(health_note(cfg, hostname, state)))
            .await;
    }

    fn installed_dest_count(task: &VserverTask) -> usize {
        task.kernel.services.values().map(|s| s.dests.len()).sum()
    }

    #[tokio::test]
    async fn test_watermark_hysteresis() {
        let ncc = SharedNetControl::new();
        let (mut task, _rx) = task(ncc.clone());
        let cfg = config(4, 0.25, 0.50, false);
        task.handle(VserverEvent::ConfigUpdate(Box::new(cfg.clone()))).await;

        // All four healthy: service active, four destinations, VIP bound.
        for i in 1..=4 {
            mark(&mut task, &cfg, &format!("web{}", i), HealthState::Healthy).await;
        }
        assert!(task.services[&key()].active);
        assert_eq!(installed_dest_count(&task), 4);
        assert_eq!(task.kernel.vips.len(), 1);

        // Three unhealthy: fraction 0.25 >= low watermark, still active.
        for i in 1..=3 {
            mark(&mut task, &cfg, &format!("web{}", i), HealthState::Unhealthy).await;
        }
        assert!(task.services[&key()].active);
        assert_eq!(installed_dest_count(&task), 1);

        // Fourth unhealthy: 0.0 < 0.25, deactivate and tear down.
        mark(&mut task, &cfg, "web4", HealthState::Unhealthy).await;
        assert!(!task.services[&key()].active);
        assert!(task.kernel.services.is_empty());
        assert!(task.kernel.vips.is_empty());

        // One recovers: 0.25 < high watermark 0.50, stays inactive.
        mark(&mut task, &cfg, "web1", HealthState::Healthy).await;
        assert!(!task.services[&key()].active);
        assert!(task.kernel.services.is_empty());

        // Second recovers: 0.50 >= 0.50, reactivates with two dests.
        mark(&mut task, &cfg, "web2", HealthState::Healthy).await;
        assert!(task.services[&key()].active);
        assert_eq!(installed_dest_count(&task), 2);
        assert_eq!(task.kernel.vips.len(), 1);
    }

    #[tokio::test]
    async fn test_identical_config_reapply_is_quiet() {
        let ncc = SharedNetControl::new();
        let (mut task, _rx) = task(ncc.clone());
        let cfg = config(2, 0.0, 0.0, false);
        task.handle(VserverEvent::ConfigUpdate(Box::new(cfg.clone()))).await;
        mark(&mut task, &cfg, "web1", HealthState::Healthy).await;
        mark(&mut task, &cfg, "web2", HealthState::Healthy).await;

        ncc.take_calls();
        task.handle(VserverEvent::ConfigUpdate(Box::new(cfg.clone()))).await;
        assert!(ncc.take_calls().is_empty());
    }

    #[tokio::test]
    async fn test_weight_change_updates_in_place() {
        let ncc = SharedNetControl::new();
        let (mut task, _rx) = task(ncc.clone());
        let mut cfg = config(2, 0.0, 0.0, false);
        task.handle(VserverEvent::ConfigUpdate(Box::new(cfg.clone()))).await;
        mark(&mut task, &cfg, "web1", HealthState::Healthy).await;
        mark(&mut task, &cfg, "web2", HealthState::Healthy).await;
        ncc.take_calls();

        cfg.backends.get_mut("web1").unwrap().weight = 5;
        task.handle(VserverEvent::ConfigUpdate(Box::new(cfg.clone()))).await;
        let calls = ncc.take_calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(
            &calls[0],
            NccRequest::UpdateDestination(_, dest) if dest.weight == 5
        ));
    }

    #[tokio::test]
    async fn test_quiescent_retains_weight_zero_destination() {
        let ncc = SharedNetControl::new();
        let (mut task, _rx) = task(ncc.clone());
        let cfg = config(2, 0.5, 0.5, true);
        task.handle(VserverEvent::ConfigUpdate(Box::new(cfg.clone()))).await;
        mark(&mut task, &cfg, "web1", HealthState::Healthy).await;
        mark(&mut task, &cfg, "web2", HealthState::Healthy).await;

        mark(&mut task, &cfg, "web2", HealthState::Unhealthy).await;
        // Still active (0.5 >= 0.5); web2 kept at weight zero.
        let dests: Vec<&IpvsDestination> = task
            .kernel
            .services
            .values()
            .flat_map(|s| s.dests.values())
            .collect();
        assert_eq!(dests.len(), 2);
        let web2: IpAddr = "10.0.0.2".parse().unwrap();
        assert_eq!(dests.iter().find(|d| d.address == web2).unwrap().weight, 0);
    }

    #[tokio::test]
    async fn test_override_disabled_removes_even_quiescent() {
        let ncc = SharedNetControl::new();
        let (mut task, _rx) = task(ncc.clone());
        let cfg = config(2, 0.5, 0.5, true);
        task.handle(VserverEvent::ConfigUpdate(Box::new(cfg.clone()))).await;
        mark(&mut task, &cfg, "web1", HealthState::Healthy).await;
        mark(&mut task, &cfg, "web2", HealthState::Healthy).await;

        task.handle(VserverEvent::Override(Override::Backend {
            hostname: "web2".to_string(),
            state: OverrideState::Disabled,
        }))
        .await;
        assert_eq!(installed_dest_count(&task), 1);

        // Restoring the default brings the healthy destination back.
        task.handle(VserverEvent::Override(Override::Backend {
            hostname: "web2".to_string(),
            state: OverrideState::Default,
        }))
        .await;
        assert_eq!(installed_dest_count(&task), 2);
    }

    #[tokio::test]
    async fn test_follower_installs_nothing() {
        let ncc = SharedNetControl::new();
        let (mut task, _rx) = task(ncc.clone());
        task.leader = false;
        let cfg = config(1, 0.0, 0.0, false);
        task.handle(VserverEvent::ConfigUpdate(Box::new(cfg.clone()))).await;
        mark(&mut task, &cfg, "web1", HealthState::Healthy).await;
        assert!(task.kernel.services.is_empty());
        assert!(task.kernel.vips.is_empty());

        // Promotion installs everything from warm state.
        task.handle(VserverEvent::HaState(HaState::Leader)).await;
        assert_eq!(installed_dest_count(&task), 1);
        assert_eq!(task.kernel.vips.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_schedules_retry() {
        let ncc = SharedNetControl::new();
        let (mut task, _rx) = task(ncc.clone());
        let cfg = config(1, 0.0, 0.0, false);
        task.handle(VserverEvent::ConfigUpdate(Box::new(cfg.clone()))).await;

        ncc.push_failure(NccResponse::Error {
            message: "ipvs busy".to_string(),
            transient: true,
        });
        mark(&mut task, &cfg, "web1", HealthState::Healthy).await;

        assert!(task.retry_at.is_some());
        assert!(!task.warnings.is_empty());
        assert_eq!(installed_dest_count(&task), 0);

        // The scripted failure is gone; the retry converges.
        task.reconcile().await;
        assert!(task.retry_at.is_none());
        assert_eq!(installed_dest_count(&task), 1);
    }

    #[tokio::test]
    async fn test_anycast_vip_uses_bgp() {
        let ncc = SharedNetControl::new();
        let (mut task, _rx) = task(ncc.clone());
        let mut cfg = config(1, 0.0, 0.0, false);
        cfg.vips.push(Vip {
            addr: "198.51.100.1".parse().unwrap(),
            kind: VipKind::Anycast,
        });
        task.handle(VserverEvent::ConfigUpdate(Box::new(cfg.clone()))).await;
        mark(&mut task, &cfg, "web1", HealthState::Healthy).await;

        let calls = ncc.take_calls();
        assert!(calls
            .iter()
            .any(|c| matches!(c, NccRequest::AdvertiseBgpPrefix(addr) if *addr == "198.51.100.1".parse::<IpAddr>().unwrap())));
    }

    #[tokio::test]
    async fn test_quit_tears_down_in_order() {
        let ncc = SharedNetControl::new();
        let (mut task, _rx) = task(ncc.clone());
        let cfg = config(1, 0.0, 0.0, false);
        task.handle(VserverEvent::ConfigUpdate(Box::new(cfg.clone()))).await;
        mark(&mut task, &cfg, "web1", HealthState::Healthy).await;
        ncc.take_calls();

        task.teardown().await;
        assert_eq!(task.kernel, KernelState::default());
        let calls = ncc.take_calls();
        // VIP removal precedes destination and service removal, rules last.
        assert!(matches!(calls.first(), Some(NccRequest::DeleteVip { .. })));
        assert!(matches!(calls.last(), Some(NccRequest::DeleteVserverRules(_))));
    }
}
