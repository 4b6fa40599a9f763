//! Engine coordinator
//!
//! Single writer over all engine state. Every external input arrives on
//! a typed channel and is consumed by a biased select ladder, highest
//! priority first: HA updates, then config notifications, the HA
//! liveness timeout, the snapshot tick, and finally IPC commands. A
//! stale config can therefore never clobber a fresh leadership
//! transition.

use ballast_config::{
    plan_cycle, ClusterConfig, ConfigNotification, ConfigSource, FetcherHandle, NodeConfig,
};
use ballast_core::{
    AuthContext, Backend, CheckNotification, Error, HaState, HaStatus, Override, Result, SyncNote,
    VipKind,
};
use ballast_ncc::{LbInterfaceConfig, NccRequest};
use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::fwmark::MarkPool;
use crate::health::HealthBridge;
use crate::netctl::NetControl;
use crate::overrides::OverrideStore;
use crate::snapshot::{ChecksSnapshot, EngineSnapshot, VserverSnapshot, Warning};
use crate::vserver::{VserverEvent, VserverHandle};

const COMMAND_QUEUE_DEPTH: usize = 64;
const SNAPSHOT_QUEUE_DEPTH: usize = 256;
const ENGINE_WARNING_RING: usize = 64;

/// Coordinator tuning knobs
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub snapshot_interval: Duration,
    pub stats_interval: Duration,
    pub garp_interval: Duration,
    /// HA controller silence tolerated before the engine declares the HA
    /// state unknown
    pub ha_timeout: Duration,
    /// Vserver additions and deletions allowed per apply cycle
    pub config_apply_limit: usize,
    /// Grace period for component teardown at shutdown
    pub shutdown_grace: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            snapshot_interval: Duration::from_secs(5),
            stats_interval: Duration::from_secs(15),
            garp_interval: Duration::from_secs(10),
            ha_timeout: Duration::from_secs(30),
            config_apply_limit: 10,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Response to a periodic HA status report. `failover` instructs the HA
/// controller to abdicate by transmitting a priority-zero advertisement.
#[derive(Debug, Clone, Copy, Default)]
pub struct HaUpdateResponse {
    pub failover: bool,
}

/// Periodic report from the HA controller
#[derive(Debug)]
pub struct HaUpdate {
    pub status: HaStatus,
    pub resp: oneshot::Sender<HaUpdateResponse>,
}

/// Commands from the local IPC surface
#[derive(Debug)]
pub enum EngineCommand {
    Failover {
        ctx: AuthContext,
        resp: oneshot::Sender<Result<()>>,
    },
    ApplyOverride {
        ctx: AuthContext,
        o: Override,
        resp: oneshot::Sender<Result<()>>,
    },
    ResetOverrides {
        ctx: AuthContext,
        resp: oneshot::Sender<Result<()>>,
    },
    ConfigReload {
        ctx: AuthContext,
        resp: oneshot::Sender<Result<()>>,
    },
    ConfigSource {
        ctx: AuthContext,
        source: ConfigSource,
        resp: oneshot::Sender<Result<()>>,
    },
    SnapshotVservers {
        ctx: AuthContext,
        resp: oneshot::Sender<Result<Vec<VserverSnapshot>>>,
    },
    ListBackends {
        ctx: AuthContext,
        resp: oneshot::Sender<Result<Vec<Backend>>>,
    },
    Healthchecks {
        resp: oneshot::Sender<ChecksSnapshot>,
    },
    EngineStatus {
        ctx: AuthContext,
        resp: oneshot::Sender<Result<EngineSnapshot>>,
    },
}

/// Channel bundle handed to the IPC server and the health bridge feed.
#[derive(Clone)]
pub struct EngineChannels {
    pub commands: mpsc::Sender<EngineCommand>,
    pub ha: mpsc::Sender<HaUpdate>,
    pub health: mpsc::Sender<Vec<CheckNotification>>,
}

/// Coordinator-side switches for the sync server and client plus the
/// note stream feeding the leader's sessions.
pub struct SyncControl {
    server_enabled: watch::Sender<bool>,
    client_enabled: watch::Sender<bool>,
    notes: mpsc::Sender<SyncNote>,
}

/// Receiving halves consumed by the sync crate.
pub struct SyncHooks {
    pub server_enabled: watch::Receiver<bool>,
    pub client_enabled: watch::Receiver<bool>,
    pub notes: mpsc::Receiver<SyncNote>,
}

impl SyncControl {
    pub fn new(note_depth: usize) -> (Self, SyncHooks) {
        let (server_tx, server_rx) = watch::channel(false);
        let (client_tx, client_rx) = watch::channel(false);
        let (notes_tx, notes_rx) = mpsc::channel(note_depth);
        (
            Self {
                server_enabled: server_tx,
                client_enabled: client_tx,
                notes: notes_tx,
            },
            SyncHooks {
                server_enabled: server_rx,
                client_enabled: client_rx,
                notes: notes_rx,
            },
        )
    }

    fn set(&self, server: bool, client: bool) {
        let _ = self.server_enabled.send(server);
        let _ = self.client_enabled.send(client);
    }

    fn note(&self, note: SyncNote) {
        if self.notes.try_send(note).is_err() {
            warn!("Sync note queue full, dropping note");
        }
    }
}

type NccFactory = Box<dyn Fn() -> Box<dyn NetControl> + Send>;

pub struct Engine {
    node: NodeConfig,
    options: EngineOptions,
    ncc: Box<dyn NetControl>,
    ncc_factory: NccFactory,
    fetcher: FetcherHandle,
    sync: SyncControl,

    config_rx: mpsc::Receiver<ConfigNotification>,
    commands_rx: mpsc::Receiver<EngineCommand>,
    ha_rx: mpsc::Receiver<HaUpdate>,
    health_rx: mpsc::Receiver<Vec<CheckNotification>>,
    snapshots_tx: mpsc::Sender<VserverSnapshot>,
    snapshots_rx: mpsc::Receiver<VserverSnapshot>,

    vservers: HashMap<String, VserverHandle>,
    vserver_snapshots: BTreeMap<String, VserverSnapshot>,
    overrides: OverrideStore,
    marks: MarkPool,
    bridge: HealthBridge,

    desired_config: Option<ClusterConfig>,
    applied_version: u64,
    config_source: ConfigSource,

    ha: HaStatus,
    last_ha_update: Option<Instant>,
    pending_failover: bool,

    warnings: Vec<Warning>,
}

impl Engine {
    pub fn new(
        node: NodeConfig,
        options: EngineOptions,
        ncc: Box<dyn NetControl>,
        ncc_factory: NccFactory,
        fetcher: FetcherHandle,
        config_rx: mpsc::Receiver<ConfigNotification>,
        sync: SyncControl,
    ) -> (Self, EngineChannels) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (ha_tx, ha_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (health_tx, health_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (snapshots_tx, snapshots_rx) = mpsc::channel(SNAPSHOT_QUEUE_DEPTH);
        let marks = MarkPool::new(node.fwmark_base, node.fwmark_size);
        let engine = Self {
            node,
            options,
            ncc,
            ncc_factory,
            fetcher,
            sync,
            config_rx,
            commands_rx,
            ha_rx,
            health_rx,
            snapshots_tx,
            snapshots_rx,
            vservers: HashMap::new(),
            vserver_snapshots: BTreeMap::new(),
            overrides: OverrideStore::new(),
            marks,
            bridge: HealthBridge::new(),
            desired_config: None,
            applied_version: 0,
            config_source: ConfigSource::Disk,
            ha: HaStatus::new(HaState::Unknown),
            last_ha_update: None,
            pending_failover: false,
            warnings: Vec::new(),
        };
        let channels = EngineChannels {
            commands: commands_tx,
            ha: ha_tx,
            health: health_tx,
        };
        (engine, channels)
    }

    /// Main event loop. Runs until `shutdown` is cancelled, then tears
    /// down every vserver within the grace period.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(node = %self.node.name, "Engine coordinator starting");
        let mut ha_timeout = tokio::time::interval(self.options.ha_timeout);
        ha_timeout.reset();
        let mut snapshot_tick = tokio::time::interval(self.options.snapshot_interval);
        let mut stats_tick = tokio::time::interval(self.options.stats_interval);
        let mut garp_tick = tokio::time::interval(self.options.garp_interval);

        loop {
            tokio::select! {
                biased;

                Some(update) = self.ha_rx.recv() => {
                    self.handle_ha_update(update).await;
                }
                Some(note) = self.config_rx.recv() => {
                    self.handle_config(note).await;
                }
                _ = ha_timeout.tick() => {
                    self.check_ha_timeout().await;
                }
                Some(batch) = self.health_rx.recv() => {
                    self.handle_health(batch);
                }
                _ = snapshot_tick.tick() => {
                    self.tick_snapshot().await;
                }
                _ = stats_tick.tick() => {
                    self.broadcast(VserverEvent::StatsTick);
                }
                _ = garp_tick.tick(), if self.ha.state == HaState::Leader => {
                    self.send_garps().await;
                }
                Some(snapshot) = self.snapshots_rx.recv() => {
                    self.vserver_snapshots.insert(snapshot.name.clone(), snapshot);
                }
                Some(command) = self.commands_rx.recv() => {
                    self.handle_command(command).await;
                }
                _ = shutdown.cancelled() => {
                    break;
                }
            }
        }
        self.shutdown().await;
    }

    fn push_warning(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(Warning::new("engine", message));
        if self.warnings.len() > ENGINE_WARNING_RING {
            self.warnings.remove(0);
        }
    }

    async fn handle_ha_update(&mut self, update: HaUpdate) {
        self.last_ha_update = Some(Instant::now());
        let previous = self.ha.state;
        if update.status.state != previous {
            self.transition(update.status.state).await;
        }
        self.ha.transition(update.status.state);
        let response = HaUpdateResponse {
            failover: std::mem::take(&mut self.pending_failover),
        };
        let _ = update.resp.send(response);
    }

    /// Leadership transition actions, applied before anything else can
    /// observe the new state.
    async fn transition(&mut self, state: HaState) {
        info!(from = %self.ha.state, to = %state, "HA state changed");
        match state {
            HaState::Leader => {
                self.set_config_source(ConfigSource::Remote).await;
                let lb = LbInterfaceConfig {
                    interface: self.node.lb_interface.clone(),
                    node_address: self.node.address,
                    vrid: self.node.vrid,
                };
                if let Err(err) = self.ncc.call(NccRequest::InitLb(lb)).await {
                    self.push_warning(format!("init_lb failed: {}", err));
                }
                if let Err(err) = self.ncc.call(NccRequest::UpLb).await {
                    self.push_warning(format!("up_lb failed: {}", err));
                }
                self.sync.set(true, false);
                self.broadcast(VserverEvent::HaState(HaState::Leader));
            }
            HaState::Follower => {
                self.set_config_source(ConfigSource::Peer).await;
                self.broadcast(VserverEvent::HaState(HaState::Follower));
                if let Err(err) = self.ncc.call(NccRequest::DownLb).await {
                    self.push_warning(format!("down_lb failed: {}", err));
                }
                self.sync.set(false, true);
            }
            HaState::Unknown | HaState::Disabled => {
                self.broadcast(VserverEvent::HaState(state));
                if let Err(err) = self.ncc.call(NccRequest::DownLb).await {
                    self.push_warning(format!("down_lb failed: {}", err));
                }
                self.sync.set(false, false);
            }
        }
    }

    async fn set_config_source(&mut self, source: ConfigSource) {
        if self.config_source == source {
            return;
        }
        self.config_source = source;
        if let Err(err) = self.fetcher.set_source(source).await {
            self.push_warning(format!("config source switch failed: {}", err));
        }
    }

    async fn check_ha_timeout(&mut self) {
        let expired = match self.last_ha_update {
            Some(at) => at.elapsed() > self.options.ha_timeout,
            None => false,
        };
        if expired && !matches!(self.ha.state, HaState::Unknown | HaState::Disabled) {
            self.push_warning("HA controller went silent".to_string());
            self.transition(HaState::Unknown).await;
            self.ha.transition(HaState::Unknown);
        }
    }

    async fn handle_config(&mut self, note: ConfigNotification) {
        if let Err(err) = note.config.validate() {
            self.push_warning(format!(
                "rejected config version {}: {}",
                note.config.version, err
            ));
            return;
        }
        info!(
            version = note.config.version,
            source = %note.source,
            vservers = note.config.vservers.len(),
            "Received config snapshot"
        );
        self.desired_config = Some(note.config);
        self.apply_cycle().await;
    }

    /// One rate-limited application cycle: deletions, then additions,
    /// then updates for everything that survives.
    async fn apply_cycle(&mut self) {
        let Some(desired) = self.desired_config.clone() else {
            return;
        };
        let current: BTreeSet<String> = self.vservers.keys().cloned().collect();
        let plan = plan_cycle(&current, &desired, self.options.config_apply_limit);
        if !plan.remove.is_empty() || !plan.add.is_empty() {
            info!(
                removing = plan.remove.len(),
                adding = plan.add.len(),
                deferred = plan.deferred,
                "Applying config cycle"
            );
        }

        // Deletions first so churn cannot exhaust the firewall-mark pool.
        let grace = self.options.shutdown_grace;
        let mut quits = Vec::new();
        for name in &plan.remove {
            if let Some(handle) = self.vservers.remove(name) {
                self.vserver_snapshots.remove(name);
                quits.push(async move { (handle.name().to_string(), handle.quit(grace).await) });
            }
        }
        for (name, confirmed) in join_all(quits).await {
            if confirmed {
                if self.marks.mark_of(&name).is_some() {
                    if let Err(err) = self.marks.release(&name) {
                        // Allocator state diverging from vserver state is
                        // unrecoverable; the supervisor restart triggers
                        // HA failover.
                        error!(vserver = %name, %err, "Firewall-mark invariant violated");
                        std::process::exit(1);
                    }
                }
            } else {
                self.push_warning(format!(
                    "vserver {} teardown unconfirmed, keeping its firewall mark",
                    name
                ));
            }
        }

        for name in &plan.add {
            let config = &desired.vservers[name];
            let mark = if config.use_firewall_mark {
                match self.marks.allocate(name) {
                    Ok(mark) => Some(mark),
                    Err(err) => {
                        self.push_warning(format!("vserver {}: {}", name, err));
                        continue;
                    }
                }
            } else {
                None
            };
            let handle = VserverHandle::spawn(
                name.clone(),
                self.node.lb_interface.clone(),
                mark,
                (self.ncc_factory)(),
                self.snapshots_tx.clone(),
            );
            handle.try_send(VserverEvent::ConfigUpdate(Box::new(config.clone())));
            for o in self.overrides.for_vserver(name) {
                handle.try_send(VserverEvent::Override(o));
            }
            handle.try_send(VserverEvent::HaState(self.ha.state));
            self.vservers.insert(name.clone(), handle);
        }

        // Surviving vservers get the new config even when unchanged so
        // per-destination weight changes propagate.
        for name in &plan.update {
            if let (Some(handle), Some(config)) =
                (self.vservers.get(name), desired.vservers.get(name))
            {
                handle.try_send(VserverEvent::ConfigUpdate(Box::new(config.clone())));
            }
        }

        self.bridge.rebuild(desired.vservers.values());

        if plan.converges() && self.applied_version != desired.version {
            self.applied_version = desired.version;
            self.sync.note(SyncNote::ConfigUpdated {
                version: desired.version,
            });
        }
    }

    fn converged(&self) -> bool {
        match &self.desired_config {
            Some(desired) => {
                let current: BTreeSet<&String> = self.vservers.keys().collect();
                let wanted: BTreeSet<&String> = desired.vservers.keys().collect();
                current == wanted
            }
            None => true,
        }
    }

    fn handle_health(&mut self, batch: Vec<CheckNotification>) {
        for note in &batch {
            self.sync.note(SyncNote::HealthcheckState {
                id: note.id,
                status: note.status.clone(),
            });
        }
        for (vserver, note) in self.bridge.route(&batch) {
            if let Some(handle) = self.vservers.get(&vserver) {
                handle.try_send(VserverEvent::HealthCheck(note));
            }
        }
    }

    async fn tick_snapshot(&mut self) {
        self.broadcast(VserverEvent::Notify);
        if !self.converged() {
            self.apply_cycle().await;
        }
    }

    fn broadcast(&self, event_for: VserverEvent) {
        // Events are not Clone (they carry boxed configs); rebuild per
        // vserver from the cheap variants only.
        for handle in self.vservers.values() {
            let event = match &event_for {
                VserverEvent::Notify => VserverEvent::Notify,
                VserverEvent::StatsTick => VserverEvent::StatsTick,
                VserverEvent::HaState(state) => VserverEvent::HaState(*state),
                _ => continue,
            };
            handle.try_send(event);
        }
    }

    async fn send_garps(&mut self) {
        let mut vips = Vec::new();
        for snapshot in self.vserver_snapshots.values() {
            if !snapshot.active {
                continue;
            }
            for vip in &snapshot.vips {
                if vip.kind == VipKind::Unicast {
                    vips.push(*vip);
                }
            }
        }
        for vip in vips {
            if let Err(err) = self
                .ncc
                .call(NccRequest::GratuitousArp {
                    vip,
                    interface: self.node.lb_interface.clone(),
                })
                .await
            {
                self.push_warning(format!("gratuitous arp for {}: {}", vip, err));
            }
        }
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Failover { ctx, resp } => {
                let result = ctx
                    .authorize_write(&self.node.access)
                    .and_then(|()| self.request_failover());
                let _ = resp.send(result);
            }
            EngineCommand::ApplyOverride { ctx, o, resp } => {
                let result = self.apply_override(&ctx, o);
                let _ = resp.send(result);
            }
            EngineCommand::ResetOverrides { ctx, resp } => {
                let result = self.reset_overrides(&ctx);
                let _ = resp.send(result);
            }
            EngineCommand::ConfigReload { ctx, resp } => {
                let result = match ctx.authorize_write(&self.node.access) {
                    Ok(()) => self
                        .fetcher
                        .reload()
                        .await
                        .map_err(|err| Error::Config(err.to_string())),
                    Err(err) => Err(err),
                };
                let _ = resp.send(result);
            }
            EngineCommand::ConfigSource { ctx, source, resp } => {
                let result = match ctx.authorize_write(&self.node.access) {
                    Ok(()) => {
                        self.set_config_source(source).await;
                        Ok(())
                    }
                    Err(err) => Err(err),
                };
                let _ = resp.send(result);
            }
            EngineCommand::SnapshotVservers { ctx, resp } => {
                let result = ctx
                    .authorize_read(&self.node.access)
                    .map(|()| self.vserver_snapshots.values().cloned().collect());
                let _ = resp.send(result);
            }
            EngineCommand::ListBackends { ctx, resp } => {
                let result = ctx.authorize_read(&self.node.access).map(|()| self.backends());
                let _ = resp.send(result);
            }
            EngineCommand::Healthchecks { resp } => {
                let _ = resp.send(self.bridge.checks().clone());
            }
            EngineCommand::EngineStatus { ctx, resp } => {
                let result = ctx
                    .authorize_read(&self.node.access)
                    .map(|()| self.engine_snapshot());
                let _ = resp.send(result);
            }
        }
    }

    fn request_failover(&mut self) -> Result<()> {
        if self.ha.state == HaState::Disabled || self.last_ha_update.is_none() {
            return Err(Error::Ha("HA is disabled on this node".to_string()));
        }
        info!("Failover requested; will signal HA controller");
        self.pending_failover = true;
        Ok(())
    }

    fn apply_override(&mut self, ctx: &AuthContext, o: Override) -> Result<()> {
        match o.vserver() {
            Some(name) => {
                let grants = self
                    .desired_config
                    .as_ref()
                    .and_then(|c| c.vservers.get(name))
                    .map(|v| v.access_grants.clone())
                    .unwrap_or_default();
                ctx.authorize_vserver(&self.node.access, &grants)?;
            }
            None => ctx.authorize_write(&self.node.access)?,
        }

        let changed = self.overrides.apply(&o);
        if changed {
            info!(?o, "Override applied");
        }
        self.fan_out_override(&o);
        self.sync.note(SyncNote::OverrideApplied(o));
        // The checker set is regenerated on overrides as well so the
        // prober side observes a fresh generation.
        if let Some(desired) = &self.desired_config {
            self.bridge.rebuild(desired.vservers.values());
        }
        Ok(())
    }

    fn fan_out_override(&self, o: &Override) {
        match o.vserver() {
            Some(name) => {
                if let Some(handle) = self.vservers.get(name) {
                    handle.try_send(VserverEvent::Override(o.clone()));
                }
            }
            None => {
                // Backend overrides may affect any vserver.
                for handle in self.vservers.values() {
                    handle.try_send(VserverEvent::Override(o.clone()));
                }
            }
        }
    }

    fn reset_overrides(&mut self, ctx: &AuthContext) -> Result<()> {
        ctx.authorize_write(&self.node.access)?;
        for o in self.overrides.defaults() {
            self.fan_out_override(&o);
            self.sync.note(SyncNote::OverrideApplied(o));
        }
        self.overrides.reset();
        info!("All overrides reset");
        Ok(())
    }

    fn backends(&self) -> Vec<Backend> {
        let mut backends: BTreeMap<String, Backend> = BTreeMap::new();
        if let Some(config) = &self.desired_config {
            for vserver in config.vservers.values() {
                for backend in vserver.backends.values() {
                    backends.insert(backend.hostname.clone(), backend.clone());
                }
            }
        }
        backends.into_values().collect()
    }

    fn engine_snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            ha: self.ha.clone(),
            config_version: self.applied_version,
            config_source: self.config_source,
            vservers: self.vserver_snapshots.values().cloned().collect(),
            backends: self.backends(),
            checks: self.bridge.checks().clone(),
            warnings: self.warnings.clone(),
            generated: Utc::now(),
        }
    }

    async fn shutdown(&mut self) {
        info!("Engine shutting down, quitting vservers");
        let grace = self.options.shutdown_grace;
        let handles: Vec<VserverHandle> = self.vservers.drain().map(|(_, h)| h).collect();
        let quits = handles.into_iter().map(|handle| handle.quit(grace));
        for confirmed in join_all(quits).await {
            if !confirmed {
                warn!("A vserver missed the shutdown grace period");
            }
        }
        // Idempotent on the helper side; a no-op when not leading.
        if let Err(err) = self.ncc.call(NccRequest::TeardownLb).await {
            warn!(%err, "LB teardown at shutdown failed");
        }
    }
}
