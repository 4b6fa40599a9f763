//! Core type definitions
//!
//! The load-balancer data model shared between the engine, the HA
//! controller, the sync channel, and the network-control client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

/// IP address family
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressFamily {
    V4,
    V6,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "ipv4"),
            AddressFamily::V6 => write!(f, "ipv6"),
        }
    }
}

impl AddressFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }
}

/// Transport protocol load-balanced by a service
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// IPVS packet-forwarding method for a destination
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ForwardingMethod {
    DirectReturn,
    Nat,
    Tunnel,
}

impl fmt::Display for ForwardingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardingMethod::DirectReturn => write!(f, "dsr"),
            ForwardingMethod::Nat => write!(f, "nat"),
            ForwardingMethod::Tunnel => write!(f, "tunnel"),
        }
    }
}

/// IPVS scheduling algorithm
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Scheduler {
    RoundRobin,
    WeightedRoundRobin,
    LeastConn,
    WeightedLeastConn,
    SourceHash,
    MaglevHash,
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scheduler::RoundRobin => "rr",
            Scheduler::WeightedRoundRobin => "wrr",
            Scheduler::LeastConn => "lc",
            Scheduler::WeightedLeastConn => "wlc",
            Scheduler::SourceHash => "sh",
            Scheduler::MaglevHash => "mh",
        };
        write!(f, "{}", s)
    }
}

/// Identity of a service within a vserver: either a conventional
/// (family, protocol, port) tuple or a firewall mark that groups several
/// tuples under one IPVS virtual service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceKey {
    Inet {
        af: AddressFamily,
        proto: Protocol,
        port: u16,
    },
    FirewallMark {
        af: AddressFamily,
        mark: u32,
    },
}

impl ServiceKey {
    pub fn af(&self) -> AddressFamily {
        match self {
            ServiceKey::Inet { af, .. } => *af,
            ServiceKey::FirewallMark { af, .. } => *af,
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKey::Inet { af, proto, port } => write!(f, "{}/{}/{}", af, proto, port),
            ServiceKey::FirewallMark { af, mark } => write!(f, "{}/fwm/{}", af, mark),
        }
    }
}

/// A physical target host, owned by the cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Backend {
    pub hostname: String,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub enabled: bool,
    pub weight: i32,
}

impl Backend {
    /// Address of this backend for the given family, if configured.
    pub fn address(&self, af: AddressFamily) -> Option<IpAddr> {
        match af {
            AddressFamily::V4 => self.ipv4.map(IpAddr::V4),
            AddressFamily::V6 => self.ipv6.map(IpAddr::V6),
        }
    }
}

/// Health of a destination as reported by the external check subsystem
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Unknown => write!(f, "unknown"),
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// A single health notification for one checker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub state: HealthState,
    pub timestamp: DateTime<Utc>,
    pub successes: u32,
    pub failures: u32,
    pub message: String,
}

impl HealthStatus {
    pub fn new(state: HealthState) -> Self {
        Self {
            state,
            timestamp: Utc::now(),
            successes: 0,
            failures: 0,
            message: String::new(),
        }
    }
}

/// Stable identifier for a health-check definition.
///
/// Derived from the canonical encoding of the definition so identical
/// definitions keep the same id across config reloads and deduplicate
/// across vservers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckerId(pub u64);

impl fmt::Display for CheckerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chk-{:016x}", self.0)
    }
}

/// Kind of health check executed by the external prober subsystem
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CheckerKind {
    Tcp,
    TcpTls,
    Http,
    Https,
    Dns,
    Icmp,
    Udp,
    Radius,
}

/// How probe packets reach the destination
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CheckerMode {
    Plain,
    DirectReturn,
    Tunnel,
}

/// Kind-specific checker parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct CheckerParams {
    pub send: Option<String>,
    pub receive: Option<String>,
    pub request_path: Option<String>,
    pub response_code: Option<u16>,
    pub dns_query: Option<String>,
    pub radius_secret: Option<String>,
}

/// A health-check template carried by cluster config. The engine
/// instantiates one concrete [`CheckerDef`] per (template, backend
/// address) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CheckerSpec {
    pub kind: CheckerKind,
    /// Probe port; defaults to the service port when unset
    pub port: Option<u16>,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub mode: CheckerMode,
    pub params: CheckerParams,
}

impl CheckerSpec {
    /// Bind this template to a concrete backend address.
    pub fn instantiate(&self, target: IpAddr, fallback_port: u16) -> CheckerDef {
        CheckerDef {
            kind: self.kind,
            target,
            port: self.port.unwrap_or(fallback_port),
            interval: self.interval,
            timeout: self.timeout,
            retries: self.retries,
            mode: self.mode,
            params: self.params.clone(),
        }
    }
}

/// A health-check definition consumed by the external prober subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CheckerDef {
    pub kind: CheckerKind,
    pub target: IpAddr,
    pub port: u16,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub mode: CheckerMode,
    pub params: CheckerParams,
}

impl CheckerDef {
    /// Stable id for this definition: FNV-1a over the canonical encoding.
    pub fn id(&self) -> CheckerId {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
        let canon = format!(
            "{:?}|{}|{}|{}|{}|{}|{:?}|{:?}",
            self.kind,
            self.target,
            self.port,
            self.interval.as_millis(),
            self.timeout.as_millis(),
            self.retries,
            self.mode,
            self.params,
        );
        let mut hash = FNV_OFFSET;
        for b in canon.as_bytes() {
            hash ^= u64::from(*b);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        CheckerId(hash)
    }
}

/// Operator-forced state applied on top of configured/health-driven state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OverrideState {
    Default,
    Enabled,
    Disabled,
}

impl fmt::Display for OverrideState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverrideState::Default => write!(f, "default"),
            OverrideState::Enabled => write!(f, "enabled"),
            OverrideState::Disabled => write!(f, "disabled"),
        }
    }
}

/// An operator override, scoped to a vserver, a backend, or a single
/// destination. Memory-only; cleared by an explicit reset or restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Override {
    Vserver {
        name: String,
        state: OverrideState,
    },
    Backend {
        hostname: String,
        state: OverrideState,
    },
    Destination {
        vserver: String,
        hostname: String,
        service: ServiceKey,
        state: OverrideState,
    },
}

impl Override {
    pub fn state(&self) -> OverrideState {
        match self {
            Override::Vserver { state, .. } => *state,
            Override::Backend { state, .. } => *state,
            Override::Destination { state, .. } => *state,
        }
    }

    /// Name of the vserver an override targets, when it targets one.
    pub fn vserver(&self) -> Option<&str> {
        match self {
            Override::Vserver { name, .. } => Some(name),
            Override::Destination { vserver, .. } => Some(vserver),
            Override::Backend { .. } => None,
        }
    }
}

/// A virtual IP exposed to clients
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Vip {
    pub addr: IpAddr,
    pub kind: VipKind,
}

/// How a VIP is made reachable
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VipKind {
    /// Bound to the load-balancer interface (or a VLAN sub-interface)
    Unicast,
    /// Advertised via BGP; never bound to an interface directly
    Anycast,
}

impl fmt::Display for Vip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            VipKind::Unicast => write!(f, "{}", self.addr),
            VipKind::Anycast => write!(f, "{} (anycast)", self.addr),
        }
    }
}

/// High-availability role of this node
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HaState {
    Unknown,
    Leader,
    Follower,
    Disabled,
}

impl fmt::Display for HaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaState::Unknown => write!(f, "unknown"),
            HaState::Leader => write!(f, "leader"),
            HaState::Follower => write!(f, "follower"),
            HaState::Disabled => write!(f, "disabled"),
        }
    }
}

/// HA state plus transition bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HaStatus {
    pub state: HaState,
    pub since: DateTime<Utc>,
    pub transitions: u64,
}

impl HaStatus {
    pub fn new(state: HaState) -> Self {
        Self {
            state,
            since: Utc::now(),
            transitions: 0,
        }
    }

    /// Record a transition to `state`; no-op when the state is unchanged.
    pub fn transition(&mut self, state: HaState) {
        if self.state != state {
            self.state = state;
            self.since = Utc::now();
            self.transitions += 1;
        }
    }
}

/// One batched health notification from the external check subsystem
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckNotification {
    pub id: CheckerId,
    pub status: HealthStatus,
}

/// A note on the leader-to-follower sync stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncNote {
    /// Liveness only; the follower just advances its sequence
    Heartbeat,
    /// Everything queued before this point is stale; refetch a full
    /// snapshot before consuming further notes
    Desync,
    /// The authoritative config moved to `version`
    ConfigUpdated { version: u64 },
    /// Health transition observed on the leader
    HealthcheckState { id: CheckerId, status: HealthStatus },
    /// Override applied on the leader
    OverrideApplied(Override),
}

/// Per-service or per-destination counters read back from the kernel
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stats {
    pub connections: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub active_conns: u32,
    pub inactive_conns: u32,
}
