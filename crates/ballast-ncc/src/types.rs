//! Wire types for the network-control RPC

use ballast_core::{ForwardingMethod, Scheduler, ServiceKey, Stats, Vip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

/// LB-interface parameters handed to the helper on leader transitions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LbInterfaceConfig {
    pub interface: String,
    /// Address of this node on the LB subnet
    pub node_address: IpAddr,
    /// VRRP virtual router id, used for the interface MAC
    pub vrid: u8,
}

/// One IPVS virtual service as installed in the kernel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpvsService {
    /// Entry address; ignored by the kernel for firewall-mark keys
    pub vip: IpAddr,
    pub key: ServiceKey,
    pub scheduler: Scheduler,
    pub persistence: Option<Duration>,
    pub one_packet: bool,
    pub conn_threshold_upper: u32,
    pub conn_threshold_lower: u32,
}

/// One IPVS real server under a virtual service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpvsDestination {
    pub address: IpAddr,
    pub port: u16,
    pub weight: i32,
    pub method: ForwardingMethod,
}

/// Per-VIP iptables material for one vserver
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VserverRules {
    pub vserver: String,
    pub vips: Vec<Vip>,
    /// Present when the vserver groups services under a firewall mark
    pub firewall_mark: Option<u32>,
    /// Services needing SNAT rules (NAT forwarding)
    pub nat_services: Vec<ServiceKey>,
}

/// Counters returned by `query_stats`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceStats {
    pub service: Stats,
    /// Keyed by destination address
    pub destinations: BTreeMap<IpAddr, Stats>,
}

/// Requests understood by the privileged helper
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NccRequest {
    InitLb(LbInterfaceConfig),
    TeardownLb,
    UpLb,
    DownLb,
    AddVip { vip: Vip, interface: String },
    DeleteVip { vip: Vip, interface: String },
    GratuitousArp { vip: Vip, interface: String },
    AddService(IpvsService),
    UpdateService(IpvsService),
    DeleteService(IpvsService),
    AddDestination(IpvsService, IpvsDestination),
    UpdateDestination(IpvsService, IpvsDestination),
    DeleteDestination(IpvsService, IpvsDestination),
    AddVserverRules(VserverRules),
    DeleteVserverRules(VserverRules),
    AdvertiseBgpPrefix(IpAddr),
    WithdrawBgpPrefix(IpAddr),
    QueryStats(IpvsService),
}

/// Helper responses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NccResponse {
    Ok,
    Stats(ServiceStats),
    Error { message: String, transient: bool },
}
