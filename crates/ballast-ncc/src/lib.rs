//! Network-control client
//!
//! Typed RPC client to the privileged helper that owns all kernel state:
//! IPVS virtual services and destinations, iptables rule templates, VIP
//! and VLAN interface lifecycle, and BGP advertisement via the routing
//! daemon. The engine core never touches the kernel directly; everything
//! goes through this client and is observed back through return values.

mod client;
mod error;
mod types;

pub use client::NccClient;
pub use error::{NccError, Result};
pub use types::{
    IpvsDestination, IpvsService, LbInterfaceConfig, NccRequest, NccResponse, ServiceStats,
    VserverRules,
};
