//! Ballast HA controller
//!
//! VRRPv3 (RFC 5798) leader election between the two nodes of a
//! cluster. The controller is authoritative for this node's
//! leader/follower status: it runs the election state machine over a raw
//! protocol-112 socket, reports status to the engine over local IPC, and
//! watches the engine socket so an engine death abdicates leadership in
//! milliseconds instead of a full master-down interval.

pub mod controller;
pub mod election;
pub mod packet;
pub mod socket;
pub mod watcher;

pub use controller::{HaConfig, HaController};
pub use election::{Action, Election, ElectionConfig, ElectionEvent, NodeState};
pub use packet::VrrpPacket;
pub use socket::VrrpSocket;
pub use watcher::EngineWatcher;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HaError {
    #[error("VRRP packet error: {0}")]
    Packet(String),

    #[error("VRRP socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("Engine IPC error: {0}")]
    Engine(String),

    #[error("Watcher error: {0}")]
    Watcher(#[from] notify::Error),
}

pub type Result<T> = std::result::Result<T, HaError>;
