//! Ballast Engine
//!
//! The control-plane core of one load-balancer node: authoritative state
//! owner and single serialization point for all mutations. External
//! inputs (HA transitions, config snapshots, health notifications,
//! operator overrides) arrive on typed channels; per-vserver tasks
//! reconcile the resulting desired state into kernel configuration
//! through the privileged network-control helper.

pub mod coordinator;
pub mod fwmark;
pub mod health;
pub mod ipc;
pub mod netctl;
pub mod overrides;
pub mod snapshot;
pub mod vserver;

pub use coordinator::{
    Engine, EngineChannels, EngineCommand, EngineOptions, HaUpdate, HaUpdateResponse, SyncControl,
    SyncHooks,
};
pub use fwmark::MarkPool;
pub use health::HealthBridge;
pub use ipc::{IpcClient, IpcEnvelope, IpcRequest, IpcResponse, IpcServer};
pub use netctl::NetControl;
pub use overrides::OverrideStore;
pub use snapshot::{ChecksSnapshot, EngineSnapshot, VserverSnapshot, Warning};
pub use vserver::{VserverEvent, VserverHandle};
