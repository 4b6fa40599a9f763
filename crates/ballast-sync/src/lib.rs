//! Ballast peer synchronization
//!
//! Long-polling notification stream that keeps the follower's runtime
//! state (config version, health view, overrides) warm for failover.
//! The transport is mutually-authenticated TLS between exactly two
//! nodes: the server half runs only on the leader, the client half only
//! on the follower, both toggled by the engine coordinator.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use ballast_core::SyncNote;

pub mod client;
pub mod server;
pub mod store;
pub mod tls;

pub use client::{SyncClient, SyncClientConfig};
pub use server::{SyncServer, SyncServerConfig};
pub use store::{PollOutcome, SessionStore};
pub use tls::TlsConfig;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Sync TLS error: {0}")]
    Tls(String),

    #[error("Sync encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Peer rejected request: {0}")]
    Rejected(String),

    #[error("Session is not accepting polls")]
    Disabled,
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// One note with its position in the session stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SequencedNote {
    pub seq: u64,
    pub note: SyncNote,
}

/// Requests on the sync channel. Session ids are client-generated; a
/// poll for an unknown session implicitly opens it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncRequest {
    Poll { session: Uuid, since: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncResponse {
    Notes { notes: Vec<SequencedNote>, next: u64 },
    Error(String),
}
