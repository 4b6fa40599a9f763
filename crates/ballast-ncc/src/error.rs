//! Network-control error classification
//!
//! Callers retry transient failures with backoff and surface permanent
//! ones as warnings; the distinction is part of the RPC contract.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NccError {
    #[error("NCC transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("NCC call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("NCC encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("NCC helper refused request: {message}")]
    Helper { message: String, transient: bool },

    #[error("NCC connection closed mid-call")]
    ConnectionClosed,
}

impl NccError {
    /// Whether retrying the same call later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            NccError::Transport(_) | NccError::Timeout(_) | NccError::ConnectionClosed => true,
            NccError::Helper { transient, .. } => *transient,
            NccError::Encoding(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, NccError>;
