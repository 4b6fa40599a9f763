//! Error types for Ballast

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network control error: {0}")]
    NetControl(String),

    #[error("HA error: {0}")]
    Ha(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Authorization error: {0}")]
    Auth(String),

    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl Error {
    /// Invariant violations are fatal to the engine; everything else is
    /// surfaced as a warning and recovered from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Invariant(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
