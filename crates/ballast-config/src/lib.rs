//! Ballast Configuration Management
//!
//! The cluster-config model the engine reconciles against, the diff engine
//! that turns a new snapshot into rate-limited per-cycle plans, the
//! notification contract with the (external) config fetcher, and the node
//! bootstrap file.

use thiserror::Error;

pub mod cluster;
pub mod diff;
pub mod node;
pub mod source;

pub use cluster::{ClusterConfig, ServiceConfig, VserverConfig};
pub use diff::{plan_cycle, CyclePlan};
pub use node::NodeConfig;
pub use source::{ConfigNotification, ConfigSource, FetcherCommand, FetcherHandle};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config fetcher unavailable: {0}")]
    FetcherUnavailable(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
