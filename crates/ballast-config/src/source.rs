//! Config fetcher contract
//!
//! The fetcher itself (disk/peer/HTTPS chain) runs outside the engine.
//! The engine sees two halves: a command channel for reload/source
//! switches and a notification channel delivering validated snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::cluster::ClusterConfig;
use crate::{ConfigError, Result};

/// Where the fetcher pulls cluster config from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConfigSource {
    /// Authoritative remote source (leader's choice)
    Remote,
    /// The peer node's sync stream (follower's choice)
    Peer,
    /// Local bootstrap file, used before any other source answers
    Disk,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Remote => write!(f, "remote"),
            ConfigSource::Peer => write!(f, "peer"),
            ConfigSource::Disk => write!(f, "disk"),
        }
    }
}

/// A new snapshot pushed by the fetcher
#[derive(Debug, Clone)]
pub struct ConfigNotification {
    pub config: ClusterConfig,
    pub source: ConfigSource,
    pub received: DateTime<Utc>,
}

impl ConfigNotification {
    pub fn new(config: ClusterConfig, source: ConfigSource) -> Self {
        Self {
            config,
            source,
            received: Utc::now(),
        }
    }
}

/// Commands the engine sends to the fetcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetcherCommand {
    /// Re-evaluate the current source immediately
    Reload,
    /// Switch the active source
    SetSource(ConfigSource),
}

/// Engine-side handle to the external fetcher.
#[derive(Debug, Clone)]
pub struct FetcherHandle {
    commands: mpsc::Sender<FetcherCommand>,
}

impl FetcherHandle {
    pub fn new(commands: mpsc::Sender<FetcherCommand>) -> Self {
        Self { commands }
    }

    /// Channel pair for wiring a fetcher to the engine. The fetcher task
    /// consumes the command receiver and produces on the notification
    /// sender.
    pub fn channel(
        depth: usize,
    ) -> (
        Self,
        mpsc::Receiver<FetcherCommand>,
        mpsc::Sender<ConfigNotification>,
        mpsc::Receiver<ConfigNotification>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(depth);
        let (note_tx, note_rx) = mpsc::channel(depth);
        (Self::new(cmd_tx), cmd_rx, note_tx, note_rx)
    }

    pub async fn reload(&self) -> Result<()> {
        self.commands
            .send(FetcherCommand::Reload)
            .await
            .map_err(|_| ConfigError::FetcherUnavailable("fetcher channel closed".to_string()))
    }

    pub async fn set_source(&self, source: ConfigSource) -> Result<()> {
        self.commands
            .send(FetcherCommand::SetSource(source))
            .await
            .map_err(|_| ConfigError::FetcherUnavailable("fetcher channel closed".to_string()))
    }
}
