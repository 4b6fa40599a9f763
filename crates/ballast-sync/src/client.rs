//! Sync client (follower side)
//!
//! Long-polls the leader and applies received notes to the local engine:
//! health transitions and overrides flow straight into the engine's
//! channels, config-update and desync notes trigger a refetch through
//! the config fetcher. Repeated failures fall back to the authoritative
//! remote config source while the client keeps retrying in the
//! background.

use ballast_config::{ConfigSource, FetcherHandle, NodeConfig};
use ballast_core::{AuthContext, CheckNotification, SyncNote};
use ballast_engine::{EngineChannels, EngineCommand};
use futures::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::tls::TlsConfig;
use crate::{Result, SyncError, SyncRequest, SyncResponse};

#[derive(Debug, Clone)]
pub struct SyncClientConfig {
    pub peer: SocketAddr,
    /// Name the peer's certificate is verified against
    pub server_name: String,
    pub tls: TlsConfig,
    pub poll_timeout: Duration,
    /// Slack added to the server's poll window for the read deadline
    pub read_slack: Duration,
    /// Consecutive failures before falling back to the remote source
    pub failure_threshold: u32,
    pub retry_delay: Duration,
}

impl SyncClientConfig {
    pub fn from_node(node: &NodeConfig) -> Self {
        Self {
            peer: SocketAddr::new(node.peer_address, node.sync_port),
            server_name: node.peer_address.to_string(),
            tls: TlsConfig::new(&node.ca_cert, &node.node_cert, &node.node_key),
            poll_timeout: Duration::from_secs(30),
            read_slack: Duration::from_secs(5),
            failure_threshold: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

pub struct SyncClient {
    config: SyncClientConfig,
    channels: EngineChannels,
    fetcher: FetcherHandle,
    enabled: watch::Receiver<bool>,
}

impl SyncClient {
    pub fn new(
        config: SyncClientConfig,
        channels: EngineChannels,
        fetcher: FetcherHandle,
        enabled: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            channels,
            fetcher,
            enabled,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let mut failures: u32 = 0;
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if !*self.enabled.borrow() {
                tokio::select! {
                    changed = self.enabled.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }

            match self.session(&shutdown).await {
                Ok(()) => {
                    failures = 0;
                }
                Err(err) => {
                    failures += 1;
                    warn!(%err, failures, "Sync session failed");
                    if failures == self.config.failure_threshold {
                        warn!("Peer unreachable; falling back to remote config source");
                        if let Err(err) = self.fetcher.set_source(ConfigSource::Remote).await {
                            warn!(%err, "Config source fallback failed");
                        }
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_delay) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }
        info!("Sync client stopped");
        Ok(())
    }

    /// One session: connect, then poll until disabled or the stream
    /// breaks.
    async fn session(&mut self, shutdown: &CancellationToken) -> Result<()> {
        let connector = TlsConnector::from(self.config.tls.client_config()?);
        let server_name = ServerName::try_from(self.config.server_name.clone())
            .map_err(|err| SyncError::Tls(format!("bad server name: {}", err)))?;
        let tcp = TcpStream::connect(self.config.peer).await?;
        let tls = connector.connect(server_name, tcp).await?;
        let mut framed = Framed::new(tls, LengthDelimitedCodec::new());

        let session = Uuid::new_v4();
        let mut since: u64 = 0;
        info!(%session, peer = %self.config.peer, "Sync session established");

        loop {
            if shutdown.is_cancelled() || !*self.enabled.borrow() {
                return Ok(());
            }
            let request = SyncRequest::Poll { session, since };
            let frame = bincode::serialize(&request)?;
            framed.send(frame.into()).await?;

            let deadline = self.config.poll_timeout + self.config.read_slack;
            let reply = tokio::time::timeout(deadline, framed.next())
                .await
                .map_err(|_| {
                    SyncError::Transport(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "poll read deadline expired",
                    ))
                })?
                .ok_or_else(|| {
                    SyncError::Transport(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "leader closed the session",
                    ))
                })??;
            match bincode::deserialize::<SyncResponse>(&reply)? {
                SyncResponse::Notes { notes, next } => {
                    for entry in notes {
                        self.apply(entry.note).await;
                    }
                    since = next;
                }
                SyncResponse::Error(message) => {
                    return Err(SyncError::Rejected(message));
                }
            }
        }
    }

    /// Fold one note into follower state.
    async fn apply(&mut self, note: SyncNote) {
        match note {
            SyncNote::Heartbeat => {}
            SyncNote::Desync => {
                info!("Desync marker received; refetching full state");
                if let Err(err) = self.fetcher.reload().await {
                    warn!(%err, "Refetch after desync failed");
                }
            }
            SyncNote::ConfigUpdated { version } => {
                debug!(version, "Leader config moved; triggering fetch");
                if let Err(err) = self.fetcher.reload().await {
                    warn!(%err, "Config fetch failed");
                }
            }
            SyncNote::HealthcheckState { id, status } => {
                let batch = vec![CheckNotification { id, status }];
                if self.channels.health.send(batch).await.is_err() {
                    warn!("Engine health channel closed");
                }
            }
            SyncNote::OverrideApplied(o) => {
                let (resp, _ignored) = oneshot::channel();
                let command = EngineCommand::ApplyOverride {
                    ctx: AuthContext::trusted(),
                    o,
                    resp,
                };
                if self.channels.commands.send(command).await.is_err() {
                    warn!("Engine command channel closed");
                }
            }
        }
    }
}
