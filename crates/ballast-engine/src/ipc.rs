//! Local IPC surface
//!
//! Unix-socket request/response server used by the CLI, the HA
//! controller, and the health-check subsystem. Requests carry a claimed
//! auth context; the server derives the effective context from the
//! peer's socket credentials. A same-UID peer is trusted and may forward
//! SSO contexts on behalf of remote callers; everyone else is untrusted
//! regardless of claims.

use ballast_core::{AuthContext, AuthType, Backend, CheckNotification, HaStatus, Override};
use ballast_config::ConfigSource;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::{EngineChannels, EngineCommand, HaUpdate};
use crate::snapshot::{ChecksSnapshot, EngineSnapshot, VserverSnapshot};

/// Requests accepted on the engine socket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IpcRequest {
    SnapshotVservers,
    ListBackends,
    Healthchecks,
    EngineStatus,
    Failover,
    ApplyOverride(Override),
    ResetOverrides,
    ConfigReload,
    ConfigSource(ConfigSource),
    /// Periodic status report from the HA controller; trusted callers only
    HaUpdate(HaStatus),
    /// Batched notifications from the health-check subsystem; trusted only
    HealthNotifications(Vec<CheckNotification>),
}

/// Responses on the engine socket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IpcResponse {
    Ok,
    Vservers(Vec<VserverSnapshot>),
    Backends(Vec<Backend>),
    Checks(ChecksSnapshot),
    Status(Box<EngineSnapshot>),
    /// Reply to `HaUpdate`; `failover` asks the controller to abdicate
    HaInstruction { failover: bool },
    Error(String),
}

/// One framed request with the caller's claimed context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcEnvelope {
    pub ctx: AuthContext,
    pub request: IpcRequest,
}

pub struct IpcServer {
    path: PathBuf,
    listener: UnixListener,
    channels: EngineChannels,
}

impl IpcServer {
    /// Bind the engine socket, replacing a stale file from a previous
    /// run.
    pub fn bind(path: &Path, channels: EngineChannels) -> std::io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        info!(path = %path.display(), "Engine IPC socket bound");
        Ok(Self {
            path: path.to_path_buf(),
            listener,
            channels,
        })
    }

    /// Accept loop. On shutdown the socket file is removed, which the HA
    /// controller's liveness watcher treats as engine death.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let channels = self.channels.clone();
                            tokio::spawn(serve_connection(stream, channels));
                        }
                        Err(err) => {
                            warn!(%err, "IPC accept failed");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    break;
                }
            }
        }
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(%err, "Failed to remove engine socket");
        }
    }
}

/// Effective context from peer credentials plus the claimed context.
fn effective_context(stream: &UnixStream, claimed: AuthContext) -> AuthContext {
    let same_uid = stream
        .peer_cred()
        .map(|cred| cred.uid() == nix::unistd::geteuid().as_raw())
        .unwrap_or(false);
    if same_uid {
        match claimed.auth_type {
            AuthType::None => AuthContext::trusted(),
            _ => claimed,
        }
    } else {
        AuthContext {
            auth_type: AuthType::Untrusted,
            ..claimed
        }
    }
}

async fn serve_connection(stream: UnixStream, channels: EngineChannels) {
    let peer_trusted_forwarder = stream
        .peer_cred()
        .map(|cred| cred.uid() == nix::unistd::geteuid().as_raw())
        .unwrap_or(false);
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%err, "IPC read failed");
                return;
            }
        };
        let envelope: IpcEnvelope = match bincode::deserialize(&frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(%err, "Dropping undecodable IPC frame");
                return;
            }
        };
        let ctx = effective_context(framed.get_ref(), envelope.ctx);
        let response = dispatch(&channels, ctx, peer_trusted_forwarder, envelope.request).await;
        let Ok(encoded) = bincode::serialize(&response) else {
            return;
        };
        if framed.send(encoded.into()).await.is_err() {
            return;
        }
    }
}

async fn dispatch(
    channels: &EngineChannels,
    ctx: AuthContext,
    trusted_peer: bool,
    request: IpcRequest,
) -> IpcResponse {
    match request {
        IpcRequest::SnapshotVservers => {
            let (tx, rx) = oneshot::channel();
            send_command(channels, EngineCommand::SnapshotVservers { ctx, resp: tx }, rx)
                .await
                .map_or_else(IpcResponse::Error, |r| match r {
                    Ok(vservers) => IpcResponse::Vservers(vservers),
                    Err(err) => IpcResponse::Error(err.to_string()),
                })
        }
        IpcRequest::ListBackends => {
            let (tx, rx) = oneshot::channel();
            send_command(channels, EngineCommand::ListBackends { ctx, resp: tx }, rx)
                .await
                .map_or_else(IpcResponse::Error, |r| match r {
                    Ok(backends) => IpcResponse::Backends(backends),
                    Err(err) => IpcResponse::Error(err.to_string()),
                })
        }
        IpcRequest::Healthchecks => {
            let (tx, rx) = oneshot::channel();
            send_command(channels, EngineCommand::Healthchecks { resp: tx }, rx)
                .await
                .map_or_else(IpcResponse::Error, IpcResponse::Checks)
        }
        IpcRequest::EngineStatus => {
            let (tx, rx) = oneshot::channel();
            send_command(channels, EngineCommand::EngineStatus { ctx, resp: tx }, rx)
                .await
                .map_or_else(IpcResponse::Error, |r| match r {
                    Ok(status) => IpcResponse::Status(Box::new(status)),
                    Err(err) => IpcResponse::Error(err.to_string()),
                })
        }
        IpcRequest::Failover => {
            let (tx, rx) = oneshot::channel();
            send_command(channels, EngineCommand::Failover { ctx, resp: tx }, rx)
                .await
                .map_or_else(IpcResponse::Error, |r| match r {
                    Ok(()) => IpcResponse::Ok,
                    Err(err) => IpcResponse::Error(err.to_string()),
                })
        }
        IpcRequest::ApplyOverride(o) => {
            let (tx, rx) = oneshot::channel();
            send_command(channels, EngineCommand::ApplyOverride { ctx, o, resp: tx }, rx)
                .await
                .map_or_else(IpcResponse::Error, |r| match r {
                    Ok(()) => IpcResponse::Ok,
                    Err(err) => IpcResponse::Error(err.to_string()),
                })
        }
        IpcRequest::ResetOverrides => {
            let (tx, rx) = oneshot::channel();
            send_command(channels, EngineCommand::ResetOverrides { ctx, resp: tx }, rx)
                .await
                .map_or_else(IpcResponse::Error, |r| match r {
                    Ok(()) => IpcResponse::Ok,
                    Err(err) => IpcResponse::Error(err.to_string()),
                })
        }
        IpcRequest::ConfigReload => {
            let (tx, rx) = oneshot::channel();
            send_command(channels, EngineCommand::ConfigReload { ctx, resp: tx }, rx)
                .await
                .map_or_else(IpcResponse::Error, |r| match r {
                    Ok(()) => IpcResponse::Ok,
                    Err(err) => IpcResponse::Error(err.to_string()),
                })
        }
        IpcRequest::ConfigSource(source) => {
            let (tx, rx) = oneshot::channel();
            send_command(
                channels,
                EngineCommand::ConfigSource { ctx, source, resp: tx },
                rx,
            )
            .await
            .map_or_else(IpcResponse::Error, |r| match r {
                Ok(()) => IpcResponse::Ok,
                Err(err) => IpcResponse::Error(err.to_string()),
            })
        }
        IpcRequest::HaUpdate(status) => {
            if !trusted_peer {
                return IpcResponse::Error("HA updates require a trusted caller".to_string());
            }
            let (tx, rx) = oneshot::channel();
            if channels
                .ha
                .send(HaUpdate { status, resp: tx })
                .await
                .is_err()
            {
                return IpcResponse::Error("engine unavailable".to_string());
            }
            match rx.await {
                Ok(instruction) => IpcResponse::HaInstruction {
                    failover: instruction.failover,
                },
                Err(_) => IpcResponse::Error("engine unavailable".to_string()),
            }
        }
        IpcRequest::HealthNotifications(batch) => {
            if !trusted_peer {
                return IpcResponse::Error("health updates require a trusted caller".to_string());
            }
            if channels.health.send(batch).await.is_err() {
                return IpcResponse::Error("engine unavailable".to_string());
            }
            IpcResponse::Ok
        }
    }
}

async fn send_command<T>(
    channels: &EngineChannels,
    command: EngineCommand,
    rx: oneshot::Receiver<T>,
) -> Result<T, String> {
    if channels.commands.send(command).await.is_err() {
        return Err("engine unavailable".to_string());
    }
    rx.await.map_err(|_| "engine unavailable".to_string())
}

/// Client for the engine socket, used by the HA controller and local
/// tooling.
pub struct IpcClient {
    framed: Framed<UnixStream, LengthDelimitedCodec>,
    ctx: AuthContext,
}

impl IpcClient {
    pub async fn connect(path: &Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
            ctx: AuthContext::trusted(),
        })
    }

    pub fn with_context(mut self, ctx: AuthContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub async fn call(&mut self, request: IpcRequest) -> std::io::Result<IpcResponse> {
        let envelope = IpcEnvelope {
            ctx: self.ctx.clone(),
            request,
        };
        let frame = bincode::serialize(&envelope)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        self.framed.send(frame.into()).await?;
        let reply = self
            .framed
            .next()
            .await
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "engine closed"))??;
        bincode::deserialize(&reply)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_core::{HaState, HealthState, HealthStatus};
    use tokio::sync::mpsc;

    /// Stand-in for the coordinator: answers commands with fixed data.
    fn responder() -> EngineChannels {
        let (commands_tx, mut commands_rx) = mpsc::channel(16);
        let (ha_tx, mut ha_rx) = mpsc::channel::<HaUpdate>(16);
        let (health_tx, mut health_rx) = mpsc::channel::<Vec<CheckNotification>>(16);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(command) = commands_rx.recv() => match command {
                        EngineCommand::SnapshotVservers { resp, .. } => {
                            let _ = resp.send(Ok(Vec::new()));
                        }
                        EngineCommand::Failover { resp, .. } => {
                            let _ = resp.send(Err(ballast_core::Error::Ha(
                                "HA is disabled on this node".to_string(),
                            )));
                        }
                        _ => {}
                    },
                    Some(update) = ha_rx.recv() => {
                        let _ = update.resp.send(crate::coordinator::HaUpdateResponse {
                            failover: update.status.state == HaState::Leader,
                        });
                    }
                    Some(_batch) = health_rx.recv() => {}
                    else => break,
                }
            }
        });
        EngineChannels {
            commands: commands_tx,
            ha: ha_tx,
            health: health_tx,
        }
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine");
        let server = IpcServer::bind(&path, responder()).unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.run(shutdown.clone()));

        let mut client = IpcClient::connect(&path).await.unwrap();
        match client.call(IpcRequest::SnapshotVservers).await.unwrap() {
            IpcResponse::Vservers(vservers) => assert!(vservers.is_empty()),
            other => panic!("unexpected response {:?}", other),
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_failover_error_is_typed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine");
        let server = IpcServer::bind(&path, responder()).unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.run(shutdown.clone()));

        let mut client = IpcClient::connect(&path).await.unwrap();
        match client.call(IpcRequest::Failover).await.unwrap() {
            IpcResponse::Error(message) => assert!(message.contains("disabled")),
            other => panic!("unexpected response {:?}", other),
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_ha_update_returns_instruction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine");
        let server = IpcServer::bind(&path, responder()).unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.run(shutdown.clone()));

        let mut client = IpcClient::connect(&path).await.unwrap();
        let response = client
            .call(IpcRequest::HaUpdate(HaStatus::new(HaState::Leader)))
            .await
            .unwrap();
        match response {
            IpcResponse::HaInstruction { failover } => assert!(failover),
            other => panic!("unexpected response {:?}", other),
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_health_notifications_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine");
        let server = IpcServer::bind(&path, responder()).unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.run(shutdown.clone()));

        let mut client = IpcClient::connect(&path).await.unwrap();
        let batch = vec![CheckNotification {
            id: ballast_core::CheckerId(7),
            status: HealthStatus::new(HealthState::Unhealthy),
        }];
        match client.call(IpcRequest::HealthNotifications(batch)).await.unwrap() {
            IpcResponse::Ok => {}
            other => panic!("unexpected response {:?}", other),
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_socket_file_removed_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine");
        let server = IpcServer::bind(&path, responder()).unwrap();
        let shutdown = CancellationToken::new();
        let join = tokio::spawn(server.run(shutdown.clone()));

        assert!(path.exists());
        shutdown.cancel();
        join.await.unwrap();
        assert!(!path.exists());
    }
}
