//! Sync server (leader side)
//!
//! Accepts long-poll sessions from the follower over mutual TLS.
//! Connections are only accepted from the configured peer address or
//! loopback, and only while the engine has this node leading; losing
//! leadership drops every session. Heartbeats keep idle sessions live
//! and a reaper collects sessions whose follower stopped polling.

use ballast_config::NodeConfig;
use ballast_core::SyncNote;
use futures::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify, RwLock};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::SessionStore;
use crate::tls::TlsConfig;
use crate::{Result, SyncRequest, SyncResponse};

#[derive(Debug, Clone)]
pub struct SyncServerConfig {
    pub bind: SocketAddr,
    pub peer_addr: IpAddr,
    pub tls: TlsConfig,
    pub queue_limit: usize,
    pub heartbeat_interval: Duration,
    pub poll_timeout: Duration,
    pub session_deadtime: Duration,
}

impl SyncServerConfig {
    pub fn from_node(node: &NodeConfig) -> Self {
        let poll_timeout = Duration::from_secs(30);
        Self {
            bind: SocketAddr::new(node.address, node.sync_port),
            peer_addr: node.peer_address,
            tls: TlsConfig::new(&node.ca_cert, &node.node_cert, &node.node_key),
            queue_limit: 100,
            heartbeat_interval: Duration::from_secs(5),
            poll_timeout,
            session_deadtime: poll_timeout * 2,
        }
    }
}

/// Source-address allowlist: the peer or loopback, nothing else.
fn peer_allowed(source: IpAddr, peer: IpAddr) -> bool {
    source == peer || source.is_loopback()
}

pub struct SyncServer {
    config: SyncServerConfig,
}

impl SyncServer {
    pub fn new(config: SyncServerConfig) -> Self {
        Self { config }
    }

    pub async fn run(
        self,
        mut server_enabled: watch::Receiver<bool>,
        mut notes: tokio::sync::mpsc::Receiver<SyncNote>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let acceptor = TlsAcceptor::from(self.config.tls.server_config()?);
        let listener = TcpListener::bind(self.config.bind).await?;
        info!(bind = %self.config.bind, "Sync server listening");

        let store = Arc::new(RwLock::new(SessionStore::new(self.config.queue_limit)));
        let notify = Arc::new(Notify::new());
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let mut reaper = tokio::time::interval(self.config.session_deadtime / 2);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let Ok((stream, addr)) = accepted else { continue };
                    if !*server_enabled.borrow() {
                        debug!(peer = %addr, "Rejecting sync session while not leading");
                        continue;
                    }
                    if !peer_allowed(addr.ip(), self.config.peer_addr) {
                        warn!(peer = %addr, "Rejecting sync session from unknown source");
                        continue;
                    }
                    let acceptor = acceptor.clone();
                    let store = store.clone();
                    let notify = notify.clone();
                    let enabled = server_enabled.clone();
                    let poll_timeout = self.config.poll_timeout;
                    let queue_limit = self.config.queue_limit;
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls) => {
                                serve_session(tls, store, notify, enabled, poll_timeout, queue_limit)
                                    .await;
                            }
                            Err(err) => {
                                warn!(peer = %addr, %err, "Sync TLS handshake failed");
                            }
                        }
                    });
                }
                note = notes.recv() => {
                    let Some(note) = note else { break };
                    if *server_enabled.borrow() {
                        store.write().await.push(note);
                        notify.notify_waiters();
                    }
                }
                _ = heartbeat.tick() => {
                    if *server_enabled.borrow() {
                        store.write().await.push(ballast_core::SyncNote::Heartbeat);
                        notify.notify_waiters();
                    }
                }
                _ = reaper.tick() => {
                    store.write().await.reap(self.config.session_deadtime);
                }
                changed = server_enabled.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !*server_enabled.borrow() {
                        store.write().await.clear();
                    }
                }
                _ = shutdown.cancelled() => {
                    break;
                }
            }
        }
        info!("Sync server stopped");
        Ok(())
    }
}

/// One follower connection: answer polls until the peer goes away or we
/// stop leading.
async fn serve_session(
    stream: tokio_rustls::server::TlsStream<TcpStream>,
    store: Arc<RwLock<SessionStore>>,
    notify: Arc<Notify>,
    enabled: watch::Receiver<bool>,
    poll_timeout: Duration,
    queue_limit: usize,
) {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    while let Some(Ok(frame)) = framed.next().await {
        let request: SyncRequest = match bincode::deserialize(&frame) {
            Ok(request) => request,
            Err(err) => {
                debug!(%err, "Dropping undecodable sync frame");
                return;
            }
        };
        let SyncRequest::Poll { session, since } = request;

        if !*enabled.borrow() {
            let reply = SyncResponse::Error("node is no longer leading".to_string());
            let _ = send(&mut framed, &reply).await;
            return;
        }

        let mut outcome = store.write().await.poll(session, since);
        if outcome.notes.is_empty() {
            // Long poll: hold until a note lands or the window expires.
            let waited = tokio::time::timeout(poll_timeout, notify.notified()).await;
            let _ = waited;
            outcome = store.write().await.poll(session, outcome.next);
        }
        if outcome.notes.len() > queue_limit {
            outcome.notes.truncate(queue_limit);
        }
        let reply = SyncResponse::Notes {
            notes: outcome.notes,
            next: outcome.next,
        };
        if send(&mut framed, &reply).await.is_err() {
            return;
        }
    }
}

async fn send(
    framed: &mut Framed<tokio_rustls::server::TlsStream<TcpStream>, LengthDelimitedCodec>,
    response: &SyncResponse,
) -> Result<()> {
    let frame = bincode::serialize(response)?;
    framed.send(frame.into()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_allowlist() {
        let peer: IpAddr = "192.0.2.11".parse().unwrap();
        assert!(peer_allowed(peer, peer));
        assert!(peer_allowed("127.0.0.1".parse().unwrap(), peer));
        assert!(peer_allowed("::1".parse().unwrap(), peer));
        assert!(!peer_allowed("192.0.2.99".parse().unwrap(), peer));
    }

    #[test]
    fn test_config_defaults_from_node() {
        let node = NodeConfig {
            name: "lb-a".to_string(),
            address: "192.0.2.10".parse().unwrap(),
            peer_address: "192.0.2.11".parse().unwrap(),
            lb_interface: "eth1".to_string(),
            vrid: 60,
            priority: 200,
            preempt: false,
            advert_interval_ms: 1000,
            sync_port: 10258,
            ca_cert: "/etc/ballast/ca.pem".into(),
            node_cert: "/etc/ballast/node.pem".into(),
            node_key: "/etc/ballast/node.key".into(),
            engine_socket: "/var/run/ballast/engine".into(),
            ncc_socket: "/var/run/ballast/ncc".into(),
            fwmark_base: 3000,
            fwmark_size: 100,
            access: Default::default(),
        };
        let config = SyncServerConfig::from_node(&node);
        assert_eq!(config.bind.port(), 10258);
        assert_eq!(config.queue_limit, 100);
        assert_eq!(config.session_deadtime, config.poll_timeout * 2);
    }
}
