//! HA controller task
//!
//! Owns the raw socket, the election machine, and both engine-facing
//! channels: periodic status reports over IPC (whose responses may
//! instruct an abdication) and the liveness watch on the engine socket.
//! Socket reads race the election timers in one select loop; timing uses
//! monotonic deadlines armed by election actions.

use ballast_config::NodeConfig;
use ballast_core::{HaState, HaStatus};
use ballast_engine::{IpcClient, IpcRequest, IpcResponse};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::election::{Action, Election, ElectionConfig, ElectionEvent, NodeState};
use crate::packet::{VrrpPacket, VRRP_TTL};
use crate::socket::{ReceivedAdvert, VrrpSocket};
use crate::watcher::EngineWatcher;
use crate::Result;

#[derive(Debug, Clone)]
pub struct HaConfig {
    pub vrid: u8,
    pub priority: u8,
    pub advert_interval: Duration,
    pub preempt: bool,
    pub local_addr: IpAddr,
    pub interface: String,
    pub engine_socket: PathBuf,
    /// Cadence of status reports to the engine
    pub status_interval: Duration,
}

impl From<&NodeConfig> for HaConfig {
    fn from(node: &NodeConfig) -> Self {
        Self {
            vrid: node.vrid,
            priority: node.priority,
            advert_interval: node.advert_interval(),
            preempt: node.preempt,
            local_addr: node.address,
            interface: node.lb_interface.clone(),
            engine_socket: node.engine_socket.clone(),
            status_interval: Duration::from_secs(1),
        }
    }
}

impl HaConfig {
    fn election_config(&self) -> ElectionConfig {
        ElectionConfig {
            vrid: self.vrid,
            priority: self.priority,
            advert_interval: self.advert_interval,
            preempt: self.preempt,
            local_addr: self.local_addr,
        }
    }

    fn advert_interval_cs(&self) -> u16 {
        (self.advert_interval.as_millis() / 10).min(0x0fff) as u16
    }
}

/// Turn a received datagram into an election event, or discard it.
/// Discards: decremented TTL, our own loopbacked advertisements, foreign
/// vrids, and anything that fails checksum or structural validation.
fn classify_advert(
    config: &HaConfig,
    dst: IpAddr,
    advert: &ReceivedAdvert,
) -> Option<ElectionEvent> {
    if advert.ttl != VRRP_TTL {
        debug!(ttl = advert.ttl, src = %advert.src, "Discarding advert with decremented TTL");
        return None;
    }
    if advert.src == config.local_addr {
        return None;
    }
    let packet = match VrrpPacket::decode(&advert.payload, advert.src, dst) {
        Ok(packet) => packet,
        Err(err) => {
            debug!(%err, src = %advert.src, "Discarding malformed advert");
            return None;
        }
    };
    if packet.vrid != config.vrid {
        debug!(vrid = packet.vrid, "Discarding advert for foreign vrid");
        return None;
    }
    Some(ElectionEvent::Advert {
        priority: packet.priority,
        src: advert.src,
    })
}

fn ha_state(state: NodeState) -> HaState {
    match state {
        NodeState::Init => HaState::Unknown,
        NodeState::Backup => HaState::Follower,
        NodeState::Leader => HaState::Leader,
        NodeState::Shutdown => HaState::Disabled,
    }
}

pub struct HaController {
    config: HaConfig,
    election: Election,
    socket: VrrpSocket,
    watcher: EngineWatcher,
    status: HaStatus,
    advert_deadline: Option<Instant>,
    master_down_deadline: Option<Instant>,
}

impl HaController {
    pub fn new(config: HaConfig) -> Result<Self> {
        let socket = VrrpSocket::open(config.local_addr, &config.interface)?;
        let watcher = EngineWatcher::watch(&config.engine_socket)?;
        let election = Election::new(config.election_config());
        Ok(Self {
            config,
            election,
            socket,
            watcher,
            status: HaStatus::new(HaState::Unknown),
            advert_deadline: None,
            master_down_deadline: None,
        })
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        info!(
            vrid = self.config.vrid,
            priority = self.config.priority,
            interface = %self.config.interface,
            "HA controller starting"
        );
        let actions = self.election.handle(ElectionEvent::Startup);
        self.execute(actions).await?;

        let mut status_tick = tokio::time::interval(self.config.status_interval);
        let mut engine: Option<IpcClient> = None;
        let far_future = Duration::from_secs(3600);

        loop {
            let advert_at = self.advert_deadline;
            let master_down_at = self.master_down_deadline;
            let stop = tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    let actions = self.election.handle(ElectionEvent::Shutdown);
                    self.execute(actions).await?
                }
                _ = self.watcher.removed() => {
                    warn!("Engine socket disappeared; abdicating");
                    let actions = self.election.handle(ElectionEvent::Shutdown);
                    self.execute(actions).await?
                }
                received = self.socket.recv() => {
                    match received {
                        Ok(advert) => {
                            let dst = self.socket.destination();
                            match classify_advert(&self.config, dst, &advert) {
                                Some(event) => {
                                    let actions = self.election.handle(event);
                                    self.execute(actions).await?
                                }
                                None => false,
                            }
                        }
                        Err(err) => {
                            warn!(%err, "VRRP receive failed");
                            false
                        }
                    }
                }
                _ = tokio::time::sleep_until(master_down_at.unwrap_or_else(|| Instant::now() + far_future)),
                    if master_down_at.is_some() =>
                {
                    self.master_down_deadline = None;
                    let actions = self.election.handle(ElectionEvent::MasterDownExpired);
                    self.execute(actions).await?
                }
                _ = tokio::time::sleep_until(advert_at.unwrap_or_else(|| Instant::now() + far_future)),
                    if advert_at.is_some() =>
                {
                    self.advert_deadline = None;
                    let actions = self.election.handle(ElectionEvent::AdvertTimerExpired);
                    self.execute(actions).await?
                }
                _ = status_tick.tick() => {
                    self.report_status(&mut engine).await
                }
            };
            if stop {
                break;
            }
        }
        info!("HA controller stopped");
        Ok(())
    }

    /// Execute election actions; returns true when the machine stopped.
    async fn execute(&mut self, actions: Vec<Action>) -> Result<bool> {
        let mut stop = false;
        for action in actions {
            match action {
                Action::SendAdvert(priority) => {
                    let packet = VrrpPacket::new(
                        self.config.vrid,
                        priority,
                        self.config.advert_interval_cs(),
                    );
                    let wire = packet.encode(self.config.local_addr, self.socket.destination());
                    if let Err(err) = self.socket.send(&wire).await {
                        warn!(%err, "Failed to send advertisement");
                    }
                }
                Action::ArmMasterDown(after) => {
                    self.master_down_deadline = Some(Instant::now() + after);
                    self.advert_deadline = None;
                }
                Action::ArmAdvertTimer => {
                    self.advert_deadline = Some(Instant::now() + self.config.advert_interval);
                    self.master_down_deadline = None;
                }
                Action::Stop => {
                    self.advert_deadline = None;
                    self.master_down_deadline = None;
                    stop = true;
                }
            }
        }
        self.status.transition(ha_state(self.election.state()));
        Ok(stop)
    }

    /// Report status to the engine; an instructed failover abdicates.
    /// Engine unavailability is tolerated: the liveness watcher is the
    /// authority on engine death.
    async fn report_status(&mut self, engine: &mut Option<IpcClient>) -> bool {
        if engine.is_none() {
            match IpcClient::connect(&self.config.engine_socket).await {
                Ok(client) => *engine = Some(client),
                Err(err) => {
                    debug!(%err, "Engine IPC unavailable");
                    return false;
                }
            }
        }
        let Some(client) = engine.as_mut() else {
            return false;
        };
        match client.call(IpcRequest::HaUpdate(self.status.clone())).await {
            Ok(IpcResponse::HaInstruction { failover: true }) => {
                info!("Engine requested failover");
                let actions = self.election.handle(ElectionEvent::Abdicate);
                match self.execute(actions).await {
                    Ok(stop) => stop,
                    Err(_) => false,
                }
            }
            Ok(_) => false,
            Err(err) => {
                debug!(%err, "Engine status report failed");
                *engine = None;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HaConfig {
        HaConfig {
            vrid: 60,
            priority: 200,
            advert_interval: Duration::from_secs(1),
            preempt: false,
            local_addr: "192.0.2.10".parse().unwrap(),
            interface: "eth1".to_string(),
            engine_socket: "/var/run/ballast/engine".into(),
            status_interval: Duration::from_secs(1),
        }
    }

    fn advert(config: &HaConfig, priority: u8, src: IpAddr, ttl: u8) -> ReceivedAdvert {
        let dst = VrrpSocket::multicast_addr(config.local_addr);
        let packet = VrrpPacket::new(config.vrid, priority, 100);
        ReceivedAdvert {
            payload: packet.encode(src, dst).to_vec(),
            src,
            ttl,
        }
    }

    #[test]
    fn test_decremented_ttl_is_discarded() {
        let config = config();
        let dst = VrrpSocket::multicast_addr(config.local_addr);
        let src: IpAddr = "192.0.2.11".parse().unwrap();
        assert!(classify_advert(&config, dst, &advert(&config, 100, src, 254)).is_none());
        assert!(classify_advert(&config, dst, &advert(&config, 100, src, 255)).is_some());
    }

    #[test]
    fn test_own_adverts_are_ignored() {
        let config = config();
        let dst = VrrpSocket::multicast_addr(config.local_addr);
        let own = advert(&config, 200, config.local_addr, 255);
        assert!(classify_advert(&config, dst, &own).is_none());
    }

    #[test]
    fn test_foreign_vrid_is_ignored() {
        let config = config();
        let dst = VrrpSocket::multicast_addr(config.local_addr);
        let src: IpAddr = "192.0.2.11".parse().unwrap();
        let mut foreign = config.clone();
        foreign.vrid = 61;
        let advert = advert(&foreign, 100, src, 255);
        assert!(classify_advert(&config, dst, &advert).is_none());
    }

    #[test]
    fn test_classified_advert_carries_priority_and_source() {
        let config = config();
        let dst = VrrpSocket::multicast_addr(config.local_addr);
        let src: IpAddr = "192.0.2.11".parse().unwrap();
        match classify_advert(&config, dst, &advert(&config, 150, src, 255)) {
            Some(ElectionEvent::Advert { priority, src: from }) => {
                assert_eq!(priority, 150);
                assert_eq!(from, src);
            }
            other => panic!("unexpected classification {:?}", other),
        }
    }

    #[test]
    fn test_advert_interval_centiseconds() {
        let config = config();
        assert_eq!(config.advert_interval_cs(), 100);
    }

    #[test]
    fn test_node_config_mapping() {
        let node = NodeConfig {
            name: "lb-a".to_string(),
            address: "192.0.2.10".parse().unwrap(),
            peer_address: "192.0.2.11".parse().unwrap(),
            lb_interface: "eth1".to_string(),
            vrid: 60,
            priority: 200,
            preempt: true,
            advert_interval_ms: 500,
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
        let config = HaConfig::from(&node);
        assert_eq!(config.advert_interval, Duration::from_millis(500));
        assert_eq!(config.advert_interval_cs(), 50);
        assert!(config.preempt);
    }
}
