//! VRRPv3 election state machine
//!
//! Pure state logic, driven by the controller: events in, actions out.
//! Timing decisions are expressed as actions so the controller owns the
//! actual timers and the machine stays deterministic under test.
//!
//! States follow RFC 5798: a node initializes into backup (or straight
//! to leader at priority 255), promotes itself when the master-down
//! timer expires, and yields to a higher-priority advertisement. A
//! priority-zero advertisement is an abdication: the backup shortens its
//! master-down timer to the skew time instead of waiting three full
//! advertisement intervals.

use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};

/// Election states. `Shutdown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Init,
    Backup,
    Leader,
    Shutdown,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Init => write!(f, "init"),
            NodeState::Backup => write!(f, "backup"),
            NodeState::Leader => write!(f, "leader"),
            NodeState::Shutdown => write!(f, "shutdown"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub vrid: u8,
    pub priority: u8,
    pub advert_interval: Duration,
    /// Whether a higher-priority backup preempts a live leader
    pub preempt: bool,
    /// Local address, used for the equal-priority tie-break
    pub local_addr: IpAddr,
}

impl ElectionConfig {
    /// `((256 - priority) × advert_interval) / 256`, favoring
    /// higher-priority backups.
    pub fn skew_time(&self) -> Duration {
        self.advert_interval * (256 - self.priority as u32) / 256
    }

    /// `3 × advert_interval + skew_time`
    pub fn master_down_interval(&self) -> Duration {
        self.advert_interval * 3 + self.skew_time()
    }
}

/// Inputs to the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionEvent {
    Startup,
    /// A validated advertisement (vrid matched, TTL 255, checksum good)
    Advert { priority: u8, src: IpAddr },
    MasterDownExpired,
    AdvertTimerExpired,
    /// Abdicate but keep participating (operator-requested failover)
    Abdicate,
    /// Abdicate and stop (engine death or process shutdown)
    Shutdown,
}

/// Outputs for the controller to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Transmit an advertisement carrying this priority
    SendAdvert(u8),
    /// (Re)arm the master-down timer with this duration
    ArmMasterDown(Duration),
    /// Arm the periodic advertisement timer
    ArmAdvertTimer,
    /// Cancel all timers and exit
    Stop,
}

pub struct Election {
    config: ElectionConfig,
    state: NodeState,
}

impl Election {
    pub fn new(config: ElectionConfig) -> Self {
        Self {
            config,
            state: NodeState::Init,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    fn transition(&mut self, state: NodeState) {
        if self.state != state {
            info!(from = %self.state, to = %state, "VRRP state transition");
            self.state = state;
        }
    }

    pub fn handle(&mut self, event: ElectionEvent) -> Vec<Action> {
        match (self.state, event) {
            (NodeState::Init, ElectionEvent::Startup) => {
                if self.config.priority == 255 {
                    self.transition(NodeState::Leader);
                    vec![Action::SendAdvert(255), Action::ArmAdvertTimer]
                } else {
                    self.transition(NodeState::Backup);
                    vec![Action::ArmMasterDown(self.config.master_down_interval())]
                }
            }

            (NodeState::Backup, ElectionEvent::Advert { priority, .. }) => {
                if priority == 0 {
                    // The leader abdicated; take over after the skew only.
                    vec![Action::ArmMasterDown(self.config.skew_time())]
                } else if !self.config.preempt || priority >= self.config.priority {
                    vec![Action::ArmMasterDown(self.config.master_down_interval())]
                } else {
                    // Preempting: let the timer run out over the lower-
                    // priority leader.
                    debug!(priority, own = self.config.priority, "Ignoring lower-priority advert");
                    vec![]
                }
            }
            (NodeState::Backup, ElectionEvent::MasterDownExpired) => {
                self.transition(NodeState::Leader);
                vec![
                    Action::SendAdvert(self.config.priority),
                    Action::ArmAdvertTimer,
                ]
            }

            (NodeState::Leader, ElectionEvent::AdvertTimerExpired) => {
                vec![
                    Action::SendAdvert(self.config.priority),
                    Action::ArmAdvertTimer,
                ]
            }
            (NodeState::Leader, ElectionEvent::Advert { priority, src }) => {
                if priority == 0 {
                    // A stray abdication from the previous leader;
                    // reassert immediately.
                    return vec![
                        Action::SendAdvert(self.config.priority),
                        Action::ArmAdvertTimer,
                    ];
                }
                let yields = priority > self.config.priority
                    || (priority == self.config.priority && src > self.config.local_addr);
                if yields {
                    self.transition(NodeState::Backup);
                    vec![Action::ArmMasterDown(self.config.master_down_interval())]
                } else {
                    vec![]
                }
            }

            (NodeState::Backup | NodeState::Leader, ElectionEvent::Abdicate) => {
                let was_leader = self.state == NodeState::Leader;
                self.transition(NodeState::Backup);
                let mut actions = Vec::new();
                if was_leader {
                    actions.push(Action::SendAdvert(0));
                }
                actions.push(Action::ArmMasterDown(self.config.master_down_interval()));
                actions
            }

            (_, ElectionEvent::Shutdown) => {
                let was_leader = self.state == NodeState::Leader;
                self.transition(NodeState::Shutdown);
                if was_leader {
                    vec![Action::SendAdvert(0), Action::Stop]
                } else {
                    vec![Action::Stop]
                }
            }

            (state, event) => {
                debug!(%state, ?event, "Ignoring event in current state");
                vec![]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(priority: u8, preempt: bool) -> ElectionConfig {
        ElectionConfig {
            vrid: 60,
            priority,
            advert_interval: Duration::from_secs(1),
            preempt,
            local_addr: "192.0.2.10".parse().unwrap(),
        }
    }

    fn peer() -> IpAddr {
        "192.0.2.11".parse().unwrap()
    }

    #[test]
    fn test_timing_arithmetic() {
        let config = config(200, false);
        // skew = (256 - 200) * 1s / 256 = 218.75ms
        assert_eq!(config.skew_time(), Duration::from_millis(218) + Duration::from_micros(750));
        assert_eq!(
            config.master_down_interval(),
            Duration::from_secs(3) + config.skew_time()
        );
    }

    #[test]
    fn test_startup_enters_backup_with_master_down_timer() {
        let mut election = Election::new(config(100, false));
        let actions = election.handle(ElectionEvent::Startup);
        assert_eq!(election.state(), NodeState::Backup);
        assert_eq!(
            actions,
            vec![Action::ArmMasterDown(election.config().master_down_interval())]
        );
    }

    #[test]
    fn test_master_down_expiry_promotes() {
        let mut election = Election::new(config(100, false));
        election.handle(ElectionEvent::Startup);
        let actions = election.handle(ElectionEvent::MasterDownExpired);
        assert_eq!(election.state(), NodeState::Leader);
        assert_eq!(actions[0], Action::SendAdvert(100));
        assert_eq!(actions[1], Action::ArmAdvertTimer);
    }

    #[test]
    fn test_priority_zero_shortens_master_down_to_skew() {
        let mut election = Election::new(config(100, false));
        election.handle(ElectionEvent::Startup);
        let actions = election.handle(ElectionEvent::Advert {
            priority: 0,
            src: peer(),
        });
        assert_eq!(
            actions,
            vec![Action::ArmMasterDown(election.config().skew_time())]
        );
        // The shortened timer fires and the backup promotes.
        election.handle(ElectionEvent::MasterDownExpired);
        assert_eq!(election.state(), NodeState::Leader);
    }

    #[test]
    fn test_leader_abdication_goes_backup_immediately() {
        let mut election = Election::new(config(200, false));
        election.handle(ElectionEvent::Startup);
        election.handle(ElectionEvent::MasterDownExpired);
        assert_eq!(election.state(), NodeState::Leader);

        let actions = election.handle(ElectionEvent::Abdicate);
        assert_eq!(election.state(), NodeState::Backup);
        assert_eq!(actions[0], Action::SendAdvert(0));
    }

    #[test]
    fn test_higher_priority_advert_demotes_leader() {
        let mut election = Election::new(config(100, false));
        election.handle(ElectionEvent::Startup);
        election.handle(ElectionEvent::MasterDownExpired);

        let actions = election.handle(ElectionEvent::Advert {
            priority: 200,
            src: peer(),
        });
        assert_eq!(election.state(), NodeState::Backup);
        assert_eq!(
            actions,
            vec![Action::ArmMasterDown(election.config().master_down_interval())]
        );
    }

    #[test]
    fn test_equal_priority_tie_break_prefers_higher_ip() {
        // Both nodes at priority 100; the peer has the higher address, so
        // this node yields when both believe they lead.
        let mut election = Election::new(config(100, false));
        election.handle(ElectionEvent::Startup);
        election.handle(ElectionEvent::MasterDownExpired);
        assert_eq!(election.state(), NodeState::Leader);

        election.handle(ElectionEvent::Advert {
            priority: 100,
            src: peer(),
        });
        assert_eq!(election.state(), NodeState::Backup);

        // The mirror case: a peer with a lower address does not displace
        // this leader.
        let mut election = Election::new(ElectionConfig {
            local_addr: peer(),
            ..config(100, false)
        });
        election.handle(ElectionEvent::Startup);
        election.handle(ElectionEvent::MasterDownExpired);
        election.handle(ElectionEvent::Advert {
            priority: 100,
            src: "192.0.2.10".parse().unwrap(),
        });
        assert_eq!(election.state(), NodeState::Leader);
    }

    #[test]
    fn test_preempting_backup_ignores_lower_priority_leader() {
        let mut election = Election::new(config(200, true));
        election.handle(ElectionEvent::Startup);
        let actions = election.handle(ElectionEvent::Advert {
            priority: 100,
            src: peer(),
        });
        // No timer reset: the master-down timer keeps running so the
        // higher-priority node takes over.
        assert!(actions.is_empty());

        // Without preemption the same advert resets the timer.
        let mut election = Election::new(config(200, false));
        election.handle(ElectionEvent::Startup);
        let actions = election.handle(ElectionEvent::Advert {
            priority: 100,
            src: peer(),
        });
        assert_eq!(
            actions,
            vec![Action::ArmMasterDown(election.config().master_down_interval())]
        );
    }

    #[test]
    fn test_shutdown_from_leader_sends_priority_zero() {
        let mut election = Election::new(config(200, false));
        election.handle(ElectionEvent::Startup);
        election.handle(ElectionEvent::MasterDownExpired);
        let actions = election.handle(ElectionEvent::Shutdown);
        assert_eq!(actions, vec![Action::SendAdvert(0), Action::Stop]);
        assert_eq!(election.state(), NodeState::Shutdown);
    }

    #[test]
    fn test_priority_255_starts_as_leader() {
        let mut election = Election::new(config(255, false));
        let actions = election.handle(ElectionEvent::Startup);
        assert_eq!(election.state(), NodeState::Leader);
        assert_eq!(actions[0], Action::SendAdvert(255));
    }
}
