use log::{info, warn};

use crate::{config::TimingConfig, types::Liveness};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub network_up: bool,
    pub bus_up: bool,
}

impl LinkStatus {
    pub fn connected(&self) -> bool {
        self.network_up && self.bus_up
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// Sustained loss: say goodbye if the session still accepts writes, then
    /// power the radio down.
    WentOffline { bus_writable: bool },
    /// Link restored; current state must be re-asserted to subscribers.
    CameOnline,
    /// Backoff elapsed while offline; try the radio again.
    PowerUpRadio,
    /// A reconnect attempt ran out of time.
    PowerDownRadio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Radio {
    Connected,
    /// Powered and waiting for the transport; gives up at the deadline.
    Reconnecting { give_up_at_ms: u64 },
    Off { retry_at_ms: u64 },
}

/// Edge-triggered ONLINE/OFFLINE tracker with radio power management.
///
/// A link must stay down for `offline_grace_ms` before the device is declared
/// offline, so one missed check never powers the radio down.
#[derive(Debug, Clone)]
pub struct ConnectivitySupervisor {
    liveness: Liveness,
    radio: Radio,
    down_since_ms: Option<u64>,
    next_backoff_ms: u64,
    grace_ms: u64,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
}

impl ConnectivitySupervisor {
    /// Starts offline with the radio powered, waiting for the first session.
    pub fn new(timing: &TimingConfig, now_ms: u64) -> Self {
        Self {
            liveness: Liveness::Offline,
            radio: Radio::Reconnecting {
                give_up_at_ms: now_ms.saturating_add(timing.offline_grace_ms),
            },
            down_since_ms: None,
            next_backoff_ms: timing.reconnect_backoff_ms,
            grace_ms: timing.offline_grace_ms,
            backoff_base_ms: timing.reconnect_backoff_ms,
            backoff_max_ms: timing.reconnect_backoff_max_ms.max(timing.reconnect_backoff_ms),
        }
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    pub fn is_online(&self) -> bool {
        self.liveness == Liveness::Online
    }

    pub fn radio_powered(&self) -> bool {
        !matches!(self.radio, Radio::Off { .. })
    }

    pub fn observe(&mut self, link: LinkStatus, now_ms: u64) -> Option<ConnectivityEvent> {
        match self.liveness {
            Liveness::Online => self.observe_online(link, now_ms),
            Liveness::Offline => self.observe_offline(link, now_ms),
        }
    }

    fn observe_online(&mut self, link: LinkStatus, now_ms: u64) -> Option<ConnectivityEvent> {
        if link.connected() {
            self.down_since_ms = None;
            return None;
        }

        let since = *self.down_since_ms.get_or_insert(now_ms);
        if now_ms.saturating_sub(since) < self.grace_ms {
            return None;
        }

        warn!(
            "link down for {}s (network={}, bus={}); going offline",
            now_ms.saturating_sub(since) / 1000,
            link.network_up,
            link.bus_up
        );
        self.liveness = Liveness::Offline;
        self.down_since_ms = None;
        self.next_backoff_ms = self.backoff_base_ms;
        let wait_ms = self.take_backoff();
        self.radio = Radio::Off {
            retry_at_ms: now_ms.saturating_add(wait_ms),
        };
        Some(ConnectivityEvent::WentOffline {
            bus_writable: link.bus_up,
        })
    }

    fn observe_offline(&mut self, link: LinkStatus, now_ms: u64) -> Option<ConnectivityEvent> {
        if link.connected() && self.radio_powered() {
            info!("link restored; back online");
            self.liveness = Liveness::Online;
            self.radio = Radio::Connected;
            self.next_backoff_ms = self.backoff_base_ms;
            return Some(ConnectivityEvent::CameOnline);
        }

        match self.radio {
            Radio::Off { retry_at_ms } if now_ms >= retry_at_ms => {
                info!("reconnect backoff elapsed; powering radio up");
                self.radio = Radio::Reconnecting {
                    give_up_at_ms: now_ms.saturating_add(self.grace_ms),
                };
                Some(ConnectivityEvent::PowerUpRadio)
            }
            Radio::Reconnecting { give_up_at_ms } if now_ms >= give_up_at_ms => {
                let wait_ms = self.take_backoff();
                self.radio = Radio::Off {
                    retry_at_ms: now_ms.saturating_add(wait_ms),
                };
                warn!(
                    "reconnect attempt failed; radio off, next attempt in {}s",
                    wait_ms / 1000
                );
                Some(ConnectivityEvent::PowerDownRadio)
            }
            _ => None,
        }
    }

    fn take_backoff(&mut self) -> u64 {
        let wait_ms = self.next_backoff_ms;
        self.next_backoff_ms = wait_ms.saturating_mul(2).min(self.backoff_max_ms);
        wait_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UP: LinkStatus = LinkStatus {
        network_up: true,
        bus_up: true,
    };
    const BUS_DOWN: LinkStatus = LinkStatus {
        network_up: true,
        bus_up: false,
    };
    const ALL_DOWN: LinkStatus = LinkStatus {
        network_up: false,
        bus_up: false,
    };

    fn online_supervisor() -> ConnectivitySupervisor {
        let mut supervisor = ConnectivitySupervisor::new(&TimingConfig::default(), 0);
        assert_eq!(
            supervisor.observe(UP, 100),
            Some(ConnectivityEvent::CameOnline)
        );
        supervisor
    }

    #[test]
    fn first_session_comes_online() {
        let supervisor = online_supervisor();
        assert!(supervisor.is_online());
        assert!(supervisor.radio_powered());
    }

    #[test]
    fn stable_online_is_a_no_op() {
        let mut supervisor = online_supervisor();
        for now in (1_000..100_000).step_by(1_000) {
            assert_eq!(supervisor.observe(UP, now), None);
        }
    }

    #[test]
    fn single_missed_check_does_not_go_offline() {
        let mut supervisor = online_supervisor();
        assert_eq!(supervisor.observe(BUS_DOWN, 1_000), None);
        assert_eq!(supervisor.observe(UP, 1_250), None);
        assert_eq!(supervisor.observe(BUS_DOWN, 40_000), None);
        assert!(supervisor.is_online());
    }

    #[test]
    fn sustained_loss_goes_offline_once() {
        let mut supervisor = online_supervisor();
        assert_eq!(supervisor.observe(ALL_DOWN, 1_000), None);
        assert_eq!(
            supervisor.observe(ALL_DOWN, 31_000),
            Some(ConnectivityEvent::WentOffline {
                bus_writable: false
            })
        );
        assert!(!supervisor.radio_powered());
        assert_eq!(supervisor.observe(ALL_DOWN, 31_250), None);
    }

    #[test]
    fn network_loss_with_live_session_says_goodbye() {
        let mut supervisor = online_supervisor();
        let link = LinkStatus {
            network_up: false,
            bus_up: true,
        };
        supervisor.observe(link, 1_000);
        assert_eq!(
            supervisor.observe(link, 31_000),
            Some(ConnectivityEvent::WentOffline { bus_writable: true })
        );
    }

    #[test]
    fn offline_retries_with_doubling_backoff() {
        let mut supervisor = online_supervisor();
        supervisor.observe(ALL_DOWN, 1_000);
        supervisor.observe(ALL_DOWN, 31_000);

        assert_eq!(supervisor.observe(ALL_DOWN, 60_000), None);
        assert_eq!(
            supervisor.observe(ALL_DOWN, 61_000),
            Some(ConnectivityEvent::PowerUpRadio)
        );
        assert_eq!(
            supervisor.observe(ALL_DOWN, 91_000),
            Some(ConnectivityEvent::PowerDownRadio)
        );
        // Second wait is twice as long as the first.
        assert_eq!(supervisor.observe(ALL_DOWN, 150_999), None);
        assert_eq!(
            supervisor.observe(ALL_DOWN, 151_000),
            Some(ConnectivityEvent::PowerUpRadio)
        );
    }

    #[test]
    fn reconnect_after_retry_comes_online() {
        let mut supervisor = online_supervisor();
        supervisor.observe(ALL_DOWN, 1_000);
        supervisor.observe(ALL_DOWN, 31_000);
        supervisor.observe(ALL_DOWN, 61_000);

        assert_eq!(
            supervisor.observe(UP, 62_000),
            Some(ConnectivityEvent::CameOnline)
        );
        assert!(supervisor.is_online());
    }

    #[test]
    fn stale_connected_reading_while_radio_off_is_ignored() {
        let mut supervisor = online_supervisor();
        supervisor.observe(ALL_DOWN, 1_000);
        supervisor.observe(ALL_DOWN, 31_000);

        assert_eq!(supervisor.observe(UP, 32_000), None);
        assert!(!supervisor.is_online());
    }

    #[test]
    fn backoff_is_capped() {
        let timing = TimingConfig {
            reconnect_backoff_ms: 1_000,
            reconnect_backoff_max_ms: 3_000,
            offline_grace_ms: 100,
            ..TimingConfig::default()
        };
        let mut supervisor = ConnectivitySupervisor::new(&timing, 0);
        let mut now = 0;
        let mut waits = Vec::new();
        let mut radio_off_at = None;

        while waits.len() < 4 {
            now += 50;
            match supervisor.observe(ALL_DOWN, now) {
                Some(ConnectivityEvent::PowerDownRadio) => radio_off_at = Some(now),
                Some(ConnectivityEvent::PowerUpRadio) => {
                    if let Some(off) = radio_off_at.take() {
                        waits.push(now - off);
                    }
                }
                _ => {}
            }
        }

        assert_eq!(waits, vec![1_000, 2_000, 3_000, 3_000]);
    }
}
