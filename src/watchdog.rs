//! Liveness watchdog for a terminal channel.
//!
//! Decides when the remote session behind a channel should be reopened.
//! The watchdog holds no timers itself: it tells its owner to arm or disarm
//! the liveness timer and reports timer expiry back through
//! [`Watchdog::on_liveness_timeout`].

use tracing::{debug, info, warn};

use crate::transport::ConnectionState;

/// What triggered a reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySignal {
    RetriesExhausted,
    ConnectionLost,
    PtyClosed,
    LivenessTimeout,
    Manual,
}

impl std::fmt::Display for RecoverySignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            RecoverySignal::RetriesExhausted => "reconnect attempts exhausted",
            RecoverySignal::ConnectionLost => "connection lost",
            RecoverySignal::PtyClosed => "remote process exited",
            RecoverySignal::LivenessTimeout => "no data after reconnect",
            RecoverySignal::Manual => "retry requested",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    ArmLiveness,
    DisarmLiveness,
    Reopen(RecoverySignal),
}

#[derive(Debug, Clone, Default)]
pub struct Watchdog {
    connection: Option<ConnectionState>,
    ever_connected: bool,
    liveness_armed: bool,
    reopen_latched: bool,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything about the previous session.  The reopen latch is
    /// left alone: only a fresh `connected` releases it.
    pub fn reset_session(&mut self) {
        self.ever_connected = false;
        self.liveness_armed = false;
    }

    pub fn on_connection(&mut self, from: ConnectionState, to: ConnectionState) -> Vec<WatchdogAction> {
        self.connection = Some(to);
        let mut actions = Vec::new();
        if self.liveness_armed {
            self.liveness_armed = false;
            actions.push(WatchdogAction::DisarmLiveness);
        }
        match to {
            ConnectionState::Connected => {
                self.ever_connected = true;
                if self.reopen_latched {
                    debug!("fresh connection, reopen latch released");
                    self.reopen_latched = false;
                }
                if from == ConnectionState::Reconnecting {
                    self.liveness_armed = true;
                    actions.push(WatchdogAction::ArmLiveness);
                }
            }
            ConnectionState::Failed => {
                actions.extend(self.trigger(RecoverySignal::RetriesExhausted));
            }
            ConnectionState::Disconnected if self.ever_connected => {
                actions.extend(self.trigger(RecoverySignal::ConnectionLost));
            }
            _ => {}
        }
        actions
    }

    /// Any inbound data frame proves the remote end is alive.
    pub fn on_data(&mut self) -> Option<WatchdogAction> {
        if !self.liveness_armed {
            return None;
        }
        self.liveness_armed = false;
        Some(WatchdogAction::DisarmLiveness)
    }

    pub fn on_pty_closed(&mut self) -> Option<WatchdogAction> {
        if self.connection != Some(ConnectionState::Connected) {
            debug!("pty_closed on an unhealthy channel, left to the connection signals");
            return None;
        }
        self.trigger(RecoverySignal::PtyClosed)
    }

    pub fn on_liveness_timeout(&mut self) -> Option<WatchdogAction> {
        if !self.liveness_armed {
            return None;
        }
        self.liveness_armed = false;
        warn!("no data arrived after reconnect");
        self.trigger(RecoverySignal::LivenessTimeout)
    }

    /// User-initiated retry after a failed reopen.
    pub fn request_reopen(&mut self) -> Option<WatchdogAction> {
        self.trigger(RecoverySignal::Manual)
    }

    /// The reopen could not create a session; allow a manual retry.
    pub fn reopen_failed(&mut self) {
        self.reopen_latched = false;
    }

    pub fn is_reopening(&self) -> bool {
        self.reopen_latched
    }

    pub fn liveness_armed(&self) -> bool {
        self.liveness_armed
    }

    fn trigger(&mut self, signal: RecoverySignal) -> Option<WatchdogAction> {
        if self.reopen_latched {
            debug!(%signal, "reopen already in flight");
            return None;
        }
        self.reopen_latched = true;
        info!(%signal, "reopening terminal session");
        Some(WatchdogAction::Reopen(signal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    fn reopens(actions: &[WatchdogAction]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, WatchdogAction::Reopen(_)))
            .count()
    }

    #[test]
    fn cold_disconnect_is_not_a_signal() {
        let mut wd = Watchdog::new();
        assert!(wd.on_connection(Connecting, Disconnected).is_empty());
    }

    #[test]
    fn disconnect_after_connect_reopens() {
        let mut wd = Watchdog::new();
        wd.on_connection(Connecting, Connected);
        let actions = wd.on_connection(Connected, Disconnected);
        assert_eq!(actions, vec![WatchdogAction::Reopen(RecoverySignal::ConnectionLost)]);
    }

    #[test]
    fn failed_and_pty_closed_together_reopen_once() {
        let mut wd = Watchdog::new();
        wd.on_connection(Connecting, Connected);
        let mut total = 0;
        total += wd.on_pty_closed().into_iter().count();
        total += reopens(&wd.on_connection(Connected, Reconnecting));
        total += reopens(&wd.on_connection(Reconnecting, Failed));
        assert_eq!(total, 1);
        assert!(wd.is_reopening());
    }

    #[test]
    fn latch_released_by_fresh_connection_only() {
        let mut wd = Watchdog::new();
        wd.on_connection(Connecting, Connected);
        assert_eq!(reopens(&wd.on_connection(Connected, Disconnected)), 1);
        assert_eq!(reopens(&wd.on_connection(Disconnected, Connecting)), 0);
        assert_eq!(reopens(&wd.on_connection(Connecting, Failed)), 0);

        wd.on_connection(Failed, Connecting);
        wd.on_connection(Connecting, Connected);
        assert!(!wd.is_reopening());
        assert!(wd.on_pty_closed().is_some());
    }

    #[test]
    fn failed_create_releases_latch() {
        let mut wd = Watchdog::new();
        assert_eq!(reopens(&wd.on_connection(Reconnecting, Failed)), 1);
        wd.reopen_failed();
        assert!(!wd.is_reopening());
    }

    #[test]
    fn liveness_armed_only_after_reconnect() {
        let mut wd = Watchdog::new();
        assert_eq!(wd.on_connection(Connecting, Connected), vec![]);
        wd.on_connection(Connected, Reconnecting);
        assert_eq!(
            wd.on_connection(Reconnecting, Connected),
            vec![WatchdogAction::ArmLiveness]
        );
        assert_eq!(
            wd.on_liveness_timeout(),
            Some(WatchdogAction::Reopen(RecoverySignal::LivenessTimeout))
        );
    }

    #[test]
    fn data_or_state_change_disarms() {
        let mut wd = Watchdog::new();
        wd.on_connection(Reconnecting, Connected);
        assert_eq!(wd.on_data(), Some(WatchdogAction::DisarmLiveness));
        assert_eq!(wd.on_liveness_timeout(), None);

        wd.on_connection(Connected, Reconnecting);
        wd.on_connection(Reconnecting, Connected);
        let actions = wd.on_connection(Connected, Reconnecting);
        assert_eq!(actions, vec![WatchdogAction::DisarmLiveness]);
        assert_eq!(wd.on_liveness_timeout(), None);
    }

    #[test]
    fn pty_closed_ignored_while_unhealthy() {
        let mut wd = Watchdog::new();
        wd.on_connection(Connected, Reconnecting);
        assert!(wd.on_pty_closed().is_none());
    }
}
