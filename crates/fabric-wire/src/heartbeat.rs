//! Liveness timers for one connection.
//!
//! Writing anything postpones the next heartbeat; reading anything
//! postpones the timeout. The driver calls [`HeartbeatTimer::poll`] on each
//! turn and acts on the answer.

use std::time::{Duration, Instant};

use crate::config::WireConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Idle,
    SendHeartbeat,
    /// Nothing arrived within the timeout window.
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct HeartbeatTimer {
    interval: Duration,
    timeout: Duration,
    last_write: Instant,
    last_read: Instant,
}

impl HeartbeatTimer {
    #[must_use]
    pub fn new(config: &WireConfig, now: Instant) -> Self {
        Self {
            interval: Duration::from_millis(config.heartbeat_interval_ms),
            timeout: Duration::from_millis(config.timeout_ms),
            last_write: now,
            last_read: now,
        }
    }

    pub fn on_write(&mut self, now: Instant) {
        self.last_write = self.last_write.max(now);
    }

    pub fn on_read(&mut self, now: Instant) {
        self.last_read = self.last_read.max(now);
    }

    /// `SendHeartbeat` counts as a write, so it is returned once per
    /// interval.
    pub fn poll(&mut self, now: Instant) -> HeartbeatAction {
        if now.saturating_duration_since(self.last_read) >= self.timeout {
            return HeartbeatAction::TimedOut;
        }
        if now.saturating_duration_since(self.last_write) >= self.interval {
            self.last_write = now;
            return HeartbeatAction::SendHeartbeat;
        }
        HeartbeatAction::Idle
    }

    /// Earliest instant at which `poll` may return something other than
    /// `Idle`.
    #[must_use]
    pub fn next_deadline(&self) -> Instant {
        (self.last_write + self.interval).min(self.last_read + self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer(t0: Instant) -> HeartbeatTimer {
        let config = WireConfig {
            heartbeat_interval_ms: 100,
            timeout_ms: 300,
            ..WireConfig::default()
        };
        HeartbeatTimer::new(&config, t0)
    }

    #[test]
    fn heartbeats_follow_write_silence() {
        let t0 = Instant::now();
        let mut hb = timer(t0);
        assert_eq!(hb.poll(t0 + Duration::from_millis(50)), HeartbeatAction::Idle);
        assert_eq!(hb.poll(t0 + Duration::from_millis(100)), HeartbeatAction::SendHeartbeat);
        assert_eq!(hb.poll(t0 + Duration::from_millis(150)), HeartbeatAction::Idle);
        hb.on_write(t0 + Duration::from_millis(190));
        assert_eq!(hb.poll(t0 + Duration::from_millis(250)), HeartbeatAction::Idle);
        assert_eq!(hb.next_deadline(), t0 + Duration::from_millis(290));
    }

    #[test]
    fn reads_keep_the_connection_alive() {
        let t0 = Instant::now();
        let mut hb = timer(t0);
        hb.on_read(t0 + Duration::from_millis(200));
        assert_ne!(hb.poll(t0 + Duration::from_millis(400)), HeartbeatAction::TimedOut);
        assert_eq!(hb.poll(t0 + Duration::from_millis(500)), HeartbeatAction::TimedOut);
    }

    #[test]
    fn writes_alone_do_not_prevent_timeout() {
        let t0 = Instant::now();
        let mut hb = timer(t0);
        hb.on_write(t0 + Duration::from_millis(290));
        assert_eq!(hb.poll(t0 + Duration::from_millis(300)), HeartbeatAction::TimedOut);
    }
}
