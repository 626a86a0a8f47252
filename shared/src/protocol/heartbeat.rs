//! Liveness timers.
//!
//! The client sends `GUI_HEARTBEAT` every interval; the collector feeds a
//! [`Watchdog`] on each one and stops when it expires.

use std::time::{Duration, Instant};

/// Fires when it has not been fed within its timeout.
#[derive(Debug, Clone)]
pub struct Watchdog {
    timeout: Duration,
    deadline: Instant,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self::starting_at(timeout, Instant::now())
    }

    pub fn starting_at(timeout: Duration, now: Instant) -> Self {
        Self {
            timeout,
            deadline: now + timeout,
        }
    }

    pub fn feed(&mut self) {
        self.feed_at(Instant::now());
    }

    pub fn feed_at(&mut self, now: Instant) {
        self.deadline = now + self.timeout;
    }

    pub fn expired(&self) -> bool {
        self.expired_at(Instant::now())
    }

    pub fn expired_at(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Periodic sender schedule.
#[derive(Debug, Clone)]
pub struct HeartbeatTimer {
    interval: Duration,
    next: Instant,
}

impl HeartbeatTimer {
    pub fn new(interval: Duration) -> Self {
        Self::starting_at(interval, Instant::now())
    }

    pub fn starting_at(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            next: now + interval,
        }
    }

    /// True once per elapsed interval; re-arms itself.
    pub fn due_at(&mut self, now: Instant) -> bool {
        if now < self.next {
            return false;
        }
        self.next = now + self.interval;
        true
    }

    pub fn due(&mut self) -> bool {
        self.due_at(Instant::now())
    }

    pub fn until_next(&self) -> Duration {
        self.next.saturating_duration_since(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watchdog_feed_extends_deadline() {
        let t0 = Instant::now();
        let mut w = Watchdog::starting_at(Duration::from_secs(5), t0);
        assert!(!w.expired_at(t0 + Duration::from_secs(4)));
        w.feed_at(t0 + Duration::from_secs(4));
        assert!(!w.expired_at(t0 + Duration::from_secs(8)));
        assert!(w.expired_at(t0 + Duration::from_secs(9)));
    }

    #[test]
    fn test_heartbeat_due_once_per_interval() {
        let t0 = Instant::now();
        let mut h = HeartbeatTimer::starting_at(Duration::from_secs(1), t0);
        assert!(!h.due_at(t0));
        assert!(h.due_at(t0 + Duration::from_millis(1500)));
        assert!(!h.due_at(t0 + Duration::from_millis(1600)));
        assert!(h.due_at(t0 + Duration::from_millis(2600)));
    }
}
