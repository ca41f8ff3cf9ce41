//! [`ProbeTracker`] – liveness bookkeeping for one device.
//!
//! Feed every probe outcome into the tracker together with whether the
//! session is currently disconnected.  The returned [`HealthVerdict`] tells
//! the caller when to force the session into `Disconnected` and when to bring
//! it back, and [`ProbeTracker::next_delay`] yields the wait before the next
//! probe: the base interval while healthy, doubling per extra failure while
//! the link is down, capped at the configured maximum.

use std::time::{Duration, Instant};

/// Default consecutive failures before a link is declared lost.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// What the caller should do after recording a probe outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Nothing to do.
    Steady,
    /// Threshold reached: drive the session to `Disconnected`.
    LinkLost,
    /// First success after a loss: drive the session back to `Idle`.
    Recovered,
}

/// Consecutive-failure counter with exponential reconnect backoff.
#[derive(Debug, Clone)]
pub struct ProbeTracker {
    threshold: u32,
    interval: Duration,
    max_backoff: Duration,
    consecutive_failures: u32,
    lost: bool,
    last_success: Option<Instant>,
}

impl ProbeTracker {
    pub fn new(threshold: u32, interval: Duration, max_backoff: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            interval,
            max_backoff: max_backoff.max(interval),
            consecutive_failures: 0,
            lost: false,
            last_success: None,
        }
    }

    /// Record a successful probe.
    pub fn record_success(&mut self, session_disconnected: bool) -> HealthVerdict {
        let was_down = self.lost || session_disconnected;
        self.consecutive_failures = 0;
        self.lost = false;
        self.last_success = Some(Instant::now());
        if was_down {
            HealthVerdict::Recovered
        } else {
            HealthVerdict::Steady
        }
    }

    /// Record a failed probe.
    pub fn record_failure(&mut self, session_disconnected: bool) -> HealthVerdict {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.lost {
            return HealthVerdict::Steady;
        }
        if session_disconnected {
            // Already down for another reason; just start backing off.
            self.lost = true;
            return HealthVerdict::Steady;
        }
        if self.consecutive_failures >= self.threshold {
            self.lost = true;
            HealthVerdict::LinkLost
        } else {
            HealthVerdict::Steady
        }
    }

    /// Delay before the next probe.
    pub fn next_delay(&self) -> Duration {
        if !self.lost {
            return self.interval;
        }
        let extra = self
            .consecutive_failures
            .saturating_sub(self.threshold)
            .min(16);
        self.interval
            .saturating_mul(1u32 << extra)
            .min(self.max_backoff)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_lost(&self) -> bool {
        self.lost
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.last_success
    }
}
