//! [`ConnectionHealthMonitor`] – periodic liveness probing for one session.
//!
//! Probes travel through the session's command lane, so they never overlap a
//! command already talking to the device.  A single failed probe changes
//! nothing; after [`MonitorConfig::failure_threshold`] consecutive failures
//! the session is forced into `Disconnected`, and the first success after
//! that brings it back to `Idle`.  While the link is down the probe period
//! backs off exponentially up to [`MonitorConfig::max_backoff`].

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use weighbridge_kernel::{HealthVerdict, ProbeTracker};
use weighbridge_kernel::probe_tracker::DEFAULT_FAILURE_THRESHOLD;
use weighbridge_types::{ScaleError, SessionState};

use crate::engine::SessionHandle;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub probe_interval: Duration,
    pub failure_threshold: u32,
    pub max_backoff: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            max_backoff: Duration::from_secs(60),
        }
    }
}

pub struct ConnectionHealthMonitor {
    session: SessionHandle,
    tracker: ProbeTracker,
}

impl ConnectionHealthMonitor {
    pub fn new(session: SessionHandle, config: &MonitorConfig) -> Self {
        Self {
            session,
            tracker: ProbeTracker::new(
                config.failure_threshold,
                config.probe_interval,
                config.max_backoff,
            ),
        }
    }

    /// Start probing in the background until the session ends.
    pub fn spawn(session: SessionHandle, config: &MonitorConfig) -> JoinHandle<()> {
        tokio::spawn(Self::new(session, config).run())
    }

    /// Probe once and apply the verdict to the session.
    pub async fn probe_once(&mut self) -> Result<HealthVerdict, ScaleError> {
        let disconnected = self.session.state() == SessionState::Disconnected;
        let verdict = match self.session.probe().await {
            Ok(()) => self.tracker.record_success(disconnected),
            Err(e @ ScaleError::Channel(_)) => return Err(e),
            Err(e) => {
                debug!(
                    device = %self.session.device_id(),
                    failures = self.tracker.consecutive_failures() + 1,
                    error = %e,
                    "liveness probe failed"
                );
                let verdict = self.tracker.record_failure(disconnected);
                if verdict == HealthVerdict::LinkLost {
                    self.session.link_lost(format!(
                        "{} consecutive liveness probes failed",
                        self.tracker.consecutive_failures()
                    ));
                }
                verdict
            }
        };
        if verdict == HealthVerdict::Recovered {
            self.session.link_recovered();
        }
        Ok(verdict)
    }

    pub async fn run(mut self) {
        let device = self.session.device_id().to_string();
        info!(%device, "health monitor started");
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.tracker.next_delay()) => {}
                () = self.session.closed() => break,
            }
            if self.session.state() == SessionState::Error {
                warn!(%device, "session failed, health monitor stopping");
                break;
            }
            match self.probe_once().await {
                Ok(HealthVerdict::LinkLost) => warn!(%device, "device link lost"),
                Ok(HealthVerdict::Recovered) => info!(%device, "device link restored"),
                Ok(HealthVerdict::Steady) => {}
                Err(_) => break,
            }
        }
        debug!(%device, "health monitor stopped");
    }

    pub fn tracker(&self) -> &ProbeTracker {
        &self.tracker
    }
}
