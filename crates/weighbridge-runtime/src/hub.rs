//! [`BroadcastHub`] – subscriber bookkeeping and lazy session lifecycle.
//!
//! The hub is the only way observers reach a device.  It creates a
//! [`WeighingSessionEngine`] the first time anybody subscribes to a device,
//! remembers who is subscribed, routes their commands, and tears the engine
//! down once the last subscriber has left and the device is idle.
//!
//! Event delivery itself rides on the per-device lanes of the shared
//! [`EventBus`]; the hub never sits between an engine and its receivers, so a
//! slow observer can only ever slow itself down.
//!
//! Structural changes (create, teardown, close) are serialised per device by
//! an async slot lock, so a session is never spawned twice and a device that
//! is slow to answer only delays callers of that same device.  Lookups use a
//! plain mutex and are safe to call from synchronous code such as the station
//! registry's deletion guard.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use weighbridge_hal::{HardwareLink, LinkRegistry};
use weighbridge_kernel::SessionLocator;
use weighbridge_middleware::{EventBus, SessionReceiver};
use weighbridge_types::{CommandAck, ScaleError, SessionSnapshot, SessionState, WeighCommand};

use crate::engine::{EngineConfig, SessionHandle, WeighingSessionEngine};
use crate::health::{ConnectionHealthMonitor, MonitorConfig};

/// What [`BroadcastHub::subscribe`] hands back.
#[derive(Debug)]
pub struct Subscription {
    /// State at the moment of subscribing.  Every event on `receiver` is
    /// newer than this.
    pub snapshot: SessionSnapshot,
    pub receiver: SessionReceiver,
}

/// One row of [`BroadcastHub::sessions_summary`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub device_id: String,
    pub state: SessionState,
    pub sequence: u64,
    pub subscribers: usize,
}

struct HubEntry {
    handle: SessionHandle,
    subscribers: HashSet<String>,
    monitor: Option<JoinHandle<()>>,
}

impl HubEntry {
    fn teardown(self, announce: bool) {
        if announce {
            self.handle.close();
        } else {
            self.handle.shutdown();
        }
        if let Some(monitor) = self.monitor {
            monitor.abort();
        }
    }

    fn is_orphaned(&self) -> bool {
        !self.handle.is_running() || (self.subscribers.is_empty() && self.handle.state().is_idle())
    }
}

pub struct BroadcastHub {
    links: RwLock<LinkRegistry>,
    bus: EventBus,
    engine: EngineConfig,
    monitor: Option<MonitorConfig>,
    sessions: Mutex<HashMap<String, HubEntry>>,
    /// One lifecycle lock per device that ever had a session.
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl BroadcastHub {
    pub fn new(links: LinkRegistry, engine: EngineConfig) -> Self {
        Self {
            links: RwLock::new(links),
            bus: EventBus::default(),
            engine,
            monitor: None,
            sessions: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Probe every live session's device in the background.
    pub fn with_monitor(mut self, config: MonitorConfig) -> Self {
        self.monitor = Some(config);
        self
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, HubEntry>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Lifecycle lock of a device, created on first use.
    fn slot(&self, device_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.slots().entry(device_id.to_string()).or_default())
    }

    fn existing_slot(&self, device_id: &str) -> Option<Arc<tokio::sync::Mutex<()>>> {
        self.slots().get(device_id).cloned()
    }

    // -- links ---------------------------------------------------------------

    /// Add or replace the link for a device.  A running session keeps the
    /// link it was created with until it is torn down.
    pub fn register_link(&self, link: Arc<dyn HardwareLink>) {
        let id = link.device_id().to_string();
        let replaced = self
            .links
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .register(link);
        if replaced.is_some() {
            debug!(device = %id, "hardware link replaced");
        }
    }

    pub fn has_link(&self, device_id: &str) -> bool {
        self.links
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains(device_id)
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.links
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .device_ids()
    }

    fn link(&self, device_id: &str) -> Result<Arc<dyn HardwareLink>, ScaleError> {
        self.links
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(device_id)
            .ok_or_else(|| ScaleError::NotFound(format!("no hardware link for device {device_id}")))
    }

    // -- subscriptions -------------------------------------------------------

    /// Attach `subscriber_id` to a device, creating its session on demand.
    pub async fn subscribe(
        &self,
        device_id: &str,
        subscriber_id: &str,
    ) -> Result<Subscription, ScaleError> {
        if self.existing_slot(device_id).is_none() {
            self.link(device_id)?;
        }
        let slot = self.slot(device_id);
        let _slot = slot.lock().await;

        let running = self
            .sessions()
            .get(device_id)
            .map(|e| e.handle.is_running())
            .unwrap_or(false);

        if !running {
            let link = self.link(device_id)?;
            let handle = WeighingSessionEngine::spawn(link, &self.bus, self.engine.clone()).await;
            let monitor = self
                .monitor
                .as_ref()
                .map(|config| ConnectionHealthMonitor::spawn(handle.clone(), config));
            info!(device = %device_id, state = %handle.state(), "session created");
            let stale = self.sessions().insert(
                device_id.to_string(),
                HubEntry {
                    handle,
                    subscribers: HashSet::new(),
                    monitor,
                },
            );
            if let Some(stale) = stale {
                stale.teardown(false);
            }
        }

        let mut sessions = self.sessions();
        let entry = sessions
            .get_mut(device_id)
            .ok_or_else(|| ScaleError::NotFound(device_id.to_string()))?;
        entry.subscribers.insert(subscriber_id.to_string());
        entry.handle.attach(subscriber_id);
        let (snapshot, receiver) = entry.handle.subscribe();
        debug!(
            device = %device_id,
            subscriber = %subscriber_id,
            subscribers = entry.subscribers.len(),
            "subscribed"
        );
        Ok(Subscription { snapshot, receiver })
    }

    /// Detach a subscriber.  Its queued commands are dropped, and the session
    /// is torn down if nobody is left and the device is idle.
    ///
    /// Returns `false` if the subscriber was not attached.
    pub async fn unsubscribe(&self, device_id: &str, subscriber_id: &str) -> bool {
        let Some(slot) = self.existing_slot(device_id) else {
            return false;
        };
        let _slot = slot.lock().await;
        let mut sessions = self.sessions();
        let Some(entry) = sessions.get_mut(device_id) else {
            return false;
        };
        if !entry.subscribers.remove(subscriber_id) {
            return false;
        }
        entry.handle.detach(subscriber_id);
        debug!(device = %device_id, subscriber = %subscriber_id, "unsubscribed");

        if entry.is_orphaned() {
            if let Some(entry) = sessions.remove(device_id) {
                info!(device = %device_id, "last subscriber left, session closed");
                entry.teardown(false);
                self.bus.close(device_id);
            }
        }
        true
    }

    /// Route a command from a subscriber to its device's session.
    pub async fn submit(
        &self,
        device_id: &str,
        subscriber_id: &str,
        command: WeighCommand,
    ) -> Result<CommandAck, ScaleError> {
        let handle = {
            let sessions = self.sessions();
            let entry = sessions
                .get(device_id)
                .ok_or_else(|| ScaleError::NotFound(format!("no session for device {device_id}")))?;
            if !entry.subscribers.contains(subscriber_id) {
                return Err(ScaleError::InvalidOperation(format!(
                    "{subscriber_id} is not subscribed to {device_id}"
                )));
            }
            entry.handle.clone()
        };
        handle.submit(command, subscriber_id).await
    }

    /// Handle to a live session, for components that drive it directly
    /// such as a health monitor.
    pub fn session(&self, device_id: &str) -> Option<SessionHandle> {
        self.sessions().get(device_id).map(|e| e.handle.clone())
    }

    pub fn snapshot(&self, device_id: &str) -> Option<SessionSnapshot> {
        self.sessions().get(device_id).map(|e| e.handle.snapshot())
    }

    pub fn subscriber_count(&self, device_id: &str) -> usize {
        self.sessions()
            .get(device_id)
            .map(|e| e.subscribers.len())
            .unwrap_or(0)
    }

    pub fn sessions_summary(&self) -> Vec<SessionSummary> {
        let mut rows: Vec<SessionSummary> = self
            .sessions()
            .iter()
            .map(|(id, e)| {
                let snapshot = e.handle.snapshot();
                SessionSummary {
                    device_id: id.clone(),
                    state: snapshot.state,
                    sequence: snapshot.sequence,
                    subscribers: e.subscribers.len(),
                }
            })
            .collect();
        rows.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        rows
    }

    // -- lifecycle -----------------------------------------------------------

    /// Close a session regardless of subscribers: the device is stopped if
    /// weighing and subscribers receive a final `closed` event.
    pub async fn force_close(&self, device_id: &str) -> bool {
        let Some(slot) = self.existing_slot(device_id) else {
            return false;
        };
        let _slot = slot.lock().await;
        let Some(entry) = self.sessions().remove(device_id) else {
            return false;
        };
        warn!(device = %device_id, subscribers = entry.subscribers.len(), "session force-closed");
        let handle = entry.handle.clone();
        entry.teardown(true);
        let _ = tokio::time::timeout(self.engine.command_timeout * 2, handle.closed()).await;
        self.bus.close(device_id);
        true
    }

    /// Discard a session that entered `Error`.  Subscribers receive `closed`;
    /// the next subscribe starts a fresh session.
    pub async fn reset_session(&self, device_id: &str) -> Result<(), ScaleError> {
        match self.snapshot(device_id).map(|s| s.state) {
            None => Err(ScaleError::NotFound(format!("no session for device {device_id}"))),
            Some(SessionState::Error) => {
                self.force_close(device_id).await;
                Ok(())
            }
            Some(state) => Err(ScaleError::InvalidOperation(format!(
                "session for {device_id} is {state}, only failed sessions can be reset"
            ))),
        }
    }

    /// Remove sessions that are idle with nobody subscribed, or whose engine
    /// has already ended.  Returns the removed device ids.
    ///
    /// Devices whose lifecycle lock is busy are skipped until the next sweep.
    pub async fn sweep(&self) -> Vec<String> {
        let candidates: Vec<String> = self
            .sessions()
            .iter()
            .filter(|(_, e)| e.is_orphaned())
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = Vec::new();
        for id in candidates {
            let Some(slot) = self.existing_slot(&id) else {
                continue;
            };
            let Ok(_slot) = slot.try_lock() else {
                continue;
            };
            let mut sessions = self.sessions();
            if sessions.get(&id).is_some_and(HubEntry::is_orphaned)
                && let Some(entry) = sessions.remove(&id)
            {
                entry.teardown(false);
                self.bus.close(&id);
                removed.push(id);
            }
        }
        if !removed.is_empty() {
            debug!(removed = removed.len(), "swept idle sessions");
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the hub is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let hub = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(hub) = hub.upgrade() else { break };
                hub.sweep().await;
            }
        })
    }

    /// Close every session, stopping devices that are weighing.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<String> = self.sessions().keys().cloned().collect();
        let mut closed = 0;
        for id in ids {
            if self.force_close(&id).await {
                closed += 1;
            }
        }
        closed
    }
}

impl SessionLocator for BroadcastHub {
    /// A session is in use while anybody is subscribed or while its device
    /// is weighing, even with nobody watching.
    fn has_active_session(&self, device_id: &str) -> bool {
        self.sessions().get(device_id).is_some_and(|e| {
            !e.subscribers.is_empty() || (e.handle.is_running() && !e.handle.state().is_idle())
        })
    }
}
