//! Per-device publish/subscribe lanes with snapshot resynchronisation.
//!
//! Each device gets one [`DeviceChannel`]: a [`tokio::sync::broadcast`]
//! channel for events plus a [`tokio::sync::watch`] cell holding the latest
//! [`SessionSnapshot`].  The publisher always stores the snapshot *before*
//! broadcasting the event it describes, so a receiver that falls behind can
//! jump straight to a state that is at least as new as anything it missed.
//!
//! | Receiver sees | [`SessionReceiver::recv`] yields |
//! |---|---|
//! | next sequence number | [`Delivery::Event`] |
//! | sequence already covered | nothing, skipped |
//! | sequence gap | [`Delivery::Resync`] with the current snapshot |
//! | `Lagged(n)` from the channel | [`Delivery::Resync`] with the current snapshot |
//! | channel closed | `None` |
//!
//! Publishing never blocks and never fails for lack of receivers; the
//! broadcast ring simply overwrites the oldest entries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};
use weighbridge_types::{SessionEvent, SessionSnapshot};

/// Events buffered per device before slow receivers start lagging.
pub const DEFAULT_CAPACITY: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// DeviceChannel
// ─────────────────────────────────────────────────────────────────────────────

/// Publishing side of one device's lane.  Clones share the same channels.
#[derive(Clone, Debug)]
pub struct DeviceChannel {
    device_id: Arc<str>,
    events: broadcast::Sender<SessionEvent>,
    snapshot: Arc<watch::Sender<SessionSnapshot>>,
}

impl DeviceChannel {
    pub fn new(initial: SessionSnapshot, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let device_id: Arc<str> = Arc::from(initial.device_id.as_str());
        let (snapshot, _) = watch::channel(initial);
        Self {
            device_id,
            events,
            snapshot: Arc::new(snapshot),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Store `snapshot` then broadcast `event`.
    ///
    /// Returns the number of receivers handed the event; zero is normal.
    pub fn publish(&self, event: SessionEvent, snapshot: SessionSnapshot) -> usize {
        debug_assert!(snapshot.sequence >= event.sequence);
        self.snapshot.send_replace(snapshot);
        self.events.send(event).unwrap_or(0)
    }

    /// Replace the snapshot without announcing an event, e.g. to record the
    /// last command applied.
    pub fn update_snapshot(&self, snapshot: SessionSnapshot) {
        self.snapshot.send_replace(snapshot);
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Attach a new receiver.
    ///
    /// The broadcast receiver is created first, so every event newer than the
    /// returned snapshot is guaranteed to reach it.
    pub fn subscribe(&self) -> (SessionSnapshot, SessionReceiver) {
        let events = self.events.subscribe();
        let watch = self.snapshot.subscribe();
        let snapshot = watch.borrow().clone();
        let receiver = SessionReceiver {
            device_id: Arc::clone(&self.device_id),
            last_sequence: snapshot.sequence,
            events,
            snapshot: watch,
        };
        (snapshot, receiver)
    }

    pub fn receiver_count(&self) -> usize {
        self.events.receiver_count()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SessionReceiver
// ─────────────────────────────────────────────────────────────────────────────

/// What a [`SessionReceiver`] hands to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// The next event in sequence.
    Event(SessionEvent),
    /// Continuity was lost; replace local state with this snapshot.
    Resync(SessionSnapshot),
}

impl Delivery {
    pub fn sequence(&self) -> u64 {
        match self {
            Delivery::Event(e) => e.sequence,
            Delivery::Resync(s) => s.sequence,
        }
    }
}

/// Receiving side for one subscriber.  Never yields a sequence number lower
/// than one it already yielded.
#[derive(Debug)]
pub struct SessionReceiver {
    device_id: Arc<str>,
    last_sequence: u64,
    events: broadcast::Receiver<SessionEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionReceiver {
    /// Wait for the next delivery.  `None` once the device's lane is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            match self.events.recv().await {
                Ok(event) if event.sequence <= self.last_sequence => continue,
                Ok(event) if event.sequence == self.last_sequence + 1 => {
                    self.last_sequence = event.sequence;
                    return Some(Delivery::Event(event));
                }
                Ok(event) => {
                    debug!(
                        device = %self.device_id,
                        expected = self.last_sequence + 1,
                        got = event.sequence,
                        "sequence gap, resyncing"
                    );
                    if let Some(d) = self.resync() {
                        return Some(d);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(device = %self.device_id, lagged_by = n, "subscriber lagged, resyncing");
                    if let Some(d) = self.resync() {
                        return Some(d);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn resync(&mut self) -> Option<Delivery> {
        let snapshot = self.snapshot.borrow().clone();
        if snapshot.sequence <= self.last_sequence {
            return None;
        }
        self.last_sequence = snapshot.sequence;
        Some(Delivery::Resync(snapshot))
    }

    /// Snapshot as of now, without consuming any events.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EventBus
// ─────────────────────────────────────────────────────────────────────────────

/// Registry of device lanes.  Clone it cheaply; clones share the same map.
#[derive(Clone, Debug)]
pub struct EventBus {
    capacity: usize,
    channels: Arc<Mutex<HashMap<String, DeviceChannel>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DeviceChannel>> {
        self.channels.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Open a fresh lane for a device, replacing any previous one.
    pub fn open(&self, initial: SessionSnapshot) -> DeviceChannel {
        let channel = DeviceChannel::new(initial, self.capacity);
        self.lock()
            .insert(channel.device_id().to_string(), channel.clone());
        channel
    }

    pub fn channel(&self, device_id: &str) -> Option<DeviceChannel> {
        self.lock().get(device_id).cloned()
    }

    /// Drop the bus's handle on a lane.  Receivers see `None` once the
    /// publisher's clones are gone too.
    pub fn close(&self, device_id: &str) -> Option<DeviceChannel> {
        self.lock().remove(device_id)
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use weighbridge_types::{SessionEventKind, SessionState};

    fn snapshot_at(seq: u64, state: SessionState) -> SessionSnapshot {
        SessionSnapshot {
            sequence: seq,
            ..SessionSnapshot::new("scale-1", state)
        }
    }

    fn event_at(seq: u64, state: SessionState) -> SessionEvent {
        SessionEvent {
            device_id: "scale-1".into(),
            sequence: seq,
            state,
            kind: SessionEventKind::StateChanged,
            reading: None,
            tare_offset: 0.0,
            timestamp: Utc::now(),
        }
    }

    fn publish(channel: &DeviceChannel, seq: u64, state: SessionState) -> usize {
        channel.publish(event_at(seq, state), snapshot_at(seq, state))
    }

    #[tokio::test]
    async fn subscriber_gets_snapshot_then_events_in_order() {
        let channel = DeviceChannel::new(snapshot_at(0, SessionState::Idle), 16);
        let (initial, mut rx) = channel.subscribe();
        assert_eq!(initial.state, SessionState::Idle);

        publish(&channel, 1, SessionState::Weighing);
        publish(&channel, 2, SessionState::Stable);

        assert!(matches!(rx.recv().await, Some(Delivery::Event(e)) if e.sequence == 1));
        assert!(matches!(rx.recv().await, Some(Delivery::Event(e)) if e.sequence == 2));
        assert_eq!(rx.last_sequence(), 2);
    }

    #[test]
    fn publish_without_receivers_is_not_an_error() {
        let channel = DeviceChannel::new(snapshot_at(0, SessionState::Idle), 16);
        assert_eq!(publish(&channel, 1, SessionState::Weighing), 0);
        assert_eq!(channel.snapshot().sequence, 1);
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let channel = DeviceChannel::new(snapshot_at(0, SessionState::Idle), 16);
        let (_, mut a) = channel.subscribe();
        let (_, mut b) = channel.subscribe();
        assert_eq!(publish(&channel, 1, SessionState::Weighing), 2);

        assert_eq!(a.recv().await.map(|d| d.sequence()), Some(1));
        assert_eq!(b.recv().await.map(|d| d.sequence()), Some(1));
    }

    #[tokio::test]
    async fn late_subscriber_skips_events_covered_by_its_snapshot() {
        let channel = DeviceChannel::new(snapshot_at(0, SessionState::Idle), 16);
        let (_, mut early) = channel.subscribe();
        publish(&channel, 1, SessionState::Weighing);

        let (initial, mut late) = channel.subscribe();
        assert_eq!(initial.sequence, 1);
        publish(&channel, 2, SessionState::Stable);

        assert_eq!(early.recv().await.map(|d| d.sequence()), Some(1));
        assert_eq!(late.recv().await.map(|d| d.sequence()), Some(2));
    }

    #[tokio::test]
    async fn lagging_subscriber_resyncs_from_snapshot() {
        let channel = DeviceChannel::new(snapshot_at(0, SessionState::Idle), 4);
        let (_, mut slow) = channel.subscribe();

        for seq in 1..=50 {
            publish(&channel, seq, SessionState::Unstable);
        }

        match slow.recv().await {
            Some(Delivery::Resync(s)) => assert_eq!(s.sequence, 50),
            other => panic!("expected resync, got {other:?}"),
        }
        // Everything still buffered is older than the snapshot.
        publish(&channel, 51, SessionState::Stable);
        assert!(matches!(slow.recv().await, Some(Delivery::Event(e)) if e.sequence == 51));
    }

    #[tokio::test]
    async fn gap_triggers_resync() {
        let channel = DeviceChannel::new(snapshot_at(0, SessionState::Idle), 16);
        let (_, mut rx) = channel.subscribe();

        // Snapshot jumps ahead of the broadcast stream.
        channel.update_snapshot(snapshot_at(2, SessionState::Stable));
        channel.publish(event_at(3, SessionState::Stable), snapshot_at(3, SessionState::Stable));

        match rx.recv().await {
            Some(Delivery::Resync(s)) => assert_eq!(s.sequence, 3),
            other => panic!("expected resync, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn receiver_ends_when_lane_is_dropped() {
        let bus = EventBus::default();
        let channel = bus.open(snapshot_at(0, SessionState::Idle));
        let (_, mut rx) = channel.subscribe();

        drop(channel);
        assert!(bus.close("scale-1").is_some());

        let next = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(next.ok(), Some(None));
    }

    #[test]
    fn bus_tracks_lanes_per_device() {
        let bus = EventBus::new(8);
        bus.open(SessionSnapshot::new("b", SessionState::Idle));
        bus.open(SessionSnapshot::new("a", SessionState::Disconnected));

        assert_eq!(bus.device_ids(), vec!["a".to_string(), "b".to_string()]);
        let a = bus.channel("a").map(|c| c.snapshot().state);
        assert_eq!(a, Some(SessionState::Disconnected));
        assert!(bus.channel("c").is_none());
        assert_eq!(bus.capacity(), 8);
    }
}
