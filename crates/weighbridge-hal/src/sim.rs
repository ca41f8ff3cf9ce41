//! In-process simulated scale for CI and demos without physical hardware.
//!
//! [`SimLink`] produces readings from a seeded random walk around a settable
//! load, so two links built with the same seed yield the same sequence of
//! readings.  Tests can additionally queue [`SimStep`]s to force exact
//! values, hangs, transient failures, or fatal faults.
//!
//! # Example
//!
//! ```rust
//! use weighbridge_hal::sim::SimFleet;
//!
//! let links = SimFleet::new()
//!     .with_seed(7)
//!     .with_scale("S1", 60_000.0)
//!     .with_scale("S2", 3_000.0)
//!     .build();
//!
//! assert!(links.get("S1").is_some());
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use weighbridge_types::{ScaleError, WeightUnit};

use crate::link::{DeviceProfile, HardwareLink, LinkCommand};
use crate::registry::LinkRegistry;

/// One scripted outcome, consumed by the next read (or command, for the
/// command script).
#[derive(Debug, Clone, PartialEq)]
pub enum SimStep {
    Value(f64),
    /// Never completes; the caller's deadline must fire.
    Hang,
    /// Transient communication failure.
    Fail,
    /// Fatal device fault.
    Fault(String),
}

struct SimState {
    rng: StdRng,
    load: f64,
    noise: f64,
    latency: Duration,
    alive: bool,
    read_script: VecDeque<SimStep>,
    command_script: VecDeque<SimStep>,
    commands: Vec<LinkCommand>,
    reads: usize,
}

// ────────────────────────────────────────────────────────────────────────────
// SimLink
// ────────────────────────────────────────────────────────────────────────────

/// A simulated scale implementing [`HardwareLink`].
pub struct SimLink {
    device_id: String,
    profile: DeviceProfile,
    state: Mutex<SimState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SimLink {
    /// Create an alive, noiseless simulated scale with seed `0`.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            profile: DeviceProfile::default(),
            state: Mutex::new(SimState {
                rng: StdRng::seed_from_u64(0),
                load: 0.0,
                noise: 0.0,
                latency: Duration::ZERO,
                alive: true,
                read_script: VecDeque::new(),
                command_script: VecDeque::new(),
                commands: Vec::new(),
                reads: 0,
            }),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_seed(self, seed: u64) -> Self {
        self.lock().rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_capacity(mut self, rated_capacity: f64) -> Self {
        self.profile.rated_capacity = rated_capacity;
        self
    }

    pub fn with_unit(mut self, unit: WeightUnit) -> Self {
        self.profile.unit = unit;
        self
    }

    /// Peak-to-peak jitter applied around the load on unscripted reads.
    pub fn with_noise(self, noise: f64) -> Self {
        self.lock().noise = noise.abs();
        self
    }

    pub fn with_load(self, load: f64) -> Self {
        self.lock().load = load;
        self
    }

    /// Delay applied to every call before it answers.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    pub fn with_script(self, steps: impl IntoIterator<Item = SimStep>) -> Self {
        self.push_reads(steps);
        self
    }

    // -- runtime controls ----------------------------------------------------

    pub fn set_load(&self, load: f64) {
        self.lock().load = load;
    }

    /// A dead link fails probes, reads, and commands.
    pub fn set_alive(&self, alive: bool) {
        self.lock().alive = alive;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn push_reads(&self, steps: impl IntoIterator<Item = SimStep>) {
        self.lock().read_script.extend(steps);
    }

    pub fn push_command_outcomes(&self, steps: impl IntoIterator<Item = SimStep>) {
        self.lock().command_script.extend(steps);
    }

    /// Every command the device acknowledged or rejected, in arrival order.
    pub fn commands(&self) -> Vec<LinkCommand> {
        self.lock().commands.clone()
    }

    pub fn read_count(&self) -> usize {
        self.lock().reads
    }

    /// Highest number of calls that were ever in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }

    async fn settle(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    async fn apply(&self, step: SimStep, operation: &str) -> Result<f64, ScaleError> {
        match step {
            SimStep::Value(v) => Ok(v),
            SimStep::Hang => {
                std::future::pending::<()>().await;
                Err(ScaleError::timeout(&self.device_id, operation))
            }
            SimStep::Fail => Err(ScaleError::timeout(&self.device_id, operation)),
            SimStep::Fault(details) => Err(ScaleError::fault(&self.device_id, details)),
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl HardwareLink for SimLink {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn profile(&self) -> DeviceProfile {
        self.profile
    }

    async fn probe_liveness(&self) -> Result<(), ScaleError> {
        let _guard = self.enter();
        self.settle().await;
        if self.lock().alive {
            Ok(())
        } else {
            Err(ScaleError::timeout(&self.device_id, "probe"))
        }
    }

    async fn read_raw(&self) -> Result<f64, ScaleError> {
        let _guard = self.enter();
        self.settle().await;
        let step = {
            let mut state = self.lock();
            state.reads += 1;
            match state.read_script.pop_front() {
                Some(step) => step,
                None if !state.alive => SimStep::Fail,
                None => {
                    let noise = state.noise;
                    let jitter = if noise > 0.0 {
                        state.rng.random_range(-noise / 2.0..=noise / 2.0)
                    } else {
                        0.0
                    };
                    SimStep::Value(state.load + jitter)
                }
            }
        };
        self.apply(step, "read").await
    }

    async fn send_command(&self, command: LinkCommand) -> Result<(), ScaleError> {
        let _guard = self.enter();
        self.settle().await;
        let step = {
            let mut state = self.lock();
            state.commands.push(command);
            match state.command_script.pop_front() {
                Some(step) => step,
                None if !state.alive => SimStep::Fail,
                None => SimStep::Value(0.0),
            }
        };
        self.apply(step, command.keyword()).await.map(|_| ())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimFleet builder
// ────────────────────────────────────────────────────────────────────────────

/// Builder that constructs a [`LinkRegistry`] pre-populated with simulated
/// scales.  Each scale gets its own seed derived from the fleet seed and its
/// position, so a whole fleet is reproducible.
#[derive(Default)]
pub struct SimFleet {
    seed: u64,
    noise: f64,
    scales: Vec<(String, f64)>,
}

impl SimFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }

    /// Add a simulated scale with the given rated capacity.
    pub fn with_scale(mut self, device_id: impl Into<String>, rated_capacity: f64) -> Self {
        self.scales.push((device_id.into(), rated_capacity));
        self
    }

    pub fn build(self) -> LinkRegistry {
        let mut registry = LinkRegistry::new();
        for (index, (id, capacity)) in self.scales.into_iter().enumerate() {
            let link = SimLink::new(id)
                .with_seed(self.seed.wrapping_add(index as u64))
                .with_noise(self.noise)
                .with_capacity(capacity);
            registry.register(Arc::new(link));
        }
        registry
    }
}
