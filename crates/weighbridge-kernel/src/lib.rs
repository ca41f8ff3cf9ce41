//! `weighbridge-kernel` – Access & Classification Rules
//!
//! Pure decision logic with no I/O.  Everything here is synchronous and can
//! be exercised without a runtime.
//!
//! # Modules
//!
//! - [`station_registry`] – [`ScaleRegistry`][station_registry::ScaleRegistry]:
//!   the set of registered scale stations and their access lists, guarded so
//!   readers never observe a half-applied update.
//! - [`access`] – [`AccessEvaluator`][access::AccessEvaluator]: decides
//!   whether a client machine may operate a station.
//! - [`stability`] – [`StabilityClassifier`][stability::StabilityClassifier]:
//!   turns raw samples into stable / unstable / overload / underload.
//! - [`probe_tracker`] – [`ProbeTracker`][probe_tracker::ProbeTracker]:
//!   consecutive-failure counting and reconnect backoff for liveness probes.

pub mod access;
pub mod probe_tracker;
pub mod stability;
pub mod station_registry;

pub use access::{AccessEvaluator, HostnameMatch};
pub use probe_tracker::{HealthVerdict, ProbeTracker};
pub use stability::{StabilityClassifier, StabilityConfig};
pub use station_registry::{ScaleRegistry, SessionLocator};
