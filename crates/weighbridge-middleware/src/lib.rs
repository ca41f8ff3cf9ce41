//! `weighbridge-middleware` – Event Fan-out
//!
//! Moves session events from a device's engine to every observer of that
//! device without letting a slow observer hold anybody else up.
//!
//! # Modules
//!
//! - [`bus`] – per-device broadcast lanes paired with a latest-snapshot
//!   cell, and a receiver that turns lag or sequence gaps into a snapshot
//!   resync instead of stale-then-fresh delivery.

pub mod bus;

pub use bus::{DEFAULT_CAPACITY, Delivery, DeviceChannel, EventBus, SessionReceiver};
