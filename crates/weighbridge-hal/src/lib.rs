//! `weighbridge-hal` – Hardware Abstraction Layer
//!
//! Everything above this crate talks to a scale through the
//! [`HardwareLink`] trait, so a simulated device and a real weight indicator
//! are interchangeable.
//!
//! # Modules
//!
//! - [`link`] – the [`HardwareLink`] contract: liveness probe, raw read, and
//!   `start` / `stop` / `tare` commands.
//! - [`sim`] – [`SimLink`]: deterministic, seedable simulated scale for CI and
//!   demos, plus [`SimFleet`] to build a [`LinkRegistry`] of them.
//! - [`tcp`] – [`TcpLink`]: ASCII line protocol to a networked weight
//!   indicator.
//! - [`registry`] – [`LinkRegistry`]: device id → link lookup.

pub mod link;
pub mod registry;
pub mod sim;
pub mod tcp;

pub use link::{DeviceProfile, HardwareLink, LinkCommand};
pub use registry::LinkRegistry;
pub use sim::{SimFleet, SimLink, SimStep};
pub use tcp::TcpLink;
