//! The [`HardwareLink`] trait every scale driver implements.
//!
//! Drivers are registered in a [`LinkRegistry`][crate::registry::LinkRegistry]
//! and driven exclusively by the session engine of their device, which wraps
//! every call in a deadline.  Drivers therefore never need their own retry
//! logic: a failed call is reported and the engine decides what it means.

use async_trait::async_trait;
use weighbridge_types::{ScaleError, WeighCommand, WeightUnit};

/// Static characteristics of a scale device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceProfile {
    /// Readings above this value classify as overload.
    pub rated_capacity: f64,
    pub unit: WeightUnit,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            rated_capacity: 60_000.0,
            unit: WeightUnit::Kg,
        }
    }
}

/// Commands understood by the device itself.  Reads go through
/// [`HardwareLink::read_raw`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkCommand {
    Start,
    Stop,
    Tare,
}

impl LinkCommand {
    /// Wire keyword used by line-oriented indicators.
    pub fn keyword(self) -> &'static str {
        match self {
            LinkCommand::Start => "START",
            LinkCommand::Stop => "STOP",
            LinkCommand::Tare => "TARE",
        }
    }
}

impl TryFrom<WeighCommand> for LinkCommand {
    type Error = ScaleError;

    fn try_from(command: WeighCommand) -> Result<Self, Self::Error> {
        match command {
            WeighCommand::Start => Ok(LinkCommand::Start),
            WeighCommand::Stop => Ok(LinkCommand::Stop),
            WeighCommand::Tare => Ok(LinkCommand::Tare),
            WeighCommand::Read => Err(ScaleError::InvalidOperation(
                "read is not a device command".to_string(),
            )),
        }
    }
}

/// Connection to one physical or simulated scale.
///
/// # Errors
///
/// Implementations report [`ScaleError::HardwareTimeout`] for recoverable
/// communication loss and [`ScaleError::HardwareFault`] only when the device
/// itself signals a fatal condition.
#[async_trait]
pub trait HardwareLink: Send + Sync {
    /// Stable device id, equal to the station id it serves.
    fn device_id(&self) -> &str;

    fn profile(&self) -> DeviceProfile;

    /// Cheap round-trip proving the device answers.
    async fn probe_liveness(&self) -> Result<(), ScaleError>;

    /// Current gross weight in [`DeviceProfile::unit`].
    async fn read_raw(&self) -> Result<f64, ScaleError>;

    async fn send_command(&self, command: LinkCommand) -> Result<(), ScaleError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Minimal in-process link used only for tests.
    struct FixedLink {
        id: String,
        weight: f64,
        sent: Mutex<Vec<LinkCommand>>,
    }

    #[async_trait]
    impl HardwareLink for FixedLink {
        fn device_id(&self) -> &str {
            &self.id
        }

        fn profile(&self) -> DeviceProfile {
            DeviceProfile::default()
        }

        async fn probe_liveness(&self) -> Result<(), ScaleError> {
            Ok(())
        }

        async fn read_raw(&self) -> Result<f64, ScaleError> {
            Ok(self.weight)
        }

        async fn send_command(&self, command: LinkCommand) -> Result<(), ScaleError> {
            self.sent.lock().unwrap().push(command);
            Ok(())
        }
    }

    #[tokio::test]
    async fn link_is_usable_as_trait_object() {
        let link: Box<dyn HardwareLink> = Box::new(FixedLink {
            id: "S1".to_string(),
            weight: 1250.0,
            sent: Mutex::new(Vec::new()),
        });
        assert_eq!(link.device_id(), "S1");
        assert!(link.probe_liveness().await.is_ok());
        assert_eq!(link.read_raw().await.unwrap(), 1250.0);
        link.send_command(LinkCommand::Tare).await.unwrap();
    }

    #[test]
    fn weigh_command_maps_to_link_command() {
        assert_eq!(LinkCommand::try_from(WeighCommand::Start).unwrap(), LinkCommand::Start);
        assert_eq!(LinkCommand::try_from(WeighCommand::Tare).unwrap(), LinkCommand::Tare);
        assert!(matches!(
            LinkCommand::try_from(WeighCommand::Read),
            Err(ScaleError::InvalidOperation(_))
        ));
        assert_eq!(LinkCommand::Stop.keyword(), "STOP");
    }
}
