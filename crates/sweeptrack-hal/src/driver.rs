//! Generic `Driver` trait: device enumeration and opening.
//!
//! A driver knows which devices it can reach and, on open, hands back a
//! [`SweepSource`] together with the device's static configuration.  Drivers
//! are registered with the runtime's `DeviceRegistry`.

use sweeptrack_types::{CalibrationConfig, DeviceDescriptor, DeviceIoError, DisplayConfig};

use crate::source::SweepSource;

/// Everything a driver delivers when a device is opened.
pub struct DriverDevice {
    pub source: Box<dyn SweepSource>,
    /// Sensor geometry for the calibration model.
    pub calibration: CalibrationConfig,
    /// Optical description; present only for head-mounted displays.
    pub display: Option<DisplayConfig>,
}

impl std::fmt::Debug for DriverDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverDevice")
            .field("source", &self.source.id())
            .field("sensors", &self.calibration.model_points.len())
            .field("display", &self.display.is_some())
            .finish()
    }
}

pub trait Driver: Send {
    /// Short stable name, e.g. `"sim"`.
    fn name(&self) -> &str;

    /// Devices currently reachable through this driver.
    fn enumerate(&self) -> Vec<DeviceDescriptor>;

    /// Open the device with the given id.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceIoError::NotFound`] for an id this driver does not
    /// offer, or another [`DeviceIoError`] when the transport fails.
    fn open(&mut self, id: &str) -> Result<DriverDevice, DeviceIoError>;
}
