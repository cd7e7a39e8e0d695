//! `sweeptrack-types` – shared data model for the tracked-device pose
//! pipeline.
//!
//! Everything that crosses a crate boundary lives here: the raw sensor
//! records produced by drivers, the normalized [`PoseSample`] handed to
//! consumers, configuration payloads, and the error taxonomy.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod config;
pub mod geometry;

pub use config::{BaseStationConfig, CalibrationConfig, DisplayConfig};
pub use geometry::{Pose, Quat, Vec3};

// ────────────────────────────────────────────────────────────────────────────
// Devices
// ────────────────────────────────────────────────────────────────────────────

/// Broad category of a tracked device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Hmd,
    Controller,
    Tracker,
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceClass::Hmd => write!(f, "hmd"),
            DeviceClass::Controller => write!(f, "controller"),
            DeviceClass::Tracker => write!(f, "tracker"),
        }
    }
}

/// Typed feature set of an open device, resolved once at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// The device reports a position.
    PositionalTracking,
    /// The device reports an orientation.
    RotationalTracking,
    /// Lens distortion coefficients can be queried (head-mounted displays).
    Distortion,
    /// Screen and lens geometry can be queried.
    DisplayGeometry,
    /// Digital buttons and touch sensors.
    Buttons,
}

/// What a driver advertises about a device before it is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Stable identifier, unique across all registered drivers.
    pub id: String,
    pub class: DeviceClass,
    pub vendor: String,
    pub product: String,
    /// Name of the driver that enumerated the device.
    pub driver: String,
    /// Capabilities the hardware can provide.
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub button_count: u32,
}

// ────────────────────────────────────────────────────────────────────────────
// Raw sensor records
// ────────────────────────────────────────────────────────────────────────────

/// One photodiode hit by the horizontal and vertical sweeps of one base
/// station.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngleMeasurement {
    pub sensor_id: u16,
    pub base_station_id: u8,
    pub horizontal_ticks: u32,
    pub vertical_ticks: u32,
    /// Capture time in seconds on the pipeline's monotonic clock.
    pub capture_time: f64,
}

/// One inertial sample in the device frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    /// Angular rate (rad/s).
    pub gyro: [f32; 3],
    /// Specific force (m/s²); reads +g along "up" at rest.
    pub accel: [f32; 3],
    /// Device-reported integration interval (seconds).
    pub dt: f32,
    pub time: f64,
}

/// Raw button bitmasks as reported by a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ButtonSample {
    pub pressed: u64,
    pub touched: u64,
}

/// Controller state with edge information relative to the previous report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerState {
    pub pressed: u64,
    pub touched: u64,
    pub changed_pressed: u64,
    pub changed_touched: u64,
    /// Incremented on every report.
    pub packet: u32,
}

/// Everything a driver delivers in one poll cycle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SensorFrame {
    pub timestamp: f64,
    pub angles: Vec<AngleMeasurement>,
    pub imu: Vec<ImuSample>,
    /// A ready-made 6DOF pose from an external tracker, already expressed in
    /// tracking space.
    pub external_pose: Option<Pose>,
    pub buttons: Option<ButtonSample>,
}

impl SensorFrame {
    /// A frame carrying only lighthouse angle measurements.
    pub fn from_angles(timestamp: f64, angles: Vec<AngleMeasurement>) -> Self {
        Self {
            timestamp,
            angles,
            ..Self::default()
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Output
// ────────────────────────────────────────────────────────────────────────────

/// Coarse confidence tag attached to every [`PoseSample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TrackingResult {
    /// Nothing usable has been observed yet, or the device went away.
    #[default]
    Uninitialized,
    /// Inertial data is arriving but no absolute fix exists yet.
    Calibrating,
    /// Absolute tracking is current.
    Running,
    /// Absolute tracking timed out; orientation is inertial only and the
    /// position is frozen.
    Fallback,
}

impl TrackingResult {
    /// Numeric code used by the integer property interface.
    pub fn code(self) -> i32 {
        match self {
            TrackingResult::Uninitialized => 0,
            TrackingResult::Calibrating => 1,
            TrackingResult::Running => 2,
            TrackingResult::Fallback => 3,
        }
    }
}

/// The normalized pose of a device at one instant, in tracking space.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PoseSample {
    pub position: Vec3,
    pub orientation: Quat,
    pub valid: bool,
    pub tracking_result: TrackingResult,
    /// Seconds on the pipeline's monotonic clock.
    pub timestamp: f64,
}

/// Monotonic seconds since a fixed epoch.  Cheap to copy; every component of
/// one registry shares the same epoch so timestamps are comparable.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Sweep axis of a lighthouse measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAxis {
    Horizontal,
    Vertical,
}

/// Bad calibration payload or an unusable single measurement.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("Malformed calibration payload: {0}")]
    Malformed(String),

    #[error("Invalid calibration field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Sensor {sensor_id} {axis:?} reading of {degrees:.3}° is outside the calibrated range")]
    OutOfRange {
        sensor_id: u16,
        axis: SweepAxis,
        degrees: f64,
    },

    #[error("Sensor {0} is not part of the calibrated model")]
    UnknownSensor(u16),
}

/// A frame that could not be turned into a pose.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TriangulationError {
    #[error("Insufficient correspondences: {found} found, {required} required")]
    InsufficientPoints { found: usize, required: usize },

    #[error("Degenerate geometry: {0}")]
    DegenerateGeometry(String),
}

/// Absolute tracking has been missing for longer than the fusion timeout.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("No absolute fix for {elapsed_s:.3}s")]
pub struct FusionTimeout {
    pub elapsed_s: f64,
}

/// The device behind a source stopped delivering data.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceIoError {
    #[error("Device {0} disconnected")]
    Disconnected(String),

    #[error("Read failure on {device}: {details}")]
    Read { device: String, details: String },

    #[error("Device {0} is not known to this driver")]
    NotFound(String),
}

/// Query-time failures of the property interface.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PropertyError {
    #[error("Property {property} is not supported by device {device}")]
    Unsupported { device: String, property: String },

    #[error("Unknown or closed device: {0}")]
    UnknownDevice(String),

    #[error("Output buffer too small: {required} values required, {provided} provided")]
    BufferTooSmall { required: usize, provided: usize },
}

/// Reasons a device could not be opened.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OpenError {
    #[error("No registered driver offers device {0}")]
    UnknownDevice(String),

    #[error("Device {0} is already open")]
    AlreadyOpen(String),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Io(#[from] DeviceIoError),

    #[error("Failed to spawn poll thread: {0}")]
    Spawn(String),
}
