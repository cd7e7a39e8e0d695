//! In-process simulation driver for CI/CD testing without physical hardware.
//!
//! [`SimDriver`] projects a scripted device motion through the device's own
//! calibration model, producing the integer tick values a real lighthouse
//! receiver would report, plus matching IMU samples and (for controllers)
//! button reports.  This lets the whole pose pipeline run headless.
//!
//! Fault injection covers the two interesting failure paths: frames with too
//! few sensors (`drop_every`) and a device that goes away
//! (`disconnect_after`).
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use sweeptrack_hal::driver::Driver;
//! use sweeptrack_hal::sim::SimDriver;
//!
//! let mut driver = SimDriver::builder().with_hmd("sim-hmd-0").build();
//! let mut dev = driver.open("sim-hmd-0").unwrap();
//!
//! let frame = dev.source.read_frame(Duration::from_millis(100)).unwrap().unwrap();
//! assert!(frame.angles.len() >= 4);
//! ```

use std::thread;
use std::time::{Duration, Instant};

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use sweeptrack_perception::calibration::CalibrationModel;
use sweeptrack_perception::transform::to_isometry;
use sweeptrack_types::{
    BaseStationConfig, ButtonSample, CalibrationConfig, Capability, DeviceClass,
    DeviceDescriptor, DeviceIoError, DisplayConfig, ImuSample, MonotonicClock, SensorFrame,
};
use tracing::{debug, info};

use crate::driver::{Driver, DriverDevice};
use crate::source::SweepSource;

const GRAVITY: f64 = 9.80665;
const CONTROLLER_BUTTONS: u32 = 4;

// ────────────────────────────────────────────────────────────────────────────
// Sensor layouts
// ────────────────────────────────────────────────────────────────────────────

/// `n` points spread evenly over a sphere of the given radius.
fn fibonacci_sphere(n: usize, radius: f64) -> Vec<[f64; 3]> {
    let golden = std::f64::consts::PI * (3.0 - 5.0_f64.sqrt());
    (0..n)
        .map(|i| {
            let y = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
            let r = (1.0 - y * y).sqrt();
            let theta = golden * i as f64;
            [radius * r * theta.cos(), radius * y, radius * r * theta.sin()]
        })
        .collect()
}

/// Calibration of a simulated device of the given class.
pub fn sim_calibration(class: DeviceClass) -> CalibrationConfig {
    let model_points = match class {
        DeviceClass::Hmd => fibonacci_sphere(20, 0.1),
        DeviceClass::Controller => fibonacci_sphere(12, 0.05),
        DeviceClass::Tracker => fibonacci_sphere(10, 0.04),
    };
    CalibrationConfig {
        model_points,
        angle_range_h: [32.0, 156.0],
        angle_range_v: [32.0, 156.0],
        ticks_per_degree: 2222.22,
        range_tolerance_deg: 2.0,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Motion
// ────────────────────────────────────────────────────────────────────────────

/// Scripted trajectory of a simulated device in tracking space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimMotion {
    Static(Isometry3<f64>),
    /// Turn about the tracking-space up axis (+Y) at a fixed position.
    Spin {
        position: Vector3<f64>,
        rate_rad_s: f64,
    },
}

impl Default for SimMotion {
    fn default() -> Self {
        SimMotion::Static(Isometry3::translation(0.0, 0.0, 2.0))
    }
}

impl SimMotion {
    pub fn pose_at(&self, t: f64) -> Isometry3<f64> {
        match *self {
            SimMotion::Static(pose) => pose,
            SimMotion::Spin {
                position,
                rate_rad_s,
            } => Isometry3::from_parts(
                Translation3::from(position),
                UnitQuaternion::from_axis_angle(&Vector3::y_axis(), rate_rad_s * t),
            ),
        }
    }

    /// Angular rate in tracking space (rad/s).
    fn world_rate(&self) -> Vector3<f64> {
        match *self {
            SimMotion::Static(_) => Vector3::zeros(),
            SimMotion::Spin { rate_rad_s, .. } => Vector3::new(0.0, rate_rad_s, 0.0),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimDevice
// ────────────────────────────────────────────────────────────────────────────

/// One simulated device and its fault-injection settings.
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub descriptor: DeviceDescriptor,
    pub calibration: CalibrationConfig,
    pub display: Option<DisplayConfig>,
    pub motion: SimMotion,
    /// Every n-th frame carries only three sensors.
    pub drop_every: Option<u64>,
    /// The source reports a disconnect after this many frames.
    pub disconnect_after: Option<u64>,
}

impl SimDevice {
    fn new(id: impl Into<String>, class: DeviceClass) -> Self {
        let (product, capabilities, button_count) = match class {
            DeviceClass::Hmd => (
                "Simulated HMD",
                vec![
                    Capability::PositionalTracking,
                    Capability::RotationalTracking,
                    Capability::Distortion,
                    Capability::DisplayGeometry,
                ],
                0,
            ),
            DeviceClass::Controller => (
                "Simulated Controller",
                vec![
                    Capability::PositionalTracking,
                    Capability::RotationalTracking,
                    Capability::Buttons,
                ],
                CONTROLLER_BUTTONS,
            ),
            DeviceClass::Tracker => (
                "Simulated Tracker",
                vec![Capability::PositionalTracking, Capability::RotationalTracking],
                0,
            ),
        };
        Self {
            descriptor: DeviceDescriptor {
                id: id.into(),
                class,
                vendor: "SweepTrack".to_string(),
                product: product.to_string(),
                driver: SimDriver::NAME.to_string(),
                capabilities,
                button_count,
            },
            calibration: sim_calibration(class),
            display: (class == DeviceClass::Hmd).then(DisplayConfig::htc_vive),
            motion: SimMotion::default(),
            drop_every: None,
            disconnect_after: None,
        }
    }

    pub fn hmd(id: impl Into<String>) -> Self {
        Self::new(id, DeviceClass::Hmd)
    }

    pub fn controller(id: impl Into<String>) -> Self {
        Self::new(id, DeviceClass::Controller)
    }

    pub fn tracker(id: impl Into<String>) -> Self {
        Self::new(id, DeviceClass::Tracker)
    }

    /// Replace the built-in sensor layout.  The payload is validated when
    /// the device is opened.
    pub fn calibration(mut self, calibration: CalibrationConfig) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn motion(mut self, motion: SimMotion) -> Self {
        self.motion = motion;
        self
    }

    pub fn drop_every(mut self, n: u64) -> Self {
        self.drop_every = Some(n.max(1));
        self
    }

    pub fn disconnect_after(mut self, frames: u64) -> Self {
        self.disconnect_after = Some(frames);
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimDriver builder
// ────────────────────────────────────────────────────────────────────────────

/// Builder for a [`SimDriver`].
pub struct SimDriverBuilder {
    devices: Vec<SimDevice>,
    stations: Vec<BaseStationConfig>,
    rate_hz: f64,
    imu_per_frame: u32,
}

impl Default for SimDriverBuilder {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            stations: Vec::new(),
            rate_hz: 60.0,
            imu_per_frame: 4,
        }
    }
}

impl SimDriverBuilder {
    pub fn with_device(mut self, device: SimDevice) -> Self {
        self.devices.push(device);
        self
    }

    pub fn with_hmd(self, id: impl Into<String>) -> Self {
        self.with_device(SimDevice::hmd(id))
    }

    pub fn with_controller(self, id: impl Into<String>) -> Self {
        self.with_device(SimDevice::controller(id))
    }

    pub fn with_tracker(self, id: impl Into<String>) -> Self {
        self.with_device(SimDevice::tracker(id))
    }

    /// Add a base station.  Without any, a single station 0 sits at the
    /// tracking-space origin looking down +Z.
    pub fn with_station(mut self, station: BaseStationConfig) -> Self {
        self.stations.push(station);
        self
    }

    /// Frame rate of every simulated source.
    pub fn with_rate_hz(mut self, rate_hz: f64) -> Self {
        if rate_hz.is_finite() && rate_hz > 0.0 {
            self.rate_hz = rate_hz;
        }
        self
    }

    pub fn with_imu_per_frame(mut self, n: u32) -> Self {
        self.imu_per_frame = n;
        self
    }

    pub fn build(self) -> SimDriver {
        let stations = if self.stations.is_empty() {
            vec![BaseStationConfig {
                id: 0,
                pose: Default::default(),
            }]
        } else {
            self.stations
        };
        SimDriver {
            devices: self.devices,
            stations,
            period: Duration::from_secs_f64(1.0 / self.rate_hz),
            imu_per_frame: self.imu_per_frame,
            clock: MonotonicClock::new(),
        }
    }
}

/// Driver whose every device is simulated.
pub struct SimDriver {
    devices: Vec<SimDevice>,
    stations: Vec<BaseStationConfig>,
    period: Duration,
    imu_per_frame: u32,
    clock: MonotonicClock,
}

impl SimDriver {
    pub const NAME: &'static str = "sim";

    pub fn builder() -> SimDriverBuilder {
        SimDriverBuilder::default()
    }

    pub fn stations(&self) -> &[BaseStationConfig] {
        &self.stations
    }
}

impl Driver for SimDriver {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn enumerate(&self) -> Vec<DeviceDescriptor> {
        self.devices.iter().map(|d| d.descriptor.clone()).collect()
    }

    fn open(&mut self, id: &str) -> Result<DriverDevice, DeviceIoError> {
        let device = self
            .devices
            .iter()
            .find(|d| d.descriptor.id == id)
            .ok_or_else(|| DeviceIoError::NotFound(id.to_string()))?;
        let model = CalibrationModel::from_config(&device.calibration).map_err(|e| DeviceIoError::Read {
            device: id.to_string(),
            details: e.to_string(),
        })?;

        info!(device = id, class = %device.descriptor.class, "Opening simulated device");
        let source = SimSource {
            id: id.to_string(),
            model,
            motion: device.motion,
            stations: self
                .stations
                .iter()
                .map(|s| (s.id, to_isometry(&s.pose).inverse()))
                .collect(),
            buttons: device.descriptor.class == DeviceClass::Controller,
            drop_every: device.drop_every,
            disconnect_after: device.disconnect_after,
            period: self.period,
            imu_per_frame: self.imu_per_frame,
            clock: self.clock,
            next_due: Instant::now(),
            frames: 0,
        };
        Ok(DriverDevice {
            source: Box::new(source),
            calibration: device.calibration.clone(),
            display: device.display.clone(),
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimSource
// ────────────────────────────────────────────────────────────────────────────

struct SimSource {
    id: String,
    model: CalibrationModel,
    motion: SimMotion,
    /// `(station id, tracking space → station frame)`.
    stations: Vec<(u8, Isometry3<f64>)>,
    buttons: bool,
    drop_every: Option<u64>,
    disconnect_after: Option<u64>,
    period: Duration,
    imu_per_frame: u32,
    clock: MonotonicClock,
    next_due: Instant,
    frames: u64,
}

impl SimSource {
    fn synthesize(&self, t: f64) -> SensorFrame {
        let pose = self.motion.pose_at(t);

        let mut angles = Vec::new();
        for (station, to_station) in &self.stations {
            angles.extend(self.model.synthesize(&(to_station * pose), *station, t));
        }
        if self.drop_every.is_some_and(|n| self.frames % n == 0) {
            angles.truncate(3);
        }

        let dt = self.period.as_secs_f64() / f64::from(self.imu_per_frame.max(1));
        let gyro = pose.rotation.inverse() * self.motion.world_rate();
        let accel = pose.rotation.inverse() * Vector3::new(0.0, GRAVITY, 0.0);
        let imu = (0..self.imu_per_frame)
            .map(|i| ImuSample {
                gyro: [gyro.x as f32, gyro.y as f32, gyro.z as f32],
                accel: [accel.x as f32, accel.y as f32, accel.z as f32],
                dt: dt as f32,
                time: t - dt * f64::from(self.imu_per_frame - 1 - i),
            })
            .collect();

        // Trigger toggles once a second.
        let buttons = self.buttons.then(|| {
            let pressed = u64::from((t as u64) % 2 == 1);
            ButtonSample {
                pressed,
                touched: pressed,
            }
        });

        SensorFrame {
            timestamp: t,
            angles,
            imu,
            external_pose: None,
            buttons,
        }
    }
}

impl SweepSource for SimSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Option<SensorFrame>, DeviceIoError> {
        if self.disconnect_after.is_some_and(|n| self.frames >= n) {
            debug!(device = %self.id, frames = self.frames, "Simulated disconnect");
            return Err(DeviceIoError::Disconnected(self.id.clone()));
        }

        let now = Instant::now();
        if self.next_due > now {
            let wait = self.next_due - now;
            if wait > timeout {
                thread::sleep(timeout);
                return Ok(None);
            }
            thread::sleep(wait);
        }
        self.next_due = self.next_due.max(now) + self.period;
        self.frames += 1;

        Ok(Some(self.synthesize(self.clock.now())))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
