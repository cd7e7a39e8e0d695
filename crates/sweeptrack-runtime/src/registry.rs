//! [`DeviceRegistry`] – driver registry and owner of every open device.
//!
//! The registry replaces any process-wide device table: the caller holds it
//! and passes it where needed.  Drivers are registered once; devices are
//! enumerated across all drivers and opened by id.  Opening a device
//!
//! 1. asks the owning driver for a [`SweepSource`](sweeptrack_hal::source::SweepSource)
//!    and static configuration,
//! 2. validates the calibration into a shared [`CalibrationModel`],
//! 3. resolves the typed capability set,
//! 4. starts the device's [`PollLoop`].
//!
//! Every query afterwards reads the device's caches only.
//!
//! # Example
//!
//! ```rust,no_run
//! use sweeptrack_hal::sim::SimDriver;
//! use sweeptrack_runtime::registry::{DeviceRegistry, RuntimeConfig};
//! use sweeptrack_runtime::properties::FloatProperty;
//!
//! let mut registry = DeviceRegistry::new(RuntimeConfig::default());
//! registry.register_driver(Box::new(SimDriver::builder().with_hmd("hmd0").build()));
//! registry.open_device("hmd0").unwrap();
//!
//! let mut quat = [0.0f32; 4];
//! registry.get_float_property("hmd0", FloatProperty::RotationQuat, &mut quat).unwrap();
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sweeptrack_hal::driver::Driver;
use sweeptrack_perception::calibration::CalibrationModel;
use sweeptrack_perception::fusion::FusionConfig;
use sweeptrack_perception::transform::TrackingSpace;
use sweeptrack_perception::triangulate::TriangulatorConfig;
use sweeptrack_types::{
    BaseStationConfig, Capability, ControllerState, DeviceClass, DeviceDescriptor, DisplayConfig,
    OpenError, PoseSample, PropertyError,
};
use tracing::{info, instrument, warn};

use crate::cache::{ControllerCache, PoseCache, PoseHealth, PoseReader};
use crate::pipeline::PosePipeline;
use crate::poll_loop::{LoopState, PollLoop, PollLoopConfig};
use crate::properties::{FloatProperty, IntProperty, PropertySource};

// ────────────────────────────────────────────────────────────────────────────
// RuntimeConfig
// ────────────────────────────────────────────────────────────────────────────

/// Tunables applied to every device the registry opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound on one blocking source read.
    pub poll_timeout_ms: u64,
    /// A pose older than this is reported by [`DeviceRegistry::stale_devices`].
    pub stale_after_ms: u64,
    pub triangulator: TriangulatorConfig,
    pub fusion: FusionConfig,
    /// Placement of each base station in tracking space.  Stations not
    /// listed sit at the origin.
    pub base_stations: Vec<BaseStationConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 10,
            stale_after_ms: 500,
            triangulator: TriangulatorConfig::default(),
            fusion: FusionConfig::default(),
            base_stations: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Device
// ────────────────────────────────────────────────────────────────────────────

/// One open device: static description plus the caches its poll loop feeds.
pub struct Device {
    descriptor: DeviceDescriptor,
    calibration: Arc<CalibrationModel>,
    cache: Arc<PoseCache>,
    controller: Arc<ControllerCache>,
    capabilities: HashSet<Capability>,
    display: Option<DisplayConfig>,
    poll: PollLoop,
}

impl Device {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn calibration(&self) -> &Arc<CalibrationModel> {
        &self.calibration
    }

    pub fn capabilities(&self) -> &HashSet<Capability> {
        &self.capabilities
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    pub fn display(&self) -> Option<&DisplayConfig> {
        self.display.as_ref()
    }

    pub fn pose(&self) -> PoseSample {
        self.cache.snapshot()
    }

    pub fn reader(&self) -> PoseReader {
        PoseCache::reader(&self.cache)
    }

    pub fn controller_state(&self) -> Option<ControllerState> {
        self.controller.snapshot()
    }

    pub fn health(&self, max_age: Duration) -> PoseHealth {
        self.cache.health(max_age)
    }

    pub fn poll_state(&self) -> LoopState {
        self.poll.state()
    }

    /// # Errors
    ///
    /// See [`PropertySource::read_float`].
    pub fn float_property(&self, kind: FloatProperty, out: &mut [f32]) -> Result<usize, PropertyError> {
        self.property_source().read_float(kind, out)
    }

    /// # Errors
    ///
    /// See [`PropertySource::read_int`].
    pub fn int_property(&self, kind: IntProperty, out: &mut [i32]) -> Result<usize, PropertyError> {
        self.property_source().read_int(kind, out)
    }

    fn property_source(&self) -> PropertySource<'_> {
        PropertySource {
            device_id: &self.descriptor.id,
            capabilities: &self.capabilities,
            sample: self.cache.snapshot(),
            display: self.display.as_ref(),
            button_count: self.descriptor.button_count,
        }
    }
}

/// Capabilities granted at open time.
///
/// Advertised capabilities are granted, except that lens distortion is
/// HMD-only and display geometry requires a display description.
fn resolve_capabilities(
    descriptor: &DeviceDescriptor,
    display: Option<&DisplayConfig>,
) -> HashSet<Capability> {
    descriptor
        .capabilities
        .iter()
        .copied()
        .filter(|cap| match cap {
            Capability::Distortion => descriptor.class == DeviceClass::Hmd && display.is_some(),
            Capability::DisplayGeometry => display.is_some(),
            _ => true,
        })
        .collect()
}

// ────────────────────────────────────────────────────────────────────────────
// DeviceRegistry
// ────────────────────────────────────────────────────────────────────────────

pub struct DeviceRegistry {
    drivers: Vec<Box<dyn Driver>>,
    devices: HashMap<String, Device>,
    config: RuntimeConfig,
}

impl DeviceRegistry {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            drivers: Vec::new(),
            devices: HashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn register_driver(&mut self, driver: Box<dyn Driver>) {
        info!(driver = driver.name(), "Driver registered");
        self.drivers.push(driver);
    }

    /// Devices reachable through every registered driver, in registration
    /// order.
    pub fn list_devices(&self) -> Vec<DeviceDescriptor> {
        self.drivers.iter().flat_map(|d| d.enumerate()).collect()
    }

    /// Open `id` and start its poll loop.
    ///
    /// # Errors
    ///
    /// - [`OpenError::AlreadyOpen`] when the device is already open.
    /// - [`OpenError::UnknownDevice`] when no driver offers `id`.
    /// - [`OpenError::Io`] when the driver fails to open it.
    /// - [`OpenError::Calibration`] when its calibration is malformed; no
    ///   device is created.
    /// - [`OpenError::Spawn`] when the poll thread cannot be started.
    #[instrument(skip(self))]
    pub fn open_device(&mut self, id: &str) -> Result<&Device, OpenError> {
        if self.devices.contains_key(id) {
            return Err(OpenError::AlreadyOpen(id.to_string()));
        }

        let (driver, descriptor) = self
            .drivers
            .iter_mut()
            .find_map(|d| {
                let descriptor = d.enumerate().into_iter().find(|desc| desc.id == id)?;
                Some((d, descriptor))
            })
            .ok_or_else(|| OpenError::UnknownDevice(id.to_string()))?;

        let opened = driver.open(id)?;
        let calibration = Arc::new(CalibrationModel::from_config(&opened.calibration)?);
        let capabilities = resolve_capabilities(&descriptor, opened.display.as_ref());

        let cache = Arc::new(PoseCache::new());
        let controller = Arc::new(ControllerCache::new());
        let pipeline = PosePipeline::new(
            Arc::clone(&calibration),
            self.config.triangulator,
            self.config.fusion,
            TrackingSpace::from_config(&self.config.base_stations),
        );
        let poll = PollLoop::start(
            id,
            opened.source,
            pipeline,
            Arc::clone(&cache),
            Arc::clone(&controller),
            PollLoopConfig {
                poll_timeout: self.config.poll_timeout(),
            },
        )?;

        info!(
            device = id,
            class = %descriptor.class,
            sensors = calibration.model_points().len(),
            capabilities = capabilities.len(),
            "Device opened"
        );
        let device = Device {
            descriptor,
            calibration,
            cache,
            controller,
            capabilities,
            display: opened.display,
            poll,
        };
        Ok(self.devices.entry(id.to_string()).or_insert(device))
    }

    /// Stop the device's poll loop and forget it.  Returns `false` when the
    /// device was not open.
    #[instrument(skip(self))]
    pub fn close_device(&mut self, id: &str) -> bool {
        match self.devices.remove(id) {
            Some(mut device) => {
                device.poll.stop();
                info!(device = id, "Device closed");
                true
            }
            None => {
                warn!(device = id, "Close requested for a device that is not open");
                false
            }
        }
    }

    pub fn close_all(&mut self) {
        let ids: Vec<String> = self.devices.keys().cloned().collect();
        for id in ids {
            self.close_device(&id);
        }
    }

    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    /// Ids of all open devices, sorted.
    pub fn open_devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// # Errors
    ///
    /// [`PropertyError::UnknownDevice`] when `id` is not open.
    pub fn get_pose(&self, id: &str) -> Result<PoseSample, PropertyError> {
        Ok(self.open(id)?.pose())
    }

    /// # Errors
    ///
    /// [`PropertyError::UnknownDevice`] when `id` is not open.
    pub fn reader(&self, id: &str) -> Result<PoseReader, PropertyError> {
        Ok(self.open(id)?.reader())
    }

    /// Latest button state; `Ok(None)` before the first report.
    ///
    /// # Errors
    ///
    /// [`PropertyError::UnknownDevice`] when `id` is not open, or
    /// [`PropertyError::Unsupported`] when the device has no buttons.
    pub fn controller_state(&self, id: &str) -> Result<Option<ControllerState>, PropertyError> {
        let device = self.open(id)?;
        if !device.has_capability(Capability::Buttons) {
            return Err(PropertyError::Unsupported {
                device: id.to_string(),
                property: "buttons".to_string(),
            });
        }
        Ok(device.controller_state())
    }

    /// Open devices whose pose has not been published within `max_age`,
    /// including those that never published.
    pub fn stale_devices(&self, max_age: Duration) -> Vec<String> {
        let mut ids: Vec<String> = self
            .devices
            .values()
            .filter(|d| d.health(max_age) != PoseHealth::Fresh)
            .map(|d| d.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// # Errors
    ///
    /// [`PropertyError::UnknownDevice`] for a device that is not open, then
    /// the errors of [`PropertySource::read_float`].
    pub fn get_float_property(
        &self,
        id: &str,
        kind: FloatProperty,
        out: &mut [f32],
    ) -> Result<usize, PropertyError> {
        self.open(id)?.float_property(kind, out)
    }

    /// # Errors
    ///
    /// [`PropertyError::UnknownDevice`] for a device that is not open, then
    /// the errors of [`PropertySource::read_int`].
    pub fn get_int_property(
        &self,
        id: &str,
        kind: IntProperty,
        out: &mut [i32],
    ) -> Result<usize, PropertyError> {
        self.open(id)?.int_property(kind, out)
    }

    fn open(&self, id: &str) -> Result<&Device, PropertyError> {
        self.devices
            .get(id)
            .ok_or_else(|| PropertyError::UnknownDevice(id.to_string()))
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::Sender;
    use parking_lot::Mutex;
    use std::thread;
    use std::time::Instant;
    use sweeptrack_hal::driver::DriverDevice;
    use sweeptrack_hal::sim::{SimDriver, sim_calibration};
    use sweeptrack_hal::source::ChannelSource;
    use sweeptrack_types::{
        CalibrationConfig, CalibrationError, DeviceIoError, SensorFrame, TrackingResult,
    };

    // ------------------------------------------------------------------
    // Test doubles
    // ------------------------------------------------------------------

    /// Driver whose devices are fed by the test through channels.
    struct ChannelDriver {
        devices: Vec<(DeviceDescriptor, CalibrationConfig)>,
        senders: Arc<Mutex<Vec<Sender<SensorFrame>>>>,
    }

    impl ChannelDriver {
        fn new() -> (Self, Arc<Mutex<Vec<Sender<SensorFrame>>>>) {
            let senders = Arc::new(Mutex::new(Vec::new()));
            let driver = Self {
                devices: Vec::new(),
                senders: Arc::clone(&senders),
            };
            (driver, senders)
        }

        fn with(mut self, id: &str, class: DeviceClass, calibration: CalibrationConfig) -> Self {
            self.devices.push((
                DeviceDescriptor {
                    id: id.to_string(),
                    class,
                    vendor: "Test".to_string(),
                    product: "Channel".to_string(),
                    driver: "channel".to_string(),
                    capabilities: vec![
                        Capability::PositionalTracking,
                        Capability::RotationalTracking,
                        Capability::Distortion,
                    ],
                    button_count: 0,
                },
                calibration,
            ));
            self
        }
    }

    impl Driver for ChannelDriver {
        fn name(&self) -> &str {
            "channel"
        }

        fn enumerate(&self) -> Vec<DeviceDescriptor> {
            self.devices.iter().map(|(d, _)| d.clone()).collect()
        }

        fn open(&mut self, id: &str) -> Result<DriverDevice, DeviceIoError> {
            let (_, calibration) = self
                .devices
                .iter()
                .find(|(d, _)| d.id == id)
                .ok_or_else(|| DeviceIoError::NotFound(id.to_string()))?;
            let (tx, source) = ChannelSource::pair(id);
            self.senders.lock().push(tx);
            Ok(DriverDevice {
                source: Box::new(source),
                calibration: calibration.clone(),
                display: None,
            })
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn sim_registry() -> DeviceRegistry {
        let mut registry = DeviceRegistry::new(RuntimeConfig::default());
        registry.register_driver(Box::new(
            SimDriver::builder()
                .with_hmd("hmd0")
                .with_controller("ctl0")
                .with_tracker("trk0")
                .with_rate_hz(200.0)
                .build(),
        ));
        registry
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[test]
    fn lists_devices_across_drivers() {
        let mut registry = sim_registry();
        let (driver, _) = ChannelDriver::new();
        registry.register_driver(Box::new(driver.with(
            "chan0",
            DeviceClass::Tracker,
            sim_calibration(DeviceClass::Tracker),
        )));

        let ids: Vec<String> = registry.list_devices().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["hmd0", "ctl0", "trk0", "chan0"]);
    }

    #[test]
    fn sim_hmd_reaches_running_pose() {
        let mut registry = sim_registry();
        let device = registry.open_device("hmd0").unwrap();
        assert!(device.has_capability(Capability::Distortion));
        assert!(device.has_capability(Capability::DisplayGeometry));

        assert!(wait_for(|| registry.get_pose("hmd0").unwrap().valid));
        let pose = registry.get_pose("hmd0").unwrap();
        assert_eq!(pose.tracking_result, TrackingResult::Running);
        assert!((pose.position.z - 2.0).abs() < 1e-2, "z={}", pose.position.z);

        let mut pos = [0.0f32; 3];
        assert_eq!(
            registry.get_float_property("hmd0", FloatProperty::PositionVector, &mut pos),
            Ok(3)
        );
        assert!((pos[2] - 2.0).abs() < 1e-2);

        let mut k = [0.0f32; 6];
        registry
            .get_float_property("hmd0", FloatProperty::DistortionK, &mut k)
            .unwrap();
        assert_eq!(k, DisplayConfig::htc_vive().distortion.unwrap());

        let mut code = [0i32];
        registry
            .get_int_property("hmd0", IntProperty::TrackingResult, &mut code)
            .unwrap();
        assert_eq!(code[0], TrackingResult::Running.code());
    }

    #[test]
    fn zero_size_query_writes_nothing() {
        let mut registry = sim_registry();
        registry.open_device("hmd0").unwrap();
        let mut empty: [f32; 0] = [];
        assert_eq!(
            registry.get_float_property("hmd0", FloatProperty::RotationQuat, &mut empty),
            Ok(4)
        );
        assert_eq!(
            registry.get_float_property("hmd0", FloatProperty::DistortionK, &mut empty),
            Ok(6)
        );
    }

    #[test]
    fn capabilities_gate_queries() {
        let mut registry = sim_registry();
        registry.open_device("trk0").unwrap();
        registry.open_device("ctl0").unwrap();

        let mut k = [0.0f32; 6];
        assert!(matches!(
            registry.get_float_property("trk0", FloatProperty::DistortionK, &mut k),
            Err(PropertyError::Unsupported { .. })
        ));
        assert!(matches!(
            registry.controller_state("trk0"),
            Err(PropertyError::Unsupported { .. })
        ));

        let mut n = [0i32];
        registry
            .get_int_property("ctl0", IntProperty::DigitalButtonCount, &mut n)
            .unwrap();
        assert_eq!(n[0], 4);
        assert!(wait_for(|| matches!(registry.controller_state("ctl0"), Ok(Some(_)))));
    }

    #[test]
    fn distortion_is_hmd_only() {
        let mut registry = DeviceRegistry::new(RuntimeConfig::default());
        let (driver, _senders) = ChannelDriver::new();
        registry.register_driver(Box::new(driver.with(
            "chan0",
            DeviceClass::Tracker,
            sim_calibration(DeviceClass::Tracker),
        )));
        let device = registry.open_device("chan0").unwrap();
        assert!(!device.has_capability(Capability::Distortion));
        assert!(device.has_capability(Capability::PositionalTracking));
    }

    #[test]
    fn open_errors() {
        let mut registry = sim_registry();
        assert_eq!(
            registry.open_device("ghost").err(),
            Some(OpenError::UnknownDevice("ghost".to_string()))
        );
        registry.open_device("hmd0").unwrap();
        assert_eq!(
            registry.open_device("hmd0").err(),
            Some(OpenError::AlreadyOpen("hmd0".to_string()))
        );
    }

    #[test]
    fn bad_calibration_creates_no_device() {
        let mut bad = sim_calibration(DeviceClass::Tracker);
        bad.angle_range_h = [120.0, 30.0];
        let mut registry = DeviceRegistry::new(RuntimeConfig::default());
        let (driver, _senders) = ChannelDriver::new();
        registry.register_driver(Box::new(driver.with("chan0", DeviceClass::Tracker, bad)));

        assert!(matches!(
            registry.open_device("chan0"),
            Err(OpenError::Calibration(CalibrationError::InvalidField { .. }))
        ));
        assert!(registry.device("chan0").is_none());
        assert_eq!(
            registry.get_pose("chan0"),
            Err(PropertyError::UnknownDevice("chan0".to_string()))
        );
    }

    #[test]
    fn disconnect_marks_pose_uninitialized() {
        let mut registry = DeviceRegistry::new(RuntimeConfig::default());
        let (driver, senders) = ChannelDriver::new();
        let calibration = sim_calibration(DeviceClass::Tracker);
        let model = CalibrationModel::from_config(&calibration).unwrap();
        registry.register_driver(Box::new(driver.with("chan0", DeviceClass::Tracker, calibration)));
        registry.open_device("chan0").unwrap();

        let pose = nalgebra::Isometry3::translation(0.2, 0.0, 1.8);
        senders.lock()[0]
            .send(SensorFrame::from_angles(0.5, model.synthesize(&pose, 0, 0.5)))
            .unwrap();
        assert!(wait_for(|| registry.get_pose("chan0").unwrap().valid));

        senders.lock().clear();
        assert!(wait_for(|| {
            registry.device("chan0").map(Device::poll_state) == Some(LoopState::Stopped)
        }));
        let s = registry.get_pose("chan0").unwrap();
        assert!(!s.valid);
        assert_eq!(s.tracking_result, TrackingResult::Uninitialized);
        assert!((s.position.x - 0.2).abs() < 1e-2);
    }

    #[test]
    fn silent_device_is_stale() {
        let mut registry = DeviceRegistry::new(RuntimeConfig::default());
        let (driver, _senders) = ChannelDriver::new();
        registry.register_driver(Box::new(driver.with(
            "chan0",
            DeviceClass::Tracker,
            sim_calibration(DeviceClass::Tracker),
        )));
        registry.open_device("chan0").unwrap();
        assert_eq!(
            registry.stale_devices(Duration::from_millis(100)),
            vec!["chan0".to_string()]
        );
    }

    #[test]
    fn close_device_forgets_it() {
        let mut registry = sim_registry();
        registry.open_device("hmd0").unwrap();
        assert_eq!(registry.open_devices(), vec!["hmd0".to_string()]);
        assert!(registry.close_device("hmd0"));
        assert!(!registry.close_device("hmd0"));
        assert!(matches!(
            registry.get_pose("hmd0"),
            Err(PropertyError::UnknownDevice(_))
        ));

        registry.open_device("hmd0").unwrap();
        registry.open_device("ctl0").unwrap();
        registry.close_all();
        assert!(registry.open_devices().is_empty());
    }

    #[test]
    fn runtime_config_defaults_fill_missing_fields() {
        let cfg: RuntimeConfig = serde_json::from_str(r#"{"stale_after_ms": 250}"#).unwrap();
        assert_eq!(cfg.stale_after(), Duration::from_millis(250));
        assert_eq!(cfg.poll_timeout(), Duration::from_millis(10));
        assert_eq!(cfg.triangulator, TriangulatorConfig::default());
        assert!(cfg.base_stations.is_empty());
    }
}
