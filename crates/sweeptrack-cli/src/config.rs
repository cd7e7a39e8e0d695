//! Configuration vault – reads/writes `~/.sweeptrack/config.toml`.

use nalgebra::{Isometry3, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use sweeptrack_hal::sim::{SimDevice, SimDriver, SimMotion};
use sweeptrack_runtime::RuntimeConfig;
use sweeptrack_types::{CalibrationConfig, DeviceClass};

/// Persisted CLI configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub sim: SimConfig,
}

/// Devices offered by the built-in simulator driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default = "default_rate_hz")]
    pub rate_hz: f64,
    #[serde(default = "default_imu_per_frame")]
    pub imu_per_frame: u32,
    #[serde(default)]
    pub devices: Vec<SimDeviceEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimDeviceEntry {
    pub id: String,
    pub class: DeviceClass,
    /// Position in tracking space (metres).
    #[serde(default = "default_position")]
    pub position: [f64; 3],
    /// Turn rate about +Y; the device is static when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spin_rad_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop_every: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnect_after: Option<u64>,
    /// JSON calibration payload replacing the built-in sensor layout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_file: Option<PathBuf>,
}

fn default_rate_hz() -> f64 {
    60.0
}
fn default_imu_per_frame() -> u32 {
    4
}
fn default_position() -> [f64; 3] {
    [0.0, 0.0, 2.0]
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            rate_hz: default_rate_hz(),
            imu_per_frame: default_imu_per_frame(),
            devices: vec![
                SimDeviceEntry {
                    id: "hmd0".to_string(),
                    class: DeviceClass::Hmd,
                    position: default_position(),
                    spin_rad_s: None,
                    drop_every: None,
                    disconnect_after: None,
                    calibration_file: None,
                },
                SimDeviceEntry {
                    id: "ctl0".to_string(),
                    class: DeviceClass::Controller,
                    position: [0.2, -0.3, 1.6],
                    spin_rad_s: Some(0.5),
                    drop_every: None,
                    disconnect_after: None,
                    calibration_file: None,
                },
            ],
        }
    }
}

impl SimDeviceEntry {
    pub fn to_sim_device(&self) -> Result<SimDevice, String> {
        let device = match self.class {
            DeviceClass::Hmd => SimDevice::hmd(&self.id),
            DeviceClass::Controller => SimDevice::controller(&self.id),
            DeviceClass::Tracker => SimDevice::tracker(&self.id),
        };
        let [x, y, z] = self.position;
        let motion = match self.spin_rad_s {
            Some(rate_rad_s) => SimMotion::Spin {
                position: Vector3::new(x, y, z),
                rate_rad_s,
            },
            None => SimMotion::Static(Isometry3::translation(x, y, z)),
        };
        let mut device = device.motion(motion);
        if let Some(n) = self.drop_every {
            device = device.drop_every(n);
        }
        if let Some(n) = self.disconnect_after {
            device = device.disconnect_after(n);
        }
        if let Some(path) = &self.calibration_file {
            device = device.calibration(load_calibration(path).map_err(|e| {
                format!("Device {}: {}", self.id, e)
            })?);
        }
        Ok(device)
    }
}

/// Read a JSON calibration payload from `path`.
pub fn load_calibration(path: &Path) -> Result<CalibrationConfig, String> {
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read calibration at {}: {}", path.display(), e))?;
    CalibrationConfig::from_json(&raw).map_err(|e| format!("{} ({})", e, path.display()))
}

impl Config {
    /// The simulator driver described by this config.  Base stations are
    /// shared with the runtime so both agree on tracking space.
    pub fn sim_driver(&self) -> Result<SimDriver, String> {
        let mut builder = SimDriver::builder()
            .with_rate_hz(self.sim.rate_hz)
            .with_imu_per_frame(self.sim.imu_per_frame);
        for station in &self.runtime.base_stations {
            builder = builder.with_station(*station);
        }
        for entry in &self.sim.devices {
            builder = builder.with_device(entry.to_sim_device()?);
        }
        Ok(builder.build())
    }
}

/// Return the path to `~/.sweeptrack/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".sweeptrack").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `SWEEPTRACK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SWEEPTRACK_POLL_TIMEOUT_MS` | `runtime.poll_timeout_ms` |
/// | `SWEEPTRACK_STALE_AFTER_MS` | `runtime.stale_after_ms` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("SWEEPTRACK_POLL_TIMEOUT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.runtime.poll_timeout_ms = ms;
    }
    if let Ok(v) = std::env::var("SWEEPTRACK_STALE_AFTER_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.runtime.stale_after_ms = ms;
    }
}

/// Save the config to disk, creating `~/.sweeptrack/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sweeptrack_hal::driver::Driver;
    use sweeptrack_hal::sim::sim_calibration;
    use sweeptrack_runtime::DeviceRegistry;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("dir")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");
        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.sim, SimConfig::default());
        assert_eq!(loaded.runtime.triangulator, RuntimeConfig::default().triangulator);
        assert_eq!(loaded.runtime.fusion, RuntimeConfig::default().fusion);
    }

    #[test]
    fn config_path_points_to_sweeptrack_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".sweeptrack"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn partial_file_takes_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [runtime]
            stale_after_ms = 200

            [[sim.devices]]
            id = "trk7"
            class = "tracker"
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.runtime.stale_after_ms, 200);
        assert_eq!(cfg.runtime.poll_timeout_ms, 10);
        assert_eq!(cfg.sim.rate_hz, 60.0);
        assert_eq!(cfg.sim.devices.len(), 1);
        assert_eq!(cfg.sim.devices[0].position, [0.0, 0.0, 2.0]);
    }

    #[test]
    fn sim_driver_offers_configured_devices() {
        let driver = Config::default().sim_driver().expect("driver");
        let ids: Vec<String> = driver.enumerate().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["hmd0", "ctl0"]);
        assert_eq!(driver.stations().len(), 1);
    }

    #[test]
    fn spin_entry_maps_to_spin_motion() {
        let entry = SimDeviceEntry {
            id: "t".to_string(),
            class: DeviceClass::Tracker,
            position: [1.0, 2.0, 3.0],
            spin_rad_s: Some(0.25),
            drop_every: Some(5),
            disconnect_after: None,
            calibration_file: None,
        };
        let device = entry.to_sim_device().expect("device");
        assert_eq!(
            device.motion,
            SimMotion::Spin {
                position: Vector3::new(1.0, 2.0, 3.0),
                rate_rad_s: 0.25
            }
        );
        assert_eq!(device.drop_every, Some(5));
        assert_eq!(device.descriptor.class, DeviceClass::Tracker);
    }

    fn entry_with_calibration(path: PathBuf) -> SimDeviceEntry {
        SimDeviceEntry {
            id: "trk1".to_string(),
            class: DeviceClass::Tracker,
            position: default_position(),
            spin_rad_s: None,
            drop_every: None,
            disconnect_after: None,
            calibration_file: Some(path),
        }
    }

    #[test]
    fn calibration_file_replaces_builtin_layout() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("trk1.json");
        let mut calibration = sim_calibration(DeviceClass::Tracker);
        calibration.model_points.truncate(6);
        calibration.ticks_per_degree = 1000.0;
        std::fs::write(&path, serde_json::to_string(&calibration).expect("json")).expect("write");

        let device = entry_with_calibration(path).to_sim_device().expect("device");
        assert_eq!(device.calibration, calibration);
    }

    #[test]
    fn malformed_calibration_file_names_the_device() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"model_points": [[0, 0, 0]]}"#).expect("write");

        let mut cfg = Config::default();
        cfg.sim.devices.push(entry_with_calibration(path));
        let err = cfg.sim_driver().err().expect("missing fields");
        assert!(err.contains("trk1"), "{err}");
        assert!(err.contains("Malformed calibration payload"), "{err}");
        assert!(err.contains("angle_range_h"), "{err}");
    }

    #[test]
    fn missing_calibration_file_is_reported() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let err = entry_with_calibration(dir.path().join("absent.json"))
            .to_sim_device()
            .expect_err("no file");
        assert!(err.contains("Failed to read calibration"), "{err}");
    }

    #[test]
    fn invalid_calibration_file_blocks_open() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("flipped.json");
        let mut calibration = sim_calibration(DeviceClass::Tracker);
        calibration.angle_range_h = [156.0, 32.0];
        std::fs::write(&path, serde_json::to_string(&calibration).expect("json")).expect("write");

        let mut cfg = Config::default();
        cfg.sim.devices = vec![entry_with_calibration(path)];
        let mut registry = DeviceRegistry::new(cfg.runtime.clone());
        registry.register_driver(Box::new(cfg.sim_driver().expect("driver")));

        let err = registry.open_device("trk1").err().expect("invalid range");
        assert!(err.to_string().contains("angle_range_h"), "{err}");
        assert!(registry.open_devices().is_empty());
    }

    #[test]
    fn apply_env_overrides_changes_timeouts() {
        // SAFETY: no other test in this crate reads these variables.
        unsafe {
            std::env::set_var("SWEEPTRACK_POLL_TIMEOUT_MS", "25");
            std::env::set_var("SWEEPTRACK_STALE_AFTER_MS", "not-a-number");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.runtime.poll_timeout_ms, 25);
        assert_eq!(cfg.runtime.stale_after_ms, 500);
        unsafe {
            std::env::remove_var("SWEEPTRACK_POLL_TIMEOUT_MS");
            std::env::remove_var("SWEEPTRACK_STALE_AFTER_MS");
        }
    }
}
