//! Sensor Fusion Engine.
//!
//! Combines low-rate absolute fixes (triangulated or externally supplied
//! poses) with a high-rate IMU stream into a single orientation + position
//! estimate using a complementary filter.
//!
//! The filter blends:
//! - **Absolute fixes** – globally consistent position and orientation, but
//!   only as often as the base stations sweep and only while enough sensors
//!   are visible.
//! - **IMU** – gyroscope angular rate integrated with the device-reported
//!   `dt`; high-frequency and locally accurate but drifting over time.  The
//!   accelerometer pulls the tilt back toward gravity whenever the device is
//!   not accelerating.
//!
//! On every fix the orientation becomes
//! ```text
//! q = slerp(q_imu, q_fix, α_eff),   α_eff = α + (1 − α) · min(window / trust, 1)
//! ```
//! where `window` is the IMU-only time accumulated since the previous fix, so
//! the longer the gyro ran alone the more the fix is trusted.
//!
//! # Example
//!
//! ```rust
//! use nalgebra::Isometry3;
//! use sweeptrack_perception::fusion::{FusionConfig, SensorFusion};
//! use sweeptrack_types::TrackingResult;
//!
//! let mut fusion = SensorFusion::new(FusionConfig::default());
//! fusion.correct(&Isometry3::translation(1.0, 0.0, 0.5), 0.0);
//!
//! let est = fusion.estimate(0.1);
//! assert!(est.valid);
//! assert_eq!(est.tracking_result, TrackingResult::Running);
//! assert!((est.position.x - 1.0).abs() < 1e-9);
//! ```

use nalgebra::{Isometry3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use sweeptrack_types::{FusionTimeout, ImuSample, TrackingResult};

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Base weight of an absolute fix against the IMU orientation (0–1).
    pub alpha: f64,
    /// IMU-only time after which a fix is trusted completely (seconds).
    pub imu_trust_window_s: f64,
    /// Time without a fix after which tracking falls back to IMU only
    /// (seconds).
    pub timeout_s: f64,
    /// Proportional gain of the accelerometer tilt correction (1/s).
    pub accel_gain: f64,
    /// Magnitude of gravity (m/s²).
    pub gravity: f64,
    /// Fraction of `gravity` by which `|accel|` may deviate for the sample to
    /// be used as a tilt reference.
    pub gravity_tolerance: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            imu_trust_window_s: 0.5,
            timeout_s: 0.25,
            accel_gain: 0.5,
            gravity: 9.80665,
            gravity_tolerance: 0.1,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Output type
// ────────────────────────────────────────────────────────────────────────────

/// The fused state estimate produced by [`SensorFusion`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusedEstimate {
    /// Tracking-space position (metres).
    pub position: Vector3<f64>,
    /// Device → tracking-space rotation.
    pub orientation: UnitQuaternion<f64>,
    pub valid: bool,
    pub tracking_result: TrackingResult,
}

// ────────────────────────────────────────────────────────────────────────────
// SensorFusion
// ────────────────────────────────────────────────────────────────────────────

/// Complementary filter over absolute fixes and IMU samples.
///
/// Feed inertial data through [`SensorFusion::integrate_imu`] and absolute
/// poses through [`SensorFusion::correct`], then call
/// [`SensorFusion::estimate`] with the current time.
#[derive(Debug, Clone)]
pub struct SensorFusion {
    config: FusionConfig,
    orientation: UnitQuaternion<f64>,
    position: Vector3<f64>,
    last_fix_time: Option<f64>,
    /// IMU-only integration time since the last fix.
    imu_window_s: f64,
    imu_seen: bool,
    imu_since_fix: bool,
}

impl SensorFusion {
    /// Create a new fusion engine.  `alpha` is clamped to `[0, 1]`.
    pub fn new(mut config: FusionConfig) -> Self {
        config.alpha = config.alpha.clamp(0.0, 1.0);
        Self {
            config,
            orientation: UnitQuaternion::identity(),
            position: Vector3::zeros(),
            last_fix_time: None,
            imu_window_s: 0.0,
            imu_seen: false,
            imu_since_fix: false,
        }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Forget all state, as after a device reconnect.
    pub fn reset(&mut self) {
        *self = Self::new(self.config);
    }

    /// Propagate the orientation by one IMU sample.
    ///
    /// Samples with a non-finite or non-positive `dt`, or a non-finite rate,
    /// are ignored.
    pub fn integrate_imu(&mut self, sample: &ImuSample) {
        let dt = f64::from(sample.dt);
        if !dt.is_finite() || dt <= 0.0 {
            return;
        }
        let mut omega = Vector3::from(sample.gyro.map(f64::from));
        if !omega.iter().all(|w| w.is_finite()) {
            return;
        }

        let accel = Vector3::from(sample.accel.map(f64::from));
        let magnitude = accel.norm();
        if magnitude.is_finite()
            && (magnitude - self.config.gravity).abs()
                <= self.config.gravity_tolerance * self.config.gravity
        {
            let measured_up = accel / magnitude;
            let predicted_up = self.orientation.inverse() * Vector3::y();
            omega += measured_up.cross(&predicted_up) * self.config.accel_gain;
        }

        self.orientation *= UnitQuaternion::from_scaled_axis(omega * dt);
        self.orientation.renormalize();
        self.imu_window_s += dt;
        self.imu_seen = true;
        self.imu_since_fix = true;
    }

    /// Apply an absolute fix (device → tracking space) observed at `time`.
    ///
    /// The fix position is taken as is.  The orientation is adopted directly
    /// for the first fix or when no IMU data arrived since the previous one;
    /// otherwise it is blended with the IMU orientation.
    pub fn correct(&mut self, fix: &Isometry3<f64>, time: f64) {
        self.position = fix.translation.vector;

        if self.last_fix_time.is_none() || !self.imu_since_fix {
            self.orientation = fix.rotation;
        } else {
            let trust = if self.config.imu_trust_window_s > 0.0 {
                (self.imu_window_s / self.config.imu_trust_window_s).min(1.0)
            } else {
                1.0
            };
            let weight = self.config.alpha + (1.0 - self.config.alpha) * trust;
            self.orientation = self
                .orientation
                .try_slerp(&fix.rotation, weight, 1e-9)
                .unwrap_or(fix.rotation);
        }

        self.last_fix_time = Some(time);
        self.imu_window_s = 0.0;
        self.imu_since_fix = false;
    }

    /// Current estimate and its tracking state at `now`.
    pub fn estimate(&self, now: f64) -> FusedEstimate {
        let (valid, tracking_result) = match self.last_fix_time {
            None if self.imu_seen => (false, TrackingResult::Calibrating),
            None => (false, TrackingResult::Uninitialized),
            Some(t) if now - t <= self.config.timeout_s => (true, TrackingResult::Running),
            Some(_) => (self.imu_since_fix, TrackingResult::Fallback),
        };
        FusedEstimate {
            position: self.position,
            orientation: self.orientation,
            valid,
            tracking_result,
        }
    }

    /// # Errors
    ///
    /// Returns [`FusionTimeout`] when the last absolute fix is older than
    /// `timeout_s`.  A filter that was never fixed has nothing to time out.
    pub fn check_timeout(&self, now: f64) -> Result<(), FusionTimeout> {
        match self.last_fix_time {
            Some(t) if now - t > self.config.timeout_s => Err(FusionTimeout { elapsed_s: now - t }),
            _ => Ok(()),
        }
    }

    pub fn last_fix_time(&self) -> Option<f64> {
        self.last_fix_time
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Translation3;

    fn gyro(wx: f32, wy: f32, wz: f32, dt: f32) -> ImuSample {
        ImuSample {
            gyro: [wx, wy, wz],
            accel: [0.0, 0.0, 0.0],
            dt,
            time: 0.0,
        }
    }

    fn at_rest(accel: [f32; 3], dt: f32) -> ImuSample {
        ImuSample {
            gyro: [0.0, 0.0, 0.0],
            accel,
            dt,
            time: 0.0,
        }
    }

    fn fix(yaw: f64) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::new(0.5, 1.2, -0.3),
            UnitQuaternion::from_euler_angles(0.0, yaw, 0.0),
        )
    }

    #[test]
    fn no_measurements_is_uninitialized() {
        let fusion = SensorFusion::new(FusionConfig::default());
        let est = fusion.estimate(1.0);
        assert!(!est.valid);
        assert_eq!(est.tracking_result, TrackingResult::Uninitialized);
        assert_eq!(est.orientation, UnitQuaternion::identity());
    }

    #[test]
    fn imu_only_is_calibrating() {
        let mut fusion = SensorFusion::new(FusionConfig::default());
        fusion.integrate_imu(&gyro(0.0, 1.0, 0.0, 0.01));
        let est = fusion.estimate(0.01);
        assert!(!est.valid);
        assert_eq!(est.tracking_result, TrackingResult::Calibrating);
    }

    #[test]
    fn gyro_integration_uses_device_dt() {
        let mut fusion = SensorFusion::new(FusionConfig::default());
        for _ in 0..100 {
            fusion.integrate_imu(&gyro(0.0, 1.0, 0.0, 0.01));
        }
        let angle = fusion.estimate(1.0).orientation.angle();
        assert!((angle - 1.0).abs() < 1e-5, "angle={angle}");
    }

    #[test]
    fn invalid_dt_is_ignored() {
        let mut fusion = SensorFusion::new(FusionConfig::default());
        fusion.integrate_imu(&gyro(0.0, 10.0, 0.0, -0.5));
        fusion.integrate_imu(&gyro(0.0, 10.0, 0.0, 0.0));
        fusion.integrate_imu(&gyro(0.0, 10.0, 0.0, f32::NAN));
        let est = fusion.estimate(0.0);
        assert_eq!(est.orientation, UnitQuaternion::identity());
        assert_eq!(est.tracking_result, TrackingResult::Uninitialized);
    }

    #[test]
    fn first_fix_is_adopted() {
        let mut fusion = SensorFusion::new(FusionConfig::default());
        fusion.integrate_imu(&gyro(0.3, 0.0, 0.0, 0.1));
        fusion.correct(&fix(0.7), 0.1);

        let est = fusion.estimate(0.1);
        assert!(est.valid);
        assert_eq!(est.tracking_result, TrackingResult::Running);
        assert!(est.orientation.angle_to(&fix(0.7).rotation) < 1e-12);
        assert!((est.position - Vector3::new(0.5, 1.2, -0.3)).norm() < 1e-12);
    }

    #[test]
    fn fix_blends_with_imu_orientation() {
        let mut fusion = SensorFusion::new(FusionConfig {
            alpha: 0.5,
            imu_trust_window_s: 1.0,
            ..FusionConfig::default()
        });
        fusion.correct(&fix(0.0), 0.0);
        // 0.1 s of IMU rotating at 0 rad/s: orientation stays at yaw 0.
        fusion.integrate_imu(&gyro(0.0, 0.0, 0.0, 0.1));
        fusion.correct(&fix(0.4), 0.1);

        // α_eff = 0.5 + 0.5 * 0.1 = 0.55 → yaw = 0.22.
        let yaw = fusion.estimate(0.1).orientation.euler_angles().1;
        assert!((yaw - 0.22).abs() < 1e-9, "yaw={yaw}");
    }

    #[test]
    fn fix_without_intervening_imu_is_adopted() {
        let mut fusion = SensorFusion::new(FusionConfig::default());
        fusion.correct(&fix(0.0), 0.0);
        fusion.correct(&fix(0.4), 0.1);
        let yaw = fusion.estimate(0.1).orientation.euler_angles().1;
        assert!((yaw - 0.4).abs() < 1e-9);
    }

    #[test]
    fn timeout_falls_back_to_imu_and_holds_position() {
        let mut fusion = SensorFusion::new(FusionConfig::default());
        fusion.correct(&fix(0.0), 0.0);
        assert!(fusion.check_timeout(0.2).is_ok());

        // Stale and no IMU since the fix: nothing to offer.
        let est = fusion.estimate(0.5);
        assert_eq!(est.tracking_result, TrackingResult::Fallback);
        assert!(!est.valid);
        let err = fusion.check_timeout(0.5).unwrap_err();
        assert!((err.elapsed_s - 0.5).abs() < 1e-12);

        fusion.integrate_imu(&gyro(0.0, 1.0, 0.0, 0.1));
        let est = fusion.estimate(0.6);
        assert_eq!(est.tracking_result, TrackingResult::Fallback);
        assert!(est.valid);
        assert!((est.position - Vector3::new(0.5, 1.2, -0.3)).norm() < 1e-12);
        assert!(est.orientation.angle() > 0.05);
    }

    #[test]
    fn accelerometer_pulls_tilt_toward_gravity() {
        let mut fusion = SensorFusion::new(FusionConfig {
            accel_gain: 2.0,
            ..FusionConfig::default()
        });
        // Start with a 0.2 rad roll error while the device is actually level.
        fusion.correct(
            &Isometry3::from_parts(
                Translation3::identity(),
                UnitQuaternion::from_euler_angles(0.0, 0.0, 0.2),
            ),
            0.0,
        );
        for _ in 0..200 {
            fusion.integrate_imu(&at_rest([0.0, 9.81, 0.0], 0.01));
        }
        let tilt = fusion.estimate(0.0).orientation.angle();
        assert!(tilt < 0.01, "tilt={tilt}");
    }

    #[test]
    fn accelerating_device_gets_no_tilt_correction() {
        let mut fusion = SensorFusion::new(FusionConfig::default());
        for _ in 0..100 {
            fusion.integrate_imu(&at_rest([5.0, 15.0, 0.0], 0.01));
        }
        assert!(fusion.estimate(0.0).orientation.angle() < 1e-12);
    }

    #[test]
    fn alpha_clamped_to_unit_interval() {
        let high = SensorFusion::new(FusionConfig {
            alpha: 5.0,
            ..FusionConfig::default()
        });
        assert!((high.config().alpha - 1.0).abs() < 1e-12);

        let low = SensorFusion::new(FusionConfig {
            alpha: -1.0,
            ..FusionConfig::default()
        });
        assert!(low.config().alpha.abs() < 1e-12);
    }

    #[test]
    fn reset_forgets_fix() {
        let mut fusion = SensorFusion::new(FusionConfig::default());
        fusion.correct(&fix(0.3), 0.0);
        fusion.reset();
        assert_eq!(fusion.last_fix_time(), None);
        assert_eq!(fusion.estimate(0.0).tracking_result, TrackingResult::Uninitialized);
    }
}
