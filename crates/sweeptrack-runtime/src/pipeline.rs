//! [`PosePipeline`] – per-frame processing, free of threads and locks.
//!
//! One call to [`PosePipeline::process`] takes a [`SensorFrame`] through the
//! whole chain:
//!
//! 1. IMU samples are integrated by [`SensorFusion`].
//! 2. Angle measurements pass through the [`AngleSampleBuffer`], are
//!    normalized by the [`CalibrationModel`], triangulated, moved into
//!    tracking space, and applied as an absolute fix.
//! 3. An external 6DOF pose, if present, is applied as a fix directly.
//! 4. Button masks go through the edge tracker.
//!
//! A frame whose triangulation fails yields a `valid = false` sample while
//! the previous fix is still within the fusion timeout; the pose cache keeps
//! the last known pose for it.  Past the timeout the frame is treated like
//! any other inertial-only frame and reports `Fallback`.

use std::sync::Arc;

use nalgebra::{Isometry3, Translation3};
use sweeptrack_hal::controller::ButtonTracker;
use sweeptrack_perception::angles::AngleSampleBuffer;
use sweeptrack_perception::calibration::CalibrationModel;
use sweeptrack_perception::fusion::{FusionConfig, SensorFusion};
use sweeptrack_perception::transform::{to_isometry, to_pose, TrackingSpace};
use sweeptrack_perception::triangulate::{Triangulation, Triangulator, TriangulatorConfig};
use sweeptrack_types::{
    ControllerState, PoseSample, SensorFrame, TrackingResult, TriangulationError,
};
use tracing::{debug, info};

/// Result of processing one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutcome {
    pub sample: PoseSample,
    pub controller: Option<ControllerState>,
    /// `None` when the frame carried no angle measurements.
    pub triangulation: Option<Result<Triangulation, TriangulationError>>,
}

pub struct PosePipeline {
    calibration: Arc<CalibrationModel>,
    buffer: AngleSampleBuffer,
    triangulator: Triangulator,
    space: TrackingSpace,
    fusion: SensorFusion,
    buttons: ButtonTracker,
    timed_out: bool,
}

impl PosePipeline {
    pub fn new(
        calibration: Arc<CalibrationModel>,
        triangulator: TriangulatorConfig,
        fusion: FusionConfig,
        space: TrackingSpace,
    ) -> Self {
        Self {
            calibration,
            buffer: AngleSampleBuffer::new(),
            triangulator: Triangulator::new(triangulator),
            space,
            fusion: SensorFusion::new(fusion),
            buttons: ButtonTracker::new(),
            timed_out: false,
        }
    }

    pub fn process(&mut self, frame: &SensorFrame) -> FrameOutcome {
        for imu in &frame.imu {
            self.fusion.integrate_imu(imu);
        }

        let mut failed = false;
        let triangulation = if frame.angles.is_empty() {
            None
        } else {
            self.buffer.extend(frame.angles.iter().copied());
            let observations = self.buffer.drain(&self.calibration);
            match self.triangulator.solve_frame(&observations) {
                Ok(fix) => {
                    let pose = self.space.to_tracking(fix.base_station, &fix.pose);
                    self.fusion.correct(&pose, frame.timestamp);
                    Some(Ok(fix))
                }
                Err(e) => {
                    debug!(error = %e, timestamp = frame.timestamp, "Triangulation failed");
                    failed = true;
                    Some(Err(e))
                }
            }
        };

        if let Some(external) = &frame.external_pose {
            self.fusion.correct(&to_isometry(external), frame.timestamp);
            failed = false;
        }

        match self.fusion.check_timeout(frame.timestamp) {
            Err(timeout) if !self.timed_out => {
                info!(elapsed_s = timeout.elapsed_s, "Absolute tracking lost; inertial only");
                self.timed_out = true;
            }
            Ok(()) if self.timed_out => {
                info!("Absolute tracking recovered");
                self.timed_out = false;
            }
            _ => {}
        }

        let estimate = self.fusion.estimate(frame.timestamp);
        // A failed solve only withholds validity while the last fix is still
        // current; once fusion has fallen back, the inertial estimate stands.
        let valid = estimate.valid
            && !(failed && estimate.tracking_result != TrackingResult::Fallback);
        let pose = to_pose(&Isometry3::from_parts(
            Translation3::from(estimate.position),
            estimate.orientation,
        ));

        FrameOutcome {
            sample: PoseSample {
                position: pose.position,
                orientation: pose.orientation,
                valid,
                tracking_result: estimate.tracking_result,
                timestamp: frame.timestamp,
            },
            controller: frame.buttons.map(|b| self.buttons.update(b)),
            triangulation,
        }
    }

    /// Forget fusion and button history.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.fusion.reset();
        self.buttons.reset();
        self.timed_out = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PoseCache;
    use nalgebra::UnitQuaternion;
    use sweeptrack_hal::sim::sim_calibration;
    use sweeptrack_types::{
        AngleMeasurement, ButtonSample, DeviceClass, ImuSample, Pose, Quat, Vec3,
    };

    fn model() -> Arc<CalibrationModel> {
        Arc::new(CalibrationModel::from_config(&sim_calibration(DeviceClass::Hmd)).unwrap())
    }

    fn pipeline(space: TrackingSpace) -> PosePipeline {
        PosePipeline::new(
            model(),
            TriangulatorConfig::default(),
            FusionConfig::default(),
            space,
        )
    }

    fn truth() -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::new(0.1, -0.2, 2.0),
            UnitQuaternion::from_euler_angles(0.05, 0.3, -0.1),
        )
    }

    fn angles(pose: &Isometry3<f64>, station: u8, t: f64) -> Vec<AngleMeasurement> {
        model().synthesize(pose, station, t)
    }

    fn assert_near(sample: &PoseSample, pose: &Isometry3<f64>, tol: f32) {
        let t = pose.translation.vector;
        assert!((sample.position.x - t.x as f32).abs() < tol, "x={}", sample.position.x);
        assert!((sample.position.y - t.y as f32).abs() < tol, "y={}", sample.position.y);
        assert!((sample.position.z - t.z as f32).abs() < tol, "z={}", sample.position.z);
    }

    #[test]
    fn synthetic_frame_recovers_pose() {
        let mut p = pipeline(TrackingSpace::new());
        let out = p.process(&SensorFrame::from_angles(0.5, angles(&truth(), 0, 0.5)));
        assert!(out.sample.valid);
        assert_eq!(out.sample.tracking_result, TrackingResult::Running);
        assert_eq!(out.sample.timestamp, 0.5);
        assert_near(&out.sample, &truth(), 5e-3);
        assert!(matches!(out.triangulation, Some(Ok(_))));
    }

    #[test]
    fn station_placement_is_applied() {
        let placement = Isometry3::from_parts(
            Translation3::new(0.0, 2.0, 0.0),
            UnitQuaternion::from_euler_angles(0.0, 0.2, 0.0),
        );
        let mut space = TrackingSpace::new();
        space.set_station(3, placement);
        let mut p = pipeline(space);

        let in_station = placement.inverse() * truth();
        let out = p.process(&SensorFrame::from_angles(0.0, angles(&in_station, 3, 0.0)));
        assert!(out.sample.valid);
        assert_near(&out.sample, &truth(), 5e-3);
    }

    #[test]
    fn starved_frame_is_invalid_and_cache_keeps_pose() {
        let cache = PoseCache::new();
        let mut p = pipeline(TrackingSpace::new());

        let good = p.process(&SensorFrame::from_angles(0.0, angles(&truth(), 0, 0.0)));
        cache.publish(good.sample);

        let mut few = angles(&Isometry3::translation(0.5, 0.5, 3.0), 0, 0.01);
        few.truncate(3);
        let out = p.process(&SensorFrame::from_angles(0.01, few));
        assert!(!out.sample.valid);
        assert!(matches!(
            out.triangulation,
            Some(Err(TriangulationError::InsufficientPoints {
                found: 3,
                required: 4
            }))
        ));

        let stored = cache.publish(out.sample);
        assert!(!stored.valid);
        assert_eq!(stored.position, good.sample.position);
        assert_eq!(stored.orientation, good.sample.orientation);
        assert_eq!(stored.timestamp, 0.01);
    }

    #[test]
    fn imu_only_frames_are_calibrating() {
        let mut p = pipeline(TrackingSpace::new());
        let frame = SensorFrame {
            timestamp: 0.1,
            imu: vec![ImuSample {
                gyro: [0.0, 0.2, 0.0],
                accel: [0.0, 9.81, 0.0],
                dt: 0.01,
                time: 0.1,
            }],
            ..SensorFrame::default()
        };
        let out = p.process(&frame);
        assert!(!out.sample.valid);
        assert_eq!(out.sample.tracking_result, TrackingResult::Calibrating);
        assert!(out.triangulation.is_none());
    }

    #[test]
    fn lost_tracking_falls_back_to_imu() {
        let mut p = pipeline(TrackingSpace::new());
        p.process(&SensorFrame::from_angles(0.0, angles(&truth(), 0, 0.0)));

        let frame = SensorFrame {
            timestamp: 1.0,
            imu: vec![ImuSample {
                gyro: [0.0, 0.1, 0.0],
                accel: [0.0, 0.0, 0.0],
                dt: 0.01,
                time: 1.0,
            }],
            ..SensorFrame::default()
        };
        let out = p.process(&frame);
        assert!(out.sample.valid);
        assert_eq!(out.sample.tracking_result, TrackingResult::Fallback);
        assert_near(&out.sample, &truth(), 5e-3);
    }

    #[test]
    fn partial_occlusion_past_timeout_keeps_imu_orientation() {
        let gyro = |t: f64| ImuSample {
            gyro: [0.0, 1.0, 0.0],
            accel: [0.0, 0.0, 0.0],
            dt: 0.1,
            time: t,
        };
        let angle_from_truth = |s: &PoseSample| {
            to_isometry(&Pose::new(s.position, s.orientation))
                .rotation
                .angle_to(&truth().rotation)
        };

        let cache = PoseCache::new();
        let mut p = pipeline(TrackingSpace::new());
        cache.publish(p.process(&SensorFrame::from_angles(0.0, angles(&truth(), 0, 0.0))).sample);

        let dark = p.process(&SensorFrame {
            timestamp: 1.0,
            imu: vec![gyro(1.0)],
            ..SensorFrame::default()
        });
        let dark = cache.publish(dark.sample);
        assert!(dark.valid);
        assert!((angle_from_truth(&dark) - 0.1).abs() < 1e-2);

        let mut few = angles(&truth(), 0, 1.1);
        few.truncate(3);
        let out = p.process(&SensorFrame {
            timestamp: 1.1,
            angles: few,
            imu: vec![gyro(1.1)],
            ..SensorFrame::default()
        });
        assert!(matches!(
            out.triangulation,
            Some(Err(TriangulationError::InsufficientPoints { .. }))
        ));
        assert_eq!(out.sample.tracking_result, TrackingResult::Fallback);
        assert!(out.sample.valid);

        let stored = cache.publish(out.sample);
        assert!(stored.valid);
        let angle = angle_from_truth(&stored);
        assert!((angle - 0.2).abs() < 1e-2, "angle={angle}");
        assert_near(&stored, &truth(), 5e-3);
    }

    #[test]
    fn external_pose_is_a_fix() {
        let mut p = pipeline(TrackingSpace::new());
        let frame = SensorFrame {
            timestamp: 2.0,
            external_pose: Some(Pose::new(Vec3::new(0.3, 1.7, -0.2), Quat::identity())),
            ..SensorFrame::default()
        };
        let out = p.process(&frame);
        assert!(out.sample.valid);
        assert_eq!(out.sample.tracking_result, TrackingResult::Running);
        assert!((out.sample.position.y - 1.7).abs() < 1e-6);
    }

    #[test]
    fn buttons_produce_controller_state() {
        let mut p = pipeline(TrackingSpace::new());
        let press = SensorFrame {
            buttons: Some(ButtonSample {
                pressed: 0b1,
                touched: 0,
            }),
            ..SensorFrame::default()
        };
        let first = p.process(&press).controller.unwrap();
        let second = p.process(&press).controller.unwrap();
        assert_eq!(first.changed_pressed, 0b1);
        assert_eq!(first.touched, 0b1);
        assert_eq!(second.changed_pressed, 0);
        assert_eq!(second.packet, 2);
    }

    #[test]
    fn reset_returns_to_uninitialized() {
        let mut p = pipeline(TrackingSpace::new());
        p.process(&SensorFrame::from_angles(0.0, angles(&truth(), 0, 0.0)));
        p.reset();
        let out = p.process(&SensorFrame {
            timestamp: 0.1,
            ..SensorFrame::default()
        });
        assert_eq!(out.sample.tracking_result, TrackingResult::Uninitialized);
    }
}
