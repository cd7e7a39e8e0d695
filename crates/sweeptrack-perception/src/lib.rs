//! `sweeptrack-perception` – geometry of the pose pipeline.
//!
//! Turns raw lighthouse sweep timings and inertial samples into a pose.
//!
//! # Modules
//!
//! - [`calibration`] – [`CalibrationModel`][calibration::CalibrationModel]:
//!   sensor layout, angle ranges and tick scale of one device.
//! - [`angles`] – [`AngleSampleBuffer`][angles::AngleSampleBuffer]: per-frame
//!   collection of sweep hits, normalized into correspondences.
//! - [`triangulate`] – [`Triangulator`][triangulate::Triangulator]: PnP solve
//!   from bearings to a base-station-frame pose.
//! - [`fusion`] – [`SensorFusion`][fusion::SensorFusion]: complementary
//!   filter over absolute fixes and the IMU.
//! - [`transform`] – [`TrackingSpace`][transform::TrackingSpace]: base-station
//!   placement and frame conversion.

pub mod angles;
pub mod calibration;
pub mod fusion;
pub mod transform;
pub mod triangulate;
