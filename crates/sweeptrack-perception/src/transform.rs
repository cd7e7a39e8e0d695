//! Tracking space and frame conversion.
//!
//! Every base station reports poses in its own frame.  [`TrackingSpace`]
//! holds the placement of each station inside the shared tracking space and
//! composes station-frame solutions into it.  It also converts between the
//! `f32` [`Pose`] that crosses crate boundaries and the `f64`
//! [`Isometry3`] the solvers work in.
//!
//! # Example
//!
//! ```rust
//! use nalgebra::Isometry3;
//! use sweeptrack_perception::transform::TrackingSpace;
//! use sweeptrack_types::{BaseStationConfig, Pose, Quat, Vec3};
//!
//! // Station 1 hangs 2 m up, otherwise aligned with tracking space.
//! let space = TrackingSpace::from_config(&[BaseStationConfig {
//!     id: 1,
//!     pose: Pose::new(Vec3::new(0.0, 2.0, 0.0), Quat::identity()),
//! }]);
//!
//! let device = space.to_tracking(1, &Isometry3::translation(0.0, 0.0, 1.5));
//! assert!((device.translation.vector.y - 2.0).abs() < 1e-6);
//! ```

use std::collections::HashMap;

use nalgebra::{Isometry3, Quaternion, Translation3, UnitQuaternion};
use sweeptrack_types::{BaseStationConfig, Pose, Quat, Vec3};
use tracing::debug;

// ────────────────────────────────────────────────────────────────────────────
// Conversions
// ────────────────────────────────────────────────────────────────────────────

/// Widen a boundary pose to `f64`.  The quaternion is renormalized.
pub fn to_isometry(pose: &Pose) -> Isometry3<f64> {
    let q = pose.orientation;
    let rotation = UnitQuaternion::try_new(
        Quaternion::new(f64::from(q.w), f64::from(q.x), f64::from(q.y), f64::from(q.z)),
        f64::EPSILON,
    )
    .unwrap_or_else(UnitQuaternion::identity);
    Isometry3::from_parts(
        Translation3::new(
            f64::from(pose.position.x),
            f64::from(pose.position.y),
            f64::from(pose.position.z),
        ),
        rotation,
    )
}

/// Narrow a solver pose to the `f32` boundary type.
pub fn to_pose(iso: &Isometry3<f64>) -> Pose {
    let t = iso.translation.vector;
    let q = iso.rotation;
    Pose::new(
        Vec3::new(t.x as f32, t.y as f32, t.z as f32),
        Quat::new(q.w as f32, q.i as f32, q.j as f32, q.k as f32).normalized(),
    )
}

// ────────────────────────────────────────────────────────────────────────────
// TrackingSpace
// ────────────────────────────────────────────────────────────────────────────

/// Placement of every known base station in tracking space.
///
/// A station without a registered placement is treated as sitting at the
/// tracking-space origin.
#[derive(Debug, Clone, Default)]
pub struct TrackingSpace {
    stations: HashMap<u8, Isometry3<f64>>,
}

impl TrackingSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(stations: &[BaseStationConfig]) -> Self {
        let mut space = Self::new();
        for bs in stations {
            space.set_station(bs.id, to_isometry(&bs.pose));
        }
        space
    }

    /// Register or update the station → tracking-space transform.
    pub fn set_station(&mut self, id: u8, pose: Isometry3<f64>) {
        self.stations.insert(id, pose);
    }

    pub fn station(&self, id: u8) -> Option<&Isometry3<f64>> {
        self.stations.get(&id)
    }

    /// Compose a station-frame device pose into tracking space.
    pub fn to_tracking(&self, station: u8, device_in_station: &Isometry3<f64>) -> Isometry3<f64> {
        match self.stations.get(&station) {
            Some(placement) => placement * device_in_station,
            None => {
                debug!(station, "No placement for base station; assuming origin");
                *device_in_station
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_1_SQRT_2;

    fn q90y() -> Quat {
        Quat::new(FRAC_1_SQRT_2, 0.0, FRAC_1_SQRT_2, 0.0)
    }

    #[test]
    fn unknown_station_is_identity() {
        let space = TrackingSpace::new();
        let p = Isometry3::translation(1.0, 2.0, 3.0);
        assert_eq!(space.to_tracking(9, &p), p);
    }

    #[test]
    fn to_tracking_respects_station_rotation() {
        // Station at the origin yawed 90° about +Y; a device 1 m down the
        // station's optical axis (+Z) ends up on tracking-space +X.
        let space = TrackingSpace::from_config(&[BaseStationConfig {
            id: 0,
            pose: Pose::new(Vec3::zero(), q90y()),
        }]);
        let t = space
            .to_tracking(0, &Isometry3::translation(0.0, 0.0, 1.0))
            .translation
            .vector;
        assert!((t.x - 1.0).abs() < 1e-6, "x={}", t.x);
        assert!(t.y.abs() < 1e-6);
        assert!(t.z.abs() < 1e-6, "z={}", t.z);
    }

    #[test]
    fn set_station_overrides_previous() {
        let mut space = TrackingSpace::new();
        space.set_station(0, Isometry3::translation(1.0, 0.0, 0.0));
        space.set_station(0, Isometry3::translation(5.0, 0.0, 0.0));
        let t = space.to_tracking(0, &Isometry3::identity()).translation.vector;
        assert!((t.x - 5.0).abs() < 1e-12);
    }

    #[test]
    fn conversions_agree_with_nalgebra() {
        let pose = Pose::new(Vec3::new(0.5, -1.0, 2.0), q90y());
        let iso = to_isometry(&pose);
        let expected = Isometry3::from_parts(
            Translation3::new(0.5, -1.0, 2.0),
            UnitQuaternion::from_axis_angle(&nalgebra::Vector3::y_axis(), std::f64::consts::FRAC_PI_2),
        );
        let p = iso * nalgebra::Point3::new(1.0, 0.0, 0.0);
        let q = expected * nalgebra::Point3::new(1.0, 0.0, 0.0);
        assert!((p - q).norm() < 1e-6, "p={p} q={q}");
        // +90° about Y carries +X onto -Z.
        assert!((q.z - 1.0).abs() < 1e-9, "z={}", q.z);

        let back = to_pose(&iso);
        assert!((back.orientation.w - pose.orientation.w).abs() < 1e-6);
        assert!((back.position.z - 2.0).abs() < 1e-6);
    }

    #[test]
    fn zero_quaternion_widens_to_identity() {
        let pose = Pose::new(Vec3::zero(), Quat::new(0.0, 0.0, 0.0, 0.0));
        assert_eq!(to_isometry(&pose).rotation, UnitQuaternion::identity());
    }
}
