//! Plain geometry value types shared across the workspace.
//!
//! These are the `f32` types that leave the pipeline (inside a
//! [`PoseSample`][crate::PoseSample]) and that appear in configuration files.
//! Solvers work in `f64` internally and convert at the boundary.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Vec3
// ────────────────────────────────────────────────────────────────────────────

/// A 3-D vector in metres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// The zero vector.
    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Quat
// ────────────────────────────────────────────────────────────────────────────

/// A unit quaternion (w, x, y, z convention).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Quat {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Default for Quat {
    fn default() -> Self {
        Self::identity()
    }
}

impl Quat {
    /// The caller is responsible for providing a unit quaternion.
    pub fn new(w: f32, x: f32, y: f32, z: f32) -> Self {
        Self { w, x, y, z }
    }

    pub fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0)
    }

    pub fn norm(self) -> f32 {
        (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Rescale to unit length.  A degenerate (zero) quaternion becomes the
    /// identity.
    pub fn normalized(self) -> Self {
        let n = self.norm();
        if n <= f32::EPSILON || !n.is_finite() {
            return Self::identity();
        }
        Self::new(self.w / n, self.x / n, self.y / n, self.z / n)
    }

    /// Components in `x, y, z, w` order, the layout used by the property
    /// query interface.
    pub fn to_xyzw(self) -> [f32; 4] {
        [self.x, self.y, self.z, self.w]
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pose
// ────────────────────────────────────────────────────────────────────────────

/// A rigid-body pose: the placement of a child frame inside a parent frame.
///
/// Frame arithmetic happens on `nalgebra::Isometry3` after widening; this
/// type only carries the values across crate and file boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Pose {
    pub position: Vec3,
    pub orientation: Quat,
}

impl Pose {
    pub fn new(position: Vec3, orientation: Quat) -> Self {
        Self {
            position,
            orientation,
        }
    }

    pub fn identity() -> Self {
        Self::new(Vec3::zero(), Quat::identity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_zero_quat_is_identity() {
        assert_eq!(Quat::new(0.0, 0.0, 0.0, 0.0).normalized(), Quat::identity());
        let q = Quat::new(2.0, 0.0, 0.0, 0.0).normalized();
        assert!((q.w - 1.0).abs() < 1e-6);
    }

    #[test]
    fn xyzw_layout() {
        let q = Quat::new(0.1, 0.2, 0.3, 0.4);
        assert_eq!(q.to_xyzw(), [0.2, 0.3, 0.4, 0.1]);
    }

    #[test]
    fn identity_pose_is_origin() {
        let p = Pose::identity();
        assert_eq!(p.position.to_array(), [0.0, 0.0, 0.0]);
        assert_eq!(p.orientation, Quat::identity());
        assert_eq!(Pose::default(), p);
    }
}
