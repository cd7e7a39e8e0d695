//! Triangulator – perspective-n-point solve from lighthouse bearings.
//!
//! Given the normalized bearings of at least four sensors seen by one base
//! station and their device-frame positions, recover the rigid transform that
//! maps device-frame points into the station frame.
//!
//! The solve runs in three stages:
//!
//! 1. **Initialisation.**  The correspondences are classified by the spread of
//!    their model points.  Near-planar sets are initialised from a homography
//!    (DLT); general sets use POSIT (scaled-orthographic iteration).  Collinear
//!    sets have no unique solution and are rejected.
//! 2. **Refinement.**  Gauss–Newton on SE(3) minimizes the bearing
//!    reprojection error.
//! 3. **Outlier rejection.**  Sensors whose ray misses by more than
//!    [`TriangulatorConfig::outlier_threshold_deg`] are removed and the pose
//!    is refined once more over the inliers.
//!
//! Correspondences are sorted by sensor id first, so the result depends only
//! on the set of inputs, never on their order.
//!
//! # Example
//!
//! ```rust
//! use nalgebra::{Isometry3, Point3, Vector2};
//! use sweeptrack_perception::angles::Correspondence;
//! use sweeptrack_perception::triangulate::Triangulator;
//!
//! let truth = Isometry3::translation(0.0, 0.0, 2.0);
//! let layout = [
//!     [0.0, 0.0, 0.0], [0.1, 0.0, 0.0], [0.0, 0.1, 0.0],
//!     [0.0, 0.0, 0.1], [0.1, 0.1, 0.05],
//! ];
//! let points: Vec<Correspondence> = layout
//!     .iter()
//!     .enumerate()
//!     .map(|(i, m)| {
//!         let model = Point3::new(m[0], m[1], m[2]);
//!         let p = truth * model;
//!         Correspondence { sensor_id: i as u16, model, bearing: Vector2::new(p.x / p.z, p.y / p.z) }
//!     })
//!     .collect();
//!
//! let fix = Triangulator::default().solve(0, &points).unwrap();
//! assert!((fix.pose.translation.vector.z - 2.0).abs() < 1e-6);
//! ```

use nalgebra::{
    Isometry3, Matrix3, Matrix6, Point3, Rotation3, SMatrix, SVector, SymmetricEigen,
    Translation3, UnitQuaternion, Vector2, Vector3, Vector6,
};
use serde::{Deserialize, Serialize};
use sweeptrack_types::TriangulationError;
use tracing::debug;

use crate::angles::{Correspondence, StationObservations};

/// Smallest number of correspondences that pins down a 6DOF pose.
pub const MIN_CORRESPONDENCES: usize = 4;

const POSIT_MAX_ITERATIONS: usize = 50;
const POSIT_EPSILON: f64 = 1e-10;
const GN_STEP_EPSILON: f64 = 1e-12;
const MIN_DEPTH: f64 = 1e-6;

// ────────────────────────────────────────────────────────────────────────────
// Configuration and result
// ────────────────────────────────────────────────────────────────────────────

/// Tunables of the PnP solve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangulatorConfig {
    /// Sensors whose ray error exceeds this angle are rejected (degrees).
    pub outlier_threshold_deg: f64,
    /// Solutions farther from the station than this are implausible (metres).
    pub max_range_m: f64,
    /// Gauss–Newton iteration cap.
    pub max_iterations: usize,
    /// Ratio of the smallest to the largest singular value of the centred
    /// model points below which the set is treated as planar.
    pub planar_ratio: f64,
}

impl Default for TriangulatorConfig {
    fn default() -> Self {
        Self {
            outlier_threshold_deg: 0.5,
            max_range_m: 10.0,
            max_iterations: 20,
            planar_ratio: 1e-3,
        }
    }
}

/// A successful solve.
#[derive(Debug, Clone, PartialEq)]
pub struct Triangulation {
    /// Device frame → base-station frame.
    pub pose: Isometry3<f64>,
    pub base_station: u8,
    /// Sensor ids that contributed to the final pose.
    pub inliers: Vec<u16>,
    /// Sensor ids removed as outliers.
    pub rejected: Vec<u16>,
    /// Root-mean-square ray error over the inliers (radians).
    pub rms_error_rad: f64,
}

// ────────────────────────────────────────────────────────────────────────────
// Triangulator
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Triangulator {
    config: TriangulatorConfig,
}

impl Triangulator {
    pub fn new(config: TriangulatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TriangulatorConfig {
        &self.config
    }

    /// Solve the station with the most correspondences (ties → lowest id).
    ///
    /// # Errors
    ///
    /// Same as [`Triangulator::solve`]; an empty frame reports
    /// [`TriangulationError::InsufficientPoints`] with `found = 0`.
    pub fn solve_frame(
        &self,
        observations: &StationObservations,
    ) -> Result<Triangulation, TriangulationError> {
        let mut best: Option<(u8, &Vec<Correspondence>)> = None;
        for (station, points) in observations {
            if best.is_none_or(|(_, b)| points.len() > b.len()) {
                best = Some((*station, points));
            }
        }
        match best {
            Some((station, points)) => self.solve(station, points),
            None => Err(TriangulationError::InsufficientPoints {
                found: 0,
                required: MIN_CORRESPONDENCES,
            }),
        }
    }

    /// Solve one station's correspondences.
    ///
    /// # Errors
    ///
    /// - [`TriangulationError::InsufficientPoints`] with fewer than four
    ///   distinct sensors, before or after outlier rejection.
    /// - [`TriangulationError::DegenerateGeometry`] for collinear model
    ///   points, a singular normal system, or an implausible solution (a
    ///   sensor behind the station or the device beyond `max_range_m`).
    pub fn solve(
        &self,
        base_station: u8,
        correspondences: &[Correspondence],
    ) -> Result<Triangulation, TriangulationError> {
        let mut points = correspondences.to_vec();
        points.sort_by_key(|c| c.sensor_id);
        points.dedup_by_key(|c| c.sensor_id);
        require_enough(points.len())?;

        let initial = match classify(&points, self.config.planar_ratio)? {
            Shape::Planar { centroid, axes } => homography_init(&points, centroid, axes)?,
            Shape::General => posit_init(&points)?,
        };
        let mut pose = self.refine(&points, initial)?;

        let threshold = self.config.outlier_threshold_deg.to_radians();
        let (inliers, rejected): (Vec<Correspondence>, Vec<Correspondence>) = points
            .iter()
            .partition(|c| ray_error(&pose, c) <= threshold);

        if !rejected.is_empty() {
            debug!(
                base_station,
                rejected = rejected.len(),
                kept = inliers.len(),
                "Rejecting outlier sensors"
            );
            require_enough(inliers.len())?;
            classify(&inliers, self.config.planar_ratio)?;
            pose = self.refine(&inliers, pose)?;
        }

        self.check_plausible(&pose, &inliers)?;

        let sum_sq: f64 = inliers.iter().map(|c| ray_error(&pose, c).powi(2)).sum();
        Ok(Triangulation {
            pose,
            base_station,
            inliers: inliers.iter().map(|c| c.sensor_id).collect(),
            rejected: rejected.iter().map(|c| c.sensor_id).collect(),
            rms_error_rad: (sum_sq / inliers.len() as f64).sqrt(),
        })
    }

    /// Gauss–Newton on SE(3) with a left perturbation
    /// `R ← exp(ω)·R`, `t ← exp(ω)·t + δt`.
    fn refine(
        &self,
        points: &[Correspondence],
        seed: Isometry3<f64>,
    ) -> Result<Isometry3<f64>, TriangulationError> {
        let mut rotation = seed.rotation.to_rotation_matrix();
        let mut t = seed.translation.vector;

        for _ in 0..self.config.max_iterations {
            let mut h = Matrix6::<f64>::zeros();
            let mut g = Vector6::<f64>::zeros();

            for c in points {
                let p = rotation * c.model.coords + t;
                if p.z <= MIN_DEPTH {
                    return Err(TriangulationError::DegenerateGeometry(format!(
                        "sensor {} projected behind the station",
                        c.sensor_id
                    )));
                }
                let inv_z = 1.0 / p.z;
                let ru = p.x * inv_z - c.bearing.x;
                let rv = p.y * inv_z - c.bearing.y;

                let mut ju = Vector6::<f64>::zeros();
                let mut jv = Vector6::<f64>::zeros();
                for k in 0..6 {
                    let dp = if k < 3 {
                        Vector3::<f64>::ith(k, 1.0).cross(&p)
                    } else {
                        Vector3::<f64>::ith(k - 3, 1.0)
                    };
                    ju[k] = inv_z * dp.x - p.x * inv_z * inv_z * dp.z;
                    jv[k] = inv_z * dp.y - p.y * inv_z * inv_z * dp.z;
                }
                h += ju * ju.transpose() + jv * jv.transpose();
                g += ju * ru + jv * rv;
            }

            let step = h
                .cholesky()
                .ok_or_else(|| {
                    TriangulationError::DegenerateGeometry("singular normal equations".to_string())
                })?
                .solve(&(-g));

            let omega = Vector3::new(step[0], step[1], step[2]);
            let dt = Vector3::new(step[3], step[4], step[5]);
            let dr = Rotation3::new(omega);
            rotation = dr * rotation;
            t = dr * t + dt;

            if step.norm() < GN_STEP_EPSILON {
                break;
            }
        }

        if !(t.iter().all(|v| v.is_finite())) {
            return Err(TriangulationError::DegenerateGeometry(
                "refinement diverged".to_string(),
            ));
        }
        Ok(Isometry3::from_parts(
            Translation3::from(t),
            UnitQuaternion::from_rotation_matrix(&rotation),
        ))
    }

    fn check_plausible(
        &self,
        pose: &Isometry3<f64>,
        points: &[Correspondence],
    ) -> Result<(), TriangulationError> {
        let range = pose.translation.vector.norm();
        if range > self.config.max_range_m {
            return Err(TriangulationError::DegenerateGeometry(format!(
                "solution {range:.2} m from the station exceeds {} m",
                self.config.max_range_m
            )));
        }
        if let Some(c) = points.iter().find(|c| (pose * c.model).z <= 0.0) {
            return Err(TriangulationError::DegenerateGeometry(format!(
                "sensor {} lies behind the station",
                c.sensor_id
            )));
        }
        Ok(())
    }
}

fn require_enough(found: usize) -> Result<(), TriangulationError> {
    if found < MIN_CORRESPONDENCES {
        return Err(TriangulationError::InsufficientPoints {
            found,
            required: MIN_CORRESPONDENCES,
        });
    }
    Ok(())
}

/// Angle between the observed ray and the ray to the predicted sensor
/// position.
fn ray_error(pose: &Isometry3<f64>, c: &Correspondence) -> f64 {
    let predicted = (pose * c.model).coords;
    let observed = Vector3::new(c.bearing.x, c.bearing.y, 1.0);
    observed.angle(&predicted)
}

// ────────────────────────────────────────────────────────────────────────────
// Model geometry
// ────────────────────────────────────────────────────────────────────────────

enum Shape {
    /// The model points lie (nearly) in the plane spanned by the first two
    /// columns of `axes` through `centroid`.
    Planar {
        centroid: Point3<f64>,
        axes: Rotation3<f64>,
    },
    General,
}

fn classify(points: &[Correspondence], planar_ratio: f64) -> Result<Shape, TriangulationError> {
    let n = points.len() as f64;
    let centroid = Point3::from(points.iter().map(|c| c.model.coords).sum::<Vector3<f64>>() / n);
    let mut scatter = Matrix3::<f64>::zeros();
    for c in points {
        let d = c.model - centroid;
        scatter += d * d.transpose();
    }

    let eigen = SymmetricEigen::new(scatter);
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));
    let sv = order.map(|i| eigen.eigenvalues[i].max(0.0).sqrt());

    if sv[0] <= f64::EPSILON || sv[1] / sv[0] < 1e-6 {
        return Err(TriangulationError::DegenerateGeometry(
            "model points are collinear".to_string(),
        ));
    }
    if sv[2] / sv[0] >= planar_ratio {
        return Ok(Shape::General);
    }

    let e1: Vector3<f64> = eigen.eigenvectors.column(order[0]).normalize();
    let e2: Vector3<f64> = eigen.eigenvectors.column(order[1]).normalize();
    let e3 = e1.cross(&e2);
    Ok(Shape::Planar {
        centroid,
        axes: Rotation3::from_matrix_unchecked(Matrix3::from_columns(&[e1, e2, e3])),
    })
}

/// Closest proper rotation to `m` in the Frobenius sense.
fn nearest_rotation(m: Matrix3<f64>) -> Result<Rotation3<f64>, TriangulationError> {
    let svd = m.svd(true, true);
    let (Some(mut u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(TriangulationError::DegenerateGeometry(
            "rotation estimate has no SVD".to_string(),
        ));
    };
    if (u * v_t).determinant() < 0.0 {
        let flipped = -u.column(2);
        u.set_column(2, &flipped);
    }
    Ok(Rotation3::from_matrix_unchecked(u * v_t))
}

// ────────────────────────────────────────────────────────────────────────────
// Initialisation
// ────────────────────────────────────────────────────────────────────────────

/// Planar case: estimate the homography from plane coordinates to bearings
/// and decompose it into `[r1 r2 t]`.
fn homography_init(
    points: &[Correspondence],
    centroid: Point3<f64>,
    axes: Rotation3<f64>,
) -> Result<Isometry3<f64>, TriangulationError> {
    let plane: Vec<Vector2<f64>> = points
        .iter()
        .map(|c| {
            let local = axes.inverse() * (c.model - centroid);
            Vector2::new(local.x, local.y)
        })
        .collect();
    let scale = (plane.iter().map(|q| q.norm_squared()).sum::<f64>() / plane.len() as f64).sqrt();
    if scale <= f64::EPSILON {
        return Err(TriangulationError::DegenerateGeometry(
            "model points coincide".to_string(),
        ));
    }

    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (q, c) in plane.iter().zip(points) {
        let (x, y) = (q.x / scale, q.y / scale);
        let (u, v) = (c.bearing.x, c.bearing.y);
        let r1 = SVector::<f64, 9>::from_column_slice(&[x, y, 1.0, 0.0, 0.0, 0.0, -u * x, -u * y, -u]);
        let r2 = SVector::<f64, 9>::from_column_slice(&[0.0, 0.0, 0.0, x, y, 1.0, -v * x, -v * y, -v]);
        ata += r1 * r1.transpose() + r2 * r2.transpose();
    }
    let eigen = SymmetricEigen::new(ata);
    let smallest = eigen.eigenvalues.imin();
    let h = eigen.eigenvectors.column(smallest);
    let hm = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let h1: Vector3<f64> = hm.column(0).into_owned();
    let h2: Vector3<f64> = hm.column(1).into_owned();
    let h3: Vector3<f64> = hm.column(2).into_owned();
    let norm = (h1.norm() + h2.norm()) / 2.0;
    if norm <= f64::EPSILON {
        return Err(TriangulationError::DegenerateGeometry(
            "homography is singular".to_string(),
        ));
    }
    let mut lambda = 1.0 / norm;
    if h3.z * lambda < 0.0 {
        lambda = -lambda;
    }
    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let t_centroid = h3 * lambda * scale;

    let in_plane = nearest_rotation(Matrix3::from_columns(&[r1, r2, r1.cross(&r2)]))?;
    let rotation = in_plane * axes.inverse();
    let t = t_centroid - rotation * centroid.coords;
    Ok(Isometry3::from_parts(
        Translation3::from(t),
        UnitQuaternion::from_rotation_matrix(&rotation),
    ))
}

/// General case: POSIT with the first correspondence as reference point.
fn posit_init(points: &[Correspondence]) -> Result<Isometry3<f64>, TriangulationError> {
    let reference = points[0];
    let rest = &points[1..];
    let offsets: Vec<Vector3<f64>> = rest.iter().map(|c| c.model - reference.model).collect();

    let mut normal = Matrix3::<f64>::zeros();
    for a in &offsets {
        normal += a * a.transpose();
    }
    let normal_inv = normal.try_inverse().ok_or_else(|| {
        TriangulationError::DegenerateGeometry("model offsets do not span 3-D".to_string())
    })?;

    let (x0, y0) = (reference.bearing.x, reference.bearing.y);
    let mut eps = vec![0.0_f64; rest.len()];
    let mut rows = Matrix3::<f64>::identity();
    let mut depth = 1.0;

    for _ in 0..POSIT_MAX_ITERATIONS {
        let mut sum_x = Vector3::<f64>::zeros();
        let mut sum_y = Vector3::<f64>::zeros();
        for ((a, c), e) in offsets.iter().zip(rest).zip(&eps) {
            sum_x += a * (c.bearing.x * (1.0 + e) - x0);
            sum_y += a * (c.bearing.y * (1.0 + e) - y0);
        }
        let big_i = normal_inv * sum_x;
        let big_j = normal_inv * sum_y;
        let (ni, nj) = (big_i.norm(), big_j.norm());
        if ni <= f64::EPSILON || nj <= f64::EPSILON {
            return Err(TriangulationError::DegenerateGeometry(
                "POSIT scale collapsed".to_string(),
            ));
        }
        let i = big_i / ni;
        let j = big_j / nj;
        let k = i.cross(&j).normalize();
        depth = 2.0 / (ni + nj);
        rows = Matrix3::from_rows(&[i.transpose(), j.transpose(), k.transpose()]);

        let mut change = 0.0_f64;
        for (a, e) in offsets.iter().zip(eps.iter_mut()) {
            let next = a.dot(&k) / depth;
            change = change.max((next - *e).abs());
            *e = next;
        }
        if change < POSIT_EPSILON {
            break;
        }
    }

    if !depth.is_finite() || depth <= 0.0 {
        return Err(TriangulationError::DegenerateGeometry(
            "POSIT produced no depth".to_string(),
        ));
    }
    let rotation = nearest_rotation(rows)?;
    let origin = Vector3::new(x0 * depth, y0 * depth, depth);
    let t = origin - rotation * reference.model.coords;
    Ok(Isometry3::from_parts(
        Translation3::from(t),
        UnitQuaternion::from_rotation_matrix(&rotation),
    ))
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
