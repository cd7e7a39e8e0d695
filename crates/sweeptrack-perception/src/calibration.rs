//! [`CalibrationModel`] – per-device sensor geometry and tick normalization.
//!
//! A lighthouse base station sweeps one laser plane horizontally and one
//! vertically.  The time at which a photodiode sees each plane is reported in
//! hardware ticks; dividing by `ticks_per_degree` gives the sweep angle.  The
//! model turns those raw readings into an [`ImagePoint`] (degrees from the
//! start of the calibrated range) and from there into a *bearing*, the
//! normalized pinhole coordinate `(tan az, tan el)` relative to the station's
//! optical axis, which lies at the middle of each range.

use nalgebra::{Isometry3, Point3, Vector2};
use sweeptrack_types::{AngleMeasurement, CalibrationConfig, CalibrationError, SweepAxis};

/// A `[min, max]` sweep window in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngleRange {
    pub min: f64,
    pub max: f64,
}

impl AngleRange {
    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    fn validate(field: &'static str, raw: [f64; 2]) -> Result<Self, CalibrationError> {
        let [min, max] = raw;
        if !(min.is_finite() && max.is_finite()) {
            return Err(CalibrationError::InvalidField {
                field,
                reason: "range bounds must be finite".to_string(),
            });
        }
        if min < 0.0 || min >= max {
            return Err(CalibrationError::InvalidField {
                field,
                reason: format!("expected 0 <= min < max, got [{min}, {max}]"),
            });
        }
        if max - min >= 180.0 {
            return Err(CalibrationError::InvalidField {
                field,
                reason: format!("span of {}° exceeds a half turn", max - min),
            });
        }
        Ok(Self { min, max })
    }
}

/// 2-D projection of one measurement, in degrees from the range minimum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImagePoint {
    pub u: f64,
    pub v: f64,
}

/// Immutable per-device calibration.
#[derive(Debug, Clone)]
pub struct CalibrationModel {
    model_points: Vec<Point3<f64>>,
    range_h: AngleRange,
    range_v: AngleRange,
    ticks_per_degree: f64,
    tolerance_deg: f64,
}

impl CalibrationModel {
    /// Validate a parsed payload and build the model.
    ///
    /// # Errors
    ///
    /// Returns [`CalibrationError::InvalidField`] naming the first field that
    /// is empty, non-finite, or inconsistent.
    pub fn from_config(config: &CalibrationConfig) -> Result<Self, CalibrationError> {
        if config.model_points.is_empty() {
            return Err(CalibrationError::InvalidField {
                field: "model_points",
                reason: "at least one sensor position is required".to_string(),
            });
        }
        if config.model_points.len() > usize::from(u16::MAX) + 1 {
            return Err(CalibrationError::InvalidField {
                field: "model_points",
                reason: format!("{} sensors exceed the u16 id space", config.model_points.len()),
            });
        }
        if let Some(idx) = config
            .model_points
            .iter()
            .position(|p| p.iter().any(|c| !c.is_finite()))
        {
            return Err(CalibrationError::InvalidField {
                field: "model_points",
                reason: format!("sensor {idx} has a non-finite coordinate"),
            });
        }
        let tpd = config.ticks_per_degree;
        if !tpd.is_finite() || tpd <= 0.0 {
            return Err(CalibrationError::InvalidField {
                field: "ticks_per_degree",
                reason: format!("expected a positive number, got {tpd}"),
            });
        }
        let tol = config.range_tolerance_deg;
        if !tol.is_finite() || tol < 0.0 {
            return Err(CalibrationError::InvalidField {
                field: "range_tolerance_deg",
                reason: format!("expected a non-negative number, got {tol}"),
            });
        }

        Ok(Self {
            model_points: config
                .model_points
                .iter()
                .map(|p| Point3::new(p[0], p[1], p[2]))
                .collect(),
            range_h: AngleRange::validate("angle_range_h", config.angle_range_h)?,
            range_v: AngleRange::validate("angle_range_v", config.angle_range_v)?,
            ticks_per_degree: tpd,
            tolerance_deg: tol,
        })
    }

    /// Device-frame sensor positions in sensor-id order.
    pub fn model_points(&self) -> &[Point3<f64>] {
        &self.model_points
    }

    pub fn range_h(&self) -> AngleRange {
        self.range_h
    }

    pub fn range_v(&self) -> AngleRange {
        self.range_v
    }

    pub fn ticks_per_degree(&self) -> f64 {
        self.ticks_per_degree
    }

    /// Convert a raw measurement into an [`ImagePoint`].
    ///
    /// # Errors
    ///
    /// - [`CalibrationError::UnknownSensor`] when the sensor id has no model
    ///   point.
    /// - [`CalibrationError::OutOfRange`] when either reading lies further
    ///   outside its range than the configured tolerance.
    pub fn normalize(&self, m: &AngleMeasurement) -> Result<ImagePoint, CalibrationError> {
        if usize::from(m.sensor_id) >= self.model_points.len() {
            return Err(CalibrationError::UnknownSensor(m.sensor_id));
        }
        let h = self.degrees(m.sensor_id, SweepAxis::Horizontal, m.horizontal_ticks)?;
        let v = self.degrees(m.sensor_id, SweepAxis::Vertical, m.vertical_ticks)?;
        Ok(ImagePoint {
            u: h - self.range_h.min,
            v: v - self.range_v.min,
        })
    }

    fn degrees(&self, sensor_id: u16, axis: SweepAxis, ticks: u32) -> Result<f64, CalibrationError> {
        let range = match axis {
            SweepAxis::Horizontal => self.range_h,
            SweepAxis::Vertical => self.range_v,
        };
        let degrees = f64::from(ticks) / self.ticks_per_degree;
        if degrees < range.min - self.tolerance_deg || degrees > range.max + self.tolerance_deg {
            return Err(CalibrationError::OutOfRange {
                sensor_id,
                axis,
                degrees,
            });
        }
        Ok(degrees)
    }

    /// Normalized pinhole coordinate `(tan az, tan el)` of an image point.
    pub fn bearing(&self, p: ImagePoint) -> Vector2<f64> {
        let az = (p.u - self.range_h.span() / 2.0).to_radians();
        let el = (p.v - self.range_v.span() / 2.0).to_radians();
        Vector2::new(az.tan(), el.tan())
    }

    /// Forward projection: the measurements a base station would report for
    /// the device at `pose` (device frame → base-station frame).
    ///
    /// Sensors behind the station or outside the sweep range are omitted.
    pub fn synthesize(
        &self,
        pose: &Isometry3<f64>,
        base_station_id: u8,
        capture_time: f64,
    ) -> Vec<AngleMeasurement> {
        let mut out = Vec::with_capacity(self.model_points.len());
        for (idx, m) in self.model_points.iter().enumerate() {
            let p = pose * m;
            if p.z <= 0.0 {
                continue;
            }
            let h = p.x.atan2(p.z).to_degrees() + self.range_h.span() / 2.0 + self.range_h.min;
            let v = p.y.atan2(p.z).to_degrees() + self.range_v.span() / 2.0 + self.range_v.min;
            if h < self.range_h.min || h > self.range_h.max || v < self.range_v.min || v > self.range_v.max {
                continue;
            }
            out.push(AngleMeasurement {
                sensor_id: idx as u16,
                base_station_id,
                horizontal_ticks: (h * self.ticks_per_degree).round() as u32,
                vertical_ticks: (v * self.ticks_per_degree).round() as u32,
                capture_time,
            });
        }
        out
    }
}
