//! [`AngleSampleBuffer`] – per-frame collection of raw sweep hits.
//!
//! Measurements accumulate while a frame is being read.  A sensor can be hit
//! more than once by the same station before the frame closes; the most
//! recent capture wins.  Draining the buffer normalizes every hit through the
//! [`CalibrationModel`] and groups the survivors by base station, each group
//! ordered by sensor id.

use std::collections::BTreeMap;

use nalgebra::{Point3, Vector2};
use sweeptrack_types::AngleMeasurement;
use tracing::debug;

use crate::calibration::CalibrationModel;

/// One 2-D / 3-D pair handed to the triangulator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub sensor_id: u16,
    /// Device-frame position of the sensor.
    pub model: Point3<f64>,
    /// Normalized pinhole coordinate `(tan az, tan el)`.
    pub bearing: Vector2<f64>,
}

/// Correspondences of one frame, keyed by base station id.
pub type StationObservations = BTreeMap<u8, Vec<Correspondence>>;

#[derive(Debug, Default)]
pub struct AngleSampleBuffer {
    /// `(base_station_id, sensor_id)` → latest hit.
    hits: BTreeMap<(u8, u16), AngleMeasurement>,
}

impl AngleSampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a hit, replacing an older one for the same station and sensor.
    pub fn push(&mut self, m: AngleMeasurement) {
        let key = (m.base_station_id, m.sensor_id);
        match self.hits.get(&key) {
            Some(prev) if prev.capture_time > m.capture_time => {}
            _ => {
                self.hits.insert(key, m);
            }
        }
    }

    pub fn extend<I: IntoIterator<Item = AngleMeasurement>>(&mut self, iter: I) {
        for m in iter {
            self.push(m);
        }
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn clear(&mut self) {
        self.hits.clear();
    }

    /// Empty the buffer into normalized correspondences.
    ///
    /// Hits that fail normalization are dropped; one bad reading never spoils
    /// the rest of the frame.
    pub fn drain(&mut self, model: &CalibrationModel) -> StationObservations {
        let mut out = StationObservations::new();
        for ((station, sensor_id), m) in std::mem::take(&mut self.hits) {
            match model.normalize(&m) {
                Ok(p) => out.entry(station).or_default().push(Correspondence {
                    sensor_id,
                    model: model.model_points()[usize::from(sensor_id)],
                    bearing: model.bearing(p),
                }),
                Err(e) => {
                    debug!(station, sensor_id, error = %e, "Dropping angle measurement");
                }
            }
        }
        out
    }
}
