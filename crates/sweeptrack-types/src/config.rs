//! Configuration payloads handed to the pipeline by its collaborators.
//!
//! The config loader parses these from JSON (calibration) or TOML (CLI
//! config); the pipeline only ever sees the typed structures.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::CalibrationError;
use crate::geometry::Pose;

fn default_range_tolerance_deg() -> f64 {
    2.0
}

/// Static per-device sensor geometry as delivered by the config loader.
///
/// Angle ranges are `[min, max]` in degrees; `ticks_per_degree` converts raw
/// sweep timings into degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CalibrationConfig {
    /// Device-frame position of every photodiode, in sensor-id order (metres).
    pub model_points: Vec<[f64; 3]>,
    pub angle_range_h: [f64; 2],
    pub angle_range_v: [f64; 2],
    pub ticks_per_degree: f64,
    /// How far (degrees) a reading may fall outside the angle range before it
    /// is treated as a glitch.
    #[serde(default = "default_range_tolerance_deg")]
    pub range_tolerance_deg: f64,
}

impl CalibrationConfig {
    /// Parse a JSON calibration payload.
    ///
    /// # Errors
    ///
    /// Returns [`CalibrationError::Malformed`] when the payload is not valid
    /// JSON or a required field is missing or mistyped.
    pub fn from_json(raw: &str) -> Result<Self, CalibrationError> {
        serde_json::from_str(raw).map_err(|e| CalibrationError::Malformed(e.to_string()))
    }
}

/// Optical description of a head-mounted display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DisplayConfig {
    /// Physical screen width (metres).
    pub hsize: f32,
    /// Physical screen height (metres).
    pub vsize: f32,
    pub hres: u32,
    pub vres: u32,
    /// Lens separation (metres).
    pub lens_sep: f32,
    /// Vertical lens position (metres).
    pub lens_vpos: f32,
    /// Horizontal field of view (radians).
    pub fov: f32,
    /// Per-eye aspect ratio.
    pub ratio: f32,
    /// Interpupillary distance (metres).
    #[serde(default = "default_ipd")]
    pub ipd: f32,
    /// Lens distortion coefficients; reported as zeros when absent.
    #[serde(default)]
    pub distortion: Option<[f32; 6]>,
}

fn default_ipd() -> f32 {
    0.061
}

impl DisplayConfig {
    /// Display geometry of the HTC Vive headset.
    pub fn htc_vive() -> Self {
        let hsize = 0.122_822_f32;
        let lens_sep = 0.056_f32;
        let eye_to_screen = 0.023_226_877_f32;
        Self {
            hsize,
            vsize: 0.068_234,
            hres: 2160,
            vres: 1200,
            lens_sep,
            lens_vpos: 0.032,
            fov: 2.0 * (hsize / 2.0 - lens_sep / 2.0).atan2(eye_to_screen),
            ratio: (2160.0 / 1200.0) / 2.0,
            ipd: default_ipd(),
            distortion: Some([1.318_397, -1.490_242, 0.663_824, 0.508_021, 0.0, 0.0]),
        }
    }
}

/// Placement of one lighthouse base station in tracking space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BaseStationConfig {
    pub id: u8,
    #[serde(default)]
    pub pose: Pose,
}
