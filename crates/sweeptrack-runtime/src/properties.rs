//! Buffer-style property queries.
//!
//! Each property kind declares its element count and the [`Capability`] that
//! must be granted before it can be read.  The query functions follow one
//! protocol:
//!
//! 1. the device must hold the kind's capability, else
//!    [`PropertyError::Unsupported`];
//! 2. an empty output buffer returns the required element count and writes
//!    nothing;
//! 3. a non-empty buffer shorter than required fails with
//!    [`PropertyError::BufferTooSmall`];
//! 4. otherwise the first `required` elements are written and the count is
//!    returned.

use std::collections::HashSet;
use std::fmt;

use sweeptrack_types::{Capability, DisplayConfig, PoseSample, PropertyError};

// ────────────────────────────────────────────────────────────────────────────
// Kinds
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatProperty {
    /// Orientation as `x, y, z, w`.
    RotationQuat,
    /// Position in metres, tracking space.
    PositionVector,
    /// Six lens distortion coefficients, zeros when none are configured.
    DistortionK,
    ScreenHorizontalSize,
    ScreenVerticalSize,
    LensSeparation,
    LensVerticalPosition,
    FieldOfView,
    AspectRatio,
    Ipd,
}

impl FloatProperty {
    pub const ALL: [FloatProperty; 10] = [
        Self::RotationQuat,
        Self::PositionVector,
        Self::DistortionK,
        Self::ScreenHorizontalSize,
        Self::ScreenVerticalSize,
        Self::LensSeparation,
        Self::LensVerticalPosition,
        Self::FieldOfView,
        Self::AspectRatio,
        Self::Ipd,
    ];

    /// Number of `f32` elements the property occupies.
    pub fn len(self) -> usize {
        match self {
            Self::RotationQuat => 4,
            Self::PositionVector => 3,
            Self::DistortionK => 6,
            _ => 1,
        }
    }

    pub fn capability(self) -> Capability {
        match self {
            Self::RotationQuat => Capability::RotationalTracking,
            Self::PositionVector => Capability::PositionalTracking,
            Self::DistortionK => Capability::Distortion,
            _ => Capability::DisplayGeometry,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::RotationQuat => "rotation_quat",
            Self::PositionVector => "position_vector",
            Self::DistortionK => "distortion_k",
            Self::ScreenHorizontalSize => "screen_horizontal_size",
            Self::ScreenVerticalSize => "screen_vertical_size",
            Self::LensSeparation => "lens_separation",
            Self::LensVerticalPosition => "lens_vertical_position",
            Self::FieldOfView => "field_of_view",
            Self::AspectRatio => "aspect_ratio",
            Self::Ipd => "ipd",
        }
    }
}

impl fmt::Display for FloatProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntProperty {
    ScreenHorizontalResolution,
    ScreenVerticalResolution,
    DigitalButtonCount,
    /// Numeric [`TrackingResult`](sweeptrack_types::TrackingResult) code.
    TrackingResult,
}

impl IntProperty {
    pub const ALL: [IntProperty; 4] = [
        Self::ScreenHorizontalResolution,
        Self::ScreenVerticalResolution,
        Self::DigitalButtonCount,
        Self::TrackingResult,
    ];

    pub fn len(self) -> usize {
        1
    }

    /// `None` for kinds every device answers.
    pub fn capability(self) -> Option<Capability> {
        match self {
            Self::ScreenHorizontalResolution | Self::ScreenVerticalResolution => {
                Some(Capability::DisplayGeometry)
            }
            Self::DigitalButtonCount => Some(Capability::Buttons),
            Self::TrackingResult => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ScreenHorizontalResolution => "screen_horizontal_resolution",
            Self::ScreenVerticalResolution => "screen_vertical_resolution",
            Self::DigitalButtonCount => "digital_button_count",
            Self::TrackingResult => "tracking_result",
        }
    }
}

impl fmt::Display for IntProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Query
// ────────────────────────────────────────────────────────────────────────────

/// Everything a property read needs from one open device.
#[derive(Debug, Clone, Copy)]
pub struct PropertySource<'a> {
    pub device_id: &'a str,
    pub capabilities: &'a HashSet<Capability>,
    pub sample: PoseSample,
    pub display: Option<&'a DisplayConfig>,
    pub button_count: u32,
}

impl PropertySource<'_> {
    fn require(&self, capability: Option<Capability>, name: &str) -> Result<(), PropertyError> {
        match capability {
            Some(cap) if !self.capabilities.contains(&cap) => Err(PropertyError::Unsupported {
                device: self.device_id.to_string(),
                property: name.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Read a float property into `out`.
    ///
    /// # Errors
    ///
    /// [`PropertyError::Unsupported`] when the capability is not granted,
    /// [`PropertyError::BufferTooSmall`] for a short non-empty buffer.
    pub fn read_float(&self, kind: FloatProperty, out: &mut [f32]) -> Result<usize, PropertyError> {
        self.require(Some(kind.capability()), kind.name())?;
        let required = kind.len();
        if out.is_empty() {
            return Ok(required);
        }
        if out.len() < required {
            return Err(PropertyError::BufferTooSmall {
                required,
                provided: out.len(),
            });
        }

        let display = |f: fn(&DisplayConfig) -> f32| self.display.map_or(0.0, f);
        match kind {
            FloatProperty::RotationQuat => out[..4].copy_from_slice(&self.sample.orientation.to_xyzw()),
            FloatProperty::PositionVector => out[..3].copy_from_slice(&self.sample.position.to_array()),
            FloatProperty::DistortionK => out[..6].copy_from_slice(
                &self.display.and_then(|d| d.distortion).unwrap_or([0.0; 6]),
            ),
            FloatProperty::ScreenHorizontalSize => out[0] = display(|d| d.hsize),
            FloatProperty::ScreenVerticalSize => out[0] = display(|d| d.vsize),
            FloatProperty::LensSeparation => out[0] = display(|d| d.lens_sep),
            FloatProperty::LensVerticalPosition => out[0] = display(|d| d.lens_vpos),
            FloatProperty::FieldOfView => out[0] = display(|d| d.fov),
            FloatProperty::AspectRatio => out[0] = display(|d| d.ratio),
            FloatProperty::Ipd => out[0] = display(|d| d.ipd),
        }
        Ok(required)
    }

    /// Read an integer property into `out`; same protocol as
    /// [`read_float`](Self::read_float).
    ///
    /// # Errors
    ///
    /// See [`read_float`](Self::read_float).
    pub fn read_int(&self, kind: IntProperty, out: &mut [i32]) -> Result<usize, PropertyError> {
        self.require(kind.capability(), kind.name())?;
        let required = kind.len();
        if out.is_empty() {
            return Ok(required);
        }

        out[0] = match kind {
            IntProperty::ScreenHorizontalResolution => clamp_i32(self.display.map_or(0, |d| d.hres)),
            IntProperty::ScreenVerticalResolution => clamp_i32(self.display.map_or(0, |d| d.vres)),
            IntProperty::DigitalButtonCount => clamp_i32(self.button_count),
            IntProperty::TrackingResult => self.sample.tracking_result.code(),
        };
        Ok(required)
    }
}

fn clamp_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}
