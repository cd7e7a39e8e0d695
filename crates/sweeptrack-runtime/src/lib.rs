//! `sweeptrack-runtime` – device lifecycle, polling and pose publication.
//!
//! # Modules
//!
//! - [`pipeline`] – [`PosePipeline`][pipeline::PosePipeline]: per-frame
//!   processing from raw sweep angles and IMU samples to a
//!   [`PoseSample`][sweeptrack_types::PoseSample].  No threads, no locks.
//! - [`cache`] – [`PoseCache`][cache::PoseCache]: the single synchronised
//!   structure between a poll loop and its readers.  Last value wins,
//!   timestamps never regress, invalid samples keep the last known pose.
//! - [`poll_loop`] – [`PollLoop`][poll_loop::PollLoop]: one named OS thread
//!   per open device with cooperative cancellation.
//! - [`properties`] – float and integer property kinds and the buffer-style
//!   query protocol.
//! - [`registry`] – [`DeviceRegistry`][registry::DeviceRegistry]: drivers,
//!   enumeration, open/close and every query entry point.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: the global
//!   `tracing` subscriber with optional OTLP export.

pub mod cache;
pub mod pipeline;
pub mod poll_loop;
pub mod properties;
pub mod registry;
pub mod telemetry;

pub use cache::{ControllerCache, PoseCache, PoseHealth, PoseReader};
pub use pipeline::{FrameOutcome, PosePipeline};
pub use poll_loop::{LoopState, PollLoop, PollLoopConfig};
pub use properties::{FloatProperty, IntProperty};
pub use registry::{Device, DeviceRegistry, RuntimeConfig};
pub use telemetry::{TracerProviderGuard, init_tracing};
