//! [`PoseCache`] – last-value-wins pose store shared between one poll loop
//! and any number of readers.
//!
//! The slot is a small `Copy` value behind a `parking_lot::RwLock`; every
//! critical section is a single copy in or out, so readers never wait on
//! triangulation or fusion.
//!
//! The cache also enforces the publication invariants:
//!
//! - timestamps never go backwards (a regressing timestamp is clamped to the
//!   previous one);
//! - an invalid sample keeps the last known position and orientation.
//!
//! Staleness is tracked the way a heartbeat watchdog tracks components: each
//! publication records its wall-clock instant and [`PoseCache::health`]
//! compares the age against a deadline.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use sweeptrack_runtime::cache::PoseCache;
//! use sweeptrack_types::{PoseSample, TrackingResult, Vec3};
//!
//! let cache = Arc::new(PoseCache::new());
//! let mut reader = PoseCache::reader(&cache);
//!
//! cache.publish(PoseSample {
//!     position: Vec3::new(0.0, 1.6, 0.0),
//!     valid: true,
//!     tracking_result: TrackingResult::Running,
//!     timestamp: 1.0,
//!     ..PoseSample::default()
//! });
//!
//! assert!(reader.snapshot_if_updated().is_some());
//! assert!(reader.snapshot_if_updated().is_none());
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use sweeptrack_types::{ControllerState, PoseSample, TrackingResult};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Freshness of the most recent publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoseHealth {
    /// Nothing has been published yet.
    NeverPublished,
    /// The last publication is within the deadline.
    Fresh,
    /// The last publication is older than the deadline.
    Stale,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal slot
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    sample: PoseSample,
    /// Incremented on every mutation.
    generation: u64,
    published_at: Option<Instant>,
}

// ────────────────────────────────────────────────────────────────────────────
// PoseCache
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct PoseCache {
    slot: RwLock<Slot>,
}

impl PoseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `sample` as the latest pose and return what was actually stored
    /// after the timestamp clamp and pose retention.
    pub fn publish(&self, sample: PoseSample) -> PoseSample {
        let mut slot = self.slot.write();
        let prev = slot.sample;
        let mut next = sample;

        // Also catches NaN.
        if slot.generation > 0 && !(next.timestamp >= prev.timestamp) {
            next.timestamp = prev.timestamp;
        }
        if !next.valid {
            next.position = prev.position;
            next.orientation = prev.orientation;
        }

        slot.sample = next;
        slot.generation += 1;
        slot.published_at = Some(Instant::now());
        next
    }

    /// Mark the current sample invalid, keeping its pose and timestamp.
    ///
    /// Only the owning poll loop calls this, on its disconnect path after
    /// the last [`publish`](Self::publish); the cache keeps a single writer.
    pub fn invalidate(&self, tracking_result: TrackingResult) {
        let mut slot = self.slot.write();
        slot.sample.valid = false;
        slot.sample.tracking_result = tracking_result;
        slot.generation += 1;
    }

    /// A consistent copy of the latest sample.
    pub fn snapshot(&self) -> PoseSample {
        self.slot.read().sample
    }

    pub fn generation(&self) -> u64 {
        self.slot.read().generation
    }

    /// Time since the last publication.
    pub fn age(&self) -> Option<Duration> {
        self.slot.read().published_at.map(|t| t.elapsed())
    }

    pub fn health(&self, max_age: Duration) -> PoseHealth {
        match self.age() {
            None => PoseHealth::NeverPublished,
            Some(age) if age <= max_age => PoseHealth::Fresh,
            Some(_) => PoseHealth::Stale,
        }
    }

    /// A polling handle that remembers what it has already seen.
    pub fn reader(cache: &Arc<Self>) -> PoseReader {
        PoseReader {
            cache: Arc::clone(cache),
            seen: 0,
        }
    }

    fn read_with_generation(&self) -> (PoseSample, u64) {
        let slot = self.slot.read();
        (slot.sample, slot.generation)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// PoseReader
// ────────────────────────────────────────────────────────────────────────────

/// Consumer handle onto a [`PoseCache`].
#[derive(Debug, Clone)]
pub struct PoseReader {
    cache: Arc<PoseCache>,
    seen: u64,
}

impl PoseReader {
    pub fn snapshot(&mut self) -> PoseSample {
        let (sample, generation) = self.cache.read_with_generation();
        self.seen = generation;
        sample
    }

    /// The latest sample, or `None` when nothing changed since the previous
    /// call on this reader.
    pub fn snapshot_if_updated(&mut self) -> Option<PoseSample> {
        let (sample, generation) = self.cache.read_with_generation();
        if generation == self.seen {
            return None;
        }
        self.seen = generation;
        Some(sample)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ControllerCache
// ────────────────────────────────────────────────────────────────────────────

/// Latest button state of a controller, same discipline as [`PoseCache`].
#[derive(Debug, Default)]
pub struct ControllerCache {
    state: RwLock<Option<ControllerState>>,
}

impl ControllerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, state: ControllerState) {
        *self.state.write() = Some(state);
    }

    pub fn snapshot(&self) -> Option<ControllerState> {
        *self.state.read()
    }

    pub fn clear(&self) {
        *self.state.write() = None;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
