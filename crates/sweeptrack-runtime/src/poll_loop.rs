//! [`PollLoop`] – one dedicated thread per open device.
//!
//! The thread owns the device's [`SweepSource`] and [`PosePipeline`], reads
//! frames with a bounded wait, and publishes every outcome to the shared
//! caches.  Cancellation is a flag checked once per iteration, so
//! [`PollLoop::stop`] returns within roughly one `poll_timeout`.
//!
//! ```text
//!   Idle ──start──▶ Polling ──stop──▶ Stopping ──join──▶ Stopped
//!                      │
//!                      └──read error──────────────────▶ Stopped
//! ```
//!
//! A read error is fatal to this loop only: the last sample is marked
//! invalid with [`TrackingResult::Uninitialized`] and the thread exits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use sweeptrack_hal::source::SweepSource;
use sweeptrack_types::{OpenError, TrackingResult};
use tracing::{debug, info, instrument, warn};

use crate::cache::{ControllerCache, PoseCache};
use crate::pipeline::PosePipeline;

/// Lifecycle of a [`PollLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Polling,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollLoopConfig {
    /// Upper bound on a single blocking read.
    pub poll_timeout: Duration,
}

impl Default for PollLoopConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(10),
        }
    }
}

pub struct PollLoop {
    device_id: String,
    state: Arc<Mutex<LoopState>>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PollLoop {
    /// Spawn the polling thread for `device_id`.
    ///
    /// # Errors
    ///
    /// Returns [`OpenError::Spawn`] when the OS refuses to create the thread.
    #[instrument(skip(source, pipeline, cache, controller))]
    pub fn start(
        device_id: &str,
        source: Box<dyn SweepSource>,
        pipeline: PosePipeline,
        cache: Arc<PoseCache>,
        controller: Arc<ControllerCache>,
        config: PollLoopConfig,
    ) -> Result<Self, OpenError> {
        let state = Arc::new(Mutex::new(LoopState::Idle));
        let cancel = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            device_id: device_id.to_string(),
            source,
            pipeline,
            cache,
            controller,
            state: Arc::clone(&state),
            cancel: Arc::clone(&cancel),
            poll_timeout: config.poll_timeout,
        };

        *state.lock() = LoopState::Polling;
        let handle = thread::Builder::new()
            .name(format!("sweeptrack-poll-{device_id}"))
            .spawn(move || worker.run())
            .map_err(|e| {
                *state.lock() = LoopState::Stopped;
                OpenError::Spawn(e.to_string())
            })?;

        info!(device = device_id, "Poll loop started");
        Ok(Self {
            device_id: device_id.to_string(),
            state,
            cancel,
            handle: Some(handle),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> LoopState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Polling
    }

    /// Request cancellation and wait for the thread to exit.  Idempotent.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.cancel.store(true, Ordering::Release);
        {
            let mut state = self.state.lock();
            if *state == LoopState::Polling {
                *state = LoopState::Stopping;
            }
        }
        if handle.join().is_err() {
            warn!(device = %self.device_id, "Poll thread panicked");
        }
        *self.state.lock() = LoopState::Stopped;
        info!(device = %self.device_id, "Poll loop stopped");
    }
}

impl Drop for PollLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Thread body
// ────────────────────────────────────────────────────────────────────────────

struct Worker {
    device_id: String,
    source: Box<dyn SweepSource>,
    pipeline: PosePipeline,
    cache: Arc<PoseCache>,
    controller: Arc<ControllerCache>,
    state: Arc<Mutex<LoopState>>,
    cancel: Arc<AtomicBool>,
    poll_timeout: Duration,
}

impl Worker {
    fn run(mut self) {
        while !self.cancel.load(Ordering::Acquire) {
            match self.source.read_frame(self.poll_timeout) {
                Ok(Some(frame)) => {
                    let outcome = self.pipeline.process(&frame);
                    self.cache.publish(outcome.sample);
                    if let Some(state) = outcome.controller {
                        self.controller.publish(state);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(device = %self.device_id, error = %e, "Device read failed; stopping poll loop");
                    self.cache.invalidate(TrackingResult::Uninitialized);
                    *self.state.lock() = LoopState::Stopped;
                    return;
                }
            }
        }
        debug!(device = %self.device_id, "Cancellation observed");
    }
}
