//! Generic `SweepSource` trait for anything that delivers sensor frames.
//!
//! A poll loop owns exactly one source and calls
//! [`SweepSource::read_frame`] with a bounded wait.  The rest of the pipeline
//! only ever talks to the trait, so a USB transport, a replay file, or the
//! simulator can stand behind it.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use sweeptrack_types::{DeviceIoError, SensorFrame};

/// A producer of [`SensorFrame`]s for one device.
pub trait SweepSource: Send {
    /// Identifier of the device this source reads from.
    fn id(&self) -> &str;

    /// Wait at most `timeout` for the next frame.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceIoError`] when the device is gone or the read failed;
    /// the caller stops polling this source.
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<SensorFrame>, DeviceIoError>;
}

/// A source fed through a `crossbeam` channel.
///
/// Dropping every [`Sender`] reads as a disconnect.
pub struct ChannelSource {
    id: String,
    rx: Receiver<SensorFrame>,
}

impl ChannelSource {
    pub fn new(id: impl Into<String>, rx: Receiver<SensorFrame>) -> Self {
        Self { id: id.into(), rx }
    }

    /// Create a source together with the sender that feeds it.
    pub fn pair(id: impl Into<String>) -> (Sender<SensorFrame>, Self) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (tx, Self::new(id, rx))
    }
}

impl SweepSource for ChannelSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Option<SensorFrame>, DeviceIoError> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(DeviceIoError::Disconnected(self.id.clone())),
        }
    }
}
