//! Keyframe-aligned circular buffer of compressed video frames.
//!
//! The buffer keeps a trailing window of encoder output bounded by both a
//! duration and a byte budget. It always starts at a keyframe, so any
//! snapshot of it can be written out as a playable segment.

mod circular;
mod error;
mod frame;
mod snapshot;

pub use circular::{AddOutcome, BufferOccupancy, BufferStats, CircularBuffer};
pub use error::BufferError;
pub use frame::CompressedFrame;
pub use snapshot::BufferSnapshot;

use std::time::Duration;

/// Result type for buffer operations.
pub type BufferResult<T> = Result<T, BufferError>;

/// Retention budget of a [`CircularBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Maximum newest-to-oldest timestamp span.
    pub max_duration: Duration,

    /// Maximum total payload bytes.
    pub max_bytes: usize,
}

impl RetentionPolicy {
    /// Create a policy from a duration and a byte budget.
    pub fn new(max_duration: Duration, max_bytes: usize) -> Self {
        Self {
            max_duration,
            max_bytes,
        }
    }

    /// Duration budget in microseconds.
    pub fn max_duration_us(&self) -> u64 {
        self.max_duration.as_micros() as u64
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        // 20 s at 6 Mbps
        Self::new(Duration::from_secs(20), 15_000_000)
    }
}

/// Consumer of compressed frames in presentation order.
pub trait FrameSink: Send + Sync {
    /// Append a frame.
    fn add(&self, frame: CompressedFrame) -> BufferResult<AddOutcome>;
}
