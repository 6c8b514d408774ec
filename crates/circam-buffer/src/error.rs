//! Error types for the buffer module.

use thiserror::Error;

/// Errors returned when a frame cannot enter the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// Timestamps must strictly increase.
    #[error("Out of order frame: pts {pts_us}us after {last_pts_us}us")]
    OutOfOrder { pts_us: u64, last_pts_us: u64 },

    /// The frame alone exceeds the byte budget.
    #[error("Frame of {size} bytes exceeds the {budget} byte budget")]
    FrameTooLarge { size: usize, budget: usize },
}
