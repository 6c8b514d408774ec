//! Camera frame sources.
//!
//! A [`FrameSource`] publishes RGBA frames into a shared [`FrameSlot`]. The
//! slot stands in for the GPU-visible camera texture: only the latest frame
//! is kept, and the render loop picks it up at its own cadence.

mod error;
mod frame;
mod pattern;
mod slot;

pub use error::CaptureError;
pub use frame::{CaptureTimestamp, CapturedFrame};
pub use pattern::TestPatternSource;
pub use slot::FrameSlot;

use std::sync::Arc;

/// Result type for capture operations.
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Trait for camera frame sources.
///
/// Implementations deliver frames from their own thread or callback and must
/// never block on downstream consumers.
pub trait FrameSource: Send {
    /// Start delivering frames into `slot`.
    fn start(&mut self, slot: Arc<FrameSlot>) -> CaptureResult<()>;

    /// Stop delivering frames. Idempotent.
    fn stop(&mut self) -> CaptureResult<()>;

    /// Check if capture is active.
    fn is_active(&self) -> bool;

    /// Get the source dimensions.
    fn dimensions(&self) -> (u32, u32);
}
