//! Error types for the capture module.

use thiserror::Error;

/// Errors that can occur during capture operations.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Capture already started.
    #[error("Capture already started")]
    AlreadyStarted,

    /// Frame dimensions the source cannot produce.
    #[error("Invalid capture dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// Capture device lost.
    #[error("Capture device lost")]
    DeviceLost,

    /// Failed to spawn the capture thread.
    #[error("Failed to spawn capture thread: {0}")]
    Thread(#[from] std::io::Error),
}
