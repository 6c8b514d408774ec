//! Error types for the encoder module.

use thiserror::Error;

/// Errors that can occur during encoding operations.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// No usable codec in this build or on this system.
    #[error("Encoder not supported: {0}")]
    NotSupported(String),

    /// Codec initialization failed.
    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// General encoding error.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Invalid input data.
    #[error("Invalid input data: {0}")]
    InvalidInput(String),

    /// Encoder already flushed or stopped.
    #[error("Encoder not running")]
    NotRunning,

    /// Failed to spawn a worker thread.
    #[error("Failed to spawn encoder thread: {0}")]
    Thread(#[from] std::io::Error),
}
