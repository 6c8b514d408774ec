//! Error types for the session engine.

use circam_ipc::{ConfigError, StartupPhase};
use thiserror::Error;

/// Errors returned by [`crate::Session`] operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The configuration cannot be honoured.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// A startup phase failed; completed phases were rolled back.
    #[error("{} failed: {message}", .phase.name())]
    InitFailed {
        phase: StartupPhase,
        message: String,
    },

    /// `start()` was called on a session that is already running.
    #[error("Session already started")]
    AlreadyStarted,

    /// The session has ended and cannot be restarted.
    #[error("Session terminated")]
    Terminated,
}

impl SessionError {
    pub(crate) fn init(phase: StartupPhase, error: impl std::fmt::Display) -> Self {
        Self::InitFailed {
            phase,
            message: error.to_string(),
        }
    }
}
