//! Events sent from the session to the owning application.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::state::SessionState;
use crate::types::{SaveReport, SaveResponse, SessionMetrics, WarningType};

/// Events that the session can deliver through the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// A save finished (successfully or not).
    SaveCompleted(SaveReport),

    /// The retained window changed.
    OccupancyChanged {
        /// Retained duration (newest − oldest timestamp) in milliseconds.
        duration_ms: u64,

        /// Retained payload bytes.
        bytes: u64,

        /// Retained frame count.
        frames: usize,
    },

    /// Session state has changed.
    StateChanged {
        /// Previous state.
        previous: Box<SessionState>,

        /// Current state.
        current: Box<SessionState>,
    },

    /// Reply to `GetState`.
    State(SessionState),

    /// A save command was answered.
    SaveRequested {
        /// Target file.
        path: PathBuf,

        /// Whether the save was accepted.
        response: SaveResponse,
    },

    /// Updated pipeline metrics.
    Metrics(SessionMetrics),

    /// Performance warning detected.
    PerformanceWarning(WarningType),

    /// Error occurred.
    Error {
        /// Whether the error is recoverable.
        recoverable: bool,

        /// Error message.
        message: String,
    },

    /// Engine is ready to accept commands.
    Ready,

    /// Session has shut down; no further events follow.
    Shutdown,
}

impl SessionEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SaveCompleted(_) => "SaveCompleted",
            Self::OccupancyChanged { .. } => "OccupancyChanged",
            Self::StateChanged { .. } => "StateChanged",
            Self::State(_) => "State",
            Self::SaveRequested { .. } => "SaveRequested",
            Self::Metrics(_) => "Metrics",
            Self::PerformanceWarning(_) => "PerformanceWarning",
            Self::Error { .. } => "Error",
            Self::Ready => "Ready",
            Self::Shutdown => "Shutdown",
        }
    }
}
