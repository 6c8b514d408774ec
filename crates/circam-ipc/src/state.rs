//! Session state machine types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The current state of a capture session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum SessionState {
    /// Session has been created but not started.
    #[default]
    Uninitialized,

    /// Session is starting up.
    Initializing {
        /// Current startup phase.
        phase: StartupPhase,
    },

    /// Session is capturing into the circular buffer.
    Running,

    /// Session is capturing and a save is in flight.
    Saving {
        /// Target of the active save.
        path: PathBuf,
    },

    /// Session is shutting down.
    ShuttingDown {
        /// Current shutdown phase.
        phase: ShutdownPhase,
    },

    /// Session has ended. Terminal.
    Terminated {
        /// Why the session ended.
        reason: StopReason,
    },
}

impl SessionState {
    /// Returns true if the session has not been started.
    pub fn is_uninitialized(&self) -> bool {
        matches!(self, Self::Uninitialized)
    }

    /// Returns true if the session is starting.
    pub fn is_initializing(&self) -> bool {
        matches!(self, Self::Initializing { .. })
    }

    /// Returns true while frames are being captured, saving or not.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::Saving { .. })
    }

    /// Returns true if a save is in flight.
    pub fn is_saving(&self) -> bool {
        matches!(self, Self::Saving { .. })
    }

    /// Returns true if the session is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, Self::ShuttingDown { .. })
    }

    /// Returns true if the session has ended.
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }

    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::Initializing { .. } => "Initializing",
            Self::Running => "Running",
            Self::Saving { .. } => "Saving",
            Self::ShuttingDown { .. } => "ShuttingDown",
            Self::Terminated { .. } => "Terminated",
        }
    }
}

/// Startup phases for the session, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartupPhase {
    /// Allocating the circular buffer.
    InitBuffer,

    /// Starting the segment writer thread.
    InitWriter,

    /// Creating the codec and its input surface.
    InitEncoder,

    /// Acquiring the GPU context and starting the render loop.
    InitRender,

    /// Starting the camera frame source.
    StartCapture,
}

impl StartupPhase {
    /// The first phase.
    pub const FIRST: Self = Self::InitBuffer;

    /// The last phase.
    pub const LAST: Self = Self::StartCapture;

    /// Returns the next phase, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::InitBuffer => Some(Self::InitWriter),
            Self::InitWriter => Some(Self::InitEncoder),
            Self::InitEncoder => Some(Self::InitRender),
            Self::InitRender => Some(Self::StartCapture),
            Self::StartCapture => None,
        }
    }

    /// Returns the previous phase, if any (for rollback).
    pub fn previous(self) -> Option<Self> {
        match self {
            Self::InitBuffer => None,
            Self::InitWriter => Some(Self::InitBuffer),
            Self::InitEncoder => Some(Self::InitWriter),
            Self::InitRender => Some(Self::InitEncoder),
            Self::StartCapture => Some(Self::InitRender),
        }
    }

    /// Returns the display name for this phase.
    pub fn name(self) -> &'static str {
        match self {
            Self::InitBuffer => "Allocating buffer",
            Self::InitWriter => "Starting writer",
            Self::InitEncoder => "Initializing encoder",
            Self::InitRender => "Initializing renderer",
            Self::StartCapture => "Starting capture",
        }
    }
}

/// Shutdown phases for the session, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownPhase {
    /// Canceling an in-flight save.
    CancelSave,

    /// Stopping the frame source.
    StopCapture,

    /// Stopping the render loop and releasing the GPU context.
    StopRender,

    /// Stopping encoder input and draining its output.
    DrainEncoder,

    /// Discarding retained frames.
    ClearBuffer,

    /// Joining the segment writer.
    StopWriter,
}

impl ShutdownPhase {
    /// Returns the next phase, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::CancelSave => Some(Self::StopCapture),
            Self::StopCapture => Some(Self::StopRender),
            Self::StopRender => Some(Self::DrainEncoder),
            Self::DrainEncoder => Some(Self::ClearBuffer),
            Self::ClearBuffer => Some(Self::StopWriter),
            Self::StopWriter => None,
        }
    }

    /// Returns the display name for this phase.
    pub fn name(self) -> &'static str {
        match self {
            Self::CancelSave => "Canceling save",
            Self::StopCapture => "Stopping capture",
            Self::StopRender => "Stopping renderer",
            Self::DrainEncoder => "Draining encoder",
            Self::ClearBuffer => "Clearing buffer",
            Self::StopWriter => "Stopping writer",
        }
    }
}

/// Reason for ending the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StopReason {
    /// Owner requested shutdown.
    UserRequested,

    /// Startup failed; nothing was left running.
    InitFailed { message: String },

    /// The codec died while running.
    EncoderFailed { message: String },

    /// The render loop lost its GPU context.
    RenderFailed { message: String },
}

impl StopReason {
    /// Returns a display message for this reason.
    pub fn message(&self) -> String {
        match self {
            Self::UserRequested => "Session stopped by user".to_string(),
            Self::InitFailed { message } => format!("Initialization failed: {message}"),
            Self::EncoderFailed { message } => format!("Encoder error: {message}"),
            Self::RenderFailed { message } => format!("Render error: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_phases_round_trip() {
        let mut phase = StartupPhase::FIRST;
        let mut forward = vec![phase];
        while let Some(next) = phase.next() {
            assert_eq!(next.previous(), Some(phase));
            forward.push(next);
            phase = next;
        }
        assert_eq!(phase, StartupPhase::LAST);
        assert_eq!(forward.len(), 5);
    }

    #[test]
    fn test_saving_counts_as_running() {
        let saving = SessionState::Saving {
            path: PathBuf::from("clip.flv"),
        };
        assert!(saving.is_running());
        assert!(saving.is_saving());
        assert!(SessionState::Running.is_running());
        assert!(!SessionState::Uninitialized.is_running());
    }

    #[test]
    fn test_shutdown_phases_end_with_writer() {
        let mut phase = ShutdownPhase::CancelSave;
        while let Some(next) = phase.next() {
            phase = next;
        }
        assert_eq!(phase, ShutdownPhase::StopWriter);
    }
}
