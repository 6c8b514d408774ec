//! Typed session control messages for circam.
//!
//! This crate defines the messages exchanged between the capture session and
//! the application that owns it, plus the [`ControlChannel`] that delivers
//! session events out of band.

mod channel;
mod commands;
mod events;
mod state;
mod types;

pub use channel::{ControlChannel, SubscriberId, Subscription};
pub use commands::SessionCommand;
pub use events::SessionEvent;
pub use state::{SessionState, ShutdownPhase, StartupPhase, StopReason};
pub use types::{
    ConfigError, SaveErrorCode, SaveReport, SaveResponse, SaveStatus, SessionConfig,
    SessionMetrics, WarningType,
};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for commands (application → session).
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Channel capacity for each event subscriber (session → application).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded command channel.
pub fn command_channel() -> (Sender<SessionCommand>, Receiver<SessionCommand>) {
    crossbeam_channel::bounded(COMMAND_CHANNEL_CAPACITY)
}
