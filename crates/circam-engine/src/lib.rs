//! Session engine for circam.
//!
//! This crate wires capture, render, encoding, the circular buffer and the
//! segment writer into one [`Session`], and runs the command loop that
//! drives it.

mod error;
mod metrics;
mod orchestrator;
mod session;
mod state;

pub use error::SessionError;
pub use metrics::{MetricsCollector, BACKLOG_WARNING_MS};
pub use orchestrator::Engine;
pub use session::{EncoderFactory, Session, SessionBackends};
pub use state::{InitializedResources, ResourceManager};

use std::sync::Arc;

use circam_ipc::SessionCommand;
use crossbeam_channel::Receiver;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Create an engine driving `session` from `command_rx`.
pub fn create_engine(session: Arc<Session>, command_rx: Receiver<SessionCommand>) -> Engine {
    Engine::new(session, command_rx)
}
