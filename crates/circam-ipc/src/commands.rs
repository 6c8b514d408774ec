//! Commands sent from the application to the session engine.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Commands that the owning application can send to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionCommand {
    /// Start the capture session.
    Start,

    /// Save the retained window to a file.
    ///
    /// `None` picks a timestamped file name in the configured output directory.
    Save { path: Option<PathBuf> },

    /// Request the current session state.
    GetState,

    /// Shut the session down and stop the engine.
    Shutdown,
}
