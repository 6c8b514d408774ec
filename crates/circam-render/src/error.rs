//! Error types for the render module.

use thiserror::Error;

/// Errors that can occur while rendering.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    /// GPU context could not be created.
    #[error("GPU initialization failed: {0}")]
    InitFailed(String),

    /// The GPU context is gone; fatal for the session.
    #[error("GPU context lost")]
    ContextLost,

    /// Texture id not known to the context.
    #[error("Unknown texture {0}")]
    UnknownTexture(u32),

    /// Camera frame could not be uploaded.
    #[error("Texture update failed: {0}")]
    TextureUpdate(String),

    /// Draw or present failed for one tick.
    #[error("Draw failed: {0}")]
    Draw(String),

    /// The render thread panicked.
    #[error("Render thread panicked")]
    Panicked,

    /// Failed to spawn the render thread.
    #[error("Failed to spawn render thread: {0}")]
    Thread(String),
}

impl RenderError {
    /// Whether the session cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InitFailed(_) | Self::ContextLost | Self::Panicked | Self::Thread(_)
        )
    }
}
