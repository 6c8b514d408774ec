//! Render loop for the camera pipeline.
//!
//! A dedicated thread owns the GPU context for the lifetime of a session. At
//! a fixed interval it uploads the newest camera frame, runs the filter stage
//! into the encoder's input surface, and presents the result. The context is
//! created on that thread and released there on every exit path.

mod error;
mod filter;
mod gpu;
mod render_loop;
mod software;

pub use error::RenderError;
pub use filter::{ChromaticAberrationFilter, FilterStage, PassthroughFilter};
pub use gpu::{Canvas, GpuContext, GpuInit, RenderBackend, TextureId};
pub use render_loop::{RenderLoop, RenderStats};
pub use software::{software_backend, SoftwareGpu};

/// Result type for render operations.
pub type RenderResult<T> = Result<T, RenderError>;
