//! GPU context contract.

use circam_capture::CapturedFrame;
use circam_encoder::InputSurface;

use crate::filter::FilterStage;
use crate::RenderResult;

/// Handle to a texture owned by a [`GpuContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u32);

/// A drawing context bound to the encoder's input surface.
///
/// Owned by the render thread; never shared.
pub trait GpuContext {
    /// Create the texture camera frames are uploaded into.
    fn create_external_texture(&mut self) -> RenderResult<TextureId>;

    /// Upload a camera frame into `texture`.
    fn update_texture(&mut self, texture: TextureId, frame: &CapturedFrame) -> RenderResult<()>;

    /// Restrict drawing to the top-left `width`x`height` region.
    fn set_viewport(&mut self, width: u32, height: u32);

    /// Clear the framebuffer to opaque black.
    fn clear(&mut self);

    /// Bind `source` for sampling and the framebuffer for writing.
    fn bind_pass(&mut self, source: TextureId) -> RenderResult<Canvas<'_>>;

    /// Finish pending drawing.
    fn flush(&mut self) -> RenderResult<()>;

    /// Present the framebuffer to the input surface.
    fn swap_buffers(&mut self) -> RenderResult<()>;

    /// Delete a texture. Unknown ids are ignored.
    fn delete_texture(&mut self, texture: TextureId);

    /// Release the context. Further calls fail with `ContextLost`.
    fn release(&mut self);
}

/// What a [`GpuInit`] produces on the render thread.
pub struct RenderBackend {
    pub context: Box<dyn GpuContext>,
    pub filter: Box<dyn FilterStage>,
}

/// Creates the GPU context and filter on the render thread.
pub type GpuInit = Box<dyn FnOnce(InputSurface) -> RenderResult<RenderBackend> + Send>;

/// One draw pass: a sampled source texture and the writable viewport.
pub struct Canvas<'a> {
    source: &'a [u8],
    source_width: u32,
    source_height: u32,
    target: &'a mut [u8],
    stride: u32,
    width: u32,
    height: u32,
}

impl<'a> Canvas<'a> {
    /// `target` is an RGBA framebuffer `stride` pixels wide; the viewport is
    /// its top-left `width`x`height` region.
    pub fn new(
        source: &'a [u8],
        source_width: u32,
        source_height: u32,
        target: &'a mut [u8],
        stride: u32,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            source,
            source_width,
            source_height,
            target,
            stride,
            width,
            height,
        }
    }

    /// Viewport width.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Viewport height.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Nearest-neighbour sample at normalized coordinates, clamped to edge.
    pub fn sample(&self, u: f32, v: f32) -> [u8; 4] {
        if self.source_width == 0 || self.source_height == 0 {
            return [0, 0, 0, 255];
        }
        let x = ((u.clamp(0.0, 1.0) * self.source_width as f32) as u32).min(self.source_width - 1);
        let y =
            ((v.clamp(0.0, 1.0) * self.source_height as f32) as u32).min(self.source_height - 1);
        let i = (y as usize * self.source_width as usize + x as usize) * 4;
        [
            self.source[i],
            self.source[i + 1],
            self.source[i + 2],
            self.source[i + 3],
        ]
    }

    /// Write one viewport pixel. Out-of-viewport writes are ignored.
    pub fn put(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let i = (y as usize * self.stride as usize + x as usize) * 4;
        self.target[i..i + 4].copy_from_slice(&rgba);
    }
}
