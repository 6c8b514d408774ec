//! CPU implementation of the GPU contract for headless runs and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use circam_capture::CapturedFrame;
use circam_encoder::InputSurface;
use tracing::{debug, trace};

use crate::error::RenderError;
use crate::filter::FilterStage;
use crate::gpu::{Canvas, GpuContext, GpuInit, RenderBackend, TextureId};
use crate::RenderResult;

struct Texture {
    data: Bytes,
    width: u32,
    height: u32,
}

/// RGBA framebuffer the size of the input surface.
pub struct SoftwareGpu {
    surface: InputSurface,
    width: u32,
    height: u32,
    viewport: (u32, u32),
    framebuffer: Vec<u8>,
    textures: HashMap<TextureId, Texture>,
    next_texture: u32,
    lost: Arc<AtomicBool>,
    released: bool,
}

impl SoftwareGpu {
    /// Create a context presenting into `surface`.
    pub fn new(surface: InputSurface) -> Self {
        Self::with_loss_flag(surface, Arc::new(AtomicBool::new(false)))
    }

    /// Create a context that reports `ContextLost` once `lost` is set.
    pub fn with_loss_flag(surface: InputSurface, lost: Arc<AtomicBool>) -> Self {
        let (width, height) = surface.dimensions();
        debug!(width, height, "Software GPU context created");
        Self {
            surface,
            width,
            height,
            viewport: (width, height),
            framebuffer: vec![0u8; width as usize * height as usize * 4],
            textures: HashMap::new(),
            next_texture: 1,
            lost,
            released: false,
        }
    }

    /// Current framebuffer contents.
    pub fn framebuffer(&self) -> &[u8] {
        &self.framebuffer
    }

    /// Number of live textures.
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    fn check(&self) -> RenderResult<()> {
        if self.released || self.lost.load(Ordering::Acquire) {
            Err(RenderError::ContextLost)
        } else {
            Ok(())
        }
    }
}

impl GpuContext for SoftwareGpu {
    fn create_external_texture(&mut self) -> RenderResult<TextureId> {
        self.check()?;
        let id = TextureId(self.next_texture);
        self.next_texture += 1;
        self.textures.insert(
            id,
            Texture {
                data: Bytes::new(),
                width: 0,
                height: 0,
            },
        );
        Ok(id)
    }

    fn update_texture(&mut self, texture: TextureId, frame: &CapturedFrame) -> RenderResult<()> {
        self.check()?;
        if !frame.is_valid() {
            return Err(RenderError::TextureUpdate(format!(
                "{} bytes for {}x{}",
                frame.data.len(),
                frame.width,
                frame.height
            )));
        }
        let slot = self
            .textures
            .get_mut(&texture)
            .ok_or(RenderError::UnknownTexture(texture.0))?;
        slot.data = frame.data.clone();
        slot.width = frame.width;
        slot.height = frame.height;
        trace!(sequence = frame.sequence, "Texture updated");
        Ok(())
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        self.viewport = (width.min(self.width), height.min(self.height));
    }

    fn clear(&mut self) {
        for pixel in self.framebuffer.chunks_exact_mut(4) {
            pixel.copy_from_slice(&[0, 0, 0, 255]);
        }
    }

    fn bind_pass(&mut self, source: TextureId) -> RenderResult<Canvas<'_>> {
        self.check()?;
        let texture = self
            .textures
            .get(&source)
            .ok_or(RenderError::UnknownTexture(source.0))?;
        Ok(Canvas::new(
            &texture.data,
            texture.width,
            texture.height,
            &mut self.framebuffer,
            self.width,
            self.viewport.0,
            self.viewport.1,
        ))
    }

    fn flush(&mut self) -> RenderResult<()> {
        self.check()
    }

    fn swap_buffers(&mut self) -> RenderResult<()> {
        self.check()?;
        // A full encoder queue drops the frame; the surface counts it.
        self.surface.present(Bytes::copy_from_slice(&self.framebuffer));
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.textures.clear();
            self.framebuffer = Vec::new();
            debug!("Software GPU context released");
        }
    }
}

/// [`GpuInit`] creating a [`SoftwareGpu`] with the filter from `make_filter`.
pub fn software_backend<F>(make_filter: F) -> GpuInit
where
    F: FnOnce() -> Box<dyn FilterStage> + Send + 'static,
{
    Box::new(move |surface| {
        Ok(RenderBackend {
            context: Box::new(SoftwareGpu::new(surface)),
            filter: make_filter(),
        })
    })
}
