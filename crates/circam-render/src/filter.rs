//! Filter stages drawn once per render tick.

use tracing::debug;

use crate::gpu::{GpuContext, TextureId};
use crate::RenderResult;

/// A shader pass from the camera texture into the bound surface.
///
/// Implementations must not keep `source_texture` beyond the call.
pub trait FilterStage {
    /// Draw `source_texture` into a `width`x`height` viewport.
    fn draw(
        &mut self,
        gpu: &mut dyn GpuContext,
        source_texture: TextureId,
        width: u32,
        height: u32,
    ) -> RenderResult<()>;

    /// Filter name for diagnostics.
    fn name(&self) -> &'static str;

    /// Free filter resources.
    fn release(&mut self);
}

/// Copies the camera frame, scaled to the viewport.
#[derive(Debug, Default)]
pub struct PassthroughFilter;

impl FilterStage for PassthroughFilter {
    fn draw(
        &mut self,
        gpu: &mut dyn GpuContext,
        source_texture: TextureId,
        width: u32,
        height: u32,
    ) -> RenderResult<()> {
        let mut canvas = gpu.bind_pass(source_texture)?;
        let (w, h) = (width.min(canvas.width()), height.min(canvas.height()));
        for y in 0..h {
            let v = (y as f32 + 0.5) / h as f32;
            for x in 0..w {
                let u = (x as f32 + 0.5) / w as f32;
                let pixel = canvas.sample(u, v);
                canvas.put(x, y, pixel);
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn release(&mut self) {}
}

/// Splits red and blue horizontally, more towards the edges.
#[derive(Debug)]
pub struct ChromaticAberrationFilter {
    /// Maximum channel offset at the frame edge, as a fraction of the width.
    strength: f32,
}

impl ChromaticAberrationFilter {
    /// Create a filter with the given edge offset (fraction of width).
    pub fn new(strength: f32) -> Self {
        Self {
            strength: strength.clamp(0.0, 0.5),
        }
    }
}

impl Default for ChromaticAberrationFilter {
    fn default() -> Self {
        Self::new(0.01)
    }
}

impl FilterStage for ChromaticAberrationFilter {
    fn draw(
        &mut self,
        gpu: &mut dyn GpuContext,
        source_texture: TextureId,
        width: u32,
        height: u32,
    ) -> RenderResult<()> {
        let mut canvas = gpu.bind_pass(source_texture)?;
        let (w, h) = (width.min(canvas.width()), height.min(canvas.height()));
        for y in 0..h {
            let v = (y as f32 + 0.5) / h as f32;
            for x in 0..w {
                let u = (x as f32 + 0.5) / w as f32;
                let offset = (u - 0.5) * 2.0 * self.strength;
                let r = canvas.sample(u + offset, v)[0];
                let [_, g, _, a] = canvas.sample(u, v);
                let b = canvas.sample(u - offset, v)[2];
                canvas.put(x, y, [r, g, b, a]);
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "chromatic-aberration"
    }

    fn release(&mut self) {
        debug!(filter = self.name(), "Filter released");
    }
}
