//! Fixed-interval render thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use circam_capture::FrameSlot;
use circam_encoder::InputSurface;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::error::RenderError;
use crate::filter::FilterStage;
use crate::gpu::{GpuContext, GpuInit, TextureId};
use crate::RenderResult;

const STATS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Point-in-time render counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    /// Frames drawn and presented.
    pub frames_rendered: u64,

    /// Ticks skipped after a transient error.
    pub render_skips: u64,

    /// Ticks with no camera frame yet.
    pub idle_ticks: u64,

    /// Camera frames uploaded.
    pub frames_uploaded: u64,
}

#[derive(Default)]
struct RenderCounters {
    frames_rendered: AtomicU64,
    render_skips: AtomicU64,
    idle_ticks: AtomicU64,
    frames_uploaded: AtomicU64,
}

/// Shared between the handle and the render thread.
struct Shared {
    should_stop: AtomicBool,
    pending_size: Mutex<Option<(u32, u32)>>,
    fault: Mutex<Option<RenderError>>,
    counters: RenderCounters,
}

/// Owns the render thread and, through it, the GPU context.
pub struct RenderLoop {
    shared: Arc<Shared>,
    thread_handle: Option<JoinHandle<()>>,
}

impl RenderLoop {
    /// Spawn the render thread and create the GPU context on it.
    ///
    /// Blocks until the context is ready; an init failure is returned here
    /// and the thread has already exited.
    #[instrument(name = "render_loop_start", skip_all, fields(interval_ms = draw_interval.as_millis() as u64))]
    pub fn start(
        init: GpuInit,
        surface: InputSurface,
        slot: Arc<FrameSlot>,
        draw_interval: Duration,
    ) -> RenderResult<Self> {
        let shared = Arc::new(Shared {
            should_stop: AtomicBool::new(false),
            pending_size: Mutex::new(None),
            fault: Mutex::new(None),
            counters: RenderCounters::default(),
        });

        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<RenderResult<()>>(1);
        let thread_shared = Arc::clone(&shared);
        let size = surface.dimensions();

        let handle = std::thread::Builder::new()
            .name("circam-render".into())
            .spawn(move || {
                let _exit = ExitGuard(Arc::clone(&thread_shared));

                let mut gpu = match GpuResources::create(init, surface) {
                    Ok(gpu) => {
                        let _ = ready_tx.send(Ok(()));
                        gpu
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                render_loop(&mut gpu, &slot, &thread_shared, size, draw_interval);
            })
            .map_err(|e| RenderError::Thread(e.to_string()))?;

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(RenderError::InitFailed("render thread exited".into())));

        if let Err(e) = ready {
            error!(error = %e, "Render thread failed to initialize");
            let _ = handle.join();
            return Err(e);
        }

        info!(width = size.0, height = size.1, "Render loop started");
        Ok(Self {
            shared,
            thread_handle: Some(handle),
        })
    }

    /// Change the viewport size. Applied at the next tick boundary.
    pub fn resize(&self, width: u32, height: u32) {
        debug!(width, height, "Surface resize requested");
        *self.shared.pending_size.lock() = Some((width, height));
    }

    /// Fatal error raised by the render thread, if any.
    pub fn fault(&self) -> Option<RenderError> {
        self.shared.fault.lock().clone()
    }

    /// Returns true while the render thread is alive.
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Current counters.
    pub fn stats(&self) -> RenderStats {
        let c = &self.shared.counters;
        RenderStats {
            frames_rendered: c.frames_rendered.load(Ordering::Relaxed),
            render_skips: c.render_skips.load(Ordering::Relaxed),
            idle_ticks: c.idle_ticks.load(Ordering::Relaxed),
            frames_uploaded: c.frames_uploaded.load(Ordering::Relaxed),
        }
    }

    /// Stop the loop and join the thread. The GPU context is released on the
    /// render thread before this returns. Idempotent.
    #[instrument(name = "render_loop_stop", skip(self))]
    pub fn stop(&mut self) {
        self.shared.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("Render thread panicked");
            }
            let stats = self.stats();
            info!(
                rendered = stats.frames_rendered,
                skips = stats.render_skips,
                "Render loop stopped"
            );
        }
    }
}

impl Drop for RenderLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Records a panic of the render thread as a fault.
struct ExitGuard(Arc<Shared>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.fault.lock().get_or_insert(RenderError::Panicked);
        }
    }
}

/// GPU objects owned by the render thread, released exactly once on drop.
struct GpuResources {
    context: Box<dyn GpuContext>,
    filter: Box<dyn FilterStage>,
    source_texture: Option<TextureId>,
}

impl GpuResources {
    fn create(init: GpuInit, surface: InputSurface) -> RenderResult<Self> {
        let backend = init(surface)?;
        let mut resources = Self {
            context: backend.context,
            filter: backend.filter,
            source_texture: None,
        };
        resources.source_texture = Some(resources.context.create_external_texture()?);
        debug!(filter = resources.filter.name(), "GPU resources created");
        Ok(resources)
    }

    fn draw(&mut self, texture: TextureId, width: u32, height: u32) -> RenderResult<()> {
        self.context.set_viewport(width, height);
        self.context.clear();
        self.filter.draw(self.context.as_mut(), texture, width, height)?;
        self.context.flush()?;
        self.context.swap_buffers()
    }
}

impl Drop for GpuResources {
    fn drop(&mut self) {
        if let Some(texture) = self.source_texture.take() {
            self.context.delete_texture(texture);
        }
        self.filter.release();
        self.context.release();
        debug!("GPU resources released");
    }
}

enum Tick {
    Rendered,
    Idle,
    Skipped,
}

fn render_loop(
    gpu: &mut GpuResources,
    slot: &FrameSlot,
    shared: &Shared,
    initial_size: (u32, u32),
    draw_interval: Duration,
) {
    let start_time = Instant::now();
    let mut last_log_time = Instant::now();
    let mut size = initial_size;
    let mut has_frame = false;
    let counters = &shared.counters;

    while !shared.should_stop.load(Ordering::SeqCst) {
        let tick_start = Instant::now();

        if let Some(new_size) = shared.pending_size.lock().take() {
            debug!(width = new_size.0, height = new_size.1, "Applying surface resize");
            size = new_size;
        }

        match tick(gpu, slot, size, &mut has_frame, counters) {
            Ok(Tick::Rendered) => {
                counters.frames_rendered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Tick::Idle) => {
                counters.idle_ticks.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Tick::Skipped) => {
                counters.render_skips.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                error!(error = %e, "Fatal render error, stopping render loop");
                *shared.fault.lock() = Some(e);
                break;
            }
        }

        if last_log_time.elapsed() >= STATS_LOG_INTERVAL {
            let elapsed = start_time.elapsed().as_secs_f32();
            let rendered = counters.frames_rendered.load(Ordering::Relaxed);
            info!(
                rendered,
                skips = counters.render_skips.load(Ordering::Relaxed),
                fps = rendered as f32 / elapsed.max(f32::EPSILON),
                uptime_s = elapsed,
                "Render stats"
            );
            last_log_time = Instant::now();
        }

        let elapsed = tick_start.elapsed();
        if elapsed < draw_interval {
            std::thread::sleep(draw_interval - elapsed);
        }
    }

    debug!("Render loop exited");
}

/// One render cycle. Errors only for fatal conditions.
fn tick(
    gpu: &mut GpuResources,
    slot: &FrameSlot,
    (width, height): (u32, u32),
    has_frame: &mut bool,
    counters: &RenderCounters,
) -> RenderResult<Tick> {
    let Some(texture) = gpu.source_texture else {
        return Err(RenderError::ContextLost);
    };

    if let Some(frame) = slot.take_pending() {
        match gpu.context.update_texture(texture, &frame) {
            Ok(()) => {
                *has_frame = true;
                counters.frames_uploaded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Texture update failed, skipping tick");
                return Ok(Tick::Skipped);
            }
        }
    }

    if !*has_frame {
        return Ok(Tick::Idle);
    }

    match gpu.draw(texture, width, height) {
        Ok(()) => {
            trace!("Frame rendered");
            Ok(Tick::Rendered)
        }
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!(error = %e, "Draw failed, skipping tick");
            Ok(Tick::Skipped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::PassthroughFilter;
    use crate::gpu::RenderBackend;
    use crate::software::{software_backend, SoftwareGpu};
    use bytes::Bytes;
    use circam_capture::{CaptureTimestamp, CapturedFrame};

    fn publish(slot: &FrameSlot, width: u32, height: u32, sequence: u64) {
        slot.publish(CapturedFrame::new(
            Bytes::from(vec![90u8; (width * height * 4) as usize]),
            width,
            height,
            CaptureTimestamp::now(Instant::now()),
            sequence,
        ));
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_idle_until_first_frame_then_renders() {
        let (surface, rx) = InputSurface::with_channel(4, 4, 64);
        let slot = Arc::new(FrameSlot::new());
        let mut render = RenderLoop::start(
            software_backend(|| Box::new(PassthroughFilter)),
            surface,
            Arc::clone(&slot),
            Duration::from_millis(5),
        )
        .unwrap();

        assert!(wait_until(|| render.stats().idle_ticks >= 2));
        assert!(rx.try_recv().is_err());

        publish(&slot, 4, 4, 0);
        assert!(wait_until(|| render.stats().frames_rendered >= 3));

        render.stop();
        render.stop();
        assert!(!render.is_running());
        assert!(render.fault().is_none());

        let frames: Vec<_> = rx.try_iter().collect();
        assert!(frames.len() >= 3);
        assert!(frames.windows(2).all(|w| w[0].pts_us < w[1].pts_us));
    }

    #[test]
    fn test_init_failure_is_returned() {
        let (surface, _rx) = InputSurface::with_channel(4, 4, 4);
        let init: GpuInit = Box::new(|_| Err(RenderError::InitFailed("no display".into())));

        let result = RenderLoop::start(
            init,
            surface,
            Arc::new(FrameSlot::new()),
            Duration::from_millis(5),
        );
        assert_eq!(
            result.err(),
            Some(RenderError::InitFailed("no display".into()))
        );
    }

    #[test]
    fn test_context_loss_sets_fault() {
        let (surface, _rx) = InputSurface::with_channel(4, 4, 64);
        let lost = Arc::new(AtomicBool::new(false));
        let init: GpuInit = {
            let lost = Arc::clone(&lost);
            Box::new(move |surface| {
                Ok(RenderBackend {
                    context: Box::new(SoftwareGpu::with_loss_flag(surface, lost)),
                    filter: Box::new(PassthroughFilter),
                })
            })
        };
        let slot = Arc::new(FrameSlot::new());
        let mut render =
            RenderLoop::start(init, surface, Arc::clone(&slot), Duration::from_millis(5)).unwrap();

        publish(&slot, 4, 4, 0);
        assert!(wait_until(|| render.stats().frames_rendered >= 1));

        lost.store(true, Ordering::SeqCst);
        assert!(wait_until(|| render.fault().is_some()));
        assert_eq!(render.fault(), Some(RenderError::ContextLost));
        assert!(wait_until(|| !render.is_running()));
        render.stop();
    }

    #[test]
    fn test_bad_frame_skips_tick() {
        let (surface, _rx) = InputSurface::with_channel(4, 4, 64);
        let slot = Arc::new(FrameSlot::new());
        let mut render = RenderLoop::start(
            software_backend(|| Box::new(PassthroughFilter)),
            surface,
            Arc::clone(&slot),
            Duration::from_millis(5),
        )
        .unwrap();

        // 8 bytes cannot hold a 4x4 RGBA frame
        slot.publish(CapturedFrame::new(
            Bytes::from(vec![0u8; 8]),
            4,
            4,
            CaptureTimestamp::now(Instant::now()),
            0,
        ));

        assert!(wait_until(|| render.stats().render_skips >= 1));
        assert!(render.fault().is_none());
        render.stop();
    }

    #[test]
    fn test_resize_applies_between_ticks() {
        let (surface, rx) = InputSurface::with_channel(4, 4, 256);
        let slot = Arc::new(FrameSlot::new());
        let mut render = RenderLoop::start(
            software_backend(|| Box::new(PassthroughFilter)),
            surface,
            Arc::clone(&slot),
            Duration::from_millis(5),
        )
        .unwrap();

        publish(&slot, 4, 4, 0);
        assert!(wait_until(|| render.stats().frames_rendered >= 1));
        render.resize(2, 2);
        let before = render.stats().frames_rendered;
        assert!(wait_until(|| render.stats().frames_rendered >= before + 3));
        render.stop();

        // The last frame drew into a 2x2 viewport; pixel (3, 3) stays black.
        let last = rx.try_iter().last().unwrap();
        let i = (3 * 4 + 3) * 4;
        assert_eq!(&last.data[i..i + 4], &[0, 0, 0, 255]);
        assert_eq!(&last.data[0..4], &[90, 90, 90, 90]);
    }
}
