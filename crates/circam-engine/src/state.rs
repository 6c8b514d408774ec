//! Resource management and initialization tracking.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use circam_buffer::{CircularBuffer, FrameSink, RetentionPolicy};
use circam_capture::{FrameSlot, FrameSource};
use circam_encoder::{AddObserver, DrainPolicy, EncoderSession, VideoEncoderConfig};
use circam_ipc::{SaveResponse, SessionConfig, SessionEvent, ShutdownPhase, StartupPhase, StopReason};
use circam_mux::{CompletionCallback, SaveRequest, SegmentWriter, StreamInfo};
use circam_render::{GpuInit, RenderLoop};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, trace, warn};

use crate::error::SessionError;
use crate::metrics::MetricsCollector;
use crate::session::{EncoderFactory, SessionBackends, SessionShared};
use crate::SessionResult;

/// Resources that have been initialized during startup.
#[derive(Default)]
pub struct InitializedResources {
    /// Retained window of encoded frames.
    pub buffer: Option<Arc<CircularBuffer>>,

    /// Save-to-file worker.
    pub writer: Option<SegmentWriter>,

    /// Codec worker and drain.
    pub encoder: Option<EncoderSession>,

    /// Render thread, owner of the GPU context.
    pub render: Option<RenderLoop>,

    /// Running camera source.
    pub source: Option<Box<dyn FrameSource>>,
}

/// Backend pieces not yet consumed by a startup phase.
struct PendingBackends {
    source: Option<Box<dyn FrameSource>>,
    gpu: Option<GpuInit>,
    encoder: Option<EncoderFactory>,
}

impl From<SessionBackends> for PendingBackends {
    fn from(backends: SessionBackends) -> Self {
        Self {
            source: Some(backends.source),
            gpu: Some(backends.gpu),
            encoder: Some(backends.encoder),
        }
    }
}

/// Brings session resources up in [`StartupPhase`] order and tears them
/// down in reverse.
///
/// Once [`ResourceManager::shutdown`] has begun, no phase stores a new
/// resource and no save is accepted.
pub struct ResourceManager {
    resources: Mutex<InitializedResources>,
    current_phase: Mutex<Option<StartupPhase>>,
    slot: Arc<FrameSlot>,
    /// Set under the `resources` lock when shutdown begins.
    closed: AtomicBool,
}

impl ResourceManager {
    /// Create a new resource manager.
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(InitializedResources::default()),
            current_phase: Mutex::new(None),
            slot: Arc::new(FrameSlot::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns true once shutdown has begun.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Lock the resources for a startup phase, unless shutdown has begun.
    fn lock_open(&self) -> Result<MutexGuard<'_, InitializedResources>, String> {
        let resources = self.resources.lock();
        if self.is_closed() {
            return Err("session shut down during startup".into());
        }
        Ok(resources)
    }

    /// Run every startup phase in order. Stops at the first failure and
    /// leaves rollback to the caller.
    #[instrument(name = "init_resources", skip_all)]
    pub(crate) fn initialize(
        &self,
        config: &SessionConfig,
        backends: SessionBackends,
        shared: &Arc<SessionShared>,
        mut on_phase: impl FnMut(StartupPhase),
    ) -> SessionResult<()> {
        let mut pending = PendingBackends::from(backends);
        let mut phase = StartupPhase::FIRST;

        loop {
            *self.current_phase.lock() = Some(phase);
            on_phase(phase);
            self.init_phase(config, phase, &mut pending, shared)?;

            match phase.next() {
                Some(next) => phase = next,
                None => break,
            }
        }

        Ok(())
    }

    fn init_phase(
        &self,
        config: &SessionConfig,
        phase: StartupPhase,
        pending: &mut PendingBackends,
        shared: &Arc<SessionShared>,
    ) -> SessionResult<()> {
        info!("Initializing phase: {}", phase.name());

        let result = match phase {
            StartupPhase::InitBuffer => self.init_buffer(config),
            StartupPhase::InitWriter => self.init_writer(config, shared),
            StartupPhase::InitEncoder => self.init_encoder(config, pending, shared),
            StartupPhase::InitRender => self.init_render(config, pending),
            StartupPhase::StartCapture => self.start_capture(pending),
        };
        result.map_err(|message| SessionError::init(phase, message))
    }

    fn init_buffer(&self, config: &SessionConfig) -> Result<(), String> {
        let policy = RetentionPolicy::new(
            config.retention(),
            usize::try_from(config.buffer_byte_budget()).unwrap_or(usize::MAX),
        );
        self.lock_open()?.buffer = Some(Arc::new(CircularBuffer::new(policy)));
        debug!("Buffer initialized");
        Ok(())
    }

    fn init_writer(&self, config: &SessionConfig, shared: &Arc<SessionShared>) -> Result<(), String> {
        std::fs::create_dir_all(&config.output_dir).map_err(|e| {
            format!(
                "cannot create output directory {}: {e}",
                config.output_dir.display()
            )
        })?;

        let mut resources = self.lock_open()?;
        let buffer = resources.buffer.clone().ok_or("buffer not initialized")?;

        let stream = StreamInfo {
            width: config.width,
            height: config.height,
            frame_rate: config.frame_rate,
            bitrate_kbps: config.bitrate_kbps,
            encoder: String::new(),
            headers: None,
        };
        let on_complete: CompletionCallback = {
            let shared = Arc::clone(shared);
            Box::new(move |report| shared.complete_save(report))
        };
        let writer = SegmentWriter::start(buffer, stream, on_complete).map_err(|e| e.to_string())?;

        resources.writer = Some(writer);
        debug!("Writer initialized");
        Ok(())
    }

    fn init_encoder(
        &self,
        config: &SessionConfig,
        pending: &mut PendingBackends,
        shared: &Arc<SessionShared>,
    ) -> Result<(), String> {
        let mut resources = self.lock_open()?;
        let buffer = resources.buffer.clone().ok_or("buffer not initialized")?;
        let factory = pending.encoder.take().ok_or("encoder factory already used")?;

        let encoder_config = VideoEncoderConfig {
            width: config.width,
            height: config.height,
            fps: config.frame_rate,
            bitrate_kbps: config.bitrate_kbps,
            keyframe_interval: config.keyframe_interval(),
            ..Default::default()
        };
        let encoder = factory(&encoder_config).map_err(|e| e.to_string())?;

        let observer = buffer_observer(Arc::clone(shared), config.occupancy_interval());
        let sink: Arc<dyn FrameSink> = buffer;
        let session = EncoderSession::start(encoder, &encoder_config, sink, observer)
            .map_err(|e| e.to_string())?;

        if let Some(writer) = &resources.writer {
            writer.set_stream_headers(session.headers(), session.encoder_name());
        }

        info!(
            encoder = session.encoder_name(),
            hardware = session.is_hardware_accelerated(),
            "Encoder initialized"
        );
        resources.encoder = Some(session);
        Ok(())
    }

    fn init_render(&self, config: &SessionConfig, pending: &mut PendingBackends) -> Result<(), String> {
        let mut resources = self.lock_open()?;
        let surface = resources
            .encoder
            .as_ref()
            .map(EncoderSession::input_surface)
            .ok_or("encoder not initialized")?;
        let gpu = pending.gpu.take().ok_or("GPU backend already used")?;

        let render = RenderLoop::start(gpu, surface, Arc::clone(&self.slot), config.draw_interval())
            .map_err(|e| e.to_string())?;

        resources.render = Some(render);
        debug!("Render loop initialized");
        Ok(())
    }

    fn start_capture(&self, pending: &mut PendingBackends) -> Result<(), String> {
        let mut source = pending.source.take().ok_or("frame source already used")?;
        source
            .start(Arc::clone(&self.slot))
            .map_err(|e| e.to_string())?;

        // The source started without the lock held; shutdown may have run
        let mut resources = match self.lock_open() {
            Ok(resources) => resources,
            Err(message) => {
                if let Err(e) = source.stop() {
                    warn!(error = %e, "Failed to stop capture");
                }
                return Err(message);
            }
        };
        let (width, height) = source.dimensions();
        debug!(width, height, "Capture started");
        resources.source = Some(source);
        Ok(())
    }

    /// Rollback resources from the current phase backwards.
    #[instrument(name = "rollback_resources", skip(self))]
    pub fn rollback(&self) {
        let current = self.current_phase.lock().take();

        if let Some(mut phase) = current {
            loop {
                info!("Rolling back phase: {}", phase.name());
                self.rollback_phase(phase);

                match phase.previous() {
                    Some(prev) => phase = prev,
                    None => break,
                }
            }
        }
    }

    fn rollback_phase(&self, phase: StartupPhase) {
        let mut resources = self.resources.lock();

        match phase {
            StartupPhase::StartCapture => {
                if let Some(mut source) = resources.source.take() {
                    if let Err(e) = source.stop() {
                        warn!(error = %e, "Failed to stop capture");
                    }
                }
            }
            StartupPhase::InitRender => {
                if let Some(mut render) = resources.render.take() {
                    render.stop();
                }
            }
            StartupPhase::InitEncoder => {
                if let Some(mut encoder) = resources.encoder.take() {
                    encoder.stop(DrainPolicy::Discard);
                }
            }
            StartupPhase::InitWriter => {
                if let Some(mut writer) = resources.writer.take() {
                    writer.shutdown();
                }
            }
            StartupPhase::InitBuffer => {
                resources.buffer = None;
            }
        }
    }

    /// Release everything in [`ShutdownPhase`] order. Each resource is
    /// released at most once.
    #[instrument(name = "shutdown_resources", skip_all)]
    pub(crate) fn shutdown(&self, mut on_phase: impl FnMut(ShutdownPhase)) {
        info!("Shutting down all resources");
        {
            let _resources = self.resources.lock();
            self.closed.store(true, Ordering::SeqCst);
        }
        let mut phase = ShutdownPhase::CancelSave;

        loop {
            on_phase(phase);
            debug!("Shutdown phase: {}", phase.name());
            self.shutdown_phase(phase);

            match phase.next() {
                Some(next) => phase = next,
                None => break,
            }
        }
        *self.current_phase.lock() = None;
    }

    fn shutdown_phase(&self, phase: ShutdownPhase) {
        let mut resources = self.resources.lock();

        match phase {
            ShutdownPhase::CancelSave => {
                if let Some(writer) = &resources.writer {
                    writer.cancel();
                }
            }
            ShutdownPhase::StopCapture => {
                if let Some(mut source) = resources.source.take() {
                    if let Err(e) = source.stop() {
                        warn!(error = %e, "Failed to stop capture");
                    }
                }
            }
            ShutdownPhase::StopRender => {
                if let Some(mut render) = resources.render.take() {
                    render.stop();
                }
            }
            ShutdownPhase::DrainEncoder => {
                if let Some(mut encoder) = resources.encoder.take() {
                    encoder.stop(DrainPolicy::Drain);
                }
            }
            ShutdownPhase::ClearBuffer => {
                if let Some(buffer) = &resources.buffer {
                    buffer.clear();
                }
            }
            ShutdownPhase::StopWriter => {
                if let Some(mut writer) = resources.writer.take() {
                    writer.shutdown();
                }
                resources.buffer = None;
            }
        }
    }

    /// Hand a save to the writer. Refused once shutdown has begun, so a
    /// queued save is always seen by the `CancelSave` phase.
    pub(crate) fn submit_save(&self, path: &Path) -> SaveResponse {
        let resources = self.resources.lock();
        if self.is_closed() {
            return SaveResponse::NotRunning;
        }
        match &resources.writer {
            Some(writer) => writer.submit(SaveRequest::new(path)),
            None => SaveResponse::NotRunning,
        }
    }

    /// A fatal fault of the codec or the render loop, if any.
    pub(crate) fn fault(&self) -> Option<StopReason> {
        let resources = self.resources.lock();

        if let Some(message) = resources.encoder.as_ref().and_then(EncoderSession::failure) {
            return Some(StopReason::EncoderFailed { message });
        }

        let render = resources.render.as_ref()?;
        match render.fault() {
            Some(fault) if fault.is_fatal() => Some(StopReason::RenderFailed {
                message: fault.to_string(),
            }),
            _ if !render.is_running() => Some(StopReason::RenderFailed {
                message: "render thread exited".into(),
            }),
            _ => None,
        }
    }

    /// Copy component counters into `metrics`.
    pub(crate) fn update_metrics(&self, metrics: &MetricsCollector) {
        let resources = self.resources.lock();
        if let Some(render) = &resources.render {
            metrics.update_render(&render.stats());
        }
        if let Some(encoder) = &resources.encoder {
            metrics.update_encoder(&encoder.counters());
        }
        if let Some(buffer) = &resources.buffer {
            metrics.update_buffer(&buffer.stats(), &buffer.occupancy());
        }
    }

    /// Get a reference to the resources.
    pub fn resources(&self) -> &Mutex<InitializedResources> {
        &self.resources
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain observer: encoder latency and throttled occupancy events.
fn buffer_observer(shared: Arc<SessionShared>, interval: Duration) -> AddObserver {
    // Same origin as the input surface clock, give or take the spawn.
    let clock = Instant::now();
    let mut last_emit: Option<Instant> = None;

    Box::new(move |frame, result| {
        let Ok(outcome) = result else {
            return;
        };

        let now_us = clock.elapsed().as_micros() as u64;
        let latency_ms = now_us.saturating_sub(frame.pts_us()) / 1000;
        shared.metrics.record_encoder_latency(latency_ms);

        if last_emit.map_or(true, |t| t.elapsed() >= interval) {
            last_emit = Some(Instant::now());
            let occupancy = outcome.occupancy;
            trace!(
                frames = occupancy.frames,
                duration_ms = occupancy.duration_ms(),
                "Occupancy changed"
            );
            shared.emit(SessionEvent::OccupancyChanged {
                duration_ms: occupancy.duration_ms(),
                bytes: occupancy.bytes as u64,
                frames: occupancy.frames,
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use circam_capture::TestPatternSource;
    use circam_encoder::testing::FakeEncoder;
    use circam_encoder::{EncoderError, VideoEncoder};
    use circam_render::{software_backend, PassthroughFilter, RenderError};

    fn config(output_dir: &Path) -> SessionConfig {
        SessionConfig {
            width: 32,
            height: 16,
            frame_rate: 30,
            retention_secs: 5,
            draw_interval_ms: 10,
            output_dir: output_dir.to_path_buf(),
            ..Default::default()
        }
    }

    fn backends(config: &SessionConfig) -> SessionBackends {
        let (width, height) = (config.width, config.height);
        let encoder: EncoderFactory = Box::new(move |_| {
            Ok(Box::new(FakeEncoder::new(width, height)) as Box<dyn VideoEncoder>)
        });
        SessionBackends::new(
            Box::new(TestPatternSource::new(width, height, 30).unwrap()),
            software_backend(|| Box::new(PassthroughFilter)),
        )
        .with_encoder(encoder)
    }

    fn shared() -> Arc<SessionShared> {
        Arc::new(SessionShared::new(30.0))
    }

    #[test]
    fn test_initialize_brings_up_every_phase() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let manager = ResourceManager::new();
        let mut phases = Vec::new();

        manager
            .initialize(&config, backends(&config), &shared(), |p| phases.push(p))
            .unwrap();

        assert_eq!(
            phases,
            vec![
                StartupPhase::InitBuffer,
                StartupPhase::InitWriter,
                StartupPhase::InitEncoder,
                StartupPhase::InitRender,
                StartupPhase::StartCapture,
            ]
        );
        {
            let resources = manager.resources().lock();
            assert!(resources.buffer.is_some());
            assert!(resources.writer.is_some());
            assert!(resources.encoder.is_some());
            assert!(resources.render.is_some());
            assert!(resources.source.as_ref().is_some_and(|s| s.is_active()));
        }
        assert!(manager.fault().is_none());

        let mut phases = Vec::new();
        manager.shutdown(|p| phases.push(p));
        assert_eq!(phases.first(), Some(&ShutdownPhase::CancelSave));
        assert_eq!(phases.last(), Some(&ShutdownPhase::StopWriter));

        let resources = manager.resources().lock();
        assert!(resources.buffer.is_none());
        assert!(resources.writer.is_none());
        assert!(resources.encoder.is_none());
        assert!(resources.render.is_none());
        assert!(resources.source.is_none());
    }

    #[test]
    fn test_encoder_failure_rolls_back_earlier_phases() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let manager = ResourceManager::new();
        let backends = backends(&config).with_encoder(Box::new(|_| {
            Err(EncoderError::NotSupported("no codec".into()))
        }));

        let err = manager
            .initialize(&config, backends, &shared(), |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::InitFailed {
                phase: StartupPhase::InitEncoder,
                ..
            }
        ));
        assert!(manager.resources().lock().writer.is_some());

        manager.rollback();
        let resources = manager.resources().lock();
        assert!(resources.writer.is_none());
        assert!(resources.buffer.is_none());
        assert!(resources.encoder.is_none());
    }

    #[test]
    fn test_gpu_failure_is_reported_at_render_phase() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let manager = ResourceManager::new();
        let mut backends = backends(&config);
        backends.gpu = Box::new(|_| Err(RenderError::InitFailed("no display".into())));

        let err = manager
            .initialize(&config, backends, &shared(), |_| {})
            .unwrap_err();
        assert!(err.to_string().contains("no display"));
        assert!(matches!(
            err,
            SessionError::InitFailed {
                phase: StartupPhase::InitRender,
                ..
            }
        ));

        manager.rollback();
        assert!(manager.resources().lock().encoder.is_none());
    }

    #[test]
    fn test_save_refused_once_shutdown_begins() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let manager = ResourceManager::new();
        manager
            .initialize(&config, backends(&config), &shared(), |_| {})
            .unwrap();

        let path = dir.path().join("late.flv");
        let mut responses = Vec::new();
        manager.shutdown(|phase| {
            if phase == ShutdownPhase::CancelSave {
                // Writer still exists here
                assert!(manager.resources().lock().writer.is_some());
                responses.push(manager.submit_save(&path));
            }
        });

        assert_eq!(responses, vec![SaveResponse::NotRunning]);
        assert!(manager.is_closed());
        assert!(!path.exists());
    }

    #[test]
    fn test_phases_after_shutdown_store_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let manager = ResourceManager::new();
        manager.shutdown(|_| {});

        let err = manager
            .initialize(&config, backends(&config), &shared(), |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::InitFailed {
                phase: StartupPhase::InitBuffer,
                ..
            }
        ));
        assert!(manager.resources().lock().buffer.is_none());
    }

    #[test]
    fn test_save_without_writer_is_not_running() {
        let manager = ResourceManager::new();
        assert_eq!(
            manager.submit_save(Path::new("clip.flv")),
            SaveResponse::NotRunning
        );
        assert!(manager.fault().is_none());
    }
}
