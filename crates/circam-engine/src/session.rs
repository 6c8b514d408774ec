//! The capture session: lifecycle, saves and events.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use circam_capture::{FrameSource, TestPatternSource};
use circam_encoder::{create_video_encoder, EncoderResult, VideoEncoder, VideoEncoderConfig};
use circam_ipc::{
    ControlChannel, SaveReport, SaveResponse, SessionConfig, SessionEvent, SessionMetrics,
    SessionState, StartupPhase, StopReason, SubscriberId, Subscription,
};
use circam_render::{software_backend, ChromaticAberrationFilter, GpuInit};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::error::SessionError;
use crate::metrics::MetricsCollector;
use crate::state::ResourceManager;
use crate::SessionResult;

/// Creates the codec once the encoder configuration is known.
pub type EncoderFactory =
    Box<dyn FnOnce(&VideoEncoderConfig) -> EncoderResult<Box<dyn VideoEncoder>> + Send>;

/// The platform pieces a session drives.
pub struct SessionBackends {
    /// Camera frame source.
    pub source: Box<dyn FrameSource>,

    /// Creates the GPU context and filter on the render thread.
    pub gpu: GpuInit,

    /// Creates the codec.
    pub encoder: EncoderFactory,
}

impl SessionBackends {
    /// Backends using the system encoder.
    pub fn new(source: Box<dyn FrameSource>, gpu: GpuInit) -> Self {
        Self {
            source,
            gpu,
            encoder: Box::new(|config| create_video_encoder(config.clone())),
        }
    }

    /// Replace the codec factory.
    pub fn with_encoder(mut self, encoder: EncoderFactory) -> Self {
        self.encoder = encoder;
        self
    }

    /// Synthetic camera and software GPU with the chromatic aberration filter.
    pub fn test_pattern(config: &SessionConfig) -> SessionResult<Self> {
        let source = TestPatternSource::new(config.width, config.height, config.frame_rate)
            .map_err(|e| SessionError::init(StartupPhase::StartCapture, e))?;
        Ok(Self::new(
            Box::new(source),
            software_backend(|| Box::new(ChromaticAberrationFilter::default())),
        ))
    }
}

/// State reachable from pipeline threads.
pub(crate) struct SessionShared {
    state: RwLock<SessionState>,
    pub(crate) events: ControlChannel,
    pub(crate) metrics: MetricsCollector,
    last_save: Mutex<Option<SaveReport>>,
}

impl SessionShared {
    pub(crate) fn new(target_fps: f32) -> Self {
        Self {
            state: RwLock::new(SessionState::Uninitialized),
            events: ControlChannel::new(),
            metrics: MetricsCollector::new(target_fps),
            last_save: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state.read().clone()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        self.events.emit(event);
    }

    pub(crate) fn transition_to(&self, new_state: SessionState) {
        let previous = std::mem::replace(&mut *self.state.write(), new_state.clone());
        self.announce(previous, new_state);
    }

    /// Transition only if the current state matches `from`.
    pub(crate) fn transition_from(
        &self,
        from: impl FnOnce(&SessionState) -> bool,
        new_state: SessionState,
    ) -> bool {
        let previous = {
            let mut state = self.state.write();
            if !from(&state) {
                return false;
            }
            std::mem::replace(&mut *state, new_state.clone())
        };
        self.announce(previous, new_state);
        true
    }

    fn announce(&self, previous: SessionState, current: SessionState) {
        debug!(
            previous = previous.name(),
            current = current.name(),
            "State transition"
        );
        self.emit(SessionEvent::StateChanged {
            previous: Box::new(previous),
            current: Box::new(current),
        });
    }

    /// Writer completion: record, leave `Saving`, notify.
    pub(crate) fn complete_save(&self, report: SaveReport) {
        *self.last_save.lock() = Some(report.clone());
        self.transition_from(SessionState::is_saving, SessionState::Running);
        self.emit(SessionEvent::SaveCompleted(report));
    }
}

/// A capture session and its control surface.
///
/// All methods take `&self`; the session can be shared between the command
/// loop and other threads. Dropping it shuts it down.
pub struct Session {
    config: SessionConfig,
    shared: Arc<SessionShared>,
    resources: ResourceManager,
    backends: Mutex<Option<SessionBackends>>,
    shutdown_started: AtomicBool,
}

impl Session {
    /// Create a session. Nothing runs until [`Session::start`].
    pub fn new(config: SessionConfig, backends: SessionBackends) -> SessionResult<Self> {
        config.validate()?;
        info!(
            width = config.width,
            height = config.height,
            frame_rate = config.frame_rate,
            retention_secs = config.retention_secs,
            "Session created"
        );
        Ok(Self {
            shared: Arc::new(SessionShared::new(config.frame_rate as f32)),
            config,
            resources: ResourceManager::new(),
            backends: Mutex::new(Some(backends)),
            shutdown_started: AtomicBool::new(false),
        })
    }

    /// Bring the pipeline up phase by phase.
    ///
    /// On failure every completed phase is rolled back, the session ends in
    /// `Terminated { InitFailed }` and one non-recoverable `Error` is emitted.
    /// A concurrent [`Session::shutdown`] wins: startup stops at the next
    /// phase boundary and `start` returns [`SessionError::Terminated`].
    #[instrument(name = "session_start", skip(self))]
    pub fn start(&self) -> SessionResult<()> {
        let state = self.shared.state();
        if state.is_initializing() || state.is_running() {
            debug!("Already started, ignoring start");
            return Err(SessionError::AlreadyStarted);
        }
        if !state.is_uninitialized() || self.shutdown_started.load(Ordering::SeqCst) {
            return Err(SessionError::Terminated);
        }
        let Some(backends) = self.backends.lock().take() else {
            return Err(SessionError::AlreadyStarted);
        };

        info!("Starting session");
        let result = self
            .resources
            .initialize(&self.config, backends, &self.shared, |phase| {
                self.shared.transition_from(
                    |state| state.is_uninitialized() || state.is_initializing(),
                    SessionState::Initializing { phase },
                );
            });

        match result {
            Ok(()) => {
                self.shared.metrics.start();
                if !self
                    .shared
                    .transition_from(SessionState::is_initializing, SessionState::Running)
                {
                    // Shutdown began after the last phase and releases it all
                    info!("Session shut down while starting");
                    return Err(SessionError::Terminated);
                }
                info!("Session running");
                Ok(())
            }
            Err(e) => {
                self.resources.rollback();
                if self.shutdown_started.load(Ordering::SeqCst) {
                    info!(error = %e, "Startup interrupted by shutdown");
                    return Err(SessionError::Terminated);
                }
                error!(error = %e, "Session start failed");
                self.shared.transition_to(SessionState::Terminated {
                    reason: StopReason::InitFailed {
                        message: e.to_string(),
                    },
                });
                self.shared.emit(SessionEvent::Error {
                    recoverable: false,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Save the retained window to `path`.
    ///
    /// `Busy` while another save is in flight, `NotRunning` outside
    /// `Running`. Capture continues throughout.
    #[instrument(name = "session_save", skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn request_save(&self, path: impl AsRef<std::path::Path>) -> SaveResponse {
        let path = path.as_ref().to_path_buf();

        let response = if self.shared.transition_from(
            |state| matches!(state, SessionState::Running),
            SessionState::Saving { path: path.clone() },
        ) {
            let response = self.resources.submit_save(&path);
            if response != SaveResponse::Accepted {
                self.shared
                    .transition_from(SessionState::is_saving, SessionState::Running);
            }
            response
        } else if self.shared.state().is_saving() {
            SaveResponse::Busy
        } else {
            SaveResponse::NotRunning
        };

        match response {
            SaveResponse::Accepted => info!("Save accepted"),
            SaveResponse::Busy => info!("Save rejected, another save in flight"),
            SaveResponse::NotRunning => warn!("Save rejected, session not running"),
        }
        self.shared
            .emit(SessionEvent::SaveRequested { path, response });
        response
    }

    /// A timestamped file name in the configured output directory.
    pub fn default_save_path(&self) -> PathBuf {
        let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
        self.config
            .output_dir
            .join(format!("circam_{stamp}.flv"))
    }

    /// Tear everything down in order. Idempotent and callable from any
    /// thread; concurrent callers return immediately.
    pub fn shutdown(&self) {
        self.shutdown_with(StopReason::UserRequested);
    }

    #[instrument(name = "session_shutdown", skip(self))]
    fn shutdown_with(&self, reason: StopReason) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            return;
        }

        let state = self.shared.state();
        if !state.is_terminated() {
            info!(?reason, "Shutting down session");
            self.resources.shutdown(|phase| {
                self.shared
                    .transition_to(SessionState::ShuttingDown { phase });
            });
            self.shared.metrics.stop();
            self.shared
                .transition_to(SessionState::Terminated { reason });
        }

        self.backends.lock().take();
        self.shared.emit(SessionEvent::Shutdown);
        self.shared.events.close();
        info!("Session terminated");
    }

    /// Shut down if the codec or the render loop has failed.
    ///
    /// Returns the reason when a fault was found.
    pub fn check_health(&self) -> Option<StopReason> {
        if !self.shared.state().is_running() {
            return None;
        }
        let reason = self.resources.fault()?;
        error!(?reason, "Pipeline fault detected");
        self.shared.emit(SessionEvent::Error {
            recoverable: false,
            message: reason.message(),
        });
        self.shutdown_with(reason.clone());
        Some(reason)
    }

    /// Register an event consumer.
    pub fn subscribe(&self) -> Subscription {
        self.shared.events.subscribe()
    }

    /// Remove an event consumer.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.shared.events.unsubscribe(id);
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Current pipeline metrics.
    pub fn metrics(&self) -> SessionMetrics {
        self.refresh_metrics();
        self.shared.metrics.snapshot()
    }

    /// Report of the most recent completed save.
    pub fn last_save(&self) -> Option<SaveReport> {
        self.shared.last_save.lock().clone()
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Emit `Metrics` and any performance warnings.
    pub(crate) fn emit_metrics(&self) {
        let metrics = self.metrics();
        self.shared.emit(SessionEvent::Metrics(metrics));
        for warning in self.shared.metrics.check_warnings() {
            warn!(?warning, "Performance warning");
            self.shared.emit(SessionEvent::PerformanceWarning(warning));
        }
        self.shared.metrics.mark_reported();
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        self.shared.emit(event);
    }

    fn refresh_metrics(&self) {
        self.resources.update_metrics(&self.shared.metrics);
        self.shared
            .metrics
            .update_events_dropped(self.shared.events.dropped());
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use circam_encoder::testing::FakeEncoder;
    use circam_ipc::{ConfigError, SaveStatus};
    use circam_render::{PassthroughFilter, RenderError};
    use std::path::Path;
    use std::time::Duration;

    fn config(output_dir: &Path) -> SessionConfig {
        SessionConfig {
            width: 32,
            height: 16,
            frame_rate: 30,
            keyframe_interval_secs: 1,
            retention_secs: 2,
            draw_interval_ms: 10,
            output_dir: output_dir.to_path_buf(),
            ..Default::default()
        }
    }

    fn backends(config: &SessionConfig) -> SessionBackends {
        let (width, height) = (config.width, config.height);
        SessionBackends::new(
            Box::new(TestPatternSource::new(width, height, 30).unwrap()),
            software_backend(|| Box::new(PassthroughFilter)),
        )
        .with_encoder(Box::new(move |_| {
            Ok(Box::new(FakeEncoder::new(width, height)) as Box<dyn VideoEncoder>)
        }))
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.frame_rate = 0;
        let backends = backends(&SessionConfig {
            frame_rate: 30,
            ..config.clone()
        });

        let err = Session::new(config, backends).err().unwrap();
        assert!(matches!(
            err,
            SessionError::InvalidConfig(ConfigError::ZeroFrameRate)
        ));
    }

    #[test]
    fn test_save_before_start_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let session = Session::new(config.clone(), backends(&config)).unwrap();
        let events = session.subscribe();

        assert_eq!(
            session.request_save(dir.path().join("early.flv")),
            SaveResponse::NotRunning
        );
        assert!(session.state().is_uninitialized());
        assert!(events.drain().iter().any(|e| matches!(
            e,
            SessionEvent::SaveRequested {
                response: SaveResponse::NotRunning,
                ..
            }
        )));
    }

    #[test]
    fn test_init_failure_terminates_with_one_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut backends = backends(&config);
        backends.gpu = Box::new(|_| Err(RenderError::InitFailed("no GPU".into())));
        let session = Session::new(config, backends).unwrap();
        let events = session.subscribe();

        assert!(session.start().is_err());
        assert!(matches!(
            session.state(),
            SessionState::Terminated {
                reason: StopReason::InitFailed { .. }
            }
        ));

        let events = events.drain();
        let errors = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Error { recoverable: false, .. }))
            .count();
        assert_eq!(errors, 1);
        assert!(matches!(session.start(), Err(SessionError::Terminated)));
    }

    #[test]
    fn test_start_save_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let session = Session::new(config.clone(), backends(&config)).unwrap();
        let events = session.subscribe();

        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Running);
        assert!(matches!(session.start(), Err(SessionError::AlreadyStarted)));

        std::thread::sleep(Duration::from_millis(500));
        let path = dir.path().join("clip.flv");
        assert_eq!(session.request_save(&path), SaveResponse::Accepted);

        let report = loop {
            match events.receiver().recv_timeout(Duration::from_secs(10)) {
                Ok(SessionEvent::SaveCompleted(report)) => break report,
                Ok(_) => continue,
                Err(e) => panic!("no save report: {e}"),
            }
        };
        assert_eq!(report.status, SaveStatus::Ok);
        assert_eq!(session.last_save(), Some(report));
        assert!(path.exists());
        assert_eq!(session.state(), SessionState::Running);

        session.shutdown();
        session.shutdown();
        assert_eq!(
            session.state(),
            SessionState::Terminated {
                reason: StopReason::UserRequested
            }
        );
        assert_eq!(session.request_save(&path), SaveResponse::NotRunning);
    }

    #[test]
    fn test_default_save_path_is_timestamped() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let session = Session::new(config.clone(), backends(&config)).unwrap();

        let path = session.default_save_path();
        assert_eq!(path.parent(), Some(dir.path()));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("circam_"));
        assert!(name.ends_with(".flv"));
        assert_eq!(name.len(), "circam_".len() + 14 + ".flv".len());
    }
}
