//! Command loop driving a [`Session`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use circam_ipc::{SessionCommand, SessionEvent};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info, instrument, warn};

use crate::session::Session;

const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(100);
const METRICS_INTERVAL: Duration = Duration::from_secs(1);

/// Runs commands against a session and reports on its health.
pub struct Engine {
    session: Arc<Session>,
    command_rx: Receiver<SessionCommand>,
    last_metrics: Instant,
}

impl Engine {
    /// Create a new engine.
    pub fn new(session: Arc<Session>, command_rx: Receiver<SessionCommand>) -> Self {
        Self {
            session,
            command_rx,
            last_metrics: Instant::now(),
        }
    }

    /// The driven session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Run the engine (blocking) until `Shutdown` or the command channel
    /// closes. The session is shut down on exit.
    #[instrument(name = "engine_run", skip(self))]
    pub fn run(&mut self) {
        info!("Engine starting");
        self.session.emit(SessionEvent::Ready);

        loop {
            match self.command_rx.recv_timeout(COMMAND_POLL_INTERVAL) {
                Ok(command) => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => self.tick(),
                Err(RecvTimeoutError::Disconnected) => {
                    info!("Command channel disconnected, shutting down");
                    break;
                }
            }
        }

        self.session.shutdown();
        info!("Engine stopped");
    }

    /// Handle a command. Returns false if the engine should stop.
    fn handle_command(&mut self, command: SessionCommand) -> bool {
        debug!(?command, "Handling command");

        match command {
            SessionCommand::Start => {
                if let Err(e) = self.session.start() {
                    warn!(error = %e, "Start command failed");
                }
                self.last_metrics = Instant::now();
            }
            SessionCommand::Save { path } => {
                let path = path.unwrap_or_else(|| self.session.default_save_path());
                self.session.request_save(path);
            }
            SessionCommand::GetState => {
                self.session.emit(SessionEvent::State(self.session.state()));
            }
            SessionCommand::Shutdown => return false,
        }

        true
    }

    fn tick(&mut self) {
        if !self.session.state().is_running() {
            return;
        }

        if let Some(reason) = self.session.check_health() {
            error!(?reason, "Session stopped by pipeline fault");
            return;
        }

        if self.last_metrics.elapsed() >= METRICS_INTERVAL {
            self.session.emit_metrics();
            self.last_metrics = Instant::now();
        }
    }
}
