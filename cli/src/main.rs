//! Command-line front end for circam.
//!
//! Runs a capture session on the engine thread and reads control commands
//! from stdin:
//!
//! ```text
//! save [path]   write the retained window (default: timestamped file)
//! state         report the session state
//! quit          shut down and exit
//! ```
//!
//! `circam probe <file.flv>` prints a summary of a saved file instead.
//! `--synthetic-encoder` needs the `synthetic` feature.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use crossbeam_channel::Sender;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "synthetic")]
use circam_encoder::{testing::FakeEncoder, VideoEncoder};
use circam_engine::{Engine, Session, SessionBackends};
use circam_ipc::{command_channel, SessionCommand, SessionConfig, SessionEvent, Subscription};

const USAGE: &str = "usage: circam [--config <file.json>] [--synthetic-encoder]\n       circam probe <file.flv>";

/// What the process was asked to do.
#[derive(Debug, PartialEq)]
enum Invocation {
    Run {
        config: Option<PathBuf>,
        synthetic_encoder: bool,
    },
    Probe(PathBuf),
    Help,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Invocation> {
    let mut args = args.into_iter();
    let mut config = None;
    let mut synthetic_encoder = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "probe" => {
                let path = args.next().context("probe needs a file")?;
                return Ok(Invocation::Probe(path.into()));
            }
            "--config" | "-c" => {
                let path = args.next().context("--config needs a file")?;
                config = Some(path.into());
            }
            "--synthetic-encoder" => synthetic_encoder = true,
            "--help" | "-h" => return Ok(Invocation::Help),
            other => bail!("unknown argument '{other}'\n{USAGE}"),
        }
    }

    Ok(Invocation::Run {
        config,
        synthetic_encoder,
    })
}

/// Initialize logging.
fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "circam=debug,circam_engine=debug,circam_capture=debug,circam_buffer=debug,circam_encoder=debug,circam_render=debug,circam_mux=debug,circam_ipc=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&Path>) -> Result<SessionConfig> {
    let Some(path) = path else {
        debug!("No config file given, using defaults");
        return Ok(SessionConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: SessionConfig = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    info!(path = %path.display(), "Loaded config");
    Ok(config)
}

/// Translate one stdin line into a command. `None` for blank lines.
fn parse_command(line: &str) -> Result<Option<SessionCommand>> {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
        return Ok(None);
    };
    let command = match word {
        "save" | "s" => SessionCommand::Save {
            path: words.next().map(PathBuf::from),
        },
        "state" => SessionCommand::GetState,
        "quit" | "exit" | "q" => SessionCommand::Shutdown,
        other => bail!("unknown command '{other}' (save [path] | state | quit)"),
    };
    Ok(Some(command))
}

fn print_events(events: Subscription) {
    for event in events.receiver().iter() {
        if let SessionEvent::Metrics(metrics) = &event {
            debug!(
                fps = metrics.render_fps,
                buffered_ms = metrics.buffered_ms,
                bitrate_kbps = metrics.bitrate_kbps,
                "Metrics"
            );
            continue;
        }
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(kind = event.kind(), "Failed to serialize event: {e}"),
        }
        if matches!(event, SessionEvent::Shutdown) {
            break;
        }
    }
}

fn read_commands(command_tx: &Sender<SessionCommand>) -> Result<()> {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read stdin")?;
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };
        let quit = matches!(command, SessionCommand::Shutdown);
        if command_tx.send(command).is_err() {
            warn!("Engine stopped, no longer accepting commands");
            return Ok(());
        }
        if quit {
            return Ok(());
        }
    }

    debug!("stdin closed");
    let _ = command_tx.send(SessionCommand::Shutdown);
    Ok(())
}

#[cfg(feature = "synthetic")]
fn with_encoder_choice(
    backends: SessionBackends,
    config: &SessionConfig,
    synthetic_encoder: bool,
) -> Result<SessionBackends> {
    if !synthetic_encoder {
        return Ok(backends);
    }
    let (width, height) = (config.width, config.height);
    info!("Using synthetic encoder");
    Ok(backends.with_encoder(Box::new(move |_| {
        Ok(Box::new(FakeEncoder::new(width, height)) as Box<dyn VideoEncoder>)
    })))
}

#[cfg(not(feature = "synthetic"))]
fn with_encoder_choice(
    backends: SessionBackends,
    _config: &SessionConfig,
    synthetic_encoder: bool,
) -> Result<SessionBackends> {
    if synthetic_encoder {
        bail!("--synthetic-encoder needs a build with the `synthetic` feature");
    }
    Ok(backends)
}

fn run(config_path: Option<&Path>, synthetic_encoder: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let backends = SessionBackends::test_pattern(&config)?;
    let backends = with_encoder_choice(backends, &config, synthetic_encoder)?;

    let session = Arc::new(Session::new(config, backends)?);
    let events = session.subscribe();
    let printer = thread::Builder::new()
        .name("circam-events".into())
        .spawn(move || print_events(events))
        .context("failed to spawn event printer")?;

    let (command_tx, command_rx) = command_channel();
    let mut engine = Engine::new(Arc::clone(&session), command_rx);
    let engine_handle = thread::Builder::new()
        .name("circam-engine".into())
        .spawn(move || engine.run())
        .context("failed to spawn engine thread")?;

    command_tx
        .send(SessionCommand::Start)
        .context("engine stopped before start")?;
    read_commands(&command_tx)?;
    drop(command_tx);

    if engine_handle.join().is_err() {
        bail!("engine thread panicked");
    }
    let _ = printer.join();
    info!(state = session.state().name(), "Exiting");
    Ok(())
}

fn probe(path: &Path) -> Result<()> {
    let summary =
        circam_mux::probe(path).with_context(|| format!("failed to read {}", path.display()))?;
    println!("file:            {}", path.display());
    println!("dimensions:      {}x{}", summary.width, summary.height);
    println!("duration:        {} ms", summary.duration_ms);
    println!("video tags:      {}", summary.video_tags);
    println!("keyframes:       {}", summary.keyframes);
    println!("starts on IDR:   {}", summary.first_is_keyframe);
    println!(
        "timestamps:      {}..{} ms",
        summary.first_timestamp_ms, summary.last_timestamp_ms
    );
    println!("sequence header: {}", summary.has_sequence_header);
    Ok(())
}

fn main() -> Result<()> {
    init_logging();

    match parse_args(std::env::args().skip(1))? {
        Invocation::Run {
            config,
            synthetic_encoder,
        } => run(config.as_deref(), synthetic_encoder),
        Invocation::Probe(path) => probe(&path),
        Invocation::Help => {
            println!("{USAGE}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        assert_eq!(
            parse_args(args(&[])).unwrap(),
            Invocation::Run {
                config: None,
                synthetic_encoder: false
            }
        );
        assert_eq!(
            parse_args(args(&["--config", "cam.json", "--synthetic-encoder"])).unwrap(),
            Invocation::Run {
                config: Some(PathBuf::from("cam.json")),
                synthetic_encoder: true
            }
        );
        assert_eq!(
            parse_args(args(&["probe", "clip.flv"])).unwrap(),
            Invocation::Probe(PathBuf::from("clip.flv"))
        );
        assert!(parse_args(args(&["probe"])).is_err());
        assert!(parse_args(args(&["--bogus"])).is_err());
    }

    #[test]
    fn test_parse_command() {
        assert!(matches!(
            parse_command("save").unwrap(),
            Some(SessionCommand::Save { path: None })
        ));
        assert!(matches!(
            parse_command("save /tmp/a.flv").unwrap(),
            Some(SessionCommand::Save { path: Some(p) }) if p == Path::new("/tmp/a.flv")
        ));
        assert!(matches!(
            parse_command("  state ").unwrap(),
            Some(SessionCommand::GetState)
        ));
        assert!(matches!(
            parse_command("quit").unwrap(),
            Some(SessionCommand::Shutdown)
        ));
        assert!(parse_command("   ").unwrap().is_none());
        assert!(parse_command("record").is_err());
    }

    #[cfg(not(feature = "synthetic"))]
    #[test]
    fn test_synthetic_encoder_needs_feature() {
        let config = SessionConfig::default();
        let backends = SessionBackends::test_pattern(&config).unwrap();
        let err = with_encoder_choice(backends, &config, true).err().unwrap();
        assert!(err.to_string().contains("synthetic"));

        let backends = SessionBackends::test_pattern(&config).unwrap();
        assert!(with_encoder_choice(backends, &config, false).is_ok());
    }

    #[cfg(feature = "synthetic")]
    #[test]
    fn test_synthetic_encoder_replaces_codec() {
        let config = SessionConfig::default();
        let backends = SessionBackends::test_pattern(&config).unwrap();
        assert!(with_encoder_choice(backends, &config, true).is_ok());
    }

    #[test]
    fn test_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam.json");
        let config = SessionConfig {
            retention_secs: 5,
            ..Default::default()
        };
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        let loaded = load_config(Some(&path)).unwrap();
        assert_eq!(loaded.retention_secs, 5);
        assert_eq!(load_config(None).unwrap().retention_secs, 20);
        assert!(load_config(Some(&dir.path().join("missing.json"))).is_err());
    }
}
