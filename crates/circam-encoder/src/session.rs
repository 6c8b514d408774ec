//! Encode worker and drain threads for one capture session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use circam_buffer::{AddOutcome, BufferResult, CompressedFrame, FrameSink};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::error::EncoderError;
use crate::surface::{InputSurface, SurfaceCounters, SurfaceFrame};
use crate::{
    EncodedVideoPacket, EncoderResult, VideoEncoder, VideoEncoderConfig, ENCODED_CHANNEL_CAPACITY,
    MAX_CONSECUTIVE_ERRORS, SURFACE_CHANNEL_CAPACITY,
};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Called on the drain thread after every `FrameSink::add`.
pub type AddObserver = Box<dyn FnMut(&CompressedFrame, &BufferResult<AddOutcome>) + Send>;

/// What to do with encoder output still in flight at stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPolicy {
    /// Encode queued frames, flush the codec and deliver everything.
    Drain,
    /// Drop queued frames and pending output.
    Discard,
}

/// Point-in-time encoder counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderCounters {
    pub frames_presented: u64,
    pub surface_drops: u64,
    pub frames_encoded: u64,
    pub keyframes: u64,
    pub encode_errors: u64,
    pub bytes_encoded: u64,
    pub packets_rejected: u64,
}

#[derive(Default)]
struct EncodeStats {
    frames_encoded: AtomicU64,
    keyframes: AtomicU64,
    encode_errors: AtomicU64,
    bytes_encoded: AtomicU64,
    packets_rejected: AtomicU64,
}

/// A running encoder: owns the codec (inside the worker) and the drain.
pub struct EncoderSession {
    surface: InputSurface,
    headers: Option<Bytes>,
    encoder_name: &'static str,
    hardware_accelerated: bool,
    forces_keyframes: bool,
    should_stop: Arc<AtomicBool>,
    discard: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<String>>>,
    stats: Arc<EncodeStats>,
    surface_counters: Arc<SurfaceCounters>,
    worker_handle: Option<JoinHandle<()>>,
    drain_handle: Option<JoinHandle<()>>,
}

impl EncoderSession {
    /// Spawn the encode worker and the drain thread.
    #[instrument(name = "encoder_session_start", skip_all, fields(encoder = encoder.name()))]
    pub fn start(
        encoder: Box<dyn VideoEncoder>,
        config: &VideoEncoderConfig,
        sink: Arc<dyn FrameSink>,
        observer: AddObserver,
    ) -> EncoderResult<Self> {
        if config.width == 0 || config.height == 0 || config.fps == 0 {
            return Err(EncoderError::InvalidInput(format!(
                "{}x{} at {} fps",
                config.width, config.height, config.fps
            )));
        }

        let encoder_name = encoder.name();
        let hardware_accelerated = encoder.is_hardware_accelerated();
        let forces_keyframes = encoder.forces_keyframes();
        let headers = encoder.headers();

        let (surface_tx, surface_rx) = crossbeam_channel::bounded(SURFACE_CHANNEL_CAPACITY);
        let (packet_tx, packet_rx) = crossbeam_channel::bounded(ENCODED_CHANNEL_CAPACITY);

        let surface_counters = Arc::new(SurfaceCounters::default());
        let surface = InputSurface::new(
            surface_tx,
            config.width,
            config.height,
            Instant::now(),
            Arc::clone(&surface_counters),
        );

        let should_stop = Arc::new(AtomicBool::new(false));
        let discard = Arc::new(AtomicBool::new(false));
        let failure = Arc::new(Mutex::new(None));
        let stats = Arc::new(EncodeStats::default());

        let worker = EncodeWorker {
            encoder,
            width: config.width,
            height: config.height,
            keyframe_interval_us: config.keyframe_interval.as_micros() as u64,
            last_keyframe_pts: None,
            keyframe_pending: false,
            consecutive_errors: 0,
            stats: Arc::clone(&stats),
            packet_tx,
        };

        let worker_handle = {
            let surface = surface.clone();
            let should_stop = Arc::clone(&should_stop);
            let discard = Arc::clone(&discard);
            let failure = Arc::clone(&failure);
            std::thread::Builder::new()
                .name("circam-encode".into())
                .spawn(move || worker.run(surface_rx, surface, should_stop, discard, failure))?
        };

        let drain_handle = {
            let discard = Arc::clone(&discard);
            let stats = Arc::clone(&stats);
            let spawned = std::thread::Builder::new()
                .name("circam-drain".into())
                .spawn(move || drain_loop(packet_rx, sink, observer, discard, stats));
            match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    surface.close();
                    should_stop.store(true, Ordering::SeqCst);
                    let _ = worker_handle.join();
                    return Err(e.into());
                }
            }
        };

        info!(
            encoder = encoder_name,
            width = config.width,
            height = config.height,
            fps = config.fps,
            bitrate_kbps = config.bitrate_kbps,
            keyframe_interval_ms = config.keyframe_interval.as_millis() as u64,
            "Encoder session started"
        );
        if !forces_keyframes {
            warn!(
                encoder = encoder_name,
                "Codec places keyframes by frame count; dropped frames stretch the interval"
            );
        }

        Ok(Self {
            surface,
            headers,
            encoder_name,
            hardware_accelerated,
            forces_keyframes,
            should_stop,
            discard,
            failure,
            stats,
            surface_counters,
            worker_handle: Some(worker_handle),
            drain_handle: Some(drain_handle),
        })
    }

    /// Handle to the drawable input. All clones feed the same worker.
    pub fn input_surface(&self) -> InputSurface {
        self.surface.clone()
    }

    /// Out-of-band SPS/PPS reported by the codec at startup.
    pub fn headers(&self) -> Option<Bytes> {
        self.headers.clone()
    }

    /// Codec name for diagnostics.
    pub fn encoder_name(&self) -> &'static str {
        self.encoder_name
    }

    /// Whether the codec runs on dedicated hardware.
    pub fn is_hardware_accelerated(&self) -> bool {
        self.hardware_accelerated
    }

    /// Whether keyframe requests reach the codec.
    pub fn forces_keyframes(&self) -> bool {
        self.forces_keyframes
    }

    /// Reason the codec died, if it did.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Returns true once the threads have been joined.
    pub fn is_stopped(&self) -> bool {
        self.worker_handle.is_none() && self.drain_handle.is_none()
    }

    /// Current counters.
    pub fn counters(&self) -> EncoderCounters {
        EncoderCounters {
            frames_presented: self.surface_counters.presented.load(Ordering::Relaxed),
            surface_drops: self.surface_counters.dropped.load(Ordering::Relaxed),
            frames_encoded: self.stats.frames_encoded.load(Ordering::Relaxed),
            keyframes: self.stats.keyframes.load(Ordering::Relaxed),
            encode_errors: self.stats.encode_errors.load(Ordering::Relaxed),
            bytes_encoded: self.stats.bytes_encoded.load(Ordering::Relaxed),
            packets_rejected: self.stats.packets_rejected.load(Ordering::Relaxed),
        }
    }

    /// Close the surface, flush the codec and join both threads. Idempotent.
    #[instrument(name = "encoder_session_stop", skip(self))]
    pub fn stop(&mut self, policy: DrainPolicy) {
        if self.is_stopped() {
            return;
        }

        info!(?policy, "Stopping encoder session");
        self.discard
            .store(policy == DrainPolicy::Discard, Ordering::SeqCst);
        self.surface.close();
        self.should_stop.store(true, Ordering::SeqCst);

        if let Some(handle) = self.worker_handle.take() {
            if handle.join().is_err() {
                error!("Encode worker panicked");
                self.failure
                    .lock()
                    .get_or_insert_with(|| "encode worker panicked".into());
            }
        }
        if let Some(handle) = self.drain_handle.take() {
            if handle.join().is_err() {
                error!("Drain thread panicked");
            }
        }

        let counters = self.counters();
        info!(
            frames_encoded = counters.frames_encoded,
            keyframes = counters.keyframes,
            surface_drops = counters.surface_drops,
            encode_errors = counters.encode_errors,
            "Encoder session stopped"
        );
    }
}

impl Drop for EncoderSession {
    fn drop(&mut self) {
        self.stop(DrainPolicy::Discard);
    }
}

struct EncodeWorker {
    encoder: Box<dyn VideoEncoder>,
    width: u32,
    height: u32,
    keyframe_interval_us: u64,
    last_keyframe_pts: Option<u64>,
    keyframe_pending: bool,
    consecutive_errors: u32,
    stats: Arc<EncodeStats>,
    packet_tx: Sender<EncodedVideoPacket>,
}

impl EncodeWorker {
    fn run(
        mut self,
        rx: Receiver<SurfaceFrame>,
        surface: InputSurface,
        should_stop: Arc<AtomicBool>,
        discard: Arc<AtomicBool>,
        failure: Arc<Mutex<Option<String>>>,
    ) {
        debug!(encoder = self.encoder.name(), "Encode worker starting");
        let start_time = Instant::now();
        let mut last_log_time = Instant::now();

        while !should_stop.load(Ordering::SeqCst) {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(frame) => {
                    if let Err(e) = self.encode_frame(frame) {
                        error!(error = %e, "Encoder failed, stopping encode worker");
                        *failure.lock() = Some(e.to_string());
                        surface.close();
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if last_log_time.elapsed() >= STATS_LOG_INTERVAL {
                info!(
                    encoded = self.stats.frames_encoded.load(Ordering::Relaxed),
                    keyframes = self.stats.keyframes.load(Ordering::Relaxed),
                    errors = self.stats.encode_errors.load(Ordering::Relaxed),
                    dropped = surface.dropped(),
                    uptime_s = start_time.elapsed().as_secs_f32(),
                    "Encode stats"
                );
                last_log_time = Instant::now();
            }
        }

        surface.close();

        if discard.load(Ordering::SeqCst) {
            let skipped = rx.try_iter().count();
            debug!(skipped, "Discarding queued surface frames");
            return;
        }

        while let Ok(frame) = rx.try_recv() {
            if self.encode_frame(frame).is_err() {
                break;
            }
        }

        match self.encoder.flush() {
            Ok(packets) => {
                debug!(packets = packets.len(), "Encoder flushed");
                for packet in packets {
                    self.forward(packet);
                }
            }
            Err(e) => warn!(error = %e, "Encoder flush failed"),
        }
    }

    /// Encode one frame. Errors only when the codec is considered dead.
    fn encode_frame(&mut self, frame: SurfaceFrame) -> EncoderResult<()> {
        let result = if frame.width != self.width || frame.height != self.height {
            Err(EncoderError::InvalidInput(format!(
                "expected {}x{}, got {}x{}",
                self.width, self.height, frame.width, frame.height
            )))
        } else {
            if self.keyframe_due(frame.pts_us) {
                trace!(pts_us = frame.pts_us, "Requesting keyframe");
                self.encoder.request_keyframe();
                self.keyframe_pending = true;
            }
            self.encoder.encode(&frame.to_nv12(), frame.pts_us)
        };

        match result {
            Ok(packet) => {
                self.consecutive_errors = 0;
                if let Some(packet) = packet {
                    self.forward(packet);
                }
                Ok(())
            }
            Err(e) => {
                self.consecutive_errors += 1;
                self.stats.encode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    error = %e,
                    consecutive = self.consecutive_errors,
                    "Encode error"
                );
                if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    Err(EncoderError::Encoding(format!(
                        "{} consecutive failures, last: {e}",
                        self.consecutive_errors
                    )))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn keyframe_due(&self, pts_us: u64) -> bool {
        !self.keyframe_pending
            && self
                .last_keyframe_pts
                .map_or(true, |last| pts_us.saturating_sub(last) >= self.keyframe_interval_us)
    }

    fn forward(&mut self, packet: EncodedVideoPacket) {
        if packet.is_keyframe {
            self.last_keyframe_pts = Some(packet.pts_us);
            self.keyframe_pending = false;
            self.stats.keyframes.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.frames_encoded.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_encoded
            .fetch_add(packet.data.len() as u64, Ordering::Relaxed);

        if self.packet_tx.send(packet).is_err() {
            warn!("Drain thread gone, dropping encoded packet");
        }
    }
}

fn drain_loop(
    rx: Receiver<EncodedVideoPacket>,
    sink: Arc<dyn FrameSink>,
    mut observer: AddObserver,
    discard: Arc<AtomicBool>,
    stats: Arc<EncodeStats>,
) {
    debug!("Drain thread starting");
    let mut delivered = 0u64;

    for packet in rx.iter() {
        if discard.load(Ordering::SeqCst) {
            continue;
        }

        let frame = CompressedFrame::new(packet.data, packet.pts_us, packet.is_keyframe);
        let result = sink.add(frame.clone());
        match &result {
            Ok(_) => delivered += 1,
            Err(e) => {
                stats.packets_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, pts_us = frame.pts_us(), "Buffer rejected frame");
            }
        }
        observer(&frame, &result);
    }

    debug!(delivered, "Drain thread exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEncoder;
    use circam_buffer::{CircularBuffer, RetentionPolicy};
    use std::sync::atomic::AtomicUsize;

    fn config(width: u32, height: u32) -> VideoEncoderConfig {
        VideoEncoderConfig {
            width,
            height,
            fps: 30,
            keyframe_interval: Duration::from_millis(100),
            ..Default::default()
        }
    }

    fn buffer() -> Arc<CircularBuffer> {
        Arc::new(CircularBuffer::new(RetentionPolicy::new(
            Duration::from_secs(10),
            10_000_000,
        )))
    }

    fn present_frames(surface: &InputSurface, count: usize) {
        let size = {
            let (w, h) = surface.dimensions();
            (w * h * 4) as usize
        };
        for _ in 0..count {
            while !surface.present(Bytes::from(vec![128u8; size])) {
                std::thread::sleep(Duration::from_millis(1));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_frames_reach_sink_with_keyframe_first() {
        let buffer = buffer();
        let observed = Arc::new(AtomicUsize::new(0));
        let observer: AddObserver = {
            let observed = Arc::clone(&observed);
            Box::new(move |_, result| {
                assert!(result.is_ok());
                observed.fetch_add(1, Ordering::SeqCst);
            })
        };

        let mut session = EncoderSession::start(
            Box::new(FakeEncoder::new(8, 8)),
            &config(8, 8),
            buffer.clone(),
            observer,
        )
        .unwrap();

        present_frames(&session.input_surface(), 30);
        session.stop(DrainPolicy::Drain);
        session.stop(DrainPolicy::Drain);

        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.len(), 30);
        assert!(snapshot.first().unwrap().is_keyframe());
        assert_eq!(observed.load(Ordering::SeqCst), 30);

        let counters = session.counters();
        assert_eq!(counters.frames_encoded, 30);
        // 100 ms interval over ~300+ ms of frames
        assert!(counters.keyframes >= 2, "{counters:?}");
        assert!(session.failure().is_none());
    }

    #[test]
    fn test_fixed_gop_codec_keyframes_by_frame_count() {
        let buffer = buffer();
        let mut session = EncoderSession::start(
            Box::new(FakeEncoder::new(8, 8).with_fixed_gop(10)),
            &config(8, 8),
            buffer.clone(),
            Box::new(|_, _| {}),
        )
        .unwrap();
        assert!(!session.forces_keyframes());

        present_frames(&session.input_surface(), 30);
        session.stop(DrainPolicy::Drain);

        // 100 ms requests are ignored; only frames 0, 10 and 20 are IDR
        assert_eq!(session.counters().frames_encoded, 30);
        assert_eq!(session.counters().keyframes, 3);
        assert!(buffer.snapshot().first().unwrap().is_keyframe());
    }

    #[test]
    fn test_surface_closed_after_stop() {
        let mut session = EncoderSession::start(
            Box::new(FakeEncoder::new(4, 4)),
            &config(4, 4),
            buffer(),
            Box::new(|_, _| {}),
        )
        .unwrap();

        let surface = session.input_surface();
        session.stop(DrainPolicy::Discard);
        assert!(surface.is_closed());
        assert!(!surface.present(Bytes::from(vec![0u8; 64])));
    }

    #[test]
    fn test_consecutive_errors_mark_codec_dead() {
        let buffer = buffer();
        let mut encoder = FakeEncoder::new(4, 4);
        encoder.fail_after(0);

        let mut session = EncoderSession::start(
            Box::new(encoder),
            &config(4, 4),
            buffer.clone(),
            Box::new(|_, _| {}),
        )
        .unwrap();

        let surface = session.input_surface();
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.failure().is_none() && Instant::now() < deadline {
            surface.present(Bytes::from(vec![0u8; 64]));
            std::thread::sleep(Duration::from_millis(2));
        }

        assert!(session.failure().is_some());
        assert!(surface.is_closed());
        session.stop(DrainPolicy::Drain);
        assert!(session.counters().encode_errors >= MAX_CONSECUTIVE_ERRORS as u64);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_rejects_zero_sized_config() {
        let result = EncoderSession::start(
            Box::new(FakeEncoder::new(4, 4)),
            &config(0, 4),
            buffer(),
            Box::new(|_, _| {}),
        );
        assert!(matches!(result, Err(EncoderError::InvalidInput(_))));
    }
}
