//! Metrics collection and reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use circam_buffer::{BufferOccupancy, BufferStats};
use circam_encoder::EncoderCounters;
use circam_ipc::{SessionMetrics, WarningType};
use circam_render::RenderStats;
use parking_lot::RwLock;
use tracing::debug;

/// Encoder latency above which a backlog warning is raised.
pub const BACKLOG_WARNING_MS: u64 = 1000;

/// Collects pipeline counters and turns them into [`SessionMetrics`].
pub struct MetricsCollector {
    start_time: RwLock<Option<Instant>>,
    last_report_time: RwLock<Instant>,
    target_fps: f32,

    frames_rendered: AtomicU64,
    render_skips: AtomicU64,
    surface_drops: AtomicU64,
    frames_encoded: AtomicU64,
    encode_errors: AtomicU64,
    bytes_encoded: AtomicU64,
    frames_buffered: AtomicU64,
    frames_evicted: AtomicU64,
    orphan_frames: AtomicU64,
    encoder_latency_ms: AtomicU64,
    buffered_ms: AtomicU64,
    buffered_bytes: AtomicU64,
    events_dropped: AtomicU64,

    last_frames_rendered: AtomicU64,
    last_surface_drops: AtomicU64,
    last_render_skips: AtomicU64,
}

impl MetricsCollector {
    /// Create a collector for a session rendering at `target_fps`.
    pub fn new(target_fps: f32) -> Self {
        Self {
            start_time: RwLock::new(None),
            last_report_time: RwLock::new(Instant::now()),
            target_fps,
            frames_rendered: AtomicU64::new(0),
            render_skips: AtomicU64::new(0),
            surface_drops: AtomicU64::new(0),
            frames_encoded: AtomicU64::new(0),
            encode_errors: AtomicU64::new(0),
            bytes_encoded: AtomicU64::new(0),
            frames_buffered: AtomicU64::new(0),
            frames_evicted: AtomicU64::new(0),
            orphan_frames: AtomicU64::new(0),
            encoder_latency_ms: AtomicU64::new(0),
            buffered_ms: AtomicU64::new(0),
            buffered_bytes: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            last_frames_rendered: AtomicU64::new(0),
            last_surface_drops: AtomicU64::new(0),
            last_render_skips: AtomicU64::new(0),
        }
    }

    /// Start metrics collection.
    pub fn start(&self) {
        *self.start_time.write() = Some(Instant::now());
        *self.last_report_time.write() = Instant::now();
    }

    /// Stop metrics collection.
    pub fn stop(&self) {
        *self.start_time.write() = None;
    }

    /// Copy render loop counters.
    pub fn update_render(&self, stats: &RenderStats) {
        self.frames_rendered
            .store(stats.frames_rendered, Ordering::Relaxed);
        self.render_skips.store(stats.render_skips, Ordering::Relaxed);
    }

    /// Copy encoder counters.
    pub fn update_encoder(&self, counters: &EncoderCounters) {
        self.surface_drops
            .store(counters.surface_drops, Ordering::Relaxed);
        self.frames_encoded
            .store(counters.frames_encoded, Ordering::Relaxed);
        self.encode_errors
            .store(counters.encode_errors, Ordering::Relaxed);
        self.bytes_encoded
            .store(counters.bytes_encoded, Ordering::Relaxed);
    }

    /// Copy buffer counters and fill level.
    pub fn update_buffer(&self, stats: &BufferStats, occupancy: &BufferOccupancy) {
        self.frames_buffered
            .store(stats.frames_added, Ordering::Relaxed);
        self.frames_evicted
            .store(stats.frames_evicted, Ordering::Relaxed);
        self.orphan_frames
            .store(stats.orphans_dropped, Ordering::Relaxed);
        self.buffered_ms
            .store(occupancy.duration_ms(), Ordering::Relaxed);
        self.buffered_bytes
            .store(occupancy.bytes as u64, Ordering::Relaxed);
    }

    /// Record the age of the newest buffered frame.
    pub fn record_encoder_latency(&self, latency_ms: u64) {
        self.encoder_latency_ms.store(latency_ms, Ordering::Relaxed);
    }

    /// Record the control channel's dropped event count.
    pub fn update_events_dropped(&self, dropped: u64) {
        self.events_dropped.store(dropped, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> SessionMetrics {
        let now = Instant::now();

        let last_time = *self.last_report_time.read();
        let elapsed = now.duration_since(last_time).as_secs_f32();
        let frames_rendered = self.frames_rendered.load(Ordering::Relaxed);
        let last_frames = self.last_frames_rendered.load(Ordering::Relaxed);
        let render_fps = if elapsed > 0.0 {
            frames_rendered.saturating_sub(last_frames) as f32 / elapsed
        } else {
            0.0
        };

        let start_time = *self.start_time.read();
        let bytes = self.bytes_encoded.load(Ordering::Relaxed);
        let bitrate_kbps = match start_time {
            Some(start) => {
                let total_elapsed = now.duration_since(start).as_secs_f32();
                if total_elapsed > 0.0 {
                    ((bytes * 8) as f32 / total_elapsed / 1000.0) as u32
                } else {
                    0
                }
            }
            None => 0,
        };
        let uptime_seconds = start_time
            .map(|s| now.duration_since(s).as_secs())
            .unwrap_or(0);

        SessionMetrics {
            render_fps,
            target_fps: self.target_fps,
            frames_rendered,
            render_skips: self.render_skips.load(Ordering::Relaxed),
            surface_drops: self.surface_drops.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
            frames_buffered: self.frames_buffered.load(Ordering::Relaxed),
            frames_evicted: self.frames_evicted.load(Ordering::Relaxed),
            orphan_frames: self.orphan_frames.load(Ordering::Relaxed),
            bitrate_kbps,
            encoder_latency_ms: self.encoder_latency_ms.load(Ordering::Relaxed),
            buffered_ms: self.buffered_ms.load(Ordering::Relaxed),
            buffered_bytes: self.buffered_bytes.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            uptime_seconds,
        }
    }

    /// Check for warnings based on current metrics.
    ///
    /// Drop and skip counts are the growth since the last report.
    pub fn check_warnings(&self) -> Vec<WarningType> {
        let mut warnings = Vec::new();

        let latency_ms = self.encoder_latency_ms.load(Ordering::Relaxed);
        if latency_ms > BACKLOG_WARNING_MS {
            warnings.push(WarningType::EncoderBacklog { latency_ms });
        }

        let drops = self
            .surface_drops
            .load(Ordering::Relaxed)
            .saturating_sub(self.last_surface_drops.load(Ordering::Relaxed));
        if drops > 0 {
            warnings.push(WarningType::SurfaceDrops { count: drops });
        }

        let skips = self
            .render_skips
            .load(Ordering::Relaxed)
            .saturating_sub(self.last_render_skips.load(Ordering::Relaxed));
        if skips > 0 {
            warnings.push(WarningType::RenderSkips { count: skips });
        }

        if !warnings.is_empty() {
            debug!(count = warnings.len(), "Performance warnings raised");
        }
        warnings
    }

    /// Update last report time and baselines.
    pub fn mark_reported(&self) {
        *self.last_report_time.write() = Instant::now();
        self.last_frames_rendered.store(
            self.frames_rendered.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        self.last_surface_drops.store(
            self.surface_drops.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        self.last_render_skips.store(
            self.render_skips.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(30.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_snapshot_copies_counters() {
        let metrics = MetricsCollector::new(30.0);
        metrics.start();
        metrics.update_buffer(
            &BufferStats {
                frames_added: 120,
                frames_evicted: 30,
                gops_evicted: 1,
                orphans_dropped: 2,
                frames_rejected: 0,
            },
            &BufferOccupancy {
                frames: 90,
                bytes: 45_000,
                duration: Duration::from_millis(2_966),
            },
        );
        metrics.update_events_dropped(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.target_fps, 30.0);
        assert_eq!(snapshot.frames_buffered, 120);
        assert_eq!(snapshot.frames_evicted, 30);
        assert_eq!(snapshot.orphan_frames, 2);
        assert_eq!(snapshot.buffered_ms, 2_966);
        assert_eq!(snapshot.buffered_bytes, 45_000);
        assert_eq!(snapshot.events_dropped, 3);
    }

    #[test]
    fn test_warnings_report_growth_since_last_report() {
        let metrics = MetricsCollector::default();
        metrics.update_encoder(&EncoderCounters {
            surface_drops: 4,
            ..Default::default()
        });
        metrics.update_render(&RenderStats {
            render_skips: 1,
            ..Default::default()
        });

        let warnings = metrics.check_warnings();
        assert!(warnings.contains(&WarningType::SurfaceDrops { count: 4 }));
        assert!(warnings.contains(&WarningType::RenderSkips { count: 1 }));

        metrics.mark_reported();
        assert!(metrics.check_warnings().is_empty());

        metrics.update_encoder(&EncoderCounters {
            surface_drops: 6,
            ..Default::default()
        });
        assert_eq!(
            metrics.check_warnings(),
            vec![WarningType::SurfaceDrops { count: 2 }]
        );
    }

    #[test]
    fn test_backlog_warning_threshold() {
        let metrics = MetricsCollector::default();
        metrics.record_encoder_latency(BACKLOG_WARNING_MS);
        assert!(metrics.check_warnings().is_empty());

        metrics.record_encoder_latency(1_500);
        assert_eq!(
            metrics.check_warnings(),
            vec![WarningType::EncoderBacklog { latency_ms: 1_500 }]
        );
    }
}
