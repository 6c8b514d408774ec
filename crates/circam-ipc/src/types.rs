//! Common types used across session messages.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for a capture session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Encoder input surface width in pixels.
    pub width: u32,

    /// Encoder input surface height in pixels.
    pub height: u32,

    /// Nominal encoder frame rate.
    pub frame_rate: u32,

    /// Video bitrate in kbps (default: 6000).
    pub bitrate_kbps: u32,

    /// Forced keyframe interval in seconds.
    pub keyframe_interval_secs: u32,

    /// Length of the retained window in seconds.
    pub retention_secs: u32,

    /// Byte budget of the circular buffer (None: bitrate × retention / 8).
    pub max_buffer_bytes: Option<u64>,

    /// Render loop tick interval in milliseconds.
    pub draw_interval_ms: u64,

    /// Minimum spacing between occupancy events in milliseconds.
    pub occupancy_interval_ms: u64,

    /// Directory for saves that do not name a file.
    pub output_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            width: 1080,
            height: 1920,
            frame_rate: 30,
            bitrate_kbps: 6000,
            keyframe_interval_secs: 1,
            retention_secs: 20,
            max_buffer_bytes: None,
            draw_interval_ms: 1000 / 30,
            occupancy_interval_ms: 250,
            output_dir: PathBuf::from("."),
        }
    }
}

impl SessionConfig {
    /// Retained window length.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs as u64)
    }

    /// Byte budget of the circular buffer.
    pub fn buffer_byte_budget(&self) -> u64 {
        self.max_buffer_bytes.unwrap_or_else(|| {
            self.bitrate_kbps as u64 * 1000 * self.retention_secs as u64 / 8
        })
    }

    /// Render loop tick interval.
    pub fn draw_interval(&self) -> Duration {
        Duration::from_millis(self.draw_interval_ms)
    }

    /// Forced keyframe interval.
    pub fn keyframe_interval(&self) -> Duration {
        Duration::from_secs(self.keyframe_interval_secs as u64)
    }

    /// Minimum spacing between occupancy events.
    pub fn occupancy_interval(&self) -> Duration {
        Duration::from_millis(self.occupancy_interval_ms)
    }

    /// Check the configuration for values the pipeline cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(ConfigError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if self.frame_rate == 0 {
            return Err(ConfigError::ZeroFrameRate);
        }
        if self.draw_interval_ms == 0 {
            return Err(ConfigError::ZeroDrawInterval);
        }
        if self.retention_secs == 0 {
            return Err(ConfigError::ZeroRetention);
        }
        if self.keyframe_interval_secs == 0
            || self.keyframe_interval_secs >= self.retention_secs
        {
            return Err(ConfigError::KeyframeInterval {
                keyframe_secs: self.keyframe_interval_secs,
                retention_secs: self.retention_secs,
            });
        }
        Ok(())
    }
}

/// Invalid session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Surface dimensions must be non-zero and even (NV12).
    #[error("Invalid surface dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// Frame rate must be non-zero.
    #[error("Frame rate must be non-zero")]
    ZeroFrameRate,

    /// Draw interval must be non-zero.
    #[error("Draw interval must be non-zero")]
    ZeroDrawInterval,

    /// Retention window must be non-zero.
    #[error("Retention window must be non-zero")]
    ZeroRetention,

    /// Keyframes must arrive more often than the retention window.
    #[error(
        "Keyframe interval {keyframe_secs}s must be non-zero and shorter than the {retention_secs}s retention window"
    )]
    KeyframeInterval {
        keyframe_secs: u32,
        retention_secs: u32,
    },
}

/// Answer to a save request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveResponse {
    /// The save was queued on the writer.
    Accepted,

    /// Another save is in flight; nothing was queued.
    Busy,

    /// The session is not running.
    NotRunning,
}

/// Machine-readable save failure code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveErrorCode {
    /// File system error.
    Io,

    /// The snapshot did not start at a keyframe.
    InvalidStream,

    /// No SPS/PPS available to build the decoder configuration.
    MissingParameterSets,
}

/// Outcome of a save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveStatus {
    /// File written.
    Ok,

    /// The buffer held no frames; no file was created.
    NoData,

    /// Writing failed; any partial file was removed.
    Failed {
        code: SaveErrorCode,
        message: String,
    },

    /// The session shut down mid-save; any partial file was removed.
    Canceled,
}

impl SaveStatus {
    /// Returns true if the file was written.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Completion record of a save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveReport {
    /// Target file.
    pub path: PathBuf,

    /// Outcome.
    pub status: SaveStatus,

    /// Frames written.
    pub frames: usize,

    /// Duration of the written segment in milliseconds.
    pub duration_ms: u64,

    /// Bytes written to the file.
    pub bytes: u64,
}

impl SaveReport {
    /// A report for a save that wrote nothing.
    pub fn empty(path: PathBuf, status: SaveStatus) -> Self {
        Self {
            path,
            status,
            frames: 0,
            duration_ms: 0,
            bytes: 0,
        }
    }
}

/// Pipeline metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetrics {
    /// Render loop frames per second since the last report.
    pub render_fps: f32,

    /// Target render rate.
    pub target_fps: f32,

    /// Frames presented to the encoder surface.
    pub frames_rendered: u64,

    /// Ticks skipped because of transient render errors.
    pub render_skips: u64,

    /// Frames dropped at the encoder surface (encoder backpressure).
    pub surface_drops: u64,

    /// Access units produced by the encoder.
    pub frames_encoded: u64,

    /// Encode calls that failed.
    pub encode_errors: u64,

    /// Access units accepted by the circular buffer.
    pub frames_buffered: u64,

    /// Frames evicted from the circular buffer.
    pub frames_evicted: u64,

    /// Non-keyframes dropped because their GOP head was gone.
    pub orphan_frames: u64,

    /// Encoded bitrate in kbps since start.
    pub bitrate_kbps: u32,

    /// Age of the newest buffered frame in milliseconds.
    pub encoder_latency_ms: u64,

    /// Retained duration in milliseconds.
    pub buffered_ms: u64,

    /// Retained bytes.
    pub buffered_bytes: u64,

    /// Events dropped because a subscriber was full.
    pub events_dropped: u64,

    /// Session uptime in seconds.
    pub uptime_seconds: u64,
}

/// Types of performance warnings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WarningType {
    /// The drain is falling behind the render loop.
    EncoderBacklog { latency_ms: u64 },

    /// Frames are being dropped at the encoder surface.
    SurfaceDrops { count: u64 },

    /// Render ticks are being skipped.
    RenderSkips { count: u64 },
}
