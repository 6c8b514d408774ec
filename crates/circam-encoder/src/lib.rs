//! H.264 video encoding.
//!
//! Frames presented to an [`InputSurface`] are converted to NV12 and encoded
//! on a dedicated worker thread. A separate drain thread hands the encoded
//! access units to a [`circam_buffer::FrameSink`], independent of the render
//! cadence.

mod error;
mod session;
mod surface;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
#[cfg(feature = "x264")]
mod x264;

pub use error::EncoderError;
pub use session::{AddObserver, DrainPolicy, EncoderCounters, EncoderSession};
pub use surface::{InputSurface, SurfaceFrame};
#[cfg(feature = "x264")]
pub use x264::X264Encoder;

use std::time::Duration;

use bytes::Bytes;

/// Channel capacity between the input surface and the encode worker.
pub const SURFACE_CHANNEL_CAPACITY: usize = 4;

/// Channel capacity for encoded packets.
pub const ENCODED_CHANNEL_CAPACITY: usize = 8;

/// Consecutive encode failures after which the codec is considered dead.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 30;

/// Result type for encoder operations.
pub type EncoderResult<T> = Result<T, EncoderError>;

/// Video encoding configuration.
#[derive(Debug, Clone)]
pub struct VideoEncoderConfig {
    /// Width in pixels.
    pub width: u32,

    /// Height in pixels.
    pub height: u32,

    /// Target frames per second.
    pub fps: u32,

    /// Target bitrate in kbps.
    pub bitrate_kbps: u32,

    /// Maximum time between keyframes.
    pub keyframe_interval: Duration,

    /// H.264 profile.
    pub profile: H264Profile,
}

impl VideoEncoderConfig {
    /// Keyframe interval expressed in frames (at least 1).
    pub fn keyframe_interval_frames(&self) -> u32 {
        let frames = self.keyframe_interval.as_secs_f64() * self.fps as f64;
        (frames.round() as u32).max(1)
    }

    /// Size of one NV12 frame in bytes.
    pub fn nv12_frame_size(&self) -> usize {
        let y_size = self.width as usize * self.height as usize;
        y_size + y_size / 2
    }
}

impl Default for VideoEncoderConfig {
    fn default() -> Self {
        Self {
            width: 1080,
            height: 1920,
            fps: 30,
            bitrate_kbps: 6000,
            keyframe_interval: Duration::from_secs(1),
            profile: H264Profile::High,
        }
    }
}

/// H.264 profile levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264Profile {
    Baseline,
    Main,
    High,
}

/// An encoded video packet.
#[derive(Debug, Clone)]
pub struct EncodedVideoPacket {
    /// One access unit in Annex B format.
    pub data: Bytes,

    /// Presentation timestamp in microseconds.
    pub pts_us: u64,

    /// Whether this is a keyframe (IDR).
    pub is_keyframe: bool,
}

/// Trait for video encoders.
///
/// Encoders are driven from a single worker thread.
pub trait VideoEncoder: Send {
    /// Encode a frame in NV12 format.
    fn encode(&mut self, frame: &[u8], pts_us: u64) -> EncoderResult<Option<EncodedVideoPacket>>;

    /// Flush any remaining frames.
    fn flush(&mut self) -> EncoderResult<Vec<EncodedVideoPacket>>;

    /// Ask for the next encoded frame to be a keyframe.
    ///
    /// This is a hint. Codecs that report `false` from
    /// [`forces_keyframes`](Self::forces_keyframes) ignore it and place IDR
    /// frames by frame count from `keyframe_interval_frames()`, so frames
    /// dropped before the codec stretch the real keyframe spacing.
    fn request_keyframe(&mut self);

    /// Whether [`request_keyframe`](Self::request_keyframe) is honoured.
    fn forces_keyframes(&self) -> bool {
        true
    }

    /// SPS/PPS in Annex B format, if the codec exposes them out of band.
    fn headers(&self) -> Option<Bytes>;

    /// Check if the encoder supports hardware acceleration.
    fn is_hardware_accelerated(&self) -> bool;

    /// Get encoder name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Create the system video encoder.
#[cfg(feature = "x264")]
pub fn create_video_encoder(config: VideoEncoderConfig) -> EncoderResult<Box<dyn VideoEncoder>> {
    let encoder = X264Encoder::new(config)?;
    tracing::info!("Using x264 software encoder");
    Ok(Box::new(encoder))
}

/// Create the system video encoder (stub when built without a codec).
#[cfg(not(feature = "x264"))]
pub fn create_video_encoder(_config: VideoEncoderConfig) -> EncoderResult<Box<dyn VideoEncoder>> {
    Err(EncoderError::NotSupported(
        "built without the `x264` feature".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyframe_interval_frames() {
        let config = VideoEncoderConfig {
            fps: 30,
            keyframe_interval: Duration::from_millis(500),
            ..Default::default()
        };
        assert_eq!(config.keyframe_interval_frames(), 15);

        let config = VideoEncoderConfig {
            keyframe_interval: Duration::ZERO,
            ..config
        };
        assert_eq!(config.keyframe_interval_frames(), 1);
    }

    #[test]
    fn test_nv12_frame_size() {
        let config = VideoEncoderConfig {
            width: 4,
            height: 2,
            ..Default::default()
        };
        assert_eq!(config.nv12_frame_size(), 12);
    }

    #[cfg(not(feature = "x264"))]
    #[test]
    fn test_create_without_codec_is_not_supported() {
        let result = create_video_encoder(VideoEncoderConfig::default());
        assert!(matches!(result, Err(EncoderError::NotSupported(_))));
    }
}
