//! Captured frame types.

use bytes::Bytes;
use std::time::Instant;

/// Timestamp for a captured frame.
#[derive(Debug, Clone, Copy)]
pub struct CaptureTimestamp {
    /// Monotonic timestamp when the frame was captured.
    pub capture_time: Instant,

    /// Microseconds since the source started.
    pub pts_us: u64,
}

impl CaptureTimestamp {
    /// Stamp a frame captured now.
    pub fn now(start_time: Instant) -> Self {
        let capture_time = Instant::now();
        let pts_us = capture_time.duration_since(start_time).as_micros() as u64;

        Self {
            capture_time,
            pts_us,
        }
    }

    /// Get the presentation timestamp in milliseconds.
    pub fn pts_ms(&self) -> u64 {
        self.pts_us / 1000
    }
}

/// A captured camera frame.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Tightly packed RGBA pixels.
    pub data: Bytes,

    /// Frame width in pixels.
    pub width: u32,

    /// Frame height in pixels.
    pub height: u32,

    /// Capture timestamp.
    pub timestamp: CaptureTimestamp,

    /// Monotonically increasing sequence number.
    pub sequence: u64,
}

impl CapturedFrame {
    /// Create a new captured frame.
    pub fn new(
        data: Bytes,
        width: u32,
        height: u32,
        timestamp: CaptureTimestamp,
        sequence: u64,
    ) -> Self {
        Self {
            data,
            width,
            height,
            timestamp,
            sequence,
        }
    }

    /// Expected RGBA buffer size for given dimensions.
    pub fn rgba_buffer_size(width: u32, height: u32) -> usize {
        width as usize * height as usize * 4
    }

    /// Validate that the frame data matches its dimensions.
    pub fn is_valid(&self) -> bool {
        self.data.len() == Self::rgba_buffer_size(self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_validation() {
        let ts = CaptureTimestamp::now(Instant::now());
        let good = CapturedFrame::new(Bytes::from(vec![0u8; 4 * 4 * 4]), 4, 4, ts, 0);
        let bad = CapturedFrame::new(Bytes::from(vec![0u8; 10]), 4, 4, ts, 1);

        assert!(good.is_valid());
        assert!(!bad.is_valid());
    }
}
