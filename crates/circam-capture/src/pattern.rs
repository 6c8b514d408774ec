//! Synthetic frame source for headless runs and tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, instrument};

use crate::error::CaptureError;
use crate::frame::{CaptureTimestamp, CapturedFrame};
use crate::slot::FrameSlot;
use crate::{CaptureResult, FrameSource};

/// Produces a moving colour-bar pattern at a fixed rate.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    frame_interval: Duration,
    should_stop: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl TestPatternSource {
    /// Create a source of `width`x`height` frames at `fps`.
    pub fn new(width: u32, height: u32, fps: u32) -> CaptureResult<Self> {
        if width == 0 || height == 0 || fps == 0 {
            return Err(CaptureError::InvalidDimensions { width, height });
        }
        Ok(Self {
            width,
            height,
            frame_interval: Duration::from_secs(1) / fps,
            should_stop: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        })
    }

    fn capture_loop(
        width: u32,
        height: u32,
        frame_interval: Duration,
        slot: Arc<FrameSlot>,
        should_stop: Arc<AtomicBool>,
    ) {
        let start_time = Instant::now();
        let mut sequence = 0u64;
        let mut next_frame = start_time;

        while !should_stop.load(Ordering::Relaxed) {
            let data = render_pattern(width, height, sequence);
            let timestamp = CaptureTimestamp::now(start_time);
            slot.publish(CapturedFrame::new(data, width, height, timestamp, sequence));
            sequence += 1;

            next_frame += frame_interval;
            let now = Instant::now();
            if next_frame > now {
                std::thread::sleep(next_frame - now);
            } else {
                next_frame = now;
            }
        }

        debug!(frames = sequence, "Test pattern loop exited");
    }
}

/// Vertical colour bars with a bright column sweeping left to right.
fn render_pattern(width: u32, height: u32, sequence: u64) -> Bytes {
    const BARS: [[u8; 3]; 8] = [
        [235, 235, 235],
        [235, 235, 16],
        [16, 235, 235],
        [16, 235, 16],
        [235, 16, 235],
        [235, 16, 16],
        [16, 16, 235],
        [16, 16, 16],
    ];

    let sweep = (sequence % width as u64) as u32;
    let mut buf = BytesMut::with_capacity(CapturedFrame::rgba_buffer_size(width, height));
    for _ in 0..height {
        for x in 0..width {
            let [r, g, b] = if x == sweep {
                [255, 255, 255]
            } else {
                BARS[(x as usize * BARS.len()) / width as usize]
            };
            buf.put_slice(&[r, g, b, 255]);
        }
    }
    buf.freeze()
}

impl FrameSource for TestPatternSource {
    #[instrument(name = "pattern_start", skip(self, slot))]
    fn start(&mut self, slot: Arc<FrameSlot>) -> CaptureResult<()> {
        if self.thread_handle.is_some() {
            return Err(CaptureError::AlreadyStarted);
        }

        info!(
            width = self.width,
            height = self.height,
            interval_ms = self.frame_interval.as_millis() as u64,
            "Starting test pattern source"
        );

        self.should_stop.store(false, Ordering::SeqCst);
        let should_stop = Arc::clone(&self.should_stop);
        let (width, height, interval) = (self.width, self.height, self.frame_interval);

        let handle = std::thread::Builder::new()
            .name("circam-capture".into())
            .spawn(move || Self::capture_loop(width, height, interval, slot, should_stop))?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    #[instrument(name = "pattern_stop", skip(self))]
    fn stop(&mut self) -> CaptureResult<()> {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            info!("Test pattern source stopped");
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.thread_handle.is_some()
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Drop for TestPatternSource {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_zero_dimensions() {
        assert!(TestPatternSource::new(0, 16, 30).is_err());
        assert!(TestPatternSource::new(16, 16, 0).is_err());
    }

    #[test]
    fn test_pattern_size() {
        let data = render_pattern(8, 4, 3);
        assert_eq!(data.len(), 8 * 4 * 4);
        // sweep column at x == 3
        assert_eq!(&data[3 * 4..3 * 4 + 4], &[255, 255, 255, 255]);
    }

    #[test]
    fn test_publishes_frames_until_stopped() {
        let slot = Arc::new(FrameSlot::new());
        let mut source = TestPatternSource::new(16, 8, 100).unwrap();

        source.start(Arc::clone(&slot)).unwrap();
        assert!(source.is_active());
        assert!(matches!(
            source.start(Arc::clone(&slot)),
            Err(CaptureError::AlreadyStarted)
        ));

        let deadline = Instant::now() + Duration::from_secs(2);
        while slot.published() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        source.stop().unwrap();
        source.stop().unwrap();
        assert!(!source.is_active());

        let frame = slot.take_pending().unwrap();
        assert!(frame.is_valid());
        assert!(slot.published() >= 3);
    }
}
