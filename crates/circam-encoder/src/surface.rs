//! Encoder input surface.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;
use tracing::trace;

/// One frame presented to the encoder, in RGBA.
#[derive(Debug, Clone)]
pub struct SurfaceFrame {
    /// Tightly packed RGBA pixels.
    pub data: Bytes,

    /// Frame width in pixels.
    pub width: u32,

    /// Frame height in pixels.
    pub height: u32,

    /// Presentation timestamp in microseconds on the session clock.
    pub pts_us: u64,
}

impl SurfaceFrame {
    /// Convert to NV12 (BT.601).
    pub fn to_nv12(&self) -> Vec<u8> {
        rgba_to_nv12(&self.data, self.width as usize, self.height as usize)
    }
}

/// Convert tightly packed RGBA to NV12.
pub(crate) fn rgba_to_nv12(rgba: &[u8], w: usize, h: usize) -> Vec<u8> {
    let row_pitch = w * 4;
    let y_size = w * h;
    let mut nv12 = vec![0u8; y_size + y_size / 2];

    for y in 0..h {
        for x in 0..w {
            let src = y * row_pitch + x * 4;
            let r = rgba[src] as f32;
            let g = rgba[src + 1] as f32;
            let b = rgba[src + 2] as f32;
            nv12[y * w + x] = (0.299 * r + 0.587 * g + 0.114 * b) as u8;
        }
    }

    // Chroma from the average of each 2x2 block
    for y in (0..h.saturating_sub(1)).step_by(2) {
        for x in (0..w.saturating_sub(1)).step_by(2) {
            let (mut r, mut g, mut b) = (0.0f32, 0.0f32, 0.0f32);
            for (dy, dx) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                let src = (y + dy) * row_pitch + (x + dx) * 4;
                r += rgba[src] as f32;
                g += rgba[src + 1] as f32;
                b += rgba[src + 2] as f32;
            }
            let (r, g, b) = (r / 4.0, g / 4.0, b / 4.0);

            let u = ((-0.169 * r - 0.331 * g + 0.500 * b) + 128.0).clamp(0.0, 255.0) as u8;
            let v = ((0.500 * r - 0.419 * g - 0.081 * b) + 128.0).clamp(0.0, 255.0) as u8;

            let uv_idx = y_size + (y / 2) * w + x;
            nv12[uv_idx] = u;
            nv12[uv_idx + 1] = v;
        }
    }

    nv12
}

#[derive(Default)]
pub(crate) struct SurfaceCounters {
    pub(crate) presented: AtomicU64,
    pub(crate) dropped: AtomicU64,
}

/// The encoder's drawable input.
///
/// Whatever is presented becomes encoder input. Each frame is stamped with a
/// strictly increasing timestamp. Presenting never blocks: when the encoder
/// is behind, the frame is dropped and counted.
#[derive(Clone)]
pub struct InputSurface {
    tx: Sender<SurfaceFrame>,
    width: u32,
    height: u32,
    clock: Instant,
    last_pts_us: Arc<Mutex<Option<u64>>>,
    closed: Arc<AtomicBool>,
    counters: Arc<SurfaceCounters>,
}

impl InputSurface {
    pub(crate) fn new(
        tx: Sender<SurfaceFrame>,
        width: u32,
        height: u32,
        clock: Instant,
        counters: Arc<SurfaceCounters>,
    ) -> Self {
        Self {
            tx,
            width,
            height,
            clock,
            last_pts_us: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
            counters,
        }
    }

    /// Standalone surface whose frames arrive on the returned receiver.
    pub fn with_channel(
        width: u32,
        height: u32,
        capacity: usize,
    ) -> (Self, crossbeam_channel::Receiver<SurfaceFrame>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let surface = Self::new(tx, width, height, Instant::now(), Arc::default());
        (surface, rx)
    }

    /// Surface dimensions expected by the encoder.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Present an RGBA frame. Returns false if it was not accepted.
    pub fn present(&self, data: Bytes) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        let pts_us = {
            let mut last = self.last_pts_us.lock();
            let now = self.clock.elapsed().as_micros() as u64;
            let pts = match *last {
                Some(prev) if now <= prev => prev + 1,
                _ => now,
            };
            *last = Some(pts);
            pts
        };

        let frame = SurfaceFrame {
            data,
            width: self.width,
            height: self.height,
            pts_us,
        };

        match self.tx.try_send(frame) {
            Ok(()) => {
                self.counters.presented.fetch_add(1, Ordering::Relaxed);
                trace!(pts_us, "Surface frame presented");
                true
            }
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(pts_us, "Encoder behind, surface frame dropped");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.close();
                false
            }
        }
    }

    /// Stop accepting frames. Affects every clone.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Returns true once the surface stopped accepting frames.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Frames handed to the encoder.
    pub fn presented(&self) -> u64 {
        self.counters.presented.load(Ordering::Relaxed)
    }

    /// Frames dropped because the encoder was behind.
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface(capacity: usize) -> (InputSurface, crossbeam_channel::Receiver<SurfaceFrame>) {
        InputSurface::with_channel(2, 2, capacity)
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let (surface, rx) = surface(64);
        for _ in 0..50 {
            assert!(surface.present(Bytes::from(vec![0u8; 16])));
        }

        let pts: Vec<u64> = rx.try_iter().map(|f| f.pts_us).collect();
        assert_eq!(pts.len(), 50);
        assert!(pts.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_full_channel_drops_frame() {
        let (surface, _rx) = surface(2);
        assert!(surface.present(Bytes::from(vec![0u8; 16])));
        assert!(surface.present(Bytes::from(vec![0u8; 16])));
        assert!(!surface.present(Bytes::from(vec![0u8; 16])));

        assert_eq!(surface.presented(), 2);
        assert_eq!(surface.dropped(), 1);
    }

    #[test]
    fn test_closed_surface_rejects() {
        let (surface, rx) = surface(4);
        let clone = surface.clone();
        surface.close();

        assert!(!clone.present(Bytes::from(vec![0u8; 16])));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_rgba_to_nv12_colours() {
        // 2x2 pure white, then pure red
        let white = vec![255u8; 16];
        let nv12 = rgba_to_nv12(&white, 2, 2);
        assert_eq!(nv12.len(), 6);
        assert!(nv12[..4].iter().all(|&y| y >= 254));
        assert!((nv12[4] as i32 - 128).abs() <= 1);
        assert!((nv12[5] as i32 - 128).abs() <= 1);

        let mut red = Vec::new();
        for _ in 0..4 {
            red.extend_from_slice(&[255, 0, 0, 255]);
        }
        let nv12 = rgba_to_nv12(&red, 2, 2);
        assert_eq!(nv12[0], 76);
        // Red pushes V up and U down
        assert!(nv12[5] > 200);
        assert!(nv12[4] < 128);
    }
}
