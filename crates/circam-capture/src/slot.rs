//! Latest-frame slot shared between the capture and render threads.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::frame::CapturedFrame;

/// Holds the most recent camera frame and a "frame ready" flag.
///
/// Publishing never blocks on the reader: a frame not yet taken is replaced
/// and counted as overwritten.
#[derive(Default)]
pub struct FrameSlot {
    latest: Mutex<Option<CapturedFrame>>,
    pending: AtomicBool,
    published: AtomicU64,
    overwritten: AtomicU64,
}

impl FrameSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new frame and raise the ready flag.
    pub fn publish(&self, frame: CapturedFrame) {
        let sequence = frame.sequence;
        let replaced = self.latest.lock().replace(frame).is_some();
        if replaced && self.pending.load(Ordering::Acquire) {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        self.pending.store(true, Ordering::Release);
        self.published.fetch_add(1, Ordering::Relaxed);
        trace!(sequence, "Frame published");
    }

    /// Take the latest frame if one arrived since the last call.
    pub fn take_pending(&self) -> Option<CapturedFrame> {
        if !self.pending.swap(false, Ordering::AcqRel) {
            return None;
        }
        self.latest.lock().take()
    }

    /// Returns true if a frame is waiting.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Total frames published.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Frames replaced before the reader took them.
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}
