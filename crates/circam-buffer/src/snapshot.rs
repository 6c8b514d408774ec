//! Point-in-time view of the buffer.

use std::time::{Duration, Instant};

use crate::frame::CompressedFrame;

/// Ordered copy of the frames retained when the snapshot was taken.
///
/// Frames share payloads with the live buffer, so later eviction does not
/// affect a snapshot.
#[derive(Debug, Clone)]
pub struct BufferSnapshot {
    frames: Vec<CompressedFrame>,
    taken_at: Instant,
}

impl BufferSnapshot {
    pub(crate) fn new(frames: Vec<CompressedFrame>) -> Self {
        Self {
            frames,
            taken_at: Instant::now(),
        }
    }

    /// Frames in presentation order.
    pub fn frames(&self) -> &[CompressedFrame] {
        &self.frames
    }

    /// Iterate frames in presentation order.
    pub fn iter(&self) -> std::slice::Iter<'_, CompressedFrame> {
        self.frames.iter()
    }

    /// Oldest frame.
    pub fn first(&self) -> Option<&CompressedFrame> {
        self.frames.first()
    }

    /// Newest frame.
    pub fn last(&self) -> Option<&CompressedFrame> {
        self.frames.last()
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns true if the buffer was empty.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Newest − oldest timestamp.
    pub fn duration(&self) -> Duration {
        match (self.frames.first(), self.frames.last()) {
            (Some(first), Some(last)) => Duration::from_micros(last.pts_us() - first.pts_us()),
            _ => Duration::ZERO,
        }
    }

    /// Total payload bytes.
    pub fn total_bytes(&self) -> usize {
        self.frames.iter().map(CompressedFrame::size).sum()
    }

    /// When the snapshot was taken.
    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

impl<'a> IntoIterator for &'a BufferSnapshot {
    type Item = &'a CompressedFrame;
    type IntoIter = std::slice::Iter<'a, CompressedFrame>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.iter()
    }
}
