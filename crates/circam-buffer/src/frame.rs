//! Compressed frame type.

use bytes::Bytes;

/// One encoder access unit.
///
/// Immutable once created; clones share the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedFrame {
    data: Bytes,
    pts_us: u64,
    is_keyframe: bool,
}

impl CompressedFrame {
    /// Wrap an encoded access unit (Annex B for H.264).
    pub fn new(data: Bytes, pts_us: u64, is_keyframe: bool) -> Self {
        Self {
            data,
            pts_us,
            is_keyframe,
        }
    }

    /// Encoded payload.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Presentation timestamp in microseconds.
    pub fn pts_us(&self) -> u64 {
        self.pts_us
    }

    /// Presentation timestamp in milliseconds.
    pub fn pts_ms(&self) -> u64 {
        self.pts_us / 1000
    }

    /// Whether the frame decodes without earlier frames.
    pub fn is_keyframe(&self) -> bool {
        self.is_keyframe
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}
