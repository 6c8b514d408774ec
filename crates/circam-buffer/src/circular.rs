//! Circular buffer with whole-GOP eviction.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::BufferError;
use crate::frame::CompressedFrame;
use crate::snapshot::BufferSnapshot;
use crate::{BufferResult, FrameSink, RetentionPolicy};

/// Current fill level of the buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferOccupancy {
    /// Number of retained frames.
    pub frames: usize,

    /// Total payload bytes.
    pub bytes: usize,

    /// Newest − oldest timestamp.
    pub duration: Duration,
}

impl BufferOccupancy {
    /// Retained span in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }
}

/// Result of a successful [`CircularBuffer::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    /// False when the frame was discarded (orphan, or evicted with an
    /// oversized GOP).
    pub retained: bool,

    /// Frames evicted by this call.
    pub evicted_frames: usize,

    /// Occupancy after the call.
    pub occupancy: BufferOccupancy,
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub frames_added: u64,
    pub frames_evicted: u64,
    pub gops_evicted: u64,
    pub orphans_dropped: u64,
    pub frames_rejected: u64,
}

struct Inner {
    frames: VecDeque<CompressedFrame>,
    total_bytes: usize,
    last_pts_us: Option<u64>,
    /// Set when a frame was rejected; deltas are dropped until a keyframe.
    resync: bool,
}

impl Inner {
    fn duration_us(&self) -> u64 {
        match (self.frames.front(), self.frames.back()) {
            (Some(first), Some(last)) => last.pts_us() - first.pts_us(),
            _ => 0,
        }
    }

    fn occupancy(&self) -> BufferOccupancy {
        BufferOccupancy {
            frames: self.frames.len(),
            bytes: self.total_bytes,
            duration: Duration::from_micros(self.duration_us()),
        }
    }

    fn over_budget(&self, policy: &RetentionPolicy) -> bool {
        self.total_bytes > policy.max_bytes || self.duration_us() > policy.max_duration_us()
    }

    /// Pop the leading keyframe and every delta frame up to the next keyframe.
    fn evict_gop(&mut self) -> usize {
        let mut evicted = 0;
        while let Some(frame) = self.frames.pop_front() {
            self.total_bytes -= frame.size();
            evicted += 1;
            if self.frames.front().map_or(true, CompressedFrame::is_keyframe) {
                break;
            }
        }
        evicted
    }
}

/// Bounded, keyframe-aligned store of the most recent compressed frames.
///
/// Invariants held after every call:
/// - the oldest retained frame is a keyframe (or the buffer is empty)
/// - timestamps strictly increase from oldest to newest
/// - total bytes and duration stay within the [`RetentionPolicy`]
///
/// Eviction always removes whole GOPs from the front. A single GOP larger
/// than the budget is therefore discarded entirely.
pub struct CircularBuffer {
    policy: RetentionPolicy,
    inner: Mutex<Inner>,
    frames_added: AtomicU64,
    frames_evicted: AtomicU64,
    gops_evicted: AtomicU64,
    orphans_dropped: AtomicU64,
    frames_rejected: AtomicU64,
}

impl CircularBuffer {
    /// Create an empty buffer.
    pub fn new(policy: RetentionPolicy) -> Self {
        debug!(
            max_duration_ms = policy.max_duration.as_millis() as u64,
            max_bytes = policy.max_bytes,
            "Circular buffer created"
        );
        Self {
            policy,
            inner: Mutex::new(Inner {
                frames: VecDeque::new(),
                total_bytes: 0,
                last_pts_us: None,
                resync: false,
            }),
            frames_added: AtomicU64::new(0),
            frames_evicted: AtomicU64::new(0),
            gops_evicted: AtomicU64::new(0),
            orphans_dropped: AtomicU64::new(0),
            frames_rejected: AtomicU64::new(0),
        }
    }

    /// Append a frame, evicting whole GOPs from the front until the buffer
    /// is back within budget.
    ///
    /// A delta frame arriving while the buffer is empty cannot be decoded
    /// and is dropped (`retained == false`). After a rejected frame, deltas
    /// are dropped the same way until the next keyframe is accepted.
    pub fn add(&self, frame: CompressedFrame) -> BufferResult<AddOutcome> {
        let mut inner = self.inner.lock();

        if let Some(last_pts_us) = inner.last_pts_us {
            if frame.pts_us() <= last_pts_us {
                return Err(self.reject(
                    &mut inner,
                    BufferError::OutOfOrder {
                        pts_us: frame.pts_us(),
                        last_pts_us,
                    },
                ));
            }
        }

        if frame.size() > self.policy.max_bytes {
            return Err(self.reject(
                &mut inner,
                BufferError::FrameTooLarge {
                    size: frame.size(),
                    budget: self.policy.max_bytes,
                },
            ));
        }

        inner.last_pts_us = Some(frame.pts_us());

        if frame.is_keyframe() {
            inner.resync = false;
        } else if inner.frames.is_empty() || inner.resync {
            self.orphans_dropped.fetch_add(1, Ordering::Relaxed);
            trace!(pts_us = frame.pts_us(), "Dropping delta frame with no keyframe");
            return Ok(AddOutcome {
                retained: false,
                evicted_frames: 0,
                occupancy: inner.occupancy(),
            });
        }

        inner.total_bytes += frame.size();
        inner.frames.push_back(frame);
        self.frames_added.fetch_add(1, Ordering::Relaxed);

        let mut evicted_frames = 0;
        while inner.over_budget(&self.policy) {
            evicted_frames += inner.evict_gop();
            self.gops_evicted.fetch_add(1, Ordering::Relaxed);
        }

        let retained = !inner.frames.is_empty();
        if !retained {
            warn!(
                max_duration_ms = self.policy.max_duration.as_millis() as u64,
                max_bytes = self.policy.max_bytes,
                "GOP exceeds retention budget, buffer emptied"
            );
        }

        if evicted_frames > 0 {
            self.frames_evicted
                .fetch_add(evicted_frames as u64, Ordering::Relaxed);
            trace!(evicted_frames, remaining = inner.frames.len(), "Evicted GOPs");
        }

        Ok(AddOutcome {
            retained,
            evicted_frames,
            occupancy: inner.occupancy(),
        })
    }

    /// Count a rejected frame. Later deltas may reference it, so the stream
    /// resyncs on the next keyframe.
    fn reject(&self, inner: &mut Inner, error: BufferError) -> BufferError {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
        inner.resync = true;
        debug!(%error, "Frame rejected, waiting for next keyframe");
        error
    }

    /// Copy the retained frames. Payloads are shared, not duplicated.
    pub fn snapshot(&self) -> BufferSnapshot {
        let inner = self.inner.lock();
        BufferSnapshot::new(inner.frames.iter().cloned().collect())
    }

    /// Drop every frame and forget the last timestamp.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let frames = inner.frames.len();
        inner.frames.clear();
        inner.total_bytes = 0;
        inner.last_pts_us = None;
        inner.resync = false;
        debug!(frames, "Circular buffer cleared");
    }

    /// Current fill level.
    pub fn occupancy(&self) -> BufferOccupancy {
        self.inner.lock().occupancy()
    }

    /// Returns true if no frame is retained.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }

    /// Retention budget.
    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Lifetime counters.
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            frames_added: self.frames_added.load(Ordering::Relaxed),
            frames_evicted: self.frames_evicted.load(Ordering::Relaxed),
            gops_evicted: self.gops_evicted.load(Ordering::Relaxed),
            orphans_dropped: self.orphans_dropped.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
        }
    }
}

impl FrameSink for CircularBuffer {
    fn add(&self, frame: CompressedFrame) -> BufferResult<AddOutcome> {
        CircularBuffer::add(self, frame)
    }
}
