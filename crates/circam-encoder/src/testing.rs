//! Deterministic encoder for tests and headless runs.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::EncoderError;
use crate::{EncodedVideoPacket, EncoderResult, VideoEncoder};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Baseline profile, level 3.1.
pub const FAKE_SPS: [u8; 8] = [0x67, 0x42, 0xc0, 0x1f, 0xda, 0x01, 0x40, 0x16];

/// Minimal PPS.
pub const FAKE_PPS: [u8; 4] = [0x68, 0xce, 0x3c, 0x80];

/// Emits well-formed Annex B access units without a real codec.
///
/// Keyframes carry SPS + PPS + IDR slice; other frames carry one non-IDR
/// slice. A keyframe is produced for the first frame and whenever one was
/// requested, or every N frames with [`FakeEncoder::with_fixed_gop`].
pub struct FakeEncoder {
    width: u32,
    height: u32,
    keyframe_size: usize,
    delta_size: usize,
    frame_count: u64,
    keyframe_requested: bool,
    fixed_gop: Option<u64>,
    fail_after: Option<u64>,
}

impl FakeEncoder {
    /// Create an encoder expecting `width`x`height` NV12 input.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            keyframe_size: 2_000,
            delta_size: 400,
            frame_count: 0,
            keyframe_requested: false,
            fixed_gop: None,
            fail_after: None,
        }
    }

    /// Payload sizes of keyframe and delta slices.
    pub fn with_sizes(mut self, keyframe_size: usize, delta_size: usize) -> Self {
        self.keyframe_size = keyframe_size.max(2);
        self.delta_size = delta_size.max(2);
        self
    }

    /// Ignore keyframe requests and emit a keyframe every `frames` frames.
    pub fn with_fixed_gop(mut self, frames: u64) -> Self {
        self.fixed_gop = Some(frames.max(1));
        self
    }

    /// Fail every encode once `frames` frames have been encoded.
    pub fn fail_after(&mut self, frames: u64) {
        self.fail_after = Some(frames);
    }

    fn slice(nal_header: u8, size: usize, seed: u64) -> impl Iterator<Item = u8> {
        // 0xAB-based filler never forms a start code
        std::iter::once(nal_header)
            .chain(std::iter::once((seed as u8) | 0x80))
            .chain(std::iter::repeat(0xAB).take(size.saturating_sub(2)))
    }
}

impl VideoEncoder for FakeEncoder {
    fn encode(&mut self, frame: &[u8], pts_us: u64) -> EncoderResult<Option<EncodedVideoPacket>> {
        if self.fail_after.is_some_and(|n| self.frame_count >= n) {
            return Err(EncoderError::Encoding("injected failure".into()));
        }

        let expected = self.width as usize * self.height as usize * 3 / 2;
        if frame.len() != expected {
            return Err(EncoderError::InvalidInput(format!(
                "expected {expected} bytes, got {}",
                frame.len()
            )));
        }

        let is_keyframe = match self.fixed_gop {
            Some(gop) => self.frame_count % gop == 0,
            None => self.frame_count == 0 || self.keyframe_requested,
        };
        self.keyframe_requested = false;

        let mut data = BytesMut::new();
        if is_keyframe {
            data.put_slice(&START_CODE);
            data.put_slice(&FAKE_SPS);
            data.put_slice(&START_CODE);
            data.put_slice(&FAKE_PPS);
            data.put_slice(&START_CODE);
            data.extend(Self::slice(0x65, self.keyframe_size, self.frame_count));
        } else {
            data.put_slice(&START_CODE);
            data.extend(Self::slice(0x41, self.delta_size, self.frame_count));
        }

        self.frame_count += 1;
        Ok(Some(EncodedVideoPacket {
            data: data.freeze(),
            pts_us,
            is_keyframe,
        }))
    }

    fn flush(&mut self) -> EncoderResult<Vec<EncodedVideoPacket>> {
        Ok(Vec::new())
    }

    fn request_keyframe(&mut self) {
        self.keyframe_requested = true;
    }

    fn forces_keyframes(&self) -> bool {
        self.fixed_gop.is_none()
    }

    fn headers(&self) -> Option<Bytes> {
        let mut headers = BytesMut::new();
        headers.put_slice(&START_CODE);
        headers.put_slice(&FAKE_SPS);
        headers.put_slice(&START_CODE);
        headers.put_slice(&FAKE_PPS);
        Some(headers.freeze())
    }

    fn is_hardware_accelerated(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_frame_and_requested_frames_are_keyframes() {
        let mut encoder = FakeEncoder::new(2, 2);
        let frame = [0u8; 6];

        assert!(encoder.encode(&frame, 0).unwrap().unwrap().is_keyframe);
        assert!(!encoder.encode(&frame, 1).unwrap().unwrap().is_keyframe);
        encoder.request_keyframe();
        assert!(encoder.encode(&frame, 2).unwrap().unwrap().is_keyframe);
        assert!(!encoder.encode(&frame, 3).unwrap().unwrap().is_keyframe);
    }

    #[test]
    fn test_fixed_gop_ignores_keyframe_requests() {
        let mut encoder = FakeEncoder::new(2, 2).with_fixed_gop(3);
        let frame = [0u8; 6];
        assert!(!encoder.forces_keyframes());

        let mut keyframes = Vec::new();
        for pts in 0..7 {
            encoder.request_keyframe();
            keyframes.push(encoder.encode(&frame, pts).unwrap().unwrap().is_keyframe);
        }
        assert_eq!(keyframes, [true, false, false, true, false, false, true]);
        assert!(FakeEncoder::new(2, 2).forces_keyframes());
    }

    #[test]
    fn test_keyframe_carries_parameter_sets() {
        let mut encoder = FakeEncoder::new(2, 2).with_sizes(10, 5);
        let packet = encoder.encode(&[0u8; 6], 0).unwrap().unwrap();

        assert_eq!(&packet.data[4..5], &[0x67]);
        assert_eq!(packet.data.len(), 4 + 8 + 4 + 4 + 4 + 10);
    }

    #[test]
    fn test_wrong_frame_size_is_rejected() {
        let mut encoder = FakeEncoder::new(2, 2);
        assert!(matches!(
            encoder.encode(&[0u8; 5], 0),
            Err(EncoderError::InvalidInput(_))
        ));
    }
}
