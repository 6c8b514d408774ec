//! x264 software video encoder.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, instrument, trace};

use crate::error::EncoderError;
use crate::{EncodedVideoPacket, EncoderResult, H264Profile, VideoEncoder, VideoEncoderConfig};

/// x264 software encoder wrapper.
///
/// Frames are fed with a frame-counter timebase; the caller's microsecond
/// timestamps are matched back to output pictures in submission order
/// (zero-latency tuning emits no B-frames, so output order is input order).
///
/// The safe bindings cannot set a picture type, so keyframe requests are not
/// honoured: IDR frames come every `max_keyframe_interval` submitted frames.
pub struct X264Encoder {
    encoder: Option<x264::Encoder>,
    config: VideoEncoderConfig,
    frame_count: i64,
    pending_pts: VecDeque<u64>,
    keyframe_requested: bool,
    headers: Option<Bytes>,
}

impl X264Encoder {
    /// Create a new x264 encoder.
    #[instrument(name = "x264_new", skip_all)]
    pub fn new(config: VideoEncoderConfig) -> EncoderResult<Self> {
        debug!(
            width = config.width,
            height = config.height,
            fps = config.fps,
            bitrate_kbps = config.bitrate_kbps,
            "Initializing x264 encoder"
        );

        let keyframe_interval = config.keyframe_interval_frames();

        let mut setup = x264::Setup::preset(
            x264::Preset::Veryfast,
            x264::Tune::None,
            false, // fast_decode
            true,  // zero_latency
        )
        .fps(config.fps, 1)
        .bitrate(config.bitrate_kbps as i32)
        .max_keyframe_interval(keyframe_interval as i32)
        .scenecut_threshold(0);

        setup = match config.profile {
            H264Profile::Baseline => setup.baseline(),
            H264Profile::Main => setup.main(),
            H264Profile::High => setup.high(),
        };

        let mut encoder = setup
            .build(
                x264::Colorspace::NV12,
                config.width as i32,
                config.height as i32,
            )
            .map_err(|e| EncoderError::Initialization(format!("x264 setup failed: {:?}", e)))?;

        let headers = encoder
            .headers()
            .ok()
            .map(|h| Bytes::from(h.entirety().to_vec()));

        debug!(
            header_size = headers.as_ref().map_or(0, Bytes::len),
            keyframe_interval,
            "x264 encoder initialized"
        );

        Ok(Self {
            encoder: Some(encoder),
            config,
            frame_count: 0,
            pending_pts: VecDeque::new(),
            keyframe_requested: false,
            headers,
        })
    }
}

fn take_packet(
    pending_pts: &mut VecDeque<u64>,
    data: &x264::Data,
    picture: &x264::Picture,
) -> Option<EncodedVideoPacket> {
    if data.len() == 0 {
        return None;
    }
    let pts_us = pending_pts.pop_front()?;
    Some(EncodedVideoPacket {
        data: Bytes::from(data.entirety().to_vec()),
        pts_us,
        is_keyframe: picture.keyframe(),
    })
}

impl VideoEncoder for X264Encoder {
    fn encode(&mut self, frame: &[u8], pts_us: u64) -> EncoderResult<Option<EncodedVideoPacket>> {
        let expected_size = self.config.nv12_frame_size();
        if frame.len() != expected_size {
            return Err(EncoderError::InvalidInput(format!(
                "Expected {} bytes ({}x{} NV12), got {}",
                expected_size,
                self.config.width,
                self.config.height,
                frame.len()
            )));
        }

        trace!(frame = self.frame_count, pts_us, "Encoding frame");

        let y_size = (self.config.width * self.config.height) as usize;
        let stride = self.config.width as i32;

        let image = x264::Image::new(
            x264::Colorspace::NV12,
            self.config.width as i32,
            self.config.height as i32,
            &[
                x264::Plane {
                    data: &frame[..y_size],
                    stride,
                },
                x264::Plane {
                    data: &frame[y_size..],
                    stride,
                },
            ],
        );

        // IDR placement is governed by max_keyframe_interval; a request is
        // only logged because the safe bindings cannot force a picture type.
        if std::mem::take(&mut self.keyframe_requested) {
            trace!(frame = self.frame_count, "Keyframe requested");
        }

        let encoder = self.encoder.as_mut().ok_or(EncoderError::NotRunning)?;
        let (data, picture) = encoder
            .encode(self.frame_count, image)
            .map_err(|e| EncoderError::Encoding(format!("x264 encode failed: {:?}", e)))?;

        self.frame_count += 1;
        self.pending_pts.push_back(pts_us);

        Ok(take_packet(&mut self.pending_pts, &data, &picture))
    }

    fn flush(&mut self) -> EncoderResult<Vec<EncodedVideoPacket>> {
        debug!(pending = self.pending_pts.len(), "Flushing x264 encoder");

        let mut packets = Vec::new();
        let encoder = match self.encoder.take() {
            Some(e) => e,
            None => return Ok(packets),
        };
        let mut flush = encoder.flush();

        while let Some(result) = flush.next() {
            match result {
                Ok((data, picture)) => {
                    if let Some(packet) = take_packet(&mut self.pending_pts, &data, &picture) {
                        packets.push(packet);
                    }
                }
                Err(e) => {
                    debug!("Flush iteration ended: {:?}", e);
                    break;
                }
            }
        }

        Ok(packets)
    }

    fn request_keyframe(&mut self) {
        self.keyframe_requested = true;
    }

    fn forces_keyframes(&self) -> bool {
        false
    }

    fn headers(&self) -> Option<Bytes> {
        self.headers.clone()
    }

    fn is_hardware_accelerated(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "x264"
    }
}

// SAFETY: x264::Encoder holds raw pointers but is only driven from the
// encode worker thread that owns it.
unsafe impl Send for X264Encoder {}
