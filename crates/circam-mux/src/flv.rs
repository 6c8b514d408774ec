//! FLV container: writer pieces and a reader for written files.
//!
//! Layout: 9-byte header, `PreviousTagSize0`, then tags. Each tag is an
//! 11-byte header (type, u24 size, u24 timestamp + extension byte, u24
//! stream id), the body, and a u32 `PreviousTagSize` of `11 + size`.

use std::io::Write;
use std::path::Path;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::MuxError;
use crate::MuxResult;

/// Script data tag type.
pub const TAG_SCRIPT: u8 = 18;

/// Video tag type.
pub const TAG_VIDEO: u8 = 9;

/// FLV codec id for H.264.
pub const CODEC_AVC: u8 = 7;

const TAG_HEADER_LEN: usize = 11;
const FILE_HEADER: [u8; 9] = [b'F', b'L', b'V', 0x01, 0x01, 0, 0, 0, 9];

const AMF_NUMBER: u8 = 0x00;
const AMF_BOOLEAN: u8 = 0x01;
const AMF_STRING: u8 = 0x02;
const AMF_ECMA_ARRAY: u8 = 0x08;
const AMF_OBJECT_END: [u8; 3] = [0x00, 0x00, 0x09];

/// Values carried in the `onMetaData` script tag.
#[derive(Debug, Clone, PartialEq)]
pub struct FlvMetadata {
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub framerate: f64,
    pub videodatarate_kbps: f64,
    pub encoder: String,
}

impl FlvMetadata {
    /// AMF0 body of the `onMetaData` script tag.
    pub fn to_amf0(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(AMF_STRING);
        put_amf_key(&mut buf, "onMetaData");

        buf.put_u8(AMF_ECMA_ARRAY);
        buf.put_u32(8);
        put_number(&mut buf, "duration", self.duration_secs);
        put_number(&mut buf, "width", self.width as f64);
        put_number(&mut buf, "height", self.height as f64);
        put_number(&mut buf, "framerate", self.framerate);
        put_number(&mut buf, "videocodecid", CODEC_AVC as f64);
        put_number(&mut buf, "videodatarate", self.videodatarate_kbps);
        put_amf_key(&mut buf, "hasAudio");
        buf.put_u8(AMF_BOOLEAN);
        buf.put_u8(0);
        put_amf_key(&mut buf, "encoder");
        buf.put_u8(AMF_STRING);
        put_amf_key(&mut buf, &self.encoder);
        buf.put_slice(&AMF_OBJECT_END);
        buf.freeze()
    }
}

fn put_amf_key(buf: &mut BytesMut, key: &str) {
    buf.put_u16(key.len() as u16);
    buf.put_slice(key.as_bytes());
}

fn put_number(buf: &mut BytesMut, key: &str, value: f64) {
    put_amf_key(buf, key);
    buf.put_u8(AMF_NUMBER);
    buf.put_f64(value);
}

/// Body of an AVC video tag.
///
/// First byte: frame type (1 = key, 2 = inter) in the high nibble, codec id
/// 7 in the low nibble. Then the AVC packet type (0 = sequence header,
/// 1 = NALU) and a zero composition time offset.
pub fn video_tag_body(payload: &[u8], is_keyframe: bool, is_sequence_header: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    let frame_type = if is_keyframe { 0x10 } else { 0x20 };
    buf.put_u8(frame_type | CODEC_AVC);
    buf.put_u8(if is_sequence_header { 0 } else { 1 });
    buf.put_slice(&[0, 0, 0]);
    buf.put_slice(payload);
    buf.freeze()
}

/// Writes FLV framing to any [`Write`].
pub struct FlvWriter<W: Write> {
    inner: W,
    bytes_written: u64,
}

impl<W: Write> FlvWriter<W> {
    /// Write the file header and `PreviousTagSize0`.
    pub fn new(mut inner: W) -> MuxResult<Self> {
        inner.write_all(&FILE_HEADER)?;
        inner.write_all(&0u32.to_be_bytes())?;
        Ok(Self {
            inner,
            bytes_written: FILE_HEADER.len() as u64 + 4,
        })
    }

    /// Append one tag with its trailing `PreviousTagSize`.
    pub fn write_tag(&mut self, tag_type: u8, timestamp_ms: u32, body: &[u8]) -> MuxResult<()> {
        if body.len() > 0x00FF_FFFF {
            return Err(MuxError::InvalidStream(format!(
                "tag body of {} bytes exceeds 24-bit size",
                body.len()
            )));
        }

        let mut header = [0u8; TAG_HEADER_LEN];
        header[0] = tag_type;
        header[1..4].copy_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        header[4..7].copy_from_slice(&timestamp_ms.to_be_bytes()[1..]);
        header[7] = (timestamp_ms >> 24) as u8;
        // stream id stays zero

        self.inner.write_all(&header)?;
        self.inner.write_all(body)?;
        let previous_tag_size = (TAG_HEADER_LEN + body.len()) as u32;
        self.inner.write_all(&previous_tag_size.to_be_bytes())?;
        self.bytes_written += (TAG_HEADER_LEN + body.len() + 4) as u64;
        Ok(())
    }

    /// Total bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flush and return the underlying writer.
    pub fn finish(mut self) -> MuxResult<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// What [`probe`] found in an FLV file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlvSummary {
    /// `onMetaData` duration in milliseconds.
    pub duration_ms: u64,

    /// `onMetaData` width.
    pub width: u32,

    /// `onMetaData` height.
    pub height: u32,

    /// Video tags excluding the sequence header.
    pub video_tags: usize,

    /// Video tags flagged as keyframes, excluding the sequence header.
    pub keyframes: usize,

    /// Whether the first video sample is a keyframe.
    pub first_is_keyframe: bool,

    /// Timestamp of the first video sample.
    pub first_timestamp_ms: u32,

    /// Timestamp of the last video sample.
    pub last_timestamp_ms: u32,

    /// Whether an AVC sequence header precedes the samples.
    pub has_sequence_header: bool,
}

/// Read back an FLV file.
pub fn probe(path: impl AsRef<Path>) -> MuxResult<FlvSummary> {
    let data = std::fs::read(path)?;
    probe_bytes(&data)
}

/// Parse FLV bytes.
pub fn probe_bytes(data: &[u8]) -> MuxResult<FlvSummary> {
    let invalid = |msg: &str| MuxError::InvalidFile(msg.to_string());

    if data.len() < FILE_HEADER.len() + 4 || &data[..3] != b"FLV" {
        return Err(invalid("missing FLV signature"));
    }
    let header_len = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) as usize;
    let mut buf = data
        .get(header_len + 4..)
        .ok_or_else(|| invalid("truncated header"))?;

    let mut summary = FlvSummary::default();
    let mut seen_sample = false;

    while buf.has_remaining() {
        if buf.remaining() < TAG_HEADER_LEN {
            return Err(invalid("truncated tag header"));
        }
        let tag_type = buf.get_u8();
        let size = buf.get_uint(3) as usize;
        let timestamp = buf.get_uint(3) as u32 | (buf.get_u8() as u32) << 24;
        buf.advance(3);

        if buf.remaining() < size + 4 {
            return Err(invalid("truncated tag body"));
        }
        let (body, rest) = buf.split_at(size);
        buf = rest;
        if buf.get_u32() as usize != TAG_HEADER_LEN + size {
            return Err(invalid("previous tag size mismatch"));
        }

        match tag_type {
            TAG_SCRIPT => read_metadata(body, &mut summary)?,
            TAG_VIDEO if body.len() >= 2 => {
                let is_keyframe = body[0] >> 4 == 1;
                if body[1] == 0 {
                    summary.has_sequence_header = true;
                    continue;
                }
                if !seen_sample {
                    seen_sample = true;
                    summary.first_is_keyframe = is_keyframe;
                    summary.first_timestamp_ms = timestamp;
                }
                summary.last_timestamp_ms = timestamp;
                summary.video_tags += 1;
                if is_keyframe {
                    summary.keyframes += 1;
                }
            }
            _ => {}
        }
    }

    Ok(summary)
}

fn read_metadata(mut body: &[u8], summary: &mut FlvSummary) -> MuxResult<()> {
    let invalid = || MuxError::InvalidFile("malformed onMetaData".into());

    if body.remaining() < 1 || body.get_u8() != AMF_STRING {
        return Err(invalid());
    }
    if read_amf_key(&mut body).ok_or_else(invalid)? != "onMetaData" {
        return Ok(());
    }
    if body.remaining() < 5 || body.get_u8() != AMF_ECMA_ARRAY {
        return Err(invalid());
    }
    body.advance(4);

    while body.remaining() >= 3 && body[..3] != AMF_OBJECT_END {
        let key = read_amf_key(&mut body).ok_or_else(invalid)?;
        if body.remaining() < 1 {
            return Err(invalid());
        }
        match body.get_u8() {
            AMF_NUMBER if body.remaining() >= 8 => {
                let value = body.get_f64();
                match key.as_str() {
                    "duration" => summary.duration_ms = (value * 1000.0).round() as u64,
                    "width" => summary.width = value as u32,
                    "height" => summary.height = value as u32,
                    _ => {}
                }
            }
            AMF_BOOLEAN if body.remaining() >= 1 => body.advance(1),
            AMF_STRING => {
                read_amf_key(&mut body).ok_or_else(invalid)?;
            }
            _ => return Err(invalid()),
        }
    }
    Ok(())
}

fn read_amf_key(body: &mut &[u8]) -> Option<String> {
    if body.remaining() < 2 {
        return None;
    }
    let len = body.get_u16() as usize;
    if body.remaining() < len {
        return None;
    }
    let key = String::from_utf8_lossy(&body[..len]).into_owned();
    body.advance(len);
    Some(key)
}
