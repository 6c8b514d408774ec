//! On-demand segment writer.
//!
//! A dedicated thread turns a [`CircularBuffer`] snapshot into an FLV file.
//! At most one save is in flight; the live buffer is never modified.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::SystemTime;

use bytes::Bytes;
use circam_buffer::{BufferSnapshot, CircularBuffer};
use circam_ipc::{SaveReport, SaveResponse, SaveStatus};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::error::MuxError;
use crate::flv::{video_tag_body, FlvMetadata, FlvWriter, TAG_SCRIPT, TAG_VIDEO};
use crate::nal::{access_unit_to_avcc, ParameterSets};
use crate::{MuxResult, JOB_CHANNEL_CAPACITY, PARTIAL_SUFFIX};

/// Stream properties written into every segment.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate_kbps: u32,
    /// Encoder name for `onMetaData`.
    pub encoder: String,
    /// Out-of-band SPS/PPS (Annex B), used when keyframes carry none.
    pub headers: Option<Bytes>,
}

/// A request to write the buffered window to `path`.
#[derive(Debug, Clone)]
pub struct SaveRequest {
    pub path: PathBuf,
    pub requested_at: SystemTime,
}

impl SaveRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            requested_at: SystemTime::now(),
        }
    }
}

/// Called on the writer thread when a save finishes.
pub type CompletionCallback = Box<dyn FnMut(SaveReport) + Send>;

struct Shared {
    busy: AtomicBool,
    cancel: AtomicBool,
    stream: RwLock<StreamInfo>,
}

struct Written {
    frames: usize,
    duration_ms: u64,
    bytes: u64,
}

/// Writes buffer snapshots to FLV files on a dedicated thread.
pub struct SegmentWriter {
    shared: Arc<Shared>,
    job_tx: Option<Sender<SaveRequest>>,
    handle: Option<JoinHandle<()>>,
}

impl SegmentWriter {
    /// Spawn the writer thread.
    #[instrument(name = "segment_writer_start", skip_all)]
    pub fn start(
        buffer: Arc<CircularBuffer>,
        stream: StreamInfo,
        on_complete: CompletionCallback,
    ) -> MuxResult<Self> {
        let shared = Arc::new(Shared {
            busy: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            stream: RwLock::new(stream),
        });
        let (job_tx, job_rx) = crossbeam_channel::bounded(JOB_CHANNEL_CAPACITY);

        let handle = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("circam-writer".into())
                .spawn(move || writer_loop(job_rx, buffer, shared, on_complete))
                .map_err(|e| MuxError::Thread(e.to_string()))?
        };

        debug!("Segment writer started");
        Ok(Self {
            shared,
            job_tx: Some(job_tx),
            handle: Some(handle),
        })
    }

    /// Queue a save. `Busy` while another save is in flight.
    pub fn submit(&self, request: SaveRequest) -> SaveResponse {
        let Some(job_tx) = &self.job_tx else {
            return SaveResponse::NotRunning;
        };

        if self
            .shared
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(path = %request.path.display(), "Save rejected, writer busy");
            return SaveResponse::Busy;
        }
        self.shared.cancel.store(false, Ordering::SeqCst);

        match job_tx.try_send(request) {
            Ok(()) => SaveResponse::Accepted,
            Err(TrySendError::Full(request)) => {
                warn!(path = %request.path.display(), "Save queue full");
                self.shared.busy.store(false, Ordering::SeqCst);
                SaveResponse::Busy
            }
            Err(TrySendError::Disconnected(_)) => {
                error!("Writer thread gone");
                self.shared.busy.store(false, Ordering::SeqCst);
                SaveResponse::NotRunning
            }
        }
    }

    /// Abort the save in flight, if any. Idempotent.
    pub fn cancel(&self) {
        if self.is_busy() {
            info!("Canceling save in flight");
        }
        self.shared.cancel.store(true, Ordering::SeqCst);
    }

    /// Returns true while a save is queued or being written.
    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::SeqCst)
    }

    /// Update the SPS/PPS and encoder name used for later saves.
    pub fn set_stream_headers(&self, headers: Option<Bytes>, encoder: &str) {
        let mut stream = self.shared.stream.write();
        stream.headers = headers;
        stream.encoder = encoder.to_string();
    }

    /// Cancel any save, stop accepting jobs and join the thread. Idempotent.
    #[instrument(name = "segment_writer_shutdown", skip(self))]
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        self.cancel();
        self.job_tx = None;
        if handle.join().is_err() {
            error!("Writer thread panicked");
        }
        info!("Segment writer stopped");
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn writer_loop(
    rx: Receiver<SaveRequest>,
    buffer: Arc<CircularBuffer>,
    shared: Arc<Shared>,
    mut on_complete: CompletionCallback,
) {
    debug!("Writer thread starting");
    for request in rx.iter() {
        let report = save_job(&buffer, &shared, &request);
        shared.busy.store(false, Ordering::SeqCst);
        on_complete(report);
    }
    debug!("Writer thread exiting");
}

#[instrument(name = "segment_save", skip_all, fields(path = %request.path.display()))]
fn save_job(buffer: &CircularBuffer, shared: &Shared, request: &SaveRequest) -> SaveReport {
    let path = request.path.clone();
    if shared.cancel.load(Ordering::SeqCst) {
        info!("Save canceled before start");
        return SaveReport::empty(path, SaveStatus::Canceled);
    }

    let snapshot = buffer.snapshot();
    if snapshot.is_empty() {
        info!("Buffer empty, nothing to save");
        return SaveReport::empty(path, SaveStatus::NoData);
    }

    let stream = shared.stream.read().clone();
    let partial = partial_path(&path);
    match write_segment(&snapshot, &stream, &path, &partial, &shared.cancel) {
        Ok(written) => {
            let latency_ms = request
                .requested_at
                .elapsed()
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default();
            info!(
                frames = written.frames,
                duration_ms = written.duration_ms,
                bytes = written.bytes,
                latency_ms,
                "Segment saved"
            );
            SaveReport {
                path,
                status: SaveStatus::Ok,
                frames: written.frames,
                duration_ms: written.duration_ms,
                bytes: written.bytes,
            }
        }
        Err(e) => {
            match &e {
                MuxError::Canceled => info!("Save canceled"),
                _ => error!(error = %e, "Save failed"),
            }
            if let Err(remove_err) = fs::remove_file(&partial) {
                if remove_err.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %remove_err, "Failed to remove partial file");
                }
            }
            SaveReport::empty(path, e.save_status())
        }
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

fn write_segment(
    snapshot: &BufferSnapshot,
    stream: &StreamInfo,
    path: &Path,
    partial: &Path,
    cancel: &AtomicBool,
) -> MuxResult<Written> {
    let first = snapshot
        .first()
        .ok_or_else(|| MuxError::InvalidStream("empty snapshot".into()))?;
    if !first.is_keyframe() {
        return Err(MuxError::InvalidStream(format!(
            "segment starts with a delta frame at {} us",
            first.pts_us()
        )));
    }

    let params = ParameterSets::from_annex_b(first.data())
        .or_else(|| {
            stream
                .headers
                .as_deref()
                .and_then(ParameterSets::from_annex_b)
        })
        .ok_or(MuxError::MissingParameterSets)?;
    let decoder_config = params
        .decoder_config()
        .ok_or(MuxError::MissingParameterSets)?;

    let first_pts = first.pts_us();
    let duration_ms = snapshot.duration().as_millis() as u64;
    debug!(
        frames = snapshot.len(),
        duration_ms,
        bytes = snapshot.total_bytes(),
        "Writing segment"
    );

    let file = File::create(partial)?;
    let mut flv = FlvWriter::new(BufWriter::new(file))?;

    let metadata = FlvMetadata {
        duration_secs: duration_ms as f64 / 1000.0,
        width: stream.width,
        height: stream.height,
        framerate: stream.frame_rate as f64,
        videodatarate_kbps: stream.bitrate_kbps as f64,
        encoder: stream.encoder.clone(),
    };
    flv.write_tag(TAG_SCRIPT, 0, &metadata.to_amf0())?;
    flv.write_tag(TAG_VIDEO, 0, &video_tag_body(&decoder_config, true, true))?;

    let mut frames = 0;
    for frame in snapshot {
        if cancel.load(Ordering::SeqCst) {
            return Err(MuxError::Canceled);
        }

        let payload = access_unit_to_avcc(frame.data());
        if payload.is_empty() {
            trace!(pts_us = frame.pts_us(), "Skipping access unit without slices");
            continue;
        }
        let timestamp_ms = ((frame.pts_us() - first_pts) / 1000) as u32;
        flv.write_tag(
            TAG_VIDEO,
            timestamp_ms,
            &video_tag_body(&payload, frame.is_keyframe(), false),
        )?;
        frames += 1;
    }

    let bytes = flv.bytes_written();
    let file = flv
        .finish()?
        .into_inner()
        .map_err(|e| MuxError::Io(e.into_error()))?;
    file.sync_all()?;
    drop(file);
    if cancel.load(Ordering::SeqCst) {
        return Err(MuxError::Canceled);
    }
    fs::rename(partial, path)?;

    Ok(Written {
        frames,
        duration_ms,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flv::probe;
    use circam_buffer::{CompressedFrame, RetentionPolicy};
    use circam_ipc::SaveErrorCode;
    use std::time::Duration;

    const SPS: [u8; 8] = [0x67, 0x42, 0xc0, 0x1f, 0xda, 0x01, 0x40, 0x16];
    const PPS: [u8; 4] = [0x68, 0xce, 0x3c, 0x80];
    const FRAME_US: u64 = 33_333;

    fn annex_b(units: &[&[u8]]) -> Bytes {
        let mut out = Vec::new();
        for unit in units {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(unit);
        }
        Bytes::from(out)
    }

    fn fill(buffer: &CircularBuffer, frames: u64, gop: u64, in_band: bool) {
        for i in 0..frames {
            let is_keyframe = i % gop == 0;
            let data = match (is_keyframe, in_band) {
                (true, true) => annex_b(&[&SPS, &PPS, &[0x65, 0x88, 0x84, 0x00]]),
                (true, false) => annex_b(&[&[0x65, 0x88, 0x84, 0x00]]),
                (false, _) => annex_b(&[&[0x41, 0x9a, 0x02]]),
            };
            buffer
                .add(CompressedFrame::new(data, i * FRAME_US, is_keyframe))
                .unwrap();
        }
    }

    fn stream_info() -> StreamInfo {
        StreamInfo {
            width: 64,
            height: 48,
            frame_rate: 30,
            bitrate_kbps: 500,
            encoder: "test".into(),
            headers: None,
        }
    }

    fn new_buffer() -> Arc<CircularBuffer> {
        Arc::new(CircularBuffer::new(RetentionPolicy::new(
            Duration::from_secs(20),
            10_000_000,
        )))
    }

    fn start_writer(
        buffer: Arc<CircularBuffer>,
        stream: StreamInfo,
    ) -> (SegmentWriter, Receiver<SaveReport>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let writer = SegmentWriter::start(
            buffer,
            stream,
            Box::new(move |report| {
                let _ = tx.send(report);
            }),
        )
        .unwrap();
        (writer, rx)
    }

    fn shared(stream: StreamInfo) -> Shared {
        Shared {
            busy: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            stream: RwLock::new(stream),
        }
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.flv");
        let buffer = new_buffer();
        fill(&buffer, 90, 30, true);

        let (mut writer, reports) = start_writer(Arc::clone(&buffer), stream_info());
        assert_eq!(writer.submit(SaveRequest::new(&path)), SaveResponse::Accepted);

        let report = reports.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(report.status, SaveStatus::Ok);
        assert_eq!(report.frames, 90);
        assert_eq!(report.duration_ms, 89 * FRAME_US / 1000);
        assert!(!writer.is_busy());

        let summary = probe(&path).unwrap();
        assert!(summary.has_sequence_header);
        assert!(summary.first_is_keyframe);
        assert_eq!(summary.first_timestamp_ms, 0);
        assert_eq!(summary.video_tags, 90);
        assert_eq!(summary.keyframes, 3);
        assert_eq!(summary.duration_ms, report.duration_ms);
        assert_eq!(summary.last_timestamp_ms as u64, report.duration_ms);
        assert_eq!((summary.width, summary.height), (64, 48));
        assert_eq!(fs::metadata(&path).unwrap().len(), report.bytes);
        assert!(!partial_path(&path).exists());

        // The live buffer is untouched
        assert_eq!(buffer.occupancy().frames, 90);
        writer.shutdown();
    }

    #[test]
    fn test_empty_buffer_creates_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.flv");
        let (writer, reports) = start_writer(new_buffer(), stream_info());

        assert_eq!(writer.submit(SaveRequest::new(&path)), SaveResponse::Accepted);
        let report = reports.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(report.status, SaveStatus::NoData);
        assert_eq!(report.frames, 0);
        assert!(!path.exists());
        assert!(!partial_path(&path).exists());
    }

    #[test]
    fn test_overlapping_submit_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.flv");
        let buffer = new_buffer();
        fill(&buffer, 30, 30, true);
        let (writer, reports) = start_writer(buffer, stream_info());

        writer.shared.busy.store(true, Ordering::SeqCst);
        assert_eq!(writer.submit(SaveRequest::new(&path)), SaveResponse::Busy);
        assert!(reports.try_recv().is_err());

        writer.shared.busy.store(false, Ordering::SeqCst);
        assert_eq!(writer.submit(SaveRequest::new(&path)), SaveResponse::Accepted);
        let report = reports.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(report.status.is_ok());
    }

    #[test]
    fn test_canceled_save_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("canceled.flv");
        let buffer = new_buffer();
        fill(&buffer, 60, 30, true);
        let shared = shared(stream_info());

        shared.cancel.store(true, Ordering::SeqCst);
        let report = save_job(&buffer, &shared, &SaveRequest::new(&path));
        assert_eq!(report.status, SaveStatus::Canceled);
        assert!(!path.exists());

        let partial = partial_path(&path);
        let result = write_segment(
            &buffer.snapshot(),
            &stream_info(),
            &path,
            &partial,
            &shared.cancel,
        );
        assert!(matches!(result, Err(MuxError::Canceled)));
        assert!(!path.exists());
    }

    #[test]
    fn test_parameter_sets_from_encoder_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("headers.flv");
        let buffer = new_buffer();
        fill(&buffer, 30, 15, false);
        let shared = shared(stream_info());

        let report = save_job(&buffer, &shared, &SaveRequest::new(&path));
        assert!(matches!(
            report.status,
            SaveStatus::Failed {
                code: SaveErrorCode::MissingParameterSets,
                ..
            }
        ));
        assert!(!path.exists());
        assert!(!partial_path(&path).exists());

        shared.stream.write().headers = Some(annex_b(&[&SPS, &PPS]));
        let report = save_job(&buffer, &shared, &SaveRequest::new(&path));
        assert_eq!(report.status, SaveStatus::Ok);
        assert!(probe(&path).unwrap().has_sequence_header);
    }

    #[test]
    fn test_io_failure_keeps_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("clip.flv");
        let buffer = new_buffer();
        fill(&buffer, 30, 30, true);
        let shared = shared(stream_info());

        let report = save_job(&buffer, &shared, &SaveRequest::new(&path));
        assert!(matches!(
            report.status,
            SaveStatus::Failed {
                code: SaveErrorCode::Io,
                ..
            }
        ));
        assert_eq!(buffer.occupancy().frames, 30);

        // Retry succeeds once the directory exists
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let report = save_job(&buffer, &shared, &SaveRequest::new(&path));
        assert!(report.status.is_ok());
    }

    #[test]
    fn test_existing_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replace.flv");
        fs::write(&path, b"old contents").unwrap();
        let buffer = new_buffer();
        fill(&buffer, 30, 30, true);

        let report = save_job(&buffer, &shared(stream_info()), &SaveRequest::new(&path));
        assert!(report.status.is_ok());
        assert_eq!(probe(&path).unwrap().video_tags, 30);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (mut writer, _reports) = start_writer(new_buffer(), stream_info());
        writer.shutdown();
        writer.shutdown();
        assert_eq!(
            writer.submit(SaveRequest::new("after.flv")),
            SaveResponse::NotRunning
        );
    }
}
