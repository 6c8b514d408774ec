//! Container output for circam.
//!
//! H.264 NAL utilities, an FLV writer and prober, and the [`SegmentWriter`]
//! that turns a buffer snapshot into a file on request.

mod error;
pub mod flv;
pub mod nal;
mod writer;

pub use error::MuxError;
pub use flv::{probe, FlvMetadata, FlvSummary, FlvWriter};
pub use nal::{access_unit_to_avcc, contains_idr, parse_annex_b, NalUnit, NalUnitType, ParameterSets};
pub use writer::{CompletionCallback, SaveRequest, SegmentWriter, StreamInfo};

/// Result type for mux operations.
pub type MuxResult<T> = Result<T, MuxError>;

/// Pending save jobs. One in flight, so one slot is enough.
pub const JOB_CHANNEL_CAPACITY: usize = 1;

/// Suffix of the file written before the final rename.
pub const PARTIAL_SUFFIX: &str = "part";
