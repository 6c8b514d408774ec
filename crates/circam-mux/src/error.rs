//! Error types for the mux module.

use circam_ipc::{SaveErrorCode, SaveStatus};
use thiserror::Error;

/// Errors that can occur while writing or reading container files.
#[derive(Debug, Error)]
pub enum MuxError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The frames cannot form a playable segment.
    #[error("Invalid stream: {0}")]
    InvalidStream(String),

    /// Neither the stream nor the encoder provided SPS/PPS.
    #[error("No SPS/PPS available")]
    MissingParameterSets,

    /// The save was canceled before completion.
    #[error("Save canceled")]
    Canceled,

    /// A file being read back is not valid FLV.
    #[error("Invalid FLV file: {0}")]
    InvalidFile(String),

    /// Writer thread could not be spawned or reached.
    #[error("Writer thread error: {0}")]
    Thread(String),
}

impl MuxError {
    /// Status reported for a save that ended with this error.
    pub fn save_status(&self) -> SaveStatus {
        let code = match self {
            Self::Canceled => return SaveStatus::Canceled,
            Self::Io(_) | Self::Thread(_) => SaveErrorCode::Io,
            Self::InvalidStream(_) | Self::InvalidFile(_) => SaveErrorCode::InvalidStream,
            Self::MissingParameterSets => SaveErrorCode::MissingParameterSets,
        };
        SaveStatus::Failed {
            code,
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_status_mapping() {
        assert_eq!(MuxError::Canceled.save_status(), SaveStatus::Canceled);
        assert!(matches!(
            MuxError::MissingParameterSets.save_status(),
            SaveStatus::Failed {
                code: SaveErrorCode::MissingParameterSets,
                ..
            }
        ));
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        match MuxError::from(io).save_status() {
            SaveStatus::Failed { code, message } => {
                assert_eq!(code, SaveErrorCode::Io);
                assert!(message.contains("denied"));
            }
            other => panic!("unexpected status {other:?}"),
        }
    }
}
