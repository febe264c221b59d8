use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("Empty file provided")]
    EmptyInput,

    #[error("Quality must be between 1 and 100, got {0}")]
    QualityOutOfRange(i64),

    #[error("Unsupported file type")]
    UnrecognizedFormat,

    #[error("Unprocessable input: {0}")]
    Unprocessable(String),

    #[error("Encoding error: {0}")]
    Encode(String),

    #[error("Transcoding failed ({status}): {stderr}")]
    TranscodeFailed { status: String, stderr: String },

    #[error("Transcoding timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TranscodeError {
    /// Whether the caller is at fault (bad upload or parameters) rather than the codec.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::EmptyInput | Self::QualityOutOfRange(_) | Self::UnrecognizedFormat
        )
    }
}

impl From<image::ImageError> for TranscodeError {
    fn from(err: image::ImageError) -> Self {
        TranscodeError::Unprocessable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TranscodeError>;
