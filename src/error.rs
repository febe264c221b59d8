use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;
use transcoding::TranscodeError;

use crate::jobs::QueueError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("{message}")]
    Conversion {
        message: String,
        details: Option<String>,
    },

    #[error("Job store unavailable")]
    Queue(#[from] QueueError),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Malformed multipart body: {0}")]
    Multipart(#[from] actix_multipart::MultipartError),
}

impl WorkerError {
    /// Maps a conversion failure to its HTTP shape. Codec errors are always
    /// logged; their text reaches the caller only when `expose_details` is set.
    pub fn from_transcode(err: TranscodeError, expose_details: bool) -> Self {
        if err.is_client_error() {
            return Self::InvalidInput(err.to_string());
        }

        log::error!("Conversion error: {}", err);
        Self::Conversion {
            message: "Conversion failed".to_string(),
            details: expose_details.then(|| err.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ResponseError for WorkerError {
    fn error_response(&self) -> HttpResponse {
        if let Self::Queue(err) = self {
            log::error!("Job store error: {}", err);
        }

        let mut status = match self {
            Self::InvalidInput(_) | Self::Multipart(_) => HttpResponse::BadRequest(),
            Self::Unauthorized => HttpResponse::Unauthorized(),
            Self::NotFound(_) => HttpResponse::NotFound(),
            Self::Conversion { .. } | Self::Queue(_) | Self::Internal(_) => {
                HttpResponse::InternalServerError()
            }
        };

        let details = match self {
            Self::Conversion { details, .. } => details.clone(),
            _ => None,
        };

        status.json(ErrorBody {
            error: self.to_string(),
            details,
        })
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let error = WorkerError::InvalidInput("No file uploaded".to_string());
        assert_eq!(error.to_string(), "No file uploaded");
        assert_eq!(WorkerError::Unauthorized.to_string(), "Unauthorized");
    }

    #[test]
    fn test_error_response_status_codes() {
        assert_eq!(
            WorkerError::InvalidInput("bad".to_string()).error_response().status(),
            400
        );
        assert_eq!(WorkerError::Unauthorized.error_response().status(), 401);
        assert_eq!(
            WorkerError::NotFound("Job not found".to_string()).error_response().status(),
            404
        );
        assert_eq!(
            WorkerError::Internal("boom".to_string()).error_response().status(),
            500
        );
        assert_eq!(
            WorkerError::Queue(QueueError::Task("worker thread panicked".to_string()))
                .error_response()
                .status(),
            500
        );
    }

    #[test]
    fn test_job_store_errors_are_not_leaked() {
        let error = WorkerError::from(QueueError::Task("disk I/O error at /var/lib/jobs.db".to_string()));
        assert_eq!(error.to_string(), "Job store unavailable");
    }

    #[test]
    fn test_client_transcode_errors_become_bad_request() {
        let error = WorkerError::from_transcode(TranscodeError::UnrecognizedFormat, true);
        assert!(matches!(error, WorkerError::InvalidInput(_)));
        assert_eq!(error.error_response().status(), 400);
    }

    #[test]
    fn test_codec_error_details_follow_environment() {
        let failure = || TranscodeError::Timeout(Duration::from_secs(60));

        match WorkerError::from_transcode(failure(), true) {
            WorkerError::Conversion { message, details } => {
                assert_eq!(message, "Conversion failed");
                assert_eq!(details.as_deref(), Some("Transcoding timed out after 60s"));
            }
            other => panic!("Expected Conversion, got {:?}", other),
        }

        match WorkerError::from_transcode(failure(), false) {
            WorkerError::Conversion { details, .. } => assert!(details.is_none()),
            other => panic!("Expected Conversion, got {:?}", other),
        }
    }

    #[test]
    fn test_error_body_omits_absent_details() {
        let body = serde_json::to_string(&ErrorBody {
            error: "Unauthorized".to_string(),
            details: None,
        })
        .unwrap();
        assert_eq!(body, r#"{"error":"Unauthorized"}"#);
    }
}
