//! 统一的错误类型：上传引擎错误分类与 API 响应转换。

use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::io::{self, ErrorKind};

use crate::config::{BUSY_RETRY_AFTER_SECS, UPLOAD_OFFSET_HEADER};
use crate::journal::{FileState, JournalError};
use crate::storage::StorageError;
use crate::upload::ResumeState;

/// Error taxonomy of the upload engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Unreadable journal version or header; needs manual intervention.
    Format,
    /// Journal and data file disagree.
    Corruption,
    /// Read, write or close failures.
    Io,
    /// Offset or length disagreements with the client.
    Protocol,
    /// Refusals such as completed or busy files.
    Policy,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("file already complete")]
    AlreadyComplete,
    #[error("file already complete but its journal still exists")]
    AlreadyCompleteButJournalExists,
    #[error("upload forbidden: {reason}")]
    Forbidden {
        reason: &'static str,
        #[source]
        source: Option<JournalError>,
    },
    #[error("in-progress file is inconsistent with its journal")]
    Corrupted(#[source] Option<JournalError>),
    /// The data file is shorter than the journal claims. Telling which bytes
    /// are still good would need a content comparison, so this is a refusal.
    #[error("in-progress file is shorter than its journal")]
    ActualFileNeedsRepair,
    #[error("file is busy")]
    Busy,
    #[error("failed to read request body")]
    ConnectionRead(#[source] io::Error),
    #[error("request body is longer than announced")]
    BodyTooLong,
    #[error("upload exceeds size limit of {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("failed to write upload data")]
    Write(#[source] io::Error),
    #[error("failed to close upload files")]
    Close(#[source] io::Error),
    #[error("committed {committed} of {expected} bytes")]
    ShortWrite { expected: u64, committed: u64 },
    #[error("content hash mismatch")]
    HashMismatch,
    #[error("upload offset {requested} does not match server offset {expected}")]
    OffsetMismatch { requested: u64, expected: u64 },
    #[error("content length required")]
    LengthRequired,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl UploadError {
    pub fn class(&self) -> ErrorClass {
        match self {
            UploadError::AlreadyComplete
            | UploadError::AlreadyCompleteButJournalExists
            | UploadError::Busy
            | UploadError::TooLarge { .. } => ErrorClass::Policy,
            UploadError::Forbidden { source, .. } => match source {
                Some(JournalError::UnsupportedVersion(_) | JournalError::HeaderRead(_)) => {
                    ErrorClass::Format
                }
                Some(JournalError::Reading(_)) => ErrorClass::Io,
                Some(JournalError::Corrupted { .. }) => ErrorClass::Corruption,
                None => ErrorClass::Policy,
            },
            UploadError::Corrupted(_) | UploadError::ActualFileNeedsRepair => {
                ErrorClass::Corruption
            }
            UploadError::ConnectionRead(_)
            | UploadError::Write(_)
            | UploadError::Close(_)
            | UploadError::Io(_) => ErrorClass::Io,
            UploadError::BodyTooLong
            | UploadError::ShortWrite { .. }
            | UploadError::HashMismatch
            | UploadError::OffsetMismatch { .. }
            | UploadError::LengthRequired => ErrorClass::Protocol,
        }
    }

    /// Whether the client may retry from the reported offset without any
    /// outside change.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Io | ErrorClass::Protocol)
            && !matches!(self, UploadError::HashMismatch)
    }

    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::AlreadyComplete | UploadError::AlreadyCompleteButJournalExists => {
                StatusCode::CONFLICT
            }
            UploadError::Forbidden { .. }
            | UploadError::Corrupted(_)
            | UploadError::ActualFileNeedsRepair => StatusCode::FORBIDDEN,
            UploadError::Busy => StatusCode::LOCKED,
            UploadError::BodyTooLong | UploadError::TooLarge { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            UploadError::HashMismatch => StatusCode::UNPROCESSABLE_ENTITY,
            UploadError::LengthRequired => StatusCode::LENGTH_REQUIRED,
            UploadError::ConnectionRead(_)
            | UploadError::Write(_)
            | UploadError::Close(_)
            | UploadError::ShortWrite { .. }
            | UploadError::OffsetMismatch { .. } => StatusCode::CONFLICT,
            UploadError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
    Unauthorized(HeaderMap),
    /// Upload refusal or failure, with the authoritative state when known.
    Upload(UploadError, Option<FileState>),
}

impl ApiError {
    pub fn upload(error: UploadError, state: FileState) -> Self {
        ApiError::Upload(error, Some(state))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
            ApiError::Unauthorized(headers) => {
                (StatusCode::UNAUTHORIZED, headers, "unauthorized").into_response()
            }
            ApiError::Upload(error, state) => {
                let status = error.status();
                let mut headers = HeaderMap::new();
                if matches!(error, UploadError::Busy)
                    && let Ok(value) = HeaderValue::from_str(&BUSY_RETRY_AFTER_SECS.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                let Some(state) = state else {
                    return (status, headers, error.to_string()).into_response();
                };
                if let Ok(value) = HeaderValue::from_str(&state.start_offset.to_string()) {
                    headers.insert(UPLOAD_OFFSET_HEADER, value);
                }
                let body = ResumeState::from(state).with_error(&error);
                (status, headers, Json(body)).into_response()
            }
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        ApiError::Upload(error, None)
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => ApiError::BadRequest("invalid path".into()),
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound(err.to_string()),
                _ => ApiError::Internal(err.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Corruption;
    use axum::body::to_bytes;

    #[test]
    fn classes_follow_taxonomy() {
        let format = UploadError::Forbidden {
            reason: "journal unreadable",
            source: Some(JournalError::UnsupportedVersion(9)),
        };
        assert_eq!(format.class(), ErrorClass::Format);
        assert!(!format.is_retryable());

        let corrupted = UploadError::Corrupted(Some(JournalError::Corrupted {
            kind: Corruption::OutOfOrder,
            at: 32,
        }));
        assert_eq!(corrupted.class(), ErrorClass::Corruption);

        let short = UploadError::ShortWrite {
            expected: 10,
            committed: 4,
        };
        assert!(short.is_retryable());
        assert!(UploadError::Close(io::Error::other("flush")).is_retryable());
        assert!(!UploadError::Busy.is_retryable());
        assert!(!UploadError::HashMismatch.is_retryable());
    }

    #[tokio::test]
    async fn upload_error_response_carries_resume_state() {
        let state = FileState {
            file_size: 1000,
            content_hash: None,
            start_offset: 400,
        };
        let response = ApiError::upload(
            UploadError::ShortWrite {
                expected: 600,
                committed: 100,
            },
            state,
        )
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response
                .headers()
                .get(UPLOAD_OFFSET_HEADER)
                .and_then(|v| v.to_str().ok()),
            Some("400")
        );
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["startOffset"], 400);
        assert_eq!(json["count"], 600);
        assert_eq!(json["fileSize"], 1000);
    }

    #[test]
    fn busy_response_sets_retry_after() {
        let response = ApiError::from(UploadError::Busy).into_response();
        assert_eq!(response.status(), StatusCode::LOCKED);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
    }
}
