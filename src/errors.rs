use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::error;

use crate::services::error::UploadError;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match &err {
            UploadError::Validation(_) => AppError::bad_request(err.to_string()),
            UploadError::MetadataConflict { .. } | UploadError::MissingChunk { .. } => {
                AppError::new(StatusCode::CONFLICT, err.to_string())
            }
            UploadError::ChunkNotFound { .. } | UploadError::SessionNotFound(_) => {
                AppError::not_found(err.to_string())
            }
            UploadError::Sqlx(_) | UploadError::Io(_) => {
                // Storage details stay in the log; the client may retry the chunk.
                error!("storage failure: {}", err);
                AppError::internal("Error uploading chunk.")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn upload_errors_map_to_statuses() {
        let cases = [
            (UploadError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (
                UploadError::MissingChunk {
                    session_id: "s".into(),
                    index: 2,
                },
                StatusCode::CONFLICT,
            ),
            (
                UploadError::MetadataConflict {
                    session_id: "s".into(),
                    reason: "r".into(),
                },
                StatusCode::CONFLICT,
            ),
            (UploadError::SessionNotFound("s".into()), StatusCode::NOT_FOUND),
            (
                UploadError::Io(io::Error::other("disk full")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn missing_chunk_message_names_the_index() {
        let err = AppError::from(UploadError::MissingChunk {
            session_id: "abc123".into(),
            index: 4,
        });
        assert_eq!(err.message, "session `abc123` is missing chunk 4");
    }
}
