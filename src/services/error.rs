use std::io;
use thiserror::Error;

/// Failures on the upload and reassembly path.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid upload request: {0}")]
    Validation(String),
    #[error("session `{session_id}` metadata conflict: {reason}")]
    MetadataConflict { session_id: String, reason: String },
    #[error("chunk {index} of session `{session_id}` not found")]
    ChunkNotFound { session_id: String, index: u32 },
    #[error("session `{session_id}` is missing chunk {index}")]
    MissingChunk { session_id: String, index: u32 },
    #[error("session `{0}` not found")]
    SessionNotFound(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;
