//! HTTP handlers for chunked uploads and their follow-up queries.
//! Parsing and validation of the multipart form happens here; the pipeline
//! itself lives in `UploadService`.

use crate::{
    errors::AppError,
    models::job::TranscodeJob,
    services::{
        session_tracker::SessionStatus,
        upload_service::{ChunkOutcome, ChunkUpload, UploadService},
    },
};
use axum::{
    Json,
    extract::{Multipart, Path, State, multipart::MultipartError},
};
use bytes::Bytes;
use serde::Serialize;

/// Body of a successful `POST /upload-chunk`.
#[derive(Debug, Serialize)]
pub struct ChunkResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub session_id: String,
    pub chunk_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

/// Raw multipart fields as received.
#[derive(Debug, Default)]
struct ChunkForm {
    chunk: Option<Bytes>,
    chunk_index: Option<String>,
    total_chunks: Option<String>,
    unique_id: Option<String>,
    original_name: Option<String>,
}

impl ChunkForm {
    fn into_upload(self) -> Result<ChunkUpload, AppError> {
        let (Some(chunk_index), Some(total_chunks), Some(session_id), Some(original_name)) = (
            non_empty(self.chunk_index),
            non_empty(self.total_chunks),
            non_empty(self.unique_id),
            non_empty(self.original_name),
        ) else {
            return Err(AppError::bad_request(
                "Missing required metadata in request body",
            ));
        };
        let data = self
            .chunk
            .ok_or_else(|| AppError::bad_request("No chunk uploaded"))?;

        let chunk_index = chunk_index.trim().parse::<u32>().map_err(|_| {
            AppError::bad_request(format!(
                "chunkIndex must be a non-negative integer, got `{}`",
                chunk_index
            ))
        })?;
        let total_chunks = total_chunks
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                AppError::bad_request(format!(
                    "totalChunks must be a positive integer, got `{}`",
                    total_chunks
                ))
            })?;

        Ok(ChunkUpload {
            session_id,
            chunk_index,
            total_chunks,
            original_name,
            data,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn multipart_error(err: MultipartError) -> AppError {
    AppError::new(err.status(), err.body_text())
}

/// `POST /upload-chunk`: store one chunk of a session.
///
/// Expects a multipart body with a `chunk` file part and the text fields
/// `chunkIndex`, `totalChunks`, `uniqueId` and `originalName`.
pub async fn upload_chunk(
    State(service): State<UploadService>,
    mut multipart: Multipart,
) -> Result<Json<ChunkResponse>, AppError> {
    let mut form = ChunkForm::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "chunk" => form.chunk = Some(field.bytes().await.map_err(multipart_error)?),
            "chunkIndex" => form.chunk_index = Some(field.text().await.map_err(multipart_error)?),
            "totalChunks" => {
                form.total_chunks = Some(field.text().await.map_err(multipart_error)?)
            }
            "uniqueId" => form.unique_id = Some(field.text().await.map_err(multipart_error)?),
            "originalName" => {
                form.original_name = Some(field.text().await.map_err(multipart_error)?)
            }
            other => tracing::debug!("ignoring multipart field `{}`", other),
        }
    }

    let upload = form.into_upload()?;
    let session_id = upload.session_id.clone();
    let chunk_index = upload.chunk_index;

    let outcome = service.accept_chunk(upload).await?;

    let (status, message, artifact) = match outcome {
        ChunkOutcome::Accepted => ("chunk accepted", "Chunk uploaded successfully.", None),
        ChunkOutcome::Reassembling => (
            "reassembling",
            "Chunk received; the upload is being reassembled.",
            None,
        ),
        ChunkOutcome::Complete { artifact_name } => {
            ("upload complete", "File upload complete.", artifact_name)
        }
    };

    Ok(Json(ChunkResponse {
        status,
        message,
        session_id,
        chunk_index,
        artifact,
    }))
}

/// `GET /sessions/{session_id}`: lifecycle state of an upload session.
pub async fn session_status(
    State(service): State<UploadService>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStatus>, AppError> {
    Ok(Json(service.session_status(&session_id).await?))
}

/// `GET /jobs/{session_id}`: transcode jobs started for a session.
pub async fn list_jobs(
    State(service): State<UploadService>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<TranscodeJob>>, AppError> {
    let jobs = service.transcode_jobs(&session_id).await;
    if jobs.is_empty() {
        return Err(AppError::not_found(format!(
            "no transcode jobs for session `{}`",
            session_id
        )));
    }
    Ok(Json(jobs))
}
