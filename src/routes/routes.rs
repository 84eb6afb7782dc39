//! Route table for the ingest service.
//!
//! - `POST /upload-chunk` accepts one multipart chunk of an upload session
//! - `GET  /sessions/{session_id}` reports the session lifecycle state
//! - `GET  /jobs/{session_id}` reports the session's transcode jobs
//! - `GET  /videos` lists transcoded renditions grouped by base name
//! - `GET  /videos/{file}` streams one rendition with byte-range support
//! - `GET  /healthz`, `GET /readyz` are the health checks

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{list_jobs, session_status, upload_chunk},
        video_handlers::{list_videos, stream_video},
    },
    services::upload_service::UploadService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router. `max_body_bytes` caps the size of one chunk request.
pub fn routes(max_body_bytes: usize) -> Router<UploadService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/upload-chunk",
            post(upload_chunk).layer(DefaultBodyLimit::max(max_body_bytes)),
        )
        .route("/sessions/{session_id}", get(session_status))
        .route("/jobs/{session_id}", get(list_jobs))
        .route("/videos", get(list_videos))
        .route("/videos/{file}", get(stream_video))
}
