//! Core data models for the upload and transcoding pipeline.
//!
//! Session records map to the `upload_sessions` table via `sqlx::FromRow`;
//! everything else lives in memory and serializes as JSON via `serde`.

pub mod artifact;
pub mod job;
pub mod profile;
pub mod session;
