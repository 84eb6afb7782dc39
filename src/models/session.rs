//! Upload sessions: the durable metadata record and the lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, path::Path, str::FromStr};

/// Where an upload session is in its lifecycle.
///
/// `Receiving -> ReassemblyTriggered -> Reassembling -> Complete | Failed`.
/// A `Failed` session keeps its chunks and may be triggered again.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Receiving,
    ReassemblyTriggered,
    Reassembling,
    Complete,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Receiving => "receiving",
            SessionState::ReassemblyTriggered => "reassembly_triggered",
            SessionState::Reassembling => "reassembling",
            SessionState::Complete => "complete",
            SessionState::Failed => "failed",
        }
    }

    /// True while a reassembly owns the session's chunks.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SessionState::ReassemblyTriggered | SessionState::Reassembling
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "receiving" => Ok(SessionState::Receiving),
            "reassembly_triggered" => Ok(SessionState::ReassemblyTriggered),
            "reassembling" => Ok(SessionState::Reassembling),
            "complete" => Ok(SessionState::Complete),
            "failed" => Ok(SessionState::Failed),
            other => Err(format!("unknown session state `{}`", other)),
        }
    }
}

/// Metadata captured from the first chunk (index 0) of a session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SessionMetadata {
    /// File name as supplied by the client, extension included.
    pub original_name: String,

    /// Declared format: the extension with its leading dot (`.mp4`), or empty.
    pub format: String,
}

impl SessionMetadata {
    pub fn from_original_name(original_name: &str) -> Self {
        Self {
            original_name: original_name.to_string(),
            format: extension_of(original_name),
        }
    }
}

/// Persisted row of the `upload_sessions` table.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSessionRecord {
    /// Caller-supplied session identifier.
    pub session_id: String,

    pub original_name: String,

    pub format: String,

    /// Chunk count declared by the client.
    pub total_chunks: i64,

    /// Serialized `SessionState`.
    pub state: String,

    /// Generated name of the reassembled artifact, once complete.
    pub artifact_name: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl UploadSessionRecord {
    pub fn metadata(&self) -> SessionMetadata {
        SessionMetadata {
            original_name: self.original_name.clone(),
            format: self.format.clone(),
        }
    }
}

/// Extension of a client-supplied file name with its leading dot.
pub fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default()
}
