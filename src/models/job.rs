//! Transcode jobs and their outcomes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use uuid::Uuid;

/// Per-job lifecycle: `Queued -> Running -> Succeeded | Failed`.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

/// Status snapshot of one (artifact, profile) job.
#[derive(Serialize, Clone, Debug)]
pub struct TranscodeJob {
    pub id: Uuid,
    pub session_id: String,
    pub profile: String,
    #[serde(skip)]
    pub input_path: PathBuf,
    /// File name of the rendition inside the transcoded directory.
    pub output_name: String,
    pub state: JobState,
    pub error: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Final result of one job, as delivered to the completion channel.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub session_id: String,
    pub profile: String,
    /// Output path on success, the engine's error message on failure.
    pub result: Result<PathBuf, String>,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}
