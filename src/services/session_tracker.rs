//! Per-session bookkeeping for chunked uploads.
//!
//! The tracker owns an in-memory map of session entries, each behind its own
//! lock, so decisions for one session never wait on another. Session metadata
//! captured from chunk 0 is also persisted to the `upload_sessions` table.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::error::{UploadError, UploadResult};
use crate::models::session::{SessionMetadata, SessionState, UploadSessionRecord};

/// What to do with an incoming chunk before it is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Store the chunk.
    Accept,
    /// A reassembly currently owns the session's storage.
    Busy,
    /// The session already produced an artifact.
    AlreadyComplete { artifact_name: Option<String> },
}

/// Outcome of recording a stored chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkDecision {
    /// More chunks are expected.
    Continue,
    /// This caller won the trigger and must run the reassembly.
    Reassemble,
    /// Another caller is already reassembling.
    Busy,
    AlreadyComplete { artifact_name: Option<String> },
}

/// Externally visible view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub state: SessionState,
    pub total_chunks: Option<u32>,
    pub received_chunks: Vec<u32>,
    pub original_name: Option<String>,
    pub format: Option<String>,
    pub artifact_name: Option<String>,
}

#[derive(Debug)]
struct SessionEntry {
    loaded: bool,
    state: SessionState,
    total_chunks: Option<u32>,
    received: BTreeSet<u32>,
    /// Set once the declared-last chunk has arrived.
    last_chunk_seen: bool,
    metadata: Option<SessionMetadata>,
    artifact_name: Option<String>,
    last_activity: DateTime<Utc>,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            loaded: false,
            state: SessionState::Receiving,
            total_chunks: None,
            received: BTreeSet::new(),
            last_chunk_seen: false,
            metadata: None,
            artifact_name: None,
            last_activity: Utc::now(),
        }
    }
}

#[derive(Debug)]
pub struct SessionTracker {
    db: Arc<SqlitePool>,
    sessions: Mutex<HashMap<String, Arc<Mutex<SessionEntry>>>>,
}

impl SessionTracker {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self {
            db,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the entry for a session. The map lock is held only for
    /// the lookup; loading persisted state happens under the entry lock.
    async fn entry(&self, session_id: &str) -> Arc<Mutex<SessionEntry>> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionEntry::new())))
            .clone()
    }

    async fn fetch_record(&self, session_id: &str) -> UploadResult<Option<UploadSessionRecord>> {
        let record = sqlx::query_as::<_, UploadSessionRecord>(
            "SELECT session_id, original_name, format, total_chunks, state,
                    artifact_name, created_at, updated_at
             FROM upload_sessions WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }

    /// Populate a fresh entry from the database, if a record exists.
    async fn load(&self, session_id: &str, entry: &mut SessionEntry) -> UploadResult<()> {
        if entry.loaded {
            return Ok(());
        }
        if let Some(record) = self.fetch_record(session_id).await? {
            let state = record
                .state
                .parse::<SessionState>()
                .unwrap_or(SessionState::Failed);
            // A reassembly interrupted by a restart left nothing usable behind.
            // The status query without a tracked entry reports it the same way.
            entry.state = if state.is_busy() {
                SessionState::Failed
            } else {
                state
            };
            // Only the declared-last chunk moves a session past Receiving.
            entry.last_chunk_seen = state == SessionState::Failed || state.is_busy();
            entry.total_chunks = u32::try_from(record.total_chunks).ok();
            entry.metadata = Some(record.metadata());
            entry.artifact_name = record.artifact_name;
        }
        entry.loaded = true;
        Ok(())
    }

    async fn persist_state(
        &self,
        session_id: &str,
        state: SessionState,
        artifact_name: Option<&str>,
    ) -> UploadResult<()> {
        sqlx::query(
            "UPDATE upload_sessions
             SET state = ?, artifact_name = COALESCE(?, artifact_name), updated_at = ?
             WHERE session_id = ?",
        )
        .bind(state.as_str())
        .bind(artifact_name)
        .bind(Utc::now())
        .bind(session_id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Decide whether a chunk may be written, and pin the declared total.
    ///
    /// A chunk declaring a different total than the first one seen is rejected.
    pub async fn admit(&self, session_id: &str, total_chunks: u32) -> UploadResult<Admission> {
        let entry = self.entry(session_id).await;
        let mut entry = entry.lock().await;
        self.load(session_id, &mut entry).await?;
        entry.last_activity = Utc::now();

        match entry.state {
            SessionState::Complete => {
                return Ok(Admission::AlreadyComplete {
                    artifact_name: entry.artifact_name.clone(),
                });
            }
            state if state.is_busy() => return Ok(Admission::Busy),
            _ => {}
        }

        match entry.total_chunks {
            Some(declared) if declared != total_chunks => Err(UploadError::Validation(format!(
                "totalChunks {} does not match {} declared earlier for this session",
                total_chunks, declared
            ))),
            _ => {
                entry.total_chunks = Some(total_chunks);
                Ok(Admission::Accept)
            }
        }
    }

    /// Record metadata delivered with chunk 0.
    ///
    /// The first capture wins. A repeat with identical values is a no-op; a
    /// repeat with different values is a `MetadataConflict`.
    pub async fn capture_metadata(
        &self,
        session_id: &str,
        metadata: &SessionMetadata,
        total_chunks: u32,
    ) -> UploadResult<()> {
        let entry = self.entry(session_id).await;
        let mut entry = entry.lock().await;
        self.load(session_id, &mut entry).await?;

        if let Some(existing) = &entry.metadata {
            return check_same_metadata(session_id, existing, metadata);
        }

        let now = Utc::now();
        sqlx::query(
            "INSERT INTO upload_sessions
                (session_id, original_name, format, total_chunks, state, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id) DO NOTHING",
        )
        .bind(session_id)
        .bind(&metadata.original_name)
        .bind(&metadata.format)
        .bind(i64::from(total_chunks))
        .bind(entry.state.as_str())
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await?;

        let stored = self
            .fetch_record(session_id)
            .await?
            .map(|record| record.metadata())
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;
        check_same_metadata(session_id, &stored, metadata)?;

        info!(
            session_id,
            original_name = %metadata.original_name,
            format = %metadata.format,
            "captured session metadata"
        );
        entry.metadata = Some(stored);
        Ok(())
    }

    /// Record that `index` is stored and decide whether to reassemble.
    ///
    /// The trigger is check-and-set under the session lock, so at most one
    /// caller ever receives `Reassemble` for a given attempt.
    pub async fn record_chunk(&self, session_id: &str, index: u32) -> UploadResult<ChunkDecision> {
        let entry = self.entry(session_id).await;
        let mut entry = entry.lock().await;
        self.load(session_id, &mut entry).await?;
        entry.last_activity = Utc::now();

        match entry.state {
            SessionState::Complete => {
                return Ok(ChunkDecision::AlreadyComplete {
                    artifact_name: entry.artifact_name.clone(),
                });
            }
            state if state.is_busy() => return Ok(ChunkDecision::Busy),
            _ => {}
        }

        entry.received.insert(index);
        let total = entry.total_chunks.unwrap_or(0);
        let is_declared_last = total > 0 && index == total - 1;
        if is_declared_last {
            entry.last_chunk_seen = true;
        }

        let retry_after_failure = entry.state == SessionState::Failed && entry.last_chunk_seen;
        if is_declared_last || retry_after_failure {
            self.persist_state(session_id, SessionState::ReassemblyTriggered, None)
                .await?;
            entry.state = SessionState::ReassemblyTriggered;
            return Ok(ChunkDecision::Reassemble);
        }

        Ok(ChunkDecision::Continue)
    }

    pub async fn begin_reassembly(&self, session_id: &str) -> UploadResult<()> {
        self.transition(session_id, SessionState::Reassembling, None)
            .await
    }

    pub async fn complete(&self, session_id: &str, artifact_name: &str) -> UploadResult<()> {
        self.transition(session_id, SessionState::Complete, Some(artifact_name))
            .await
    }

    /// Mark the attempt failed; chunks stay on disk for a later retry.
    pub async fn fail(&self, session_id: &str) -> UploadResult<()> {
        self.transition(session_id, SessionState::Failed, None)
            .await
    }

    async fn transition(
        &self,
        session_id: &str,
        state: SessionState,
        artifact_name: Option<&str>,
    ) -> UploadResult<()> {
        let entry = self.entry(session_id).await;
        let mut entry = entry.lock().await;
        let persisted = self.persist_state(session_id, state, artifact_name).await;

        // Terminal states apply in memory even when the row could not be written.
        let terminal = matches!(state, SessionState::Complete | SessionState::Failed);
        if persisted.is_ok() || terminal {
            entry.state = state;
            entry.last_activity = Utc::now();
            if let Some(name) = artifact_name {
                entry.artifact_name = Some(name.to_string());
                entry.received.clear();
            }
        }
        if let Err(err) = persisted {
            warn!(session_id, %state, "failed to persist session state: {}", err);
            return Err(err);
        }
        Ok(())
    }

    /// Current view of a session, from memory or the database.
    pub async fn status(&self, session_id: &str) -> UploadResult<Option<SessionStatus>> {
        let tracked = {
            let sessions = self.sessions.lock().await;
            sessions.get(session_id).cloned()
        };

        if let Some(entry) = tracked {
            let mut entry = entry.lock().await;
            self.load(session_id, &mut entry).await?;
            return Ok(Some(SessionStatus {
                session_id: session_id.to_string(),
                state: entry.state,
                total_chunks: entry.total_chunks,
                received_chunks: entry.received.iter().copied().collect(),
                original_name: entry.metadata.as_ref().map(|m| m.original_name.clone()),
                format: entry.metadata.as_ref().map(|m| m.format.clone()),
                artifact_name: entry.artifact_name.clone(),
            }));
        }

        Ok(self.fetch_record(session_id).await?.map(|record| {
            let state = record
                .state
                .parse::<SessionState>()
                .ok()
                .filter(|state| !state.is_busy())
                .unwrap_or(SessionState::Failed);
            SessionStatus {
                session_id: record.session_id,
                state,
                total_chunks: u32::try_from(record.total_chunks).ok(),
                received_chunks: Vec::new(),
                original_name: Some(record.original_name),
                format: Some(record.format),
                artifact_name: record.artifact_name,
            }
        }))
    }

    pub async fn is_tracked(&self, session_id: &str) -> bool {
        self.sessions.lock().await.contains_key(session_id)
    }

    /// Sessions idle for longer than `ttl` that no reassembly is using.
    pub async fn idle_sessions(&self, ttl: Duration) -> Vec<String> {
        let Some(cutoff) = Utc::now().checked_sub_signed(ttl) else {
            return Vec::new();
        };
        let entries: Vec<(String, Arc<Mutex<SessionEntry>>)> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect()
        };

        let mut idle = Vec::new();
        for (session_id, entry) in entries {
            let entry = entry.lock().await;
            if entry.last_activity <= cutoff && !entry.state.is_busy() {
                idle.push(session_id);
            }
        }
        idle
    }

    /// Drop a session from memory. The persisted record is kept.
    pub async fn forget(&self, session_id: &str) {
        self.sessions.lock().await.remove(session_id);
    }
}

fn check_same_metadata(
    session_id: &str,
    existing: &SessionMetadata,
    incoming: &SessionMetadata,
) -> UploadResult<()> {
    if existing == incoming {
        return Ok(());
    }
    warn!(
        session_id,
        existing = %existing.original_name,
        incoming = %incoming.original_name,
        "conflicting metadata for session"
    );
    Err(UploadError::MetadataConflict {
        session_id: session_id.to_string(),
        reason: format!(
            "already captured `{}` ({}), got `{}` ({})",
            existing.original_name, existing.format, incoming.original_name, incoming.format
        ),
    })
}
