//! src/services/upload_service.rs
//!
//! UploadService: the chunk-upload pipeline. A chunk is admitted by the
//! session tracker, written to the chunk store, recorded, and, when it wins
//! the completion trigger, reassembled into an artifact that is then handed to
//! the transcode orchestrator in the background.

use bytes::Bytes;
use serde::Serialize;
use sqlx::SqlitePool;
use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use super::{
    chunk_store::ChunkStore,
    error::{UploadError, UploadResult},
    reassembler::Reassembler,
    session_tracker::{Admission, ChunkDecision, SessionStatus, SessionTracker},
    transcoder::{TranscodeEngine, TranscodeOrchestrator},
};
use crate::{
    config::AppConfig,
    models::{
        artifact::FinalArtifact,
        job::{JobOutcome, TranscodeJob},
        profile::ResolutionProfile,
        session::{SessionMetadata, SessionState},
    },
};

/// One validated chunk upload request.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub session_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// Client file name, extension included.
    pub original_name: String,
    pub data: Bytes,
}

/// What happened to an accepted chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChunkOutcome {
    /// Stored; more chunks are expected.
    Accepted,
    /// Another request is reassembling this session.
    Reassembling,
    /// The artifact exists.
    Complete { artifact_name: Option<String> },
}

#[derive(Clone)]
pub struct UploadService {
    /// Shared SQLite pool holding session records.
    pub db: Arc<SqlitePool>,

    pub chunks: ChunkStore,

    pub tracker: Arc<SessionTracker>,

    reassembler: Reassembler,

    pub transcoder: TranscodeOrchestrator,

    profiles: Arc<Vec<ResolutionProfile>>,

    /// Directory holding transcoded renditions.
    pub transcoded_dir: PathBuf,
}

impl UploadService {
    /// Build the pipeline from config. The returned receiver yields one
    /// `JobOutcome` per finished transcode job.
    pub fn new(
        config: &AppConfig,
        db: Arc<SqlitePool>,
        engine: Arc<dyn TranscodeEngine>,
    ) -> (Self, mpsc::UnboundedReceiver<JobOutcome>) {
        let chunks = ChunkStore::new(&config.chunk_dir);
        let reassembler = Reassembler::new(chunks.clone(), &config.final_dir);
        let (transcoder, outcomes) = TranscodeOrchestrator::new(engine, &config.transcoded_dir);

        let service = Self {
            tracker: Arc::new(SessionTracker::new(db.clone())),
            db,
            chunks,
            reassembler,
            transcoder,
            profiles: Arc::new(ResolutionProfile::standard_set()),
            transcoded_dir: config.transcoded_dir.clone(),
        };
        (service, outcomes)
    }

    fn validate(upload: &ChunkUpload) -> UploadResult<()> {
        ChunkStore::ensure_session_id_safe(&upload.session_id)?;
        if upload.total_chunks == 0 {
            return Err(UploadError::Validation(
                "totalChunks must be a positive integer".into(),
            ));
        }
        if upload.chunk_index >= upload.total_chunks {
            return Err(UploadError::Validation(format!(
                "chunkIndex {} is out of range for totalChunks {}",
                upload.chunk_index, upload.total_chunks
            )));
        }
        if upload.original_name.trim().is_empty() {
            return Err(UploadError::Validation("originalName must not be empty".into()));
        }
        Ok(())
    }

    /// Accept one chunk. Reassembles the session when this chunk completes it.
    ///
    /// Chunk writes for the same session run concurrently; only metadata
    /// capture and the completion decision are serialized per session.
    pub async fn accept_chunk(&self, upload: ChunkUpload) -> UploadResult<ChunkOutcome> {
        Self::validate(&upload)?;
        let session_id = upload.session_id.as_str();
        let index = upload.chunk_index;

        match self.tracker.admit(session_id, upload.total_chunks).await? {
            Admission::Accept => {}
            Admission::Busy => return Ok(ChunkOutcome::Reassembling),
            Admission::AlreadyComplete { artifact_name } => {
                debug!(session_id, chunk_index = index, "chunk for completed session ignored");
                return Ok(ChunkOutcome::Complete { artifact_name });
            }
        }

        // Chunk 0 carries the session metadata; a conflicting retry must not
        // reach the disk.
        if index == 0 {
            let metadata = SessionMetadata::from_original_name(&upload.original_name);
            self.tracker
                .capture_metadata(session_id, &metadata, upload.total_chunks)
                .await?;
        }

        if let Err(err) = self.chunks.put(session_id, index, &upload.data).await {
            // A concurrent reassembly may have removed the directory mid-write.
            if let Some(outcome) = self.settled_outcome(session_id).await {
                return Ok(outcome);
            }
            return Err(err);
        }

        match self.tracker.record_chunk(session_id, index).await? {
            ChunkDecision::Continue => Ok(ChunkOutcome::Accepted),
            ChunkDecision::Busy => Ok(ChunkOutcome::Reassembling),
            ChunkDecision::AlreadyComplete { artifact_name } => {
                // The write landed after reassembly removed the session directory.
                if let Err(err) = self.chunks.remove_session(session_id).await {
                    warn!(session_id, "could not drop late chunk: {}", err);
                }
                Ok(ChunkOutcome::Complete { artifact_name })
            }
            ChunkDecision::Reassemble => {
                match self
                    .finish_upload(session_id, upload.total_chunks, &upload.original_name)
                    .await
                {
                    Ok(artifact) => Ok(ChunkOutcome::Complete {
                        artifact_name: Some(artifact.file_name),
                    }),
                    // The chunk itself is stored; the gap is filled by a later upload.
                    Err(UploadError::MissingChunk { index: missing, .. }) => {
                        info!(
                            session_id,
                            chunk_index = index,
                            missing_chunk = missing,
                            "declared-last chunk stored, waiting for earlier chunks"
                        );
                        Ok(ChunkOutcome::Accepted)
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// The outcome to report if the session was completed or taken over by a
    /// reassembly since this request was admitted.
    async fn settled_outcome(&self, session_id: &str) -> Option<ChunkOutcome> {
        let status = self.tracker.status(session_id).await.ok()??;
        match status.state {
            SessionState::Complete => Some(ChunkOutcome::Complete {
                artifact_name: status.artifact_name,
            }),
            state if state.is_busy() => Some(ChunkOutcome::Reassembling),
            _ => None,
        }
    }

    /// Reassemble a triggered session and start its transcodes.
    async fn finish_upload(
        &self,
        session_id: &str,
        total_chunks: u32,
        fallback_name: &str,
    ) -> UploadResult<FinalArtifact> {
        // The name captured from chunk 0 wins over whatever the last chunk carried.
        let original_name = match self.tracker.status(session_id).await? {
            Some(SessionStatus {
                original_name: Some(name),
                ..
            }) => name,
            _ => fallback_name.to_string(),
        };
        let destination = FinalArtifact::generate_name(&original_name);

        let result = match self.tracker.begin_reassembly(session_id).await {
            Ok(()) => {
                self.reassembler
                    .reassemble(session_id, total_chunks, &destination)
                    .await
            }
            Err(err) => Err(err),
        };

        let artifact = match result {
            Ok(artifact) => artifact,
            Err(err) => {
                if let Err(mark_err) = self.tracker.fail(session_id).await {
                    warn!(session_id, "could not mark session failed: {}", mark_err);
                }
                return Err(err);
            }
        };

        let marked = self.tracker.complete(session_id, &artifact.file_name).await;

        let group = self
            .transcoder
            .transcode(&artifact.path, session_id, &self.profiles)
            .await;
        if group.is_empty() {
            warn!(session_id, "no resolution profiles configured, nothing to transcode");
        }
        info!(
            session_id,
            artifact = %artifact.file_name,
            jobs = group.len(),
            job_ids = ?group.job_ids(),
            "upload complete, transcoding scheduled"
        );
        let summary_id = session_id.to_string();
        tokio::spawn(async move {
            let outcomes = group.wait().await;
            let failed = outcomes.iter().filter(|o| !o.succeeded()).count();
            info!(
                session_id = %summary_id,
                renditions = outcomes.len() - failed,
                failed,
                "all transcodes finished"
            );
        });

        marked?;
        Ok(artifact)
    }

    pub async fn session_status(&self, session_id: &str) -> UploadResult<SessionStatus> {
        ChunkStore::ensure_session_id_safe(session_id)?;
        let mut status = self
            .tracker
            .status(session_id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;
        // After a restart only the disk knows which chunks arrived.
        if status.received_chunks.is_empty() && status.state != SessionState::Complete {
            status.received_chunks = self.chunks.list_indices(session_id).await?;
        }
        Ok(status)
    }

    pub async fn transcode_jobs(&self, session_id: &str) -> Vec<TranscodeJob> {
        self.transcoder.jobs_for(session_id).await
    }

    /// Remove chunk storage of sessions idle for longer than `ttl`, plus any
    /// session directory on disk that no live session owns and that has not
    /// been touched for `ttl`. Transcode jobs finished more than `ttl` ago
    /// are dropped from the job registry. Returns how many sessions were
    /// removed.
    pub async fn sweep_abandoned(&self, ttl: Duration) -> UploadResult<usize> {
        let idle_for = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let mut removed = 0;

        for session_id in self.tracker.idle_sessions(idle_for).await {
            self.chunks.remove_session(&session_id).await?;
            self.tracker.forget(&session_id).await;
            info!(session_id = %session_id, "swept idle session");
            removed += 1;
        }

        for stored in self.chunks.stored_sessions().await? {
            if self.tracker.is_tracked(&stored.session_id).await {
                continue;
            }
            let age = SystemTime::now()
                .duration_since(stored.modified)
                .unwrap_or_default();
            if age < ttl {
                continue;
            }
            match self.chunks.remove_session(&stored.session_id).await {
                Ok(()) => {
                    info!(session_id = %stored.session_id, "swept orphaned chunk directory");
                    removed += 1;
                }
                Err(err) => warn!(
                    session_id = %stored.session_id,
                    "could not sweep chunk directory: {}", err
                ),
            }
        }

        let pruned = self.transcoder.prune_finished(idle_for).await;
        if pruned > 0 {
            debug!(pruned, "dropped finished transcode jobs");
        }

        Ok(removed)
    }

    /// Run `sweep_abandoned` every `every` until the runtime shuts down.
    pub fn spawn_sweeper(&self, every: Duration, ttl: Duration) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match service.sweep_abandoned(ttl).await {
                    Ok(0) => debug!("sweep found no abandoned sessions"),
                    Ok(n) => info!(removed = n, "swept abandoned sessions"),
                    Err(err) => warn!("session sweep failed: {}", err),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, services::testing::FakeEngine};
    use tempfile::TempDir;
    use tokio::fs;

    struct Harness {
        service: UploadService,
        outcomes: mpsc::UnboundedReceiver<JobOutcome>,
        config: AppConfig,
        _dir: TempDir,
    }

    async fn harness(fail_label: Option<&str>) -> Harness {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::for_tests(dir.path());
        let (service, outcomes) = UploadService::new(
            &config,
            db::memory_pool().await,
            Arc::new(FakeEngine::new(fail_label)),
        );
        Harness {
            service,
            outcomes,
            config,
            _dir: dir,
        }
    }

    fn chunk(session_id: &str, index: u32, total: u32, name: &str, data: &[u8]) -> ChunkUpload {
        ChunkUpload {
            session_id: session_id.into(),
            chunk_index: index,
            total_chunks: total,
            original_name: name.into(),
            data: Bytes::copy_from_slice(data),
        }
    }

    async fn artifacts(config: &AppConfig) -> Vec<PathBuf> {
        let mut found = Vec::new();
        if let Ok(mut entries) = fs::read_dir(&config.final_dir).await {
            while let Some(entry) = entries.next_entry().await.unwrap() {
                found.push(entry.path());
            }
        }
        found
    }

    async fn drain(outcomes: &mut mpsc::UnboundedReceiver<JobOutcome>, n: usize) -> Vec<JobOutcome> {
        let mut received = Vec::new();
        for _ in 0..n {
            let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
                .await
                .expect("transcode outcome timed out")
                .expect("completion channel closed");
            received.push(outcome);
        }
        received
    }

    #[tokio::test]
    async fn out_of_order_last_chunk_reassembles_after_gap_fills() {
        let mut h = harness(None).await;

        // chunk 1 is the declared last chunk, but chunk 0 is not there yet
        let early = h
            .service
            .accept_chunk(chunk("abc123", 1, 2, "movie.mp4", b"-second"))
            .await
            .unwrap();
        assert_eq!(early, ChunkOutcome::Accepted);
        assert_eq!(h.service.chunks.list_indices("abc123").await.unwrap(), vec![1]);
        assert!(artifacts(&h.config).await.is_empty());
        assert_eq!(
            h.service.session_status("abc123").await.unwrap().state,
            SessionState::Failed
        );

        let done = h
            .service
            .accept_chunk(chunk("abc123", 0, 2, "movie.mp4", b"first"))
            .await
            .unwrap();
        let ChunkOutcome::Complete {
            artifact_name: Some(name),
        } = done
        else {
            panic!("expected completion, got {:?}", done);
        };

        let path = h.config.final_dir.join(&name);
        assert_eq!(fs::read(&path).await.unwrap(), b"first-second");
        assert!(h.service.chunks.list_indices("abc123").await.unwrap().is_empty());

        let outcomes = drain(&mut h.outcomes, 3).await;
        assert!(outcomes.iter().all(JobOutcome::succeeded));
    }

    #[tokio::test]
    async fn artifact_name_is_generated_with_original_extension() {
        let h = harness(None).await;
        let outcome = h
            .service
            .accept_chunk(chunk("s1", 0, 1, "movie.mp4", b"bytes"))
            .await
            .unwrap();

        let ChunkOutcome::Complete {
            artifact_name: Some(name),
        } = outcome
        else {
            panic!("expected completion");
        };
        assert_ne!(name, "movie.mp4");
        assert!(name.starts_with("movie-"));
        assert!(name.ends_with(".mp4"));

        let status = h.service.session_status("s1").await.unwrap();
        assert_eq!(status.state, SessionState::Complete);
        assert_eq!(status.artifact_name.as_deref(), Some(name.as_str()));
        assert_eq!(status.format.as_deref(), Some(".mp4"));
    }

    #[tokio::test]
    async fn duplicate_chunks_do_not_change_the_artifact() {
        let h = harness(None).await;
        let svc = &h.service;

        assert_eq!(
            svc.accept_chunk(chunk("dup", 0, 3, "a.mov", b"AA")).await.unwrap(),
            ChunkOutcome::Accepted
        );
        assert_eq!(
            svc.accept_chunk(chunk("dup", 0, 3, "a.mov", b"AA")).await.unwrap(),
            ChunkOutcome::Accepted
        );
        svc.accept_chunk(chunk("dup", 1, 3, "a.mov", b"BB")).await.unwrap();
        svc.accept_chunk(chunk("dup", 1, 3, "a.mov", b"BB")).await.unwrap();
        let done = svc
            .accept_chunk(chunk("dup", 2, 3, "a.mov", b"CC"))
            .await
            .unwrap();
        assert!(matches!(done, ChunkOutcome::Complete { .. }));

        let found = artifacts(&h.config).await;
        assert_eq!(found.len(), 1);
        assert_eq!(fs::read(&found[0]).await.unwrap(), b"AABBCC");
    }

    #[tokio::test]
    async fn conflicting_chunk_zero_metadata_is_rejected() {
        let h = harness(None).await;
        h.service
            .accept_chunk(chunk("meta", 0, 2, "a.mp4", b"x"))
            .await
            .unwrap();

        let result = h
            .service
            .accept_chunk(chunk("meta", 0, 2, "b.mkv", b"x"))
            .await;
        assert!(matches!(result, Err(UploadError::MetadataConflict { .. })));

        let status = h.service.session_status("meta").await.unwrap();
        assert_eq!(status.original_name.as_deref(), Some("a.mp4"));
    }

    #[tokio::test]
    async fn conflicting_chunk_zero_keeps_original_bytes() {
        let h = harness(None).await;
        let svc = &h.service;
        svc.accept_chunk(chunk("keep", 0, 2, "a.mp4", b"GOOD")).await.unwrap();

        let rejected = svc.accept_chunk(chunk("keep", 0, 2, "b.mkv", b"EVIL")).await;
        assert!(matches!(rejected, Err(UploadError::MetadataConflict { .. })));

        let done = svc
            .accept_chunk(chunk("keep", 1, 2, "a.mp4", b"-tail"))
            .await
            .unwrap();
        assert!(matches!(done, ChunkOutcome::Complete { .. }));

        let found = artifacts(&h.config).await;
        assert_eq!(found.len(), 1);
        assert_eq!(fs::read(&found[0]).await.unwrap(), b"GOOD-tail");
    }

    #[tokio::test]
    async fn missing_chunk_completes_the_upload_after_restart() {
        let h = harness(None).await;
        let svc = &h.service;
        svc.accept_chunk(chunk("gap", 0, 3, "m.mp4", b"a")).await.unwrap();
        assert_eq!(
            svc.accept_chunk(chunk("gap", 2, 3, "m.mp4", b"c")).await.unwrap(),
            ChunkOutcome::Accepted
        );
        assert_eq!(
            svc.session_status("gap").await.unwrap().state,
            SessionState::Failed
        );

        // a fresh service over the same database and directories
        let (restarted, _outcomes) = UploadService::new(
            &h.config,
            svc.db.clone(),
            Arc::new(FakeEngine::new(None)),
        );
        let done = restarted
            .accept_chunk(chunk("gap", 1, 3, "m.mp4", b"b"))
            .await
            .unwrap();
        assert!(matches!(done, ChunkOutcome::Complete { .. }));

        let found = artifacts(&h.config).await;
        assert_eq!(found.len(), 1);
        assert_eq!(fs::read(&found[0]).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn sweep_drops_finished_transcode_jobs() {
        let mut h = harness(None).await;
        h.service
            .accept_chunk(chunk("jobs", 0, 1, "v.mp4", b"v"))
            .await
            .unwrap();
        drain(&mut h.outcomes, 3).await;
        assert_eq!(h.service.transcode_jobs("jobs").await.len(), 3);

        h.service.sweep_abandoned(Duration::ZERO).await.unwrap();
        assert!(h.service.transcode_jobs("jobs").await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_last_chunk_retries_reassemble_once() {
        let h = harness(None).await;
        h.service
            .accept_chunk(chunk("race", 0, 2, "clip.mp4", b"head"))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let svc = h.service.clone();
            handles.push(tokio::spawn(async move {
                svc.accept_chunk(chunk("race", 1, 2, "clip.mp4", b"tail")).await
            }));
        }

        let mut named = Vec::new();
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                ChunkOutcome::Complete {
                    artifact_name: Some(name),
                } => named.push(name),
                ChunkOutcome::Reassembling => {}
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert!(!named.is_empty());
        named.dedup();
        assert_eq!(named.len(), 1);

        let found = artifacts(&h.config).await;
        assert_eq!(found.len(), 1);
        assert_eq!(fs::read(&found[0]).await.unwrap(), b"headtail");
    }

    #[tokio::test]
    async fn retry_after_completion_reports_same_artifact() {
        let h = harness(None).await;
        let first = h
            .service
            .accept_chunk(chunk("again", 0, 1, "v.mp4", b"v"))
            .await
            .unwrap();
        let second = h
            .service
            .accept_chunk(chunk("again", 0, 1, "v.mp4", b"v"))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(artifacts(&h.config).await.len(), 1);
        assert!(h.service.chunks.stored_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transcode_failure_does_not_affect_upload_or_siblings() {
        let mut h = harness(Some("1080p")).await;
        let outcome = h
            .service
            .accept_chunk(chunk("tx", 0, 1, "v.mp4", b"video"))
            .await
            .unwrap();
        assert!(matches!(outcome, ChunkOutcome::Complete { .. }));

        let outcomes = drain(&mut h.outcomes, 3).await;
        let failed: Vec<&str> = outcomes
            .iter()
            .filter(|o| !o.succeeded())
            .map(|o| o.profile.as_str())
            .collect();
        assert_eq!(failed, vec!["1080p"]);

        let jobs = h.service.transcode_jobs("tx").await;
        assert_eq!(jobs.len(), 3);
    }

    #[tokio::test]
    async fn invalid_requests_are_validation_errors() {
        let h = harness(None).await;
        let cases = [
            chunk("s", 0, 0, "a.mp4", b"x"),
            chunk("s", 2, 2, "a.mp4", b"x"),
            chunk("../s", 0, 1, "a.mp4", b"x"),
            chunk("s", 0, 1, "  ", b"x"),
        ];
        for case in cases {
            let result = h.service.accept_chunk(case.clone()).await;
            assert!(
                matches!(result, Err(UploadError::Validation(_))),
                "{:?}",
                case
            );
        }
    }

    #[tokio::test]
    async fn status_after_restart_reads_chunks_from_disk() {
        let h = harness(None).await;
        let svc = &h.service;
        svc.accept_chunk(chunk("resume", 0, 3, "a.mp4", b"x")).await.unwrap();
        svc.accept_chunk(chunk("resume", 1, 3, "a.mp4", b"y")).await.unwrap();

        // drop in-memory state as a restart would
        svc.tracker.forget("resume").await;

        let status = svc.session_status("resume").await.unwrap();
        assert_eq!(status.state, SessionState::Receiving);
        assert_eq!(status.total_chunks, Some(3));
        assert_eq!(status.received_chunks, vec![0, 1]);
    }

    #[tokio::test]
    async fn sweep_removes_idle_and_orphaned_sessions() {
        let h = harness(None).await;
        h.service
            .accept_chunk(chunk("idle", 0, 3, "a.mp4", b"x"))
            .await
            .unwrap();
        // left behind by an earlier process
        h.service.chunks.put("orphan", 0, b"y").await.unwrap();

        assert_eq!(
            h.service
                .sweep_abandoned(Duration::from_secs(3600))
                .await
                .unwrap(),
            0
        );

        let removed = h.service.sweep_abandoned(Duration::ZERO).await.unwrap();
        assert_eq!(removed, 2);
        assert!(h.service.chunks.stored_sessions().await.unwrap().is_empty());
        assert!(!h.service.tracker.is_tracked("idle").await);
    }
}
