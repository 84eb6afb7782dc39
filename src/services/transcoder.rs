//! Transcoding of finished artifacts into resolution variants.
//!
//! `TranscodeEngine` abstracts the external encoder; `FfmpegEngine` runs the
//! real `ffmpeg` binary. `TranscodeOrchestrator` fans one artifact out into
//! one background task per profile and reports every job independently.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    process::Command,
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::models::{
    job::{JobOutcome, JobState, TranscodeJob},
    profile::ResolutionProfile,
};

const STDERR_TAIL_CHARS: usize = 2000;

/// Errors from one transcode invocation.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("transcode timed out after {0} seconds")]
    Timeout(u64),

    #[error("transcode failed with exit code {code}: {stderr}")]
    ProcessFailed { code: i32, stderr: String },

    #[error("expected output file not created: {0}")]
    OutputMissing(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// An encoder able to render `input` to `output` for one profile.
#[async_trait]
pub trait TranscodeEngine: Send + Sync {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        profile: &ResolutionProfile,
    ) -> Result<(), TranscodeError>;
}

/// Runs the `ffmpeg` command-line tool as a child process.
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    binary: String,
    timeout: Duration,
}

impl FfmpegEngine {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// `-y -i <in> -s WxH -r <fps> -c:v <codec> -preset <preset> -crf <crf> <out>`
    pub fn command_args(input: &Path, output: &Path, profile: &ResolutionProfile) -> Vec<String> {
        vec![
            "-y".into(),
            "-i".into(),
            input.to_string_lossy().into_owned(),
            "-s".into(),
            profile.size(),
            "-r".into(),
            profile.fps.to_string(),
            "-c:v".into(),
            profile.codec.clone(),
            "-preset".into(),
            profile.preset.clone(),
            "-crf".into(),
            profile.crf.to_string(),
            output.to_string_lossy().into_owned(),
        ]
    }
}

#[async_trait]
impl TranscodeEngine for FfmpegEngine {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        profile: &ResolutionProfile,
    ) -> Result<(), TranscodeError> {
        let args = Self::command_args(input, output, profile);
        debug!(command = %self.binary, ?args, "spawning encoder");

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| TranscodeError::Spawn {
            command: self.binary.clone(),
            source,
        })?;

        let result = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => return Err(TranscodeError::Timeout(self.timeout.as_secs())),
        };

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let skip = stderr.chars().count().saturating_sub(STDERR_TAIL_CHARS);
            return Err(TranscodeError::ProcessFailed {
                code: result.status.code().unwrap_or(-1),
                stderr: stderr.chars().skip(skip).collect(),
            });
        }

        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(TranscodeError::OutputMissing(output.display().to_string()));
        }
        Ok(())
    }
}

/// Handles for the jobs spawned from one artifact.
pub struct JobGroup {
    jobs: Vec<(Uuid, String, JoinHandle<JobOutcome>)>,
    session_id: String,
}

impl JobGroup {
    pub fn job_ids(&self) -> Vec<Uuid> {
        self.jobs.iter().map(|(id, _, _)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Wait for every job; outcomes are in profile order.
    pub async fn wait(self) -> Vec<JobOutcome> {
        let session_id = self.session_id;
        let (meta, handles): (Vec<_>, Vec<_>) = self
            .jobs
            .into_iter()
            .map(|(id, label, handle)| ((id, label), handle))
            .unzip();

        join_all(handles)
            .await
            .into_iter()
            .zip(meta)
            .map(|(joined, (job_id, profile))| {
                joined.unwrap_or_else(|err| JobOutcome {
                    job_id,
                    session_id: session_id.clone(),
                    profile,
                    result: Err(format!("transcode task aborted: {}", err)),
                })
            })
            .collect()
    }
}

/// Launches and tracks transcode jobs.
#[derive(Clone)]
pub struct TranscodeOrchestrator {
    engine: Arc<dyn TranscodeEngine>,
    output_dir: PathBuf,
    jobs: Arc<Mutex<HashMap<String, Vec<TranscodeJob>>>>,
    completions: mpsc::UnboundedSender<JobOutcome>,
}

impl TranscodeOrchestrator {
    /// Create an orchestrator and the receiving end of its completion channel.
    pub fn new(
        engine: Arc<dyn TranscodeEngine>,
        output_dir: impl Into<PathBuf>,
    ) -> (Self, mpsc::UnboundedReceiver<JobOutcome>) {
        let (completions, rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            engine,
            output_dir: output_dir.into(),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            completions,
        };
        (orchestrator, rx)
    }

    /// Start one background job per profile against `artifact_path`.
    ///
    /// Returns immediately. Jobs never cancel, retry, or wait on each other.
    pub async fn transcode(
        &self,
        artifact_path: &Path,
        session_id: &str,
        profiles: &[ResolutionProfile],
    ) -> JobGroup {
        let base = artifact_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("artifact")
            .to_string();

        let mut group = JobGroup {
            jobs: Vec::with_capacity(profiles.len()),
            session_id: session_id.to_string(),
        };

        for profile in profiles {
            let job = TranscodeJob {
                id: Uuid::new_v4(),
                session_id: session_id.to_string(),
                profile: profile.label.clone(),
                input_path: artifact_path.to_path_buf(),
                output_name: profile.output_file_name(&base),
                state: JobState::Queued,
                error: None,
                queued_at: Utc::now(),
                finished_at: None,
            };
            self.jobs
                .lock()
                .await
                .entry(session_id.to_string())
                .or_default()
                .push(job.clone());

            let job_id = job.id;
            let label = profile.label.clone();
            let this = self.clone();
            let profile = profile.clone();
            let handle = tokio::spawn(async move { this.run_job(job, profile).await });
            group.jobs.push((job_id, label, handle));
        }

        group
    }

    async fn run_job(&self, job: TranscodeJob, profile: ResolutionProfile) -> JobOutcome {
        let output_path = self.output_dir.join(&job.output_name);
        self.set_state(&job.session_id, job.id, JobState::Running, None)
            .await;
        info!(
            session_id = %job.session_id,
            profile = %profile.label,
            output = %output_path.display(),
            "transcode started"
        );

        let started = Instant::now();
        let result = match tokio::fs::create_dir_all(&self.output_dir).await {
            Ok(()) => {
                self.engine
                    .transcode(&job.input_path, &output_path, &profile)
                    .await
            }
            Err(err) => Err(TranscodeError::Io(err)),
        };

        let outcome = match result {
            Ok(()) => {
                info!(
                    session_id = %job.session_id,
                    profile = %profile.label,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "transcode complete: {}",
                    output_path.display()
                );
                self.set_state(&job.session_id, job.id, JobState::Succeeded, None)
                    .await;
                Ok(output_path)
            }
            Err(err) => {
                error!(
                    session_id = %job.session_id,
                    profile = %profile.label,
                    "transcode failed: {}",
                    err
                );
                let message = err.to_string();
                self.set_state(
                    &job.session_id,
                    job.id,
                    JobState::Failed,
                    Some(message.clone()),
                )
                .await;
                Err(message)
            }
        };

        let outcome = JobOutcome {
            job_id: job.id,
            session_id: job.session_id,
            profile: profile.label,
            result: outcome,
        };
        // Nobody listening is fine; the registry still has the result.
        let _ = self.completions.send(outcome.clone());
        outcome
    }

    async fn set_state(
        &self,
        session_id: &str,
        job_id: Uuid,
        state: JobState,
        error: Option<String>,
    ) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs
            .get_mut(session_id)
            .and_then(|list| list.iter_mut().find(|job| job.id == job_id))
        {
            job.state = state;
            job.error = error;
            if matches!(state, JobState::Succeeded | JobState::Failed) {
                job.finished_at = Some(Utc::now());
            }
        }
    }

    /// Drop jobs that finished at least `older_than` ago. Queued and running
    /// jobs are kept. Returns how many jobs were removed.
    pub async fn prune_finished(&self, older_than: chrono::Duration) -> usize {
        let Some(cutoff) = Utc::now().checked_sub_signed(older_than) else {
            return 0;
        };
        let mut jobs = self.jobs.lock().await;
        let mut pruned = 0;
        jobs.retain(|_, list| {
            let before = list.len();
            list.retain(|job| !job.finished_at.is_some_and(|at| at <= cutoff));
            pruned += before - list.len();
            !list.is_empty()
        });
        pruned
    }

    /// Status snapshot of every job started for a session.
    pub async fn jobs_for(&self, session_id: &str) -> Vec<TranscodeJob> {
        self.jobs
            .lock()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::FakeEngine;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    #[tokio::test]
    async fn three_profiles_give_three_outcomes() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new(None));
        let (orchestrator, mut rx) =
            TranscodeOrchestrator::new(engine.clone(), dir.path().join("transcoded"));

        let group = orchestrator
            .transcode(
                Path::new("/data/final/movie-0123456789abcdef.mp4"),
                "s1",
                &ResolutionProfile::standard_set(),
            )
            .await;
        assert_eq!(group.len(), 3);

        let outcomes = group.wait().await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(JobOutcome::succeeded));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 3);

        let out = outcomes[1].result.as_ref().unwrap();
        assert_eq!(
            out,
            &dir.path().join("transcoded/movie-0123456789abcdef_720p.mp4")
        );
        assert_eq!(tokio::fs::read_to_string(out).await.unwrap(), "1280x720");

        let mut delivered = 0;
        while rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, 3);
    }

    #[tokio::test]
    async fn one_failure_leaves_siblings_succeeded() {
        let dir = TempDir::new().unwrap();
        let (orchestrator, _rx) = TranscodeOrchestrator::new(
            Arc::new(FakeEngine::new(Some("720p"))),
            dir.path().to_path_buf(),
        );

        let outcomes = orchestrator
            .transcode(
                Path::new("/data/final/clip.mp4"),
                "s1",
                &ResolutionProfile::standard_set(),
            )
            .await
            .wait()
            .await;

        let summary: Vec<(&str, bool)> = outcomes
            .iter()
            .map(|o| (o.profile.as_str(), o.succeeded()))
            .collect();
        assert_eq!(
            summary,
            vec![("480p", true), ("720p", false), ("1080p", true)]
        );
        let failure = outcomes[1].result.as_ref().unwrap_err();
        assert!(failure.contains("cannot encode 720p"));

        let jobs = orchestrator.jobs_for("s1").await;
        assert_eq!(jobs.len(), 3);
        let states: Vec<JobState> = jobs.iter().map(|j| j.state).collect();
        assert_eq!(
            states,
            vec![JobState::Succeeded, JobState::Failed, JobState::Succeeded]
        );
        assert!(jobs.iter().all(|j| j.finished_at.is_some()));
        assert_eq!(jobs[1].error.as_deref(), Some(failure.as_str()));
    }

    #[tokio::test]
    async fn unknown_session_has_no_jobs() {
        let dir = TempDir::new().unwrap();
        let (orchestrator, _rx) =
            TranscodeOrchestrator::new(Arc::new(FakeEngine::new(None)), dir.path());
        assert!(orchestrator.jobs_for("nope").await.is_empty());
    }

    #[tokio::test]
    async fn finished_jobs_are_pruned_after_their_age() {
        let dir = TempDir::new().unwrap();
        let (orchestrator, _rx) =
            TranscodeOrchestrator::new(Arc::new(FakeEngine::new(Some("480p"))), dir.path());
        let profiles = ResolutionProfile::standard_set();

        orchestrator
            .transcode(Path::new("/data/final/a.mp4"), "s1", &profiles)
            .await
            .wait()
            .await;
        orchestrator
            .transcode(Path::new("/data/final/b.mp4"), "s2", &profiles)
            .await
            .wait()
            .await;

        assert_eq!(orchestrator.prune_finished(chrono::Duration::hours(1)).await, 0);
        assert_eq!(orchestrator.jobs_for("s1").await.len(), 3);

        // failed jobs are pruned along with successful ones
        assert_eq!(orchestrator.prune_finished(chrono::Duration::zero()).await, 6);
        assert!(orchestrator.jobs_for("s1").await.is_empty());
        assert!(orchestrator.jobs_for("s2").await.is_empty());
        assert!(orchestrator.jobs.lock().await.is_empty());
    }

    #[tokio::test]
    async fn unfinished_jobs_survive_pruning() {
        let dir = TempDir::new().unwrap();
        let (orchestrator, _rx) =
            TranscodeOrchestrator::new(Arc::new(FakeEngine::new(None)), dir.path());
        orchestrator.jobs.lock().await.insert(
            "s1".into(),
            vec![TranscodeJob {
                id: Uuid::new_v4(),
                session_id: "s1".into(),
                profile: "720p".into(),
                input_path: PathBuf::from("/data/final/a.mp4"),
                output_name: "a_720p.mp4".into(),
                state: JobState::Running,
                error: None,
                queued_at: Utc::now(),
                finished_at: None,
            }],
        );

        assert_eq!(orchestrator.prune_finished(chrono::Duration::zero()).await, 0);
        assert_eq!(orchestrator.jobs_for("s1").await.len(), 1);
    }

    #[test]
    fn ffmpeg_args_follow_profile() {
        let profile = &ResolutionProfile::standard_set()[0];
        let args = FfmpegEngine::command_args(
            Path::new("in/movie.mp4"),
            Path::new("out/movie_480p.mp4"),
            profile,
        );
        assert_eq!(
            args.join(" "),
            "-y -i in/movie.mp4 -s 854x480 -r 30 -c:v libx264 -preset fast -crf 23 out/movie_480p.mp4"
        );
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let engine = FfmpegEngine::new("definitely-not-an-encoder-binary", Duration::from_secs(5));
        let result = engine
            .transcode(
                Path::new("in.mp4"),
                Path::new("out.mp4"),
                &ResolutionProfile::standard_set()[0],
            )
            .await;
        assert!(matches!(result, Err(TranscodeError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_process_failure() {
        let engine = FfmpegEngine::new("false", Duration::from_secs(5));
        let result = engine
            .transcode(
                Path::new("in.mp4"),
                Path::new("out.mp4"),
                &ResolutionProfile::standard_set()[0],
            )
            .await;
        assert!(matches!(
            result,
            Err(TranscodeError::ProcessFailed { code: 1, .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn clean_exit_without_output_is_reported() {
        let dir = TempDir::new().unwrap();
        let engine = FfmpegEngine::new("true", Duration::from_secs(5));
        let result = engine
            .transcode(
                Path::new("in.mp4"),
                &dir.path().join("never-written.mp4"),
                &ResolutionProfile::standard_set()[0],
            )
            .await;
        assert!(matches!(result, Err(TranscodeError::OutputMissing(_))));
    }
}
