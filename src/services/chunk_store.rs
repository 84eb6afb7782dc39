//! src/services/chunk_store.rs
//!
//! ChunkStore: durable per-session chunk storage on local disk. Each session
//! owns one directory beneath `root/{session_id}/` holding files named
//! `chunk_{index}`. Writes go through a temp file and a rename so a retried
//! or concurrent `put` of the same index replaces the chunk whole.

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::SystemTime,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

use super::error::{UploadError, UploadResult};

const MAX_SESSION_ID_LEN: usize = 128;
const CHUNK_PREFIX: &str = "chunk_";

/// A session directory found on disk, with its last modification time.
#[derive(Debug, Clone)]
pub struct StoredSession {
    pub session_id: String,
    pub modified: SystemTime,
}

#[derive(Clone, Debug)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Session IDs name directories, so only `[A-Za-z0-9_-]` is accepted.
    pub fn ensure_session_id_safe(session_id: &str) -> UploadResult<()> {
        if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LEN {
            return Err(UploadError::Validation(format!(
                "uniqueId must be 1-{} characters",
                MAX_SESSION_ID_LEN
            )));
        }
        if !session_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(UploadError::Validation(
                "uniqueId may only contain letters, digits, '-' and '_'".into(),
            ));
        }
        Ok(())
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn chunk_path(&self, session_id: &str, index: u32) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("{}{}", CHUNK_PREFIX, index))
    }

    /// Store the bytes of chunk `index`, replacing any earlier copy.
    ///
    /// Creates the session directory on demand.
    pub async fn put(&self, session_id: &str, index: u32, bytes: &[u8]) -> UploadResult<()> {
        Self::ensure_session_id_safe(session_id)?;
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir).await?;

        let final_path = self.chunk_path(session_id, index);
        let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));
        if let Err(err) = write_synced(&tmp_path, bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&final_path).await?;
                fs::rename(&tmp_path, &final_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(UploadError::Io(err));
            }
        }

        debug!(session_id, chunk_index = index, size = bytes.len(), "stored chunk");
        Ok(())
    }

    pub async fn exists(&self, session_id: &str, index: u32) -> bool {
        if Self::ensure_session_id_safe(session_id).is_err() {
            return false;
        }
        fs::try_exists(self.chunk_path(session_id, index))
            .await
            .unwrap_or(false)
    }

    pub async fn read(&self, session_id: &str, index: u32) -> UploadResult<Vec<u8>> {
        Self::ensure_session_id_safe(session_id)?;
        fs::read(self.chunk_path(session_id, index))
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    UploadError::ChunkNotFound {
                        session_id: session_id.to_string(),
                        index,
                    }
                } else {
                    UploadError::Io(err)
                }
            })
    }

    /// Delete the session directory and every chunk in it.
    ///
    /// Removing a session that has no storage is not an error.
    pub async fn remove_session(&self, session_id: &str) -> UploadResult<()> {
        Self::ensure_session_id_safe(session_id)?;
        let dir = self.session_dir(session_id);
        match fs::remove_dir_all(&dir).await {
            Ok(_) => {
                debug!(session_id, "removed chunk storage");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(UploadError::Io(err)),
        }
    }

    /// Indices currently on disk for a session, ascending.
    pub async fn list_indices(&self, session_id: &str) -> UploadResult<Vec<u32>> {
        Self::ensure_session_id_safe(session_id)?;
        let mut entries = match fs::read_dir(self.session_dir(session_id)).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(UploadError::Io(err)),
        };

        let mut indices = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(index) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix(CHUNK_PREFIX))
                .and_then(|n| n.parse::<u32>().ok())
            {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// Every session directory under the root.
    pub async fn stored_sessions(&self) -> io::Result<Vec<StoredSession>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_dir() {
                continue;
            }
            let Some(session_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            sessions.push(StoredSession {
                session_id,
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(sessions)
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}
