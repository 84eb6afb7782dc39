//! Concatenates a session's chunks, in index order, into one artifact.
//!
//! The artifact is written under a temp name in the final-upload directory,
//! synced, and only then renamed into place, so a failed reassembly never
//! leaves a file that looks complete.

use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    chunk_store::ChunkStore,
    error::{UploadError, UploadResult},
};
use crate::models::artifact::FinalArtifact;

#[derive(Clone, Debug)]
pub struct Reassembler {
    chunks: ChunkStore,
    final_dir: PathBuf,
}

impl Reassembler {
    pub fn new(chunks: ChunkStore, final_dir: impl Into<PathBuf>) -> Self {
        Self {
            chunks,
            final_dir: final_dir.into(),
        }
    }

    /// First index in `0..total_chunks` with no stored chunk.
    async fn first_missing(&self, session_id: &str, total_chunks: u32) -> Option<u32> {
        for index in 0..total_chunks {
            if !self.chunks.exists(session_id, index).await {
                return Some(index);
            }
        }
        None
    }

    /// Build `final_dir/destination_name` from chunks `0..total_chunks`.
    ///
    /// Fails with `MissingChunk` (and leaves the chunks in place) if any index
    /// is absent. On success the session's chunk storage is removed.
    pub async fn reassemble(
        &self,
        session_id: &str,
        total_chunks: u32,
        destination_name: &str,
    ) -> UploadResult<FinalArtifact> {
        if total_chunks == 0 {
            return Err(UploadError::Validation("totalChunks must be at least 1".into()));
        }
        if destination_name.is_empty()
            || destination_name.contains(['/', '\\'])
            || destination_name.starts_with('.')
        {
            return Err(UploadError::Validation(format!(
                "invalid destination name `{}`",
                destination_name
            )));
        }
        if let Some(index) = self.first_missing(session_id, total_chunks).await {
            warn!(session_id, chunk_index = index, total_chunks, "reassembly aborted: missing chunk");
            return Err(UploadError::MissingChunk {
                session_id: session_id.to_string(),
                index,
            });
        }

        fs::create_dir_all(&self.final_dir).await?;
        let final_path = self.final_dir.join(destination_name);
        if fs::try_exists(&final_path).await? {
            return Err(UploadError::Io(io::Error::new(
                ErrorKind::AlreadyExists,
                format!("artifact {} already exists", final_path.display()),
            )));
        }
        let tmp_path = self.final_dir.join(format!(".tmp-{}", Uuid::new_v4()));

        let (size_bytes, digest) = match self.write_chunks(session_id, total_chunks, &tmp_path).await
        {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(err));
        }

        // The artifact is durable at this point; stale chunks are left to the sweep.
        if let Err(err) = self.chunks.remove_session(session_id).await {
            warn!(session_id, "could not remove chunk storage after reassembly: {}", err);
        }

        info!(
            session_id,
            artifact = %final_path.display(),
            size_bytes,
            total_chunks,
            "reassembled upload"
        );

        Ok(FinalArtifact {
            session_id: session_id.to_string(),
            file_name: destination_name.to_string(),
            path: final_path,
            size_bytes,
            md5: digest,
        })
    }

    /// Append every chunk, in ascending index order, to a new file at `path`.
    async fn write_chunks(
        &self,
        session_id: &str,
        total_chunks: u32,
        path: &Path,
    ) -> UploadResult<(u64, String)> {
        let mut file = File::create(path).await?;
        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();

        for index in 0..total_chunks {
            let bytes = self
                .chunks
                .read(session_id, index)
                .await
                .map_err(|err| match err {
                    UploadError::ChunkNotFound { session_id, index } => {
                        UploadError::MissingChunk { session_id, index }
                    }
                    other => other,
                })?;
            digest.consume(&bytes);
            file.write_all(&bytes).await?;
            size_bytes += bytes.len() as u64;
            debug!(session_id, chunk_index = index, "appended chunk");
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok((size_bytes, format!("{:x}", digest.compute())))
    }
}
