//! Test doubles shared by service and handler tests.

use async_trait::async_trait;
use std::{
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};

use super::transcoder::{TranscodeEngine, TranscodeError};
use crate::models::profile::ResolutionProfile;

/// Writes a small file per profile, failing the profile named `fail_label`.
pub struct FakeEngine {
    fail_label: Option<String>,
    pub calls: AtomicUsize,
}

impl FakeEngine {
    pub fn new(fail_label: Option<&str>) -> Self {
        Self {
            fail_label: fail_label.map(str::to_string),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TranscodeEngine for FakeEngine {
    async fn transcode(
        &self,
        _input: &Path,
        output: &Path,
        profile: &ResolutionProfile,
    ) -> Result<(), TranscodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_label.as_deref() == Some(profile.label.as_str()) {
            return Err(TranscodeError::ProcessFailed {
                code: 1,
                stderr: format!("cannot encode {}", profile.label),
            });
        }
        tokio::fs::write(output, profile.size()).await?;
        Ok(())
    }
}
