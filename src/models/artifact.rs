//! The reassembled upload.

use serde::Serialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A fully reassembled upload sitting in the final-upload directory.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct FinalArtifact {
    /// Session the artifact was assembled from.
    pub session_id: String,

    /// Generated, collision-resistant file name (`<base>-<suffix><ext>`).
    pub file_name: String,

    /// Full path on disk.
    #[serde(skip)]
    pub path: PathBuf,

    pub size_bytes: u64,

    /// Hex MD5 of the assembled bytes.
    pub md5: String,
}

impl FinalArtifact {
    /// Build a fresh destination name for `original_name`.
    ///
    /// Directory components are dropped, the extension is preserved and a
    /// random 16-hex-digit suffix is appended to the stem.
    pub fn generate_name(original_name: &str) -> String {
        let file_name = Path::new(original_name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload");
        let as_path = Path::new(file_name);
        let stem = as_path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("upload");
        let ext = as_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e))
            .unwrap_or_default();
        let suffix = Uuid::new_v4().simple().to_string();

        format!("{}-{}{}", stem, &suffix[..16], ext)
    }
}
