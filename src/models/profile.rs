//! Target renditions produced from every finished upload.

use serde::Serialize;

/// A named transcoding target.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ResolutionProfile {
    /// Label used in output names, e.g. `720p`.
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Video encoder passed to the engine.
    pub codec: String,
    /// Encoder speed/quality preset.
    pub preset: String,
    /// Constant rate factor.
    pub crf: u8,
}

impl ResolutionProfile {
    fn h264(label: &str, width: u32, height: u32) -> Self {
        Self {
            label: label.to_string(),
            width,
            height,
            fps: 30,
            codec: "libx264".into(),
            preset: "fast".into(),
            crf: 23,
        }
    }

    /// 480p, 720p and 1080p, all at 30 fps.
    pub fn standard_set() -> Vec<Self> {
        vec![
            Self::h264("480p", 854, 480),
            Self::h264("720p", 1280, 720),
            Self::h264("1080p", 1920, 1080),
        ]
    }

    /// `WxH`, the form ffmpeg's `-s` expects.
    pub fn size(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    /// `<base>_<label>.mp4`
    pub fn output_file_name(&self, artifact_base: &str) -> String {
        format!("{}_{}.mp4", artifact_base, self.label)
    }
}
