use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Encoding policy applied to every transcode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodePolicy {
    /// Video encoder name (broadly compatible H.264 by default)
    pub video_codec: String,
    /// Encoder speed preset
    pub preset: String,
    /// Constant rate factor (lower = higher quality)
    pub crf: u8,
    /// Audio encoder name
    pub audio_codec: String,
    /// Audio bitrate, ffmpeg notation (e.g. "128k")
    pub audio_bitrate: String,
    /// Move the moov atom to the front for progressive playback
    pub faststart: bool,
}

impl Default for TranscodePolicy {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            preset: "fast".to_string(),
            crf: 23,
            audio_codec: "aac".to_string(),
            audio_bitrate: "128k".to_string(),
            faststart: true,
        }
    }
}

/// Configuration for the MKV to MP4 converter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Path to the ffmpeg binary used as the transcoding engine
    pub ffmpeg_bin: PathBuf,
    /// Root for the engine's private working directories (system temp if unset)
    pub work_dir: Option<PathBuf>,
    /// File extensions accepted on submission, without the dot
    pub accepted_extensions: Vec<String>,
    /// Refuse to convert once a decoder-not-found diagnosis is recorded
    pub block_unsupported: bool,
    /// Encoding policy for the transcode command
    pub transcode: TranscodePolicy,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ConverterConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            work_dir: None,
            accepted_extensions: vec!["mkv".to_string()],
            block_unsupported: true,
            transcode: TranscodePolicy::default(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    /// Check whether a display name carries one of the accepted extensions
    pub fn accepts(&self, display_name: &str) -> bool {
        let ext = Path::new(display_name)
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());

        match ext {
            Some(ext) => self.accepted_extensions.iter().any(|a| a.eq_ignore_ascii_case(&ext)),
            None => false,
        }
    }
}
