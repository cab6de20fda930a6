//! YAML configuration for the processing pipeline.
//!
//! Loaded once at startup and validated before any job starts, so a bad
//! model identifier or a zero timeout fails immediately instead of after an
//! episode has been half-processed.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::PipelineError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub transcription: TranscriptionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Transcript segments submitted per classification call.
    #[serde(default = "default_chunk_size")]
    pub num_segments_to_input_to_prompt: usize,
    /// Optional override for the built-in classification system prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Crossfade applied at every cut point, in milliseconds.
    #[serde(default = "default_fade_ms")]
    pub fade_ms: u64,
    /// Ad spans closer together than this are merged into one block.
    #[serde(
        default = "default_min_separation",
        alias = "min_ad_segment_separation_seconds"
    )]
    pub min_ad_segement_separation_seconds: f64,
    /// Merged blocks shorter than this are dropped from the cut list.
    #[serde(default = "default_min_length")]
    pub min_ad_segment_length_seconds: f64,
    /// Blocks with any contributing identification below this are kept as content.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default = "default_llm_base_url")]
    pub llm_base_url: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_llm_timeout")]
    pub llm_timeout_seconds: u64,
    #[serde(default = "default_llm_max_tokens")]
    pub llm_max_tokens: u32,
    #[serde(default = "default_llm_concurrency")]
    pub llm_max_concurrent_calls: usize,
    #[serde(default = "default_retry_attempts")]
    pub llm_max_retry_attempts: u32,
    /// Optional input-token budget per minute; unset means unthrottled.
    #[serde(default)]
    pub llm_max_input_tokens_per_minute: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionBackendKind {
    WhisperCli,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    #[serde(default = "default_transcription_backend")]
    pub backend: TranscriptionBackendKind,
    #[serde(default = "default_whisper_cli_path")]
    pub whisper_cli_path: PathBuf,
    #[serde(default)]
    pub whisper_model_path: Option<PathBuf>,
    #[serde(default = "default_remote_base_url")]
    pub remote_base_url: String,
    #[serde(default)]
    pub remote_api_key: Option<String>,
    #[serde(default = "default_remote_model")]
    pub remote_model: String,
    #[serde(default = "default_transcription_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_retry_attempts")]
    pub max_retry_attempts: u32,
    /// A cached transcript is reused only if the stored episode duration is
    /// within this many seconds of the duration probed from the audio file.
    #[serde(default = "default_duration_tolerance")]
    pub duration_tolerance_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for downloaded source audio.
    #[serde(default = "default_episodes_dir")]
    pub episodes_dir: PathBuf,
    /// Directory for rendered ad-free audio.
    #[serde(default = "default_processed_dir")]
    pub processed_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Per-stage retry ceiling before the job is failed.
    #[serde(default = "default_stage_retries")]
    pub max_stage_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_download_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_retry_attempts")]
    pub max_retry_attempts: u32,
}

impl Config {
    /// Load and validate a YAML config file.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Config = serde_yaml::from_str(&text)
            .map_err(|e| PipelineError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Fail fast on values that would otherwise surface mid-job.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.processing.num_segments_to_input_to_prompt == 0 {
            return Err(PipelineError::Config(
                "processing.num_segments_to_input_to_prompt must be at least 1".into(),
            ));
        }
        if self.llm.llm_model.trim().is_empty() {
            return Err(PipelineError::Config("llm.llm_model must not be empty".into()));
        }
        if self.llm.llm_max_concurrent_calls == 0 {
            return Err(PipelineError::Config(
                "llm.llm_max_concurrent_calls must be at least 1".into(),
            ));
        }
        if self.llm.llm_timeout_seconds == 0 {
            return Err(PipelineError::Config(
                "llm.llm_timeout_seconds must be nonzero".into(),
            ));
        }
        if let Some(budget) = self.llm.llm_max_input_tokens_per_minute {
            if budget == 0 {
                return Err(PipelineError::Config(
                    "llm.llm_max_input_tokens_per_minute must be nonzero when set".into(),
                ));
            }
        }
        if self.output.min_confidence < 0.0 || self.output.min_confidence > 1.0 {
            return Err(PipelineError::Config(
                "output.min_confidence must be within 0..=1".into(),
            ));
        }
        if self.output.min_ad_segement_separation_seconds < 0.0
            || self.output.min_ad_segment_length_seconds < 0.0
        {
            return Err(PipelineError::Config(
                "output thresholds must not be negative".into(),
            ));
        }
        if self.transcription.duration_tolerance_seconds < 0.0 {
            return Err(PipelineError::Config(
                "transcription.duration_tolerance_seconds must not be negative".into(),
            ));
        }
        if self.transcription.backend == TranscriptionBackendKind::Remote
            && self.transcription.remote_model.trim().is_empty()
        {
            return Err(PipelineError::Config(
                "transcription.remote_model must not be empty".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            num_segments_to_input_to_prompt: default_chunk_size(),
            system_prompt: None,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            fade_ms: default_fade_ms(),
            min_ad_segement_separation_seconds: default_min_separation(),
            min_ad_segment_length_seconds: default_min_length(),
            min_confidence: default_min_confidence(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            llm_model: default_llm_model(),
            llm_base_url: default_llm_base_url(),
            llm_api_key: None,
            llm_timeout_seconds: default_llm_timeout(),
            llm_max_tokens: default_llm_max_tokens(),
            llm_max_concurrent_calls: default_llm_concurrency(),
            llm_max_retry_attempts: default_retry_attempts(),
            llm_max_input_tokens_per_minute: None,
        }
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            backend: default_transcription_backend(),
            whisper_cli_path: default_whisper_cli_path(),
            whisper_model_path: None,
            remote_base_url: default_remote_base_url(),
            remote_api_key: None,
            remote_model: default_remote_model(),
            timeout_seconds: default_transcription_timeout(),
            max_retry_attempts: default_retry_attempts(),
            duration_tolerance_seconds: default_duration_tolerance(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            episodes_dir: default_episodes_dir(),
            processed_dir: default_processed_dir(),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_stage_retries: default_stage_retries(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_download_timeout(),
            connect_timeout_seconds: default_connect_timeout(),
            max_retry_attempts: default_retry_attempts(),
        }
    }
}

fn default_chunk_size() -> usize {
    30
}
fn default_fade_ms() -> u64 {
    3000
}
fn default_min_separation() -> f64 {
    60.0
}
fn default_min_length() -> f64 {
    14.0
}
fn default_min_confidence() -> f64 {
    0.8
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_timeout() -> u64 {
    120
}
fn default_llm_max_tokens() -> u32 {
    2048
}
fn default_llm_concurrency() -> usize {
    4
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_transcription_backend() -> TranscriptionBackendKind {
    TranscriptionBackendKind::WhisperCli
}
fn default_whisper_cli_path() -> PathBuf {
    PathBuf::from("whisper-cli")
}
fn default_remote_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_remote_model() -> String {
    "whisper-1".to_string()
}
fn default_transcription_timeout() -> u64 {
    600
}
fn default_duration_tolerance() -> f64 {
    1.0
}
fn default_episodes_dir() -> PathBuf {
    PathBuf::from("episodes")
}
fn default_processed_dir() -> PathBuf {
    PathBuf::from("processed")
}
fn default_stage_retries() -> u32 {
    2
}
fn default_download_timeout() -> u64 {
    600
}
fn default_connect_timeout() -> u64 {
    30
}
fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}
fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn parses_partial_yaml() {
        let yaml = r#"
processing:
  num_segments_to_input_to_prompt: 25
output:
  fade_ms: 1500
  min_ad_segement_separation_seconds: 45
llm:
  llm_model: "qwen2.5:14b"
  llm_base_url: "http://localhost:11434/v1"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.processing.num_segments_to_input_to_prompt, 25);
        assert_eq!(config.output.fade_ms, 1500);
        assert_eq!(config.output.min_ad_segement_separation_seconds, 45.0);
        // Untouched sections keep defaults
        assert_eq!(config.output.min_ad_segment_length_seconds, 14.0);
        assert_eq!(config.llm.llm_model, "qwen2.5:14b");
        assert_eq!(config.jobs.max_stage_retries, 2);
    }

    #[test]
    fn accepts_corrected_separation_key_spelling() {
        let yaml = r#"
output:
  min_ad_segment_separation_seconds: 30
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.output.min_ad_segement_separation_seconds, 30.0);
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let yaml = r#"
processing:
  num_segments_to_input_to_prompt: 0
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let yaml = r#"
output:
  min_confidence: 1.5
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_model() {
        let yaml = r#"
llm:
  llm_model: "  "
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
