use serde::{Deserialize, Serialize};

/// Episode-level processing status, mirrored from the latest job so list
/// views never need a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl Default for EpisodeStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for EpisodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Queued => write!(f, "queued"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl From<String> for EpisodeStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "queued" => Self::Queued,
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Overall status of one processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl JobStatus {
    /// Terminal jobs never change again; a new attempt gets a new row.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            "skipped" => Self::Skipped,
            _ => Self::Queued,
        }
    }
}

/// The four ordered pipeline stages tracked per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Downloading,
    Transcribing,
    Identifying,
    Rendering,
}

pub const TOTAL_STEPS: u32 = 4;

impl JobStage {
    pub fn step(&self) -> u32 {
        match self {
            Self::Downloading => 1,
            Self::Transcribing => 2,
            Self::Identifying => 3,
            Self::Rendering => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Downloading => "downloading",
            Self::Transcribing => "transcribing",
            Self::Identifying => "identifying",
            Self::Rendering => "rendering",
        }
    }

    pub fn from_step(step: u32) -> Self {
        match step {
            2 => Self::Transcribing,
            3 => Self::Identifying,
            4 => Self::Rendering,
            _ => Self::Downloading,
        }
    }

    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Downloading => Some(Self::Transcribing),
            Self::Transcribing => Some(Self::Identifying),
            Self::Identifying => Some(Self::Rendering),
            Self::Rendering => None,
        }
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    pub title: String,
    pub audio_url: String,
    pub whitelisted: bool,
    /// Seconds, probed from the downloaded file; None until first download.
    pub duration: Option<f64>,
    pub status: EpisodeStatus,
    pub unprocessed_path: Option<String>,
    pub processed_path: Option<String>,
    pub created_date: String,
    pub downloaded_date: Option<String>,
    pub processed_date: Option<String>,
}

/// Episode fields supplied by the feed collaborator at discovery time.
#[derive(Debug, Clone)]
pub struct NewEpisode {
    pub title: String,
    pub audio_url: String,
    pub whitelisted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub id: i64,
    pub episode_id: i64,
    pub stage: JobStage,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Segment-level ad/content verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdLabel {
    Content,
    Ad,
}

impl std::fmt::Display for AdLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Content => write!(f, "content"),
            Self::Ad => write!(f, "ad"),
        }
    }
}

impl AdLabel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ad" | "advertisement" => Some(Self::Ad),
            "content" => Some(Self::Content),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub id: i64,
    pub episode_id: i64,
    /// Strictly increasing and gapless within an episode, starting at 0.
    pub sequence: i64,
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
    pub label: Option<AdLabel>,
    pub mixed: bool,
}

#[derive(Debug, Clone)]
pub struct NewSegment {
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCallStatus {
    Pending,
    Success,
    Failed,
}

impl std::fmt::Display for ModelCallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl From<String> for ModelCallStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "success" => Self::Success,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// One classification request; append-only audit trail. Only retry
/// bookkeeping touches the row between creation and its terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCall {
    pub id: i64,
    pub episode_id: i64,
    pub first_sequence: i64,
    pub last_sequence: i64,
    pub model: String,
    pub prompt: String,
    pub response: Option<String>,
    pub status: ModelCallStatus,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: String,
}

/// One per-segment result derived from a model call. Append-only; the
/// segment's primary label is the latest accepted identification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identification {
    pub id: i64,
    pub segment_id: i64,
    pub model_call_id: i64,
    pub label: AdLabel,
    pub confidence: f64,
    pub mixed: bool,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewIdentification {
    pub segment_id: i64,
    pub model_call_id: i64,
    pub label: AdLabel,
    pub confidence: f64,
    pub mixed: bool,
}
