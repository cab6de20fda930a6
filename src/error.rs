use thiserror::Error;

/// Typed error hierarchy for the processing pipeline.
///
/// Stage code propagates these with `?`; the orchestrator decides whether a
/// failure is worth another attempt via [`PipelineError::is_retryable`].
/// Messages are human-readable because the failing variant's text ends up on
/// the ProcessingJob row and in the status surface.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Io(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("transcription failed: {0}")]
    Transcription(String),

    #[error("classification failed: {0}")]
    Classification(String),

    #[error("render failed: {0}")]
    Render(String),

    /// Source audio missing, unreadable, or of undeterminable duration.
    #[error("audio error: {0}")]
    Audio(String),

    #[error("episode is not whitelisted for processing")]
    NotWhitelisted,

    #[error("a processing job is already active for this episode")]
    AlreadyRunning,

    #[error("processing cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Whether the orchestrator may retry the current stage after this error.
    ///
    /// Upstream trouble (network, backend, subprocess) is retryable; bad
    /// configuration, missing records, and cancellation are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Download(_)
                | PipelineError::Transcription(_)
                | PipelineError::Classification(_)
                | PipelineError::Render(_)
                | PipelineError::Io(_)
        )
    }
}

// ── From impls ─────────────────────────────────────────────────────────────

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        PipelineError::Database(e.to_string())
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::Database(e.to_string())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Io(e.to_string())
    }
}
