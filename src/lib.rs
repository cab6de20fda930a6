//! Ad-removal processing pipeline for podcast episodes.
//!
//! The [`Processor`] turns a raw episode into an advertisement-free one in
//! four stages: download the source audio, obtain a duration-validated
//! transcript, classify transcript chunks with an LLM, and render the cut
//! audio with crossfades. All durable state lives in SQLite behind a
//! single-writer actor; feed discovery, auth, and serving are the caller's
//! problem.

pub mod audio;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod pipeline;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub use config::Config;
pub use db::{Database, WriteAction, Writer};
pub use error::PipelineError;
pub use pipeline::ProcessingStatus;

use db::models::{Episode, EpisodeStatus, JobStatus, ProcessingJob};
use llm::LlmClient;
use pipeline::{run_job, status_for, JobContext};

/// Initialize env-filtered logging (`RUST_LOG`), for binaries and tests.
/// Safe to call more than once.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

struct ActiveJob {
    job_id: i64,
    cancel: CancellationToken,
}

/// Entry point for collaborators: owns the writer actor, the LLM client and
/// the registry of in-flight jobs, and guarantees at most one active job per
/// episode.
pub struct Processor {
    db: Arc<Database>,
    writer: Writer,
    config: Arc<Config>,
    llm: Arc<LlmClient>,
    active: Arc<Mutex<HashMap<i64, ActiveJob>>>,
}

impl Processor {
    /// Validate the configuration, spawn the persistence actor, and recover
    /// jobs a previous process left mid-run.
    pub async fn new(config: Config, db: Arc<Database>) -> Result<Self, PipelineError> {
        config.validate()?;
        let llm = Arc::new(LlmClient::new(&config.llm)?);
        let writer = Writer::spawn(db.clone());
        writer.perform(WriteAction::ResetStuckJobs).await?;
        Ok(Self {
            db,
            writer,
            config: Arc::new(config),
            llm,
            active: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Handle to the persistence actor, for collaborators with their own
    /// housekeeping writes (e.g. storage reclamation).
    pub fn writer(&self) -> &Writer {
        &self.writer
    }

    /// Start processing an episode, or report the job already covering it.
    ///
    /// Idempotent: a second call while a job is queued/running returns that
    /// job's status instead of creating another row, and a completed episode
    /// reports completed until [`Processor::reprocess`] clears it.
    pub async fn start_processing(
        &self,
        episode_id: i64,
    ) -> Result<ProcessingStatus, PipelineError> {
        let mut active = self.active.lock().await;

        let episode = self.require_episode(episode_id)?;
        if !episode.whitelisted {
            return Err(PipelineError::NotWhitelisted);
        }

        // Coalesce onto the job this process is already running.
        if let Some(entry) = active.get(&episode_id) {
            if let Some(job) = self.db.get_job(entry.job_id)? {
                if !job.status.is_terminal() {
                    return Ok(status_for(&job, &episode));
                }
            }
            active.remove(&episode_id);
        }

        // A queued job left by a crashed process is adopted, not duplicated.
        let job = match self.db.get_active_job(episode_id)? {
            Some(job) => job,
            None => {
                if episode.status == EpisodeStatus::Completed && episode.processed_path.is_some() {
                    if let Some(latest) = self.db.get_latest_job(episode_id)? {
                        if latest.status == JobStatus::Completed {
                            return Ok(status_for(&latest, &episode));
                        }
                    }
                }
                self.writer
                    .perform(WriteAction::CreateJob { episode_id })
                    .await?
                    .job()
                    .ok_or_else(|| {
                        PipelineError::Database("create_job returned no job".into())
                    })?
            }
        };

        let status = status_for(&job, &episode);
        self.spawn_job(&mut active, job);
        Ok(status)
    }

    /// Polling endpoint: last known stage and message for the episode.
    pub async fn get_status(&self, episode_id: i64) -> Result<ProcessingStatus, PipelineError> {
        let episode = self.require_episode(episode_id)?;
        match self.db.get_latest_job(episode_id)? {
            Some(job) => Ok(status_for(&job, &episode)),
            None => Ok(ProcessingStatus {
                status: JobStatus::Queued,
                step: 1,
                step_name: "downloading".to_string(),
                total_steps: db::models::TOTAL_STEPS,
                message: Some("episode has not been processed".to_string()),
                download_url: None,
            }),
        }
    }

    /// Clear prior processing artifacts and restart from stage 1.
    ///
    /// Refused while a job is active; cancel it first. The cached
    /// transcript survives the clear; the transcription stage revalidates it
    /// against the audio and reuses it if the file is unchanged.
    pub async fn reprocess(&self, episode_id: i64) -> Result<ProcessingStatus, PipelineError> {
        {
            let active = self.active.lock().await;
            let running_here = active.contains_key(&episode_id);
            if running_here || self.db.get_active_job(episode_id)?.is_some() {
                return Err(PipelineError::AlreadyRunning);
            }
        }
        self.writer
            .perform(WriteAction::ClearProcessingArtifacts { episode_id })
            .await?;
        self.start_processing(episode_id).await
    }

    /// Mark the episode's running job for cancellation. The orchestrator
    /// honors the flag at the next stage boundary.
    pub async fn cancel(&self, episode_id: i64) -> Result<(), PipelineError> {
        let active = self.active.lock().await;
        if let Some(entry) = active.get(&episode_id) {
            entry.cancel.cancel();
            return Ok(());
        }
        drop(active);
        // A queued job from a previous process can be cancelled directly.
        if let Some(job) = self.db.get_active_job(episode_id)? {
            self.writer
                .perform(WriteAction::CancelJob { job_id: job.id })
                .await?;
            return Ok(());
        }
        Err(PipelineError::NotFound(format!(
            "no active job for episode {}",
            episode_id
        )))
    }

    fn require_episode(&self, episode_id: i64) -> Result<Episode, PipelineError> {
        self.db
            .get_episode(episode_id)?
            .ok_or_else(|| PipelineError::NotFound(format!("episode {}", episode_id)))
    }

    fn spawn_job(&self, active: &mut HashMap<i64, ActiveJob>, job: ProcessingJob) {
        let episode_id = job.episode_id;
        let cancel = CancellationToken::new();
        active.insert(
            episode_id,
            ActiveJob {
                job_id: job.id,
                cancel: cancel.clone(),
            },
        );

        let ctx = JobContext {
            db: self.db.clone(),
            writer: self.writer.clone(),
            config: self.config.clone(),
            llm: self.llm.clone(),
        };
        let registry = self.active.clone();
        tokio::spawn(async move {
            run_job(&ctx, job, cancel).await;
            registry.lock().await.remove(&episode_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::NewEpisode;
    use tempfile::TempDir;

    async fn setup() -> (Processor, Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&temp_dir.path().join("test.db")).unwrap());
        let mut config = Config::default();
        config.storage.episodes_dir = temp_dir.path().join("episodes");
        config.storage.processed_dir = temp_dir.path().join("processed");
        let processor = Processor::new(config, db.clone()).await.unwrap();
        (processor, db, temp_dir)
    }

    fn insert_episode(db: &Database, whitelisted: bool) -> i64 {
        db.insert_episode(&NewEpisode {
            title: "Test Episode".into(),
            // Nothing listens here; the download stage fails and retries,
            // keeping the job running long enough to observe.
            audio_url: "http://127.0.0.1:1/audio.mp3".into(),
            whitelisted,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn start_processing_unknown_episode_is_not_found() {
        let (processor, _db, _temp) = setup().await;
        assert!(matches!(
            processor.start_processing(999).await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn start_processing_requires_whitelist() {
        let (processor, db, _temp) = setup().await;
        let episode_id = insert_episode(&db, false);
        assert!(matches!(
            processor.start_processing(episode_id).await,
            Err(PipelineError::NotWhitelisted)
        ));
        // Fatal at job start: no job row was created.
        assert!(db.get_latest_job(episode_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn second_start_coalesces_onto_running_job() {
        let (processor, db, _temp) = setup().await;
        let episode_id = insert_episode(&db, true);

        let first = processor.start_processing(episode_id).await.unwrap();
        let second = processor.start_processing(episode_id).await.unwrap();

        assert!(!first.status.is_terminal());
        assert!(!second.status.is_terminal());

        // One job row, not two.
        let job = db.get_active_job(episode_id).unwrap().unwrap();
        let latest = db.get_latest_job(episode_id).unwrap().unwrap();
        assert_eq!(job.id, latest.id);
    }

    #[tokio::test]
    async fn get_status_without_job_reports_unprocessed() {
        let (processor, db, _temp) = setup().await;
        let episode_id = insert_episode(&db, true);
        let status = processor.get_status(episode_id).await.unwrap();
        assert_eq!(status.step, 1);
        assert_eq!(status.total_steps, 4);
        assert!(status.download_url.is_none());
    }

    #[tokio::test]
    async fn reprocess_is_refused_while_job_active() {
        let (processor, db, _temp) = setup().await;
        let episode_id = insert_episode(&db, true);
        processor.start_processing(episode_id).await.unwrap();
        assert!(matches!(
            processor.reprocess(episode_id).await,
            Err(PipelineError::AlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn cancel_without_active_job_is_not_found() {
        let (processor, db, _temp) = setup().await;
        let episode_id = insert_episode(&db, true);
        assert!(matches!(
            processor.cancel(episode_id).await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_flags_running_job() {
        let (processor, db, _temp) = setup().await;
        let episode_id = insert_episode(&db, true);
        processor.start_processing(episode_id).await.unwrap();
        processor.cancel(episode_id).await.unwrap();
        // The token is set; the orchestrator will transition the job at its
        // next stage boundary. The active registry entry is still present
        // until the job task observes the flag.
        assert!(processor.active.lock().await.contains_key(&episode_id));
    }
}
