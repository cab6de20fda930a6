//! Single-writer persistence actor.
//!
//! Every durable mutation in the pipeline is a named [`WriteAction`]
//! submitted to one dedicated task that owns the mutating side of the
//! database. Actions apply strictly one at a time in submission order, so
//! concurrent workers never race on shared rows and no caller manages locks
//! or transactions itself. Reads stay on the caller's thread; WAL mode
//! allows them alongside the writer.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};

use crate::db::models::{JobStage, NewIdentification, NewSegment, ProcessingJob};
use crate::db::Database;
use crate::error::PipelineError;

/// A named, serializable state mutation.
#[derive(Debug)]
pub enum WriteAction {
    CreateJob {
        episode_id: i64,
    },
    StartJob {
        job_id: i64,
    },
    AdvanceJobStage {
        job_id: i64,
        stage: JobStage,
    },
    CompleteJob {
        job_id: i64,
    },
    FailJob {
        job_id: i64,
        message: String,
    },
    CancelJob {
        job_id: i64,
    },
    SkipJob {
        job_id: i64,
    },
    BumpJobRetry {
        job_id: i64,
    },
    ResetStuckJobs,
    SetEpisodeDuration {
        episode_id: i64,
        duration: f64,
    },
    MarkDownloaded {
        episode_id: i64,
        path: String,
    },
    MarkProcessed {
        episode_id: i64,
        path: String,
    },
    ReplaceTranscript {
        episode_id: i64,
        segments: Vec<NewSegment>,
    },
    CreateModelCall {
        episode_id: i64,
        first_sequence: i64,
        last_sequence: i64,
        model: String,
        prompt: String,
    },
    FinishModelCallSuccess {
        model_call_id: i64,
        response: String,
    },
    FinishModelCallFailure {
        model_call_id: i64,
        error: String,
    },
    BumpModelCallRetry {
        model_call_id: i64,
    },
    RecordIdentifications {
        items: Vec<NewIdentification>,
    },
    ClearProcessingArtifacts {
        episode_id: i64,
    },
    CleanupProcessedFilesOnly {
        episode_id: i64,
    },
    CleanupAllFiles {
        episode_id: i64,
    },
    LogPipelineError {
        stage: String,
        episode_id: Option<i64>,
        error_kind: String,
        message: String,
    },
    SetSetting {
        key: String,
        value: String,
    },
}

impl WriteAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateJob { .. } => "create_job",
            Self::StartJob { .. } => "start_job",
            Self::AdvanceJobStage { .. } => "advance_job_stage",
            Self::CompleteJob { .. } => "complete_job",
            Self::FailJob { .. } => "fail_job",
            Self::CancelJob { .. } => "cancel_job",
            Self::SkipJob { .. } => "skip_job",
            Self::BumpJobRetry { .. } => "bump_job_retry",
            Self::ResetStuckJobs => "reset_stuck_jobs",
            Self::SetEpisodeDuration { .. } => "set_episode_duration",
            Self::MarkDownloaded { .. } => "mark_downloaded",
            Self::MarkProcessed { .. } => "mark_processed",
            Self::ReplaceTranscript { .. } => "replace_transcript",
            Self::CreateModelCall { .. } => "record_model_call",
            Self::FinishModelCallSuccess { .. } => "finish_model_call_success",
            Self::FinishModelCallFailure { .. } => "finish_model_call_failure",
            Self::BumpModelCallRetry { .. } => "bump_model_call_retry",
            Self::RecordIdentifications { .. } => "record_identifications",
            Self::ClearProcessingArtifacts { .. } => "clear_processing_artifacts",
            Self::CleanupProcessedFilesOnly { .. } => "cleanup_processed_files_only",
            Self::CleanupAllFiles { .. } => "cleanup_all_files",
            Self::LogPipelineError { .. } => "log_pipeline_error",
            Self::SetSetting { .. } => "set_setting",
        }
    }
}

/// Result of an applied action, for callers that wait.
#[derive(Debug)]
pub enum WriteOutcome {
    Unit,
    Id(i64),
    Count(usize),
    Job(ProcessingJob),
}

impl WriteOutcome {
    pub fn id(self) -> i64 {
        match self {
            Self::Id(id) => id,
            Self::Job(job) => job.id,
            _ => 0,
        }
    }

    pub fn count(self) -> usize {
        match self {
            Self::Count(count) => count,
            _ => 0,
        }
    }

    pub fn job(self) -> Option<ProcessingJob> {
        match self {
            Self::Job(job) => Some(job),
            _ => None,
        }
    }
}

struct WriteRequest {
    action: WriteAction,
    reply: Option<oneshot::Sender<Result<WriteOutcome>>>,
}

/// Handle to the persistence actor. Cheap to clone; all clones feed the
/// same ordered queue.
#[derive(Clone)]
pub struct Writer {
    tx: mpsc::Sender<WriteRequest>,
}

impl Writer {
    /// Spawn the actor task that owns all mutation of `db`.
    pub fn spawn(db: Arc<Database>) -> Self {
        let (tx, mut rx) = mpsc::channel::<WriteRequest>(64);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let name = request.action.name();
                let result = apply(&db, request.action);
                if let Err(e) = &result {
                    log::warn!("write action {} failed: {}", name, e);
                }
                if let Some(reply) = request.reply {
                    // Receiver may have given up waiting; that's fine.
                    let _ = reply.send(result);
                }
            }
            log::info!("Persistence writer stopped");
        });
        Self { tx }
    }

    /// Submit an action and wait for its result.
    pub async fn perform(&self, action: WriteAction) -> Result<WriteOutcome, PipelineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WriteRequest {
                action,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| PipelineError::Database("persistence writer is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| PipelineError::Database("persistence writer dropped reply".into()))?
            .map_err(|e| PipelineError::Database(e.to_string()))
    }

    /// Fire-and-forget submission for non-critical housekeeping; failures
    /// are logged by the actor.
    pub async fn submit(&self, action: WriteAction) {
        let _ = self
            .tx
            .send(WriteRequest {
                action,
                reply: None,
            })
            .await;
    }
}

fn apply(db: &Database, action: WriteAction) -> Result<WriteOutcome> {
    use WriteAction::*;
    match action {
        CreateJob { episode_id } => Ok(WriteOutcome::Job(db.create_job(episode_id)?)),
        StartJob { job_id } => db.start_job(job_id).map(|_| WriteOutcome::Unit),
        AdvanceJobStage { job_id, stage } => {
            db.advance_job_stage(job_id, stage).map(|_| WriteOutcome::Unit)
        }
        CompleteJob { job_id } => db.complete_job(job_id).map(|_| WriteOutcome::Unit),
        FailJob { job_id, message } => db.fail_job(job_id, &message).map(|_| WriteOutcome::Unit),
        CancelJob { job_id } => db.cancel_job(job_id).map(|_| WriteOutcome::Unit),
        SkipJob { job_id } => db.skip_job(job_id).map(|_| WriteOutcome::Unit),
        BumpJobRetry { job_id } => Ok(WriteOutcome::Count(db.bump_job_retry(job_id)? as usize)),
        ResetStuckJobs => Ok(WriteOutcome::Count(db.reset_stuck_jobs()?)),
        SetEpisodeDuration {
            episode_id,
            duration,
        } => db
            .set_episode_duration(episode_id, duration)
            .map(|_| WriteOutcome::Unit),
        MarkDownloaded { episode_id, path } => {
            db.mark_downloaded(episode_id, &path).map(|_| WriteOutcome::Unit)
        }
        MarkProcessed { episode_id, path } => {
            db.mark_processed(episode_id, &path).map(|_| WriteOutcome::Unit)
        }
        ReplaceTranscript {
            episode_id,
            segments,
        } => Ok(WriteOutcome::Count(
            db.replace_segments(episode_id, &segments)?,
        )),
        CreateModelCall {
            episode_id,
            first_sequence,
            last_sequence,
            model,
            prompt,
        } => Ok(WriteOutcome::Id(db.create_model_call(
            episode_id,
            first_sequence,
            last_sequence,
            &model,
            &prompt,
        )?)),
        FinishModelCallSuccess {
            model_call_id,
            response,
        } => db
            .finish_model_call_success(model_call_id, &response)
            .map(|_| WriteOutcome::Unit),
        FinishModelCallFailure {
            model_call_id,
            error,
        } => db
            .finish_model_call_failure(model_call_id, &error)
            .map(|_| WriteOutcome::Unit),
        BumpModelCallRetry { model_call_id } => Ok(WriteOutcome::Count(
            db.bump_model_call_retry(model_call_id)? as usize,
        )),
        RecordIdentifications { items } => {
            Ok(WriteOutcome::Count(db.record_identifications(&items)?))
        }
        ClearProcessingArtifacts { episode_id } => db
            .clear_processing_artifacts(episode_id)
            .map(|_| WriteOutcome::Unit),
        CleanupProcessedFilesOnly { episode_id } => db
            .clear_audio_paths(episode_id, true)
            .map(|_| WriteOutcome::Unit),
        CleanupAllFiles { episode_id } => db
            .clear_audio_paths(episode_id, false)
            .map(|_| WriteOutcome::Unit),
        LogPipelineError {
            stage,
            episode_id,
            error_kind,
            message,
        } => db
            .log_pipeline_error(&stage, episode_id, &error_kind, &message)
            .map(|_| WriteOutcome::Unit),
        SetSetting { key, value } => db.set_setting(&key, &value).map(|_| WriteOutcome::Unit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::NewEpisode;
    use tempfile::TempDir;

    fn setup() -> (Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).unwrap();
        (Arc::new(db), temp_dir)
    }

    fn insert_episode(db: &Database) -> i64 {
        db.insert_episode(&NewEpisode {
            title: "Episode 1".into(),
            audio_url: "https://example.com/ep1.mp3".into(),
            whitelisted: true,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn perform_waits_for_result() {
        let (db, _temp) = setup();
        let episode_id = insert_episode(&db);
        let writer = Writer::spawn(db.clone());

        let job = writer
            .perform(WriteAction::CreateJob { episode_id })
            .await
            .unwrap()
            .job()
            .unwrap();
        assert_eq!(job.episode_id, episode_id);

        // The row is visible to direct reads once perform returns.
        let active = db.get_active_job(episode_id).unwrap().unwrap();
        assert_eq!(active.id, job.id);
    }

    #[tokio::test]
    async fn perform_surfaces_action_errors() {
        let (db, _temp) = setup();
        let episode_id = insert_episode(&db);
        let writer = Writer::spawn(db.clone());

        writer
            .perform(WriteAction::CreateJob { episode_id })
            .await
            .unwrap();
        // Second active job for the same episode must be refused.
        let err = writer
            .perform(WriteAction::CreateJob { episode_id })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("active job"));
    }

    #[tokio::test]
    async fn actions_apply_in_submission_order() {
        let (db, _temp) = setup();
        let episode_id = insert_episode(&db);
        let writer = Writer::spawn(db.clone());

        for i in 0..20 {
            writer
                .submit(WriteAction::SetSetting {
                    key: "counter".into(),
                    value: i.to_string(),
                })
                .await;
        }
        // A waited action submitted last acts as a barrier.
        writer
            .perform(WriteAction::SetSetting {
                key: "done".into(),
                value: "yes".into(),
            })
            .await
            .unwrap();

        assert_eq!(db.get_setting("counter").unwrap().unwrap(), "19");
        assert_eq!(db.get_setting("done").unwrap().unwrap(), "yes");
    }

    #[tokio::test]
    async fn fire_and_forget_errors_do_not_propagate() {
        let (db, _temp) = setup();
        let writer = Writer::spawn(db.clone());

        // Nonexistent episode: the action fails inside the actor, the caller
        // never sees it.
        writer
            .submit(WriteAction::ClearProcessingArtifacts { episode_id: 9999 })
            .await;
        writer
            .perform(WriteAction::SetSetting {
                key: "alive".into(),
                value: "yes".into(),
            })
            .await
            .unwrap();
        assert_eq!(db.get_setting("alive").unwrap().unwrap(), "yes");
    }
}
