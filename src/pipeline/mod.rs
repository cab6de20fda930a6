//! Job orchestration: drives one episode through the four processing stages.
//!
//! The orchestrator owns the episode's job record for the lifetime of the
//! run. Stage code reports plain `Result`s; this module decides what is
//! retryable, what fails the job, and where cancellation may interrupt:
//! only ever at stage boundaries, never mid-call.

pub mod chunk;
pub mod classify;
pub mod download;
pub mod render;
pub mod resolve;
pub mod transcribe;

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db::models::{Episode, JobStage, JobStatus, ProcessingJob, TOTAL_STEPS};
use crate::db::{Database, WriteAction, Writer};
use crate::error::PipelineError;
use crate::llm::LlmClient;
use crate::pipeline::download::DownloadedAudio;

/// Progress shape exposed for external polling.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingStatus {
    pub status: JobStatus,
    pub step: u32,
    pub step_name: String,
    pub total_steps: u32,
    pub message: Option<String>,
    pub download_url: Option<String>,
}

/// Build the polling view of a job. Never exposes a raw error chain; the
/// message is whatever human-readable text the failing stage attached.
pub fn status_for(job: &ProcessingJob, episode: &Episode) -> ProcessingStatus {
    let message = match job.status {
        JobStatus::Failed => job.error_message.clone(),
        JobStatus::Completed => Some("processing complete".to_string()),
        JobStatus::Cancelled => Some("processing cancelled".to_string()),
        JobStatus::Skipped => Some("episode not whitelisted, processing skipped".to_string()),
        JobStatus::Queued => Some("waiting to start".to_string()),
        JobStatus::Running => Some(format!(
            "{} (step {} of {})",
            job.stage.name(),
            job.stage.step(),
            TOTAL_STEPS
        )),
    };
    ProcessingStatus {
        status: job.status,
        step: job.stage.step(),
        step_name: job.stage.name().to_string(),
        total_steps: TOTAL_STEPS,
        message,
        download_url: match job.status {
            JobStatus::Completed => episode.processed_path.clone(),
            _ => None,
        },
    }
}

/// Everything a job run borrows from the processor.
pub(crate) struct JobContext {
    pub db: Arc<Database>,
    pub writer: Writer,
    pub config: Arc<Config>,
    pub llm: Arc<LlmClient>,
}

/// Drive `job` to a terminal status. All outcomes, including failure and
/// cancellation, are recorded through the writer before this returns.
pub(crate) async fn run_job(ctx: &JobContext, job: ProcessingJob, cancel: CancellationToken) {
    let job_id = job.id;
    let episode_id = job.episode_id;
    if let Err(e) = drive_stages(ctx, job, &cancel).await {
        log::error!(
            "Job {} for episode {} ended with error: {}",
            job_id,
            episode_id,
            e
        );
        // Stage failures are written terminal by drive_stages itself; this
        // covers errors that escaped it (e.g. a failed read), so no job is
        // ever left behind in running.
        if let Ok(Some(current)) = ctx.db.get_job(job_id) {
            if !current.status.is_terminal() {
                let _ = ctx
                    .writer
                    .perform(WriteAction::FailJob {
                        job_id,
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    }
}

async fn drive_stages(
    ctx: &JobContext,
    job: ProcessingJob,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    let db = &ctx.db;
    let writer = &ctx.writer;
    let config = &ctx.config;

    // The episode row as it stood before this run: its recorded duration is
    // what the transcript staleness check compares against.
    let episode_at_start = match db.get_episode(job.episode_id)? {
        Some(episode) => episode,
        None => {
            let message = format!("episode {} no longer exists", job.episode_id);
            writer
                .perform(WriteAction::FailJob {
                    job_id: job.id,
                    message: message.clone(),
                })
                .await?;
            return Err(PipelineError::NotFound(message));
        }
    };

    writer.perform(WriteAction::StartJob { job_id: job.id }).await?;
    log::info!(
        "Job {} for episode {} running from stage {}",
        job.id,
        job.episode_id,
        job.stage
    );

    let mut stage = job.stage;
    let mut audio: Option<DownloadedAudio> = None;

    loop {
        // Stage boundary: cancellation and whitelist are re-checked before
        // any further external calls are issued.
        if cancel.is_cancelled() {
            writer.perform(WriteAction::CancelJob { job_id: job.id }).await?;
            log::info!("Job {} cancelled at stage {}", job.id, stage);
            return Ok(());
        }
        let episode = db
            .get_episode(job.episode_id)?
            .ok_or_else(|| PipelineError::NotFound(format!("episode {}", job.episode_id)))?;
        if !episode.whitelisted {
            writer.perform(WriteAction::SkipJob { job_id: job.id }).await?;
            log::info!(
                "Job {} skipped: episode {} is no longer whitelisted",
                job.id,
                job.episode_id
            );
            return Ok(());
        }

        match run_stage(ctx, stage, &episode_at_start, &episode, &mut audio).await {
            Ok(()) => match stage.next() {
                Some(next_stage) => {
                    writer
                        .perform(WriteAction::AdvanceJobStage {
                            job_id: job.id,
                            stage: next_stage,
                        })
                        .await?;
                    stage = next_stage;
                }
                None => {
                    writer.perform(WriteAction::CompleteJob { job_id: job.id }).await?;
                    log::info!("Job {} for episode {} completed", job.id, job.episode_id);
                    return Ok(());
                }
            },
            Err(e) if e.is_retryable() => {
                writer
                    .submit(WriteAction::LogPipelineError {
                        stage: stage.name().to_string(),
                        episode_id: Some(job.episode_id),
                        error_kind: "retryable".to_string(),
                        message: e.to_string(),
                    })
                    .await;
                let retries = writer
                    .perform(WriteAction::BumpJobRetry { job_id: job.id })
                    .await?
                    .count() as u32;
                if retries > config.jobs.max_stage_retries {
                    let message = e.to_string();
                    writer
                        .perform(WriteAction::FailJob {
                            job_id: job.id,
                            message: message.clone(),
                        })
                        .await?;
                    return Err(e);
                }
                log::warn!(
                    "Job {} stage {} attempt {} failed, retrying: {}",
                    job.id,
                    stage,
                    retries,
                    e
                );
            }
            Err(e) => {
                writer
                    .submit(WriteAction::LogPipelineError {
                        stage: stage.name().to_string(),
                        episode_id: Some(job.episode_id),
                        error_kind: "fatal".to_string(),
                        message: e.to_string(),
                    })
                    .await;
                writer
                    .perform(WriteAction::FailJob {
                        job_id: job.id,
                        message: e.to_string(),
                    })
                    .await?;
                return Err(e);
            }
        }
    }
}

async fn run_stage(
    ctx: &JobContext,
    stage: JobStage,
    episode_at_start: &Episode,
    episode: &Episode,
    audio: &mut Option<DownloadedAudio>,
) -> Result<(), PipelineError> {
    match stage {
        JobStage::Downloading => {
            *audio = Some(download::run(&ctx.writer, &ctx.config, episode).await?);
            Ok(())
        }
        JobStage::Transcribing => {
            let downloaded = ensure_audio(ctx, episode, audio).await?;
            transcribe::run(&ctx.db, &ctx.writer, &ctx.config, episode_at_start, downloaded)
                .await?;
            Ok(())
        }
        JobStage::Identifying => {
            classify::run(&ctx.db, &ctx.writer, &ctx.llm, &ctx.config, episode.id).await
        }
        JobStage::Rendering => {
            let downloaded = ensure_audio(ctx, episode, audio).await?;
            render::run(&ctx.db, &ctx.writer, &ctx.config, episode.id, downloaded).await?;
            Ok(())
        }
    }
}

/// Audio is produced by stage 1, but a job recovered mid-run starts at a
/// later stage; rebuild the handle from the persisted path in that case.
async fn ensure_audio<'a>(
    ctx: &JobContext,
    episode: &Episode,
    audio: &'a mut Option<DownloadedAudio>,
) -> Result<&'a DownloadedAudio, PipelineError> {
    if audio.is_none() {
        let path = episode
            .unprocessed_path
            .as_ref()
            .filter(|p| Path::new(p).exists())
            .ok_or_else(|| {
                PipelineError::Audio(format!(
                    "episode {} has no source audio on disk",
                    episode.id
                ))
            })?;
        let path = std::path::PathBuf::from(path);
        let duration = crate::audio::probe_duration(&ctx.config.ffprobe_path, &path).await?;
        *audio = Some(DownloadedAudio { path, duration });
    }
    Ok(audio.as_ref().unwrap())
}
