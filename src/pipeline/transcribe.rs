//! Stage 2: obtain a validated transcript for the episode.
//!
//! A transcript cached from an earlier run is reused only when the duration
//! recorded for the episode still matches the duration probed from the audio
//! file on disk. A changed source file silently invalidates every
//! timestamp, so a mismatch regenerates the whole segment set rather than
//! patching it.

use std::path::Path;
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;

use crate::config::{Config, TranscriptionBackendKind};
use crate::db::models::{Episode, NewSegment, TranscriptSegment};
use crate::db::{Database, WriteAction, Writer};
use crate::error::PipelineError;
use crate::pipeline::download::DownloadedAudio;

/// Outcome of the staleness check on a cached transcript.
#[derive(Debug, PartialEq, Eq)]
pub enum TranscriptDecision {
    Reuse,
    Regenerate(&'static str),
}

/// Decide whether a cached transcript still corresponds to the audio.
///
/// `recorded_duration` is the episode duration as persisted before this
/// job's download ran; `measured_duration` is freshly probed from the file.
pub fn evaluate_cache(
    segment_count: i64,
    recorded_duration: Option<f64>,
    measured_duration: f64,
    tolerance_seconds: f64,
) -> TranscriptDecision {
    if segment_count == 0 {
        return TranscriptDecision::Regenerate("no cached transcript");
    }
    let Some(recorded) = recorded_duration else {
        return TranscriptDecision::Regenerate("no recorded duration to validate against");
    };
    if (recorded - measured_duration).abs() > tolerance_seconds {
        return TranscriptDecision::Regenerate("audio duration changed beyond tolerance");
    }
    TranscriptDecision::Reuse
}

/// Produce the episode's ordered segment set, reusing the cached transcript
/// when the duration check allows it.
pub async fn run(
    db: &Database,
    writer: &Writer,
    config: &Config,
    episode: &Episode,
    audio: &DownloadedAudio,
) -> Result<Vec<TranscriptSegment>, PipelineError> {
    let cached_count = db.count_segments(episode.id)?;
    let decision = evaluate_cache(
        cached_count,
        episode.duration,
        audio.duration,
        config.transcription.duration_tolerance_seconds,
    );

    match decision {
        TranscriptDecision::Reuse => {
            log::info!(
                "Reusing cached transcript for episode {} ({} segments)",
                episode.id,
                cached_count
            );
            return Ok(db.get_segments(episode.id)?);
        }
        TranscriptDecision::Regenerate(reason) => {
            log::info!("Transcribing episode {}: {}", episode.id, reason);
        }
    }

    let segments = transcribe_with_retries(config, &audio.path).await?;
    if segments.is_empty() {
        return Err(PipelineError::Transcription(
            "backend returned an empty transcript".into(),
        ));
    }

    writer
        .perform(WriteAction::ReplaceTranscript {
            episode_id: episode.id,
            segments,
        })
        .await?;

    // Read back through the store so segments carry their row ids.
    Ok(db.get_segments(episode.id)?)
}

async fn transcribe_with_retries(
    config: &Config,
    audio_path: &Path,
) -> Result<Vec<NewSegment>, PipelineError> {
    let backoff_delays = [2u64, 8, 30];
    let attempts = config.transcription.max_retry_attempts.max(1) as usize;
    let mut last_error = String::new();

    for attempt in 0..attempts {
        let result = match config.transcription.backend {
            TranscriptionBackendKind::WhisperCli => {
                transcribe_whisper_cli(config, audio_path).await
            }
            TranscriptionBackendKind::Remote => transcribe_remote(config, audio_path).await,
        };
        match result {
            Ok(segments) => return Ok(normalize_segments(segments)),
            Err(e) => {
                last_error = e;
                if attempt + 1 < attempts {
                    let delay = backoff_delays[attempt.min(backoff_delays.len() - 1)];
                    log::warn!(
                        "Transcription attempt {} failed, retrying in {}s: {}",
                        attempt + 1,
                        delay,
                        last_error
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                }
            }
        }
    }

    Err(PipelineError::Transcription(format!(
        "failed after {} attempts: {}",
        attempts, last_error
    )))
}

/// Local whisper-cli subprocess producing JSON output next to the audio.
async fn transcribe_whisper_cli(
    config: &Config,
    audio_path: &Path,
) -> Result<Vec<NewSegment>, String> {
    let model_path = config
        .transcription
        .whisper_model_path
        .as_ref()
        .ok_or("transcription.whisper_model_path is not set")?;
    if !model_path.exists() {
        return Err(format!("model not found: {}", model_path.display()));
    }

    let output_base = audio_path.with_extension("");

    log::info!("Running whisper-cli on {}", audio_path.display());

    let mut command = Command::new(&config.transcription.whisper_cli_path);
    command
        .arg("-m")
        .arg(model_path)
        .arg("-f")
        .arg(audio_path)
        .arg("-oj")
        .arg("-of")
        .arg(&output_base)
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let output = tokio::time::timeout(
        std::time::Duration::from_secs(config.transcription.timeout_seconds),
        command.output(),
    )
    .await
    .map_err(|_| "whisper-cli timed out".to_string())?
    .map_err(|e| format!("failed to spawn whisper-cli: {}", e))?;

    if !output.status.success() {
        return Err(format!(
            "whisper-cli failed with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    let json_path = output_base.with_extension("json");
    let text = tokio::fs::read_to_string(&json_path)
        .await
        .map_err(|e| format!("cannot read whisper output {}: {}", json_path.display(), e))?;
    parse_whisper_cli_json(&text)
}

/// OpenAI-compatible `audio/transcriptions` endpoint.
async fn transcribe_remote(config: &Config, audio_path: &Path) -> Result<Vec<NewSegment>, String> {
    let settings = &config.transcription;
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(settings.timeout_seconds))
        .build()
        .map_err(|e| format!("failed to create HTTP client: {}", e))?;

    let bytes = tokio::fs::read(audio_path)
        .await
        .map_err(|e| format!("cannot read audio file: {}", e))?;
    let filename = audio_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "audio.mp3".to_string());

    let form = reqwest::multipart::Form::new()
        .part(
            "file",
            reqwest::multipart::Part::bytes(bytes).file_name(filename),
        )
        .text("model", settings.remote_model.clone())
        .text("response_format", "verbose_json");

    let url = format!(
        "{}/audio/transcriptions",
        settings.remote_base_url.trim_end_matches('/')
    );
    let mut builder = client.post(&url).multipart(form);
    if let Some(key) = &settings.remote_api_key {
        builder = builder.bearer_auth(key);
    }

    let response = builder
        .send()
        .await
        .map_err(|e| format!("transcription request failed: {}", e))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("transcription backend returned {}: {}", status, body));
    }

    let body = response
        .text()
        .await
        .map_err(|e| format!("unreadable transcription response: {}", e))?;
    parse_remote_verbose_json(&body)
}

// ============================================================================
// Backend response parsing
// ============================================================================

#[derive(Deserialize)]
struct WhisperCliOutput {
    transcription: Vec<WhisperCliSegment>,
}

#[derive(Deserialize)]
struct WhisperCliSegment {
    offsets: WhisperCliOffsets,
    text: String,
}

#[derive(Deserialize)]
struct WhisperCliOffsets {
    from: i64,
    to: i64,
}

fn parse_whisper_cli_json(text: &str) -> Result<Vec<NewSegment>, String> {
    let parsed: WhisperCliOutput =
        serde_json::from_str(text).map_err(|e| format!("malformed whisper-cli JSON: {}", e))?;
    Ok(parsed
        .transcription
        .into_iter()
        .map(|s| NewSegment {
            start_time: s.offsets.from as f64 / 1000.0,
            end_time: s.offsets.to as f64 / 1000.0,
            text: s.text.trim().to_string(),
        })
        .collect())
}

#[derive(Deserialize)]
struct RemoteVerboseOutput {
    segments: Vec<RemoteSegment>,
}

#[derive(Deserialize)]
struct RemoteSegment {
    start: f64,
    end: f64,
    text: String,
}

fn parse_remote_verbose_json(text: &str) -> Result<Vec<NewSegment>, String> {
    let parsed: RemoteVerboseOutput =
        serde_json::from_str(text).map_err(|e| format!("malformed transcription JSON: {}", e))?;
    Ok(parsed
        .segments
        .into_iter()
        .map(|s| NewSegment {
            start_time: s.start,
            end_time: s.end,
            text: s.text.trim().to_string(),
        })
        .collect())
}

/// Enforce the segment invariants before persisting: time-ordered, no empty
/// text, and no overlap between neighbors.
fn normalize_segments(mut segments: Vec<NewSegment>) -> Vec<NewSegment> {
    segments.retain(|s| !s.text.is_empty() && s.end_time > s.start_time);
    segments.sort_by(|a, b| {
        a.start_time
            .partial_cmp(&b.start_time)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for i in 1..segments.len() {
        if segments[i].start_time < segments[i - 1].end_time {
            segments[i - 1].end_time = segments[i].start_time;
        }
    }
    segments.retain(|s| s.end_time > s.start_time);
    segments
}
