//! Stage 1: fetch the episode's source audio.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::audio;
use crate::config::Config;
use crate::db::models::Episode;
use crate::db::{WriteAction, Writer};
use crate::error::PipelineError;

/// Result of a completed download: where the audio landed and how long it is.
pub struct DownloadedAudio {
    pub path: PathBuf,
    pub duration: f64,
}

/// Download the episode audio (or reuse a file already on disk), probe its
/// duration, and record both through the writer.
pub async fn run(
    writer: &Writer,
    config: &Config,
    episode: &Episode,
) -> Result<DownloadedAudio, PipelineError> {
    let file_path = match existing_audio(episode) {
        Some(path) => {
            log::info!(
                "Episode {} audio already on disk at {}",
                episode.id,
                path.display()
            );
            path
        }
        None => download_with_retries(config, episode).await?,
    };

    // An unprobeable duration is fatal: without it neither transcript
    // staleness checks nor the renderer's keep intervals mean anything.
    let duration = audio::probe_duration(&config.ffprobe_path, &file_path).await?;

    writer
        .perform(WriteAction::MarkDownloaded {
            episode_id: episode.id,
            path: file_path.to_string_lossy().to_string(),
        })
        .await?;
    writer
        .perform(WriteAction::SetEpisodeDuration {
            episode_id: episode.id,
            duration,
        })
        .await?;

    Ok(DownloadedAudio {
        path: file_path,
        duration,
    })
}

fn existing_audio(episode: &Episode) -> Option<PathBuf> {
    episode
        .unprocessed_path
        .as_ref()
        .map(PathBuf::from)
        .filter(|p| p.exists())
}

/// Download with streaming, timeouts, and automatic retry.
async fn download_with_retries(
    config: &Config,
    episode: &Episode,
) -> Result<PathBuf, PipelineError> {
    let filename = format!("{}-{}.mp3", episode.id, safe_filename(&episode.title));
    let file_path = config.storage.episodes_dir.join(filename);
    tokio::fs::create_dir_all(&config.storage.episodes_dir)
        .await
        .map_err(|e| PipelineError::Download(format!("cannot create episodes dir: {}", e)))?;

    let backoff_delays = [2u64, 8, 30];
    let attempts = config.download.max_retry_attempts.max(1) as usize;

    for attempt in 0..attempts {
        match try_download(config, episode, &file_path).await {
            Ok(bytes) => {
                log::info!(
                    "Downloaded episode {} ({} bytes) to {}",
                    episode.id,
                    bytes,
                    file_path.display()
                );
                return Ok(file_path);
            }
            Err(e) => {
                // Clean up partial file
                let _ = tokio::fs::remove_file(&file_path).await;

                if attempt + 1 < attempts {
                    let delay = backoff_delays[attempt.min(backoff_delays.len() - 1)];
                    log::warn!(
                        "Download attempt {} failed for episode {}, retrying in {}s: {}",
                        attempt + 1,
                        episode.id,
                        delay,
                        e
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                } else {
                    return Err(PipelineError::Download(format!(
                        "failed after {} attempts: {}",
                        attempts, e
                    )));
                }
            }
        }
    }

    unreachable!()
}

/// Single download attempt with streaming and size validation.
async fn try_download(
    config: &Config,
    episode: &Episode,
    file_path: &Path,
) -> Result<u64, String> {
    let client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(
            config.download.connect_timeout_seconds,
        ))
        .timeout(std::time::Duration::from_secs(config.download.timeout_seconds))
        .build()
        .map_err(|e| format!("failed to create HTTP client: {}", e))?;

    let response = client
        .get(&episode.audio_url)
        .send()
        .await
        .map_err(|e| format!("failed to start download: {}", e))?;

    if !response.status().is_success() {
        return Err(format!("download failed with status: {}", response.status()));
    }

    let content_length = response.content_length();
    let mut stream = response.bytes_stream();
    let mut file = tokio::fs::File::create(file_path)
        .await
        .map_err(|e| format!("failed to create file: {}", e))?;
    let mut downloaded: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| format!("error reading download stream: {}", e))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| format!("failed to write chunk: {}", e))?;
        downloaded += chunk.len() as u64;
    }

    file.flush()
        .await
        .map_err(|e| format!("failed to flush file: {}", e))?;

    // Validate file size against Content-Length
    if let Some(expected) = content_length {
        if downloaded != expected {
            return Err(format!(
                "download incomplete: got {} bytes, expected {}",
                downloaded, expected
            ));
        }
    }

    Ok(downloaded)
}

fn safe_filename(title: &str) -> String {
    let safe: String = title
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == ' ' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    safe.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_filename_strips_path_hazards() {
        assert_eq!(safe_filename("Ep 12: Ads/Sponsors?"), "Ep 12_ Ads_Sponsors_");
        assert_eq!(safe_filename("  plain title  "), "plain title");
    }
}
