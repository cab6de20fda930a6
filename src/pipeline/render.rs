//! Stage 4: cut the resolved ad blocks out of the source audio.

use std::path::PathBuf;

use crate::audio;
use crate::config::Config;
use crate::db::{Database, WriteAction, Writer};
use crate::error::PipelineError;
use crate::pipeline::download::DownloadedAudio;
use crate::pipeline::resolve::{cut_spans, resolve_ad_blocks};

/// Resolve the cut list and render the ad-free file. The episode record is
/// pointed at the output only after the file is fully written, so a crash
/// mid-render leaves "no processed audio yet", never a dangling path.
pub async fn run(
    db: &Database,
    writer: &Writer,
    config: &Config,
    episode_id: i64,
    audio: &DownloadedAudio,
) -> Result<String, PipelineError> {
    let segments = db.get_segments(episode_id)?;
    let identifications = db.get_identifications(episode_id)?;
    let blocks = resolve_ad_blocks(&segments, &identifications, &config.output);

    let removed: f64 = blocks.iter().map(|b| b.length()).sum();
    log::info!(
        "Episode {}: {} ad block(s), {:.1}s of {:.1}s marked for removal",
        episode_id,
        blocks.len(),
        removed,
        audio.duration
    );

    let dest_path: PathBuf = config
        .storage
        .processed_dir
        .join(format!("{}-adfree.mp3", episode_id));

    audio::render_cut(
        &config.ffmpeg_path,
        &audio.path,
        &dest_path,
        &cut_spans(&blocks),
        audio.duration,
        config.output.fade_ms,
    )
    .await?;

    let dest = dest_path.to_string_lossy().to_string();
    writer
        .perform(WriteAction::MarkProcessed {
            episode_id,
            path: dest.clone(),
        })
        .await?;

    Ok(dest)
}
