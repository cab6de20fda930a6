//! Audio I/O primitives: duration probing and cut rendering.
//!
//! Both shell out to the ffmpeg tool family via `tokio::process::Command`.
//! The renderer builds its whole filter graph up front from the cut list, so
//! the same blocks against the same source always produce the same command
//! line and the same output.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::error::PipelineError;

/// Spans shorter than this are dropped rather than rendered; they are
/// artifacts of float arithmetic, not audible audio.
const MIN_SPAN_SECONDS: f64 = 0.01;

/// Measure an audio file's duration in seconds with ffprobe.
pub async fn probe_duration(ffprobe_path: &Path, audio_path: &Path) -> Result<f64, PipelineError> {
    if !audio_path.exists() {
        return Err(PipelineError::Audio(format!(
            "audio file not found: {}",
            audio_path.display()
        )));
    }

    let output = Command::new(ffprobe_path)
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(audio_path)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| PipelineError::Audio(format!("failed to spawn ffprobe: {}", e)))?;

    if !output.status.success() {
        return Err(PipelineError::Audio(format!(
            "ffprobe failed on {}: {}",
            audio_path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let duration: f64 = text.trim().parse().map_err(|_| {
        PipelineError::Audio(format!(
            "ffprobe returned unparseable duration {:?} for {}",
            text.trim(),
            audio_path.display()
        ))
    })?;
    if duration <= 0.0 {
        return Err(PipelineError::Audio(format!(
            "audio duration of {} could not be determined",
            audio_path.display()
        )));
    }
    Ok(duration)
}

/// Complement of the cut spans over `[0, total_duration]`.
///
/// Cuts must be sorted and non-overlapping (the resolver guarantees both);
/// out-of-range edges are clamped and sub-audible slivers dropped.
pub fn keep_intervals(total_duration: f64, cuts: &[(f64, f64)]) -> Vec<(f64, f64)> {
    let mut keeps = Vec::new();
    let mut cursor = 0.0_f64;
    for &(start, end) in cuts {
        let start = start.clamp(0.0, total_duration);
        let end = end.clamp(0.0, total_duration);
        if start > cursor + MIN_SPAN_SECONDS {
            keeps.push((cursor, start));
        }
        cursor = cursor.max(end);
    }
    if total_duration > cursor + MIN_SPAN_SECONDS {
        keeps.push((cursor, total_duration));
    }
    keeps
}

/// Build the ffmpeg filter graph that trims out each keep interval and
/// joins them with crossfades at every cut point.
pub fn build_filter_graph(keeps: &[(f64, f64)], fade_seconds: f64) -> String {
    let mut parts: Vec<String> = keeps
        .iter()
        .enumerate()
        .map(|(i, (start, end))| {
            format!(
                "[0:a]atrim=start={:.3}:end={:.3},asetpts=PTS-STARTPTS[k{}]",
                start, end, i
            )
        })
        .collect();

    if keeps.len() == 1 {
        parts.push("[k0]acopy[out]".to_string());
        return parts.join(";");
    }

    if fade_seconds < MIN_SPAN_SECONDS {
        let inputs: String = (0..keeps.len()).map(|i| format!("[k{}]", i)).collect();
        parts.push(format!("{}concat=n={}:v=0:a=1[out]", inputs, keeps.len()));
        return parts.join(";");
    }

    let mut previous = "k0".to_string();
    for i in 1..keeps.len() {
        // acrossfade needs both inputs to be at least the fade long; clamp
        // against the two adjacent keeps.
        let left_len = keeps[i - 1].1 - keeps[i - 1].0;
        let right_len = keeps[i].1 - keeps[i].0;
        let fade = fade_seconds
            .min(left_len)
            .min(right_len)
            .max(MIN_SPAN_SECONDS);
        let label = if i == keeps.len() - 1 {
            "out".to_string()
        } else {
            format!("x{}", i)
        };
        parts.push(format!(
            "[{}][k{}]acrossfade=d={:.3}:c1=tri:c2=tri[{}]",
            previous, i, fade, label
        ));
        previous = label;
    }
    parts.join(";")
}

/// Render `source` minus the cut spans into `dest_path`.
///
/// Writes to a temporary sibling first and renames only after ffmpeg exits
/// cleanly, so an interrupted render never leaves a half-written file at the
/// destination path. An empty cut list degrades to a plain copy.
pub async fn render_cut(
    ffmpeg_path: &Path,
    source_path: &Path,
    dest_path: &Path,
    cuts: &[(f64, f64)],
    total_duration: f64,
    fade_ms: u64,
) -> Result<(), PipelineError> {
    if !source_path.exists() {
        return Err(PipelineError::Audio(format!(
            "audio file not found: {}",
            source_path.display()
        )));
    }
    if let Some(parent) = dest_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PipelineError::Render(format!("cannot create output dir: {}", e)))?;
    }

    if cuts.is_empty() {
        log::info!(
            "No ad blocks for {}, copying through unchanged",
            source_path.display()
        );
        tokio::fs::copy(source_path, dest_path)
            .await
            .map_err(|e| PipelineError::Render(format!("copy failed: {}", e)))?;
        return Ok(());
    }

    let keeps = keep_intervals(total_duration, cuts);
    if keeps.is_empty() {
        return Err(PipelineError::Render(
            "cut list removes the entire episode".into(),
        ));
    }
    let graph = build_filter_graph(&keeps, fade_ms as f64 / 1000.0);

    let temp_path = temp_sibling(dest_path);
    log::info!(
        "Rendering {} keep interval(s) from {} to {}",
        keeps.len(),
        source_path.display(),
        dest_path.display()
    );

    let output = Command::new(ffmpeg_path)
        .args(["-y", "-hide_banner", "-loglevel", "error", "-i"])
        .arg(source_path)
        .args(["-filter_complex", &graph, "-map", "[out]"])
        .arg(&temp_path)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| PipelineError::Render(format!("failed to spawn ffmpeg: {}", e)))?;

    if !output.status.success() {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(PipelineError::Render(format!(
            "ffmpeg exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    tokio::fs::rename(&temp_path, dest_path)
        .await
        .map_err(|e| PipelineError::Render(format!("cannot move output into place: {}", e)))?;
    Ok(())
}

fn temp_sibling(dest_path: &Path) -> PathBuf {
    let extension = dest_path
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_else(|| "mp3".to_string());
    let name = format!(".render-{}.{}", uuid::Uuid::new_v4(), extension);
    match dest_path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_intervals_with_no_cuts_is_whole_episode() {
        assert_eq!(keep_intervals(600.0, &[]), vec![(0.0, 600.0)]);
    }

    #[test]
    fn keep_intervals_interior_cut() {
        let keeps = keep_intervals(600.0, &[(58.0, 140.0)]);
        assert_eq!(keeps, vec![(0.0, 58.0), (140.0, 600.0)]);
    }

    #[test]
    fn keep_intervals_cut_at_start_and_end() {
        let keeps = keep_intervals(100.0, &[(0.0, 10.0), (90.0, 100.0)]);
        assert_eq!(keeps, vec![(10.0, 90.0)]);
    }

    #[test]
    fn keep_intervals_clamps_overrunning_cut() {
        let keeps = keep_intervals(100.0, &[(95.0, 130.0)]);
        assert_eq!(keeps, vec![(0.0, 95.0)]);
    }

    #[test]
    fn keep_intervals_everything_cut() {
        assert!(keep_intervals(60.0, &[(0.0, 60.0)]).is_empty());
    }

    #[test]
    fn filter_graph_single_keep_has_no_crossfade() {
        let graph = build_filter_graph(&[(10.0, 90.0)], 3.0);
        assert!(graph.contains("atrim=start=10.000:end=90.000"));
        assert!(graph.contains("[k0]acopy[out]"));
        assert!(!graph.contains("acrossfade"));
    }

    #[test]
    fn filter_graph_joins_keeps_with_crossfades() {
        let graph = build_filter_graph(&[(0.0, 58.0), (140.0, 600.0)], 3.0);
        assert!(graph.contains("[0:a]atrim=start=0.000:end=58.000,asetpts=PTS-STARTPTS[k0]"));
        assert!(graph.contains("[0:a]atrim=start=140.000:end=600.000,asetpts=PTS-STARTPTS[k1]"));
        assert!(graph.contains("[k0][k1]acrossfade=d=3.000:c1=tri:c2=tri[out]"));
    }

    #[test]
    fn filter_graph_clamps_fade_to_short_keeps() {
        // Second keep is only 1s long; a 3s fade must shrink to fit.
        let graph = build_filter_graph(&[(0.0, 58.0), (140.0, 141.0), (200.0, 300.0)], 3.0);
        assert!(graph.contains("[k0][k1]acrossfade=d=1.000"));
        assert!(graph.contains("[x1][k2]acrossfade=d=1.000"));
        assert!(graph.ends_with("[out]"));
    }

    #[test]
    fn filter_graph_zero_fade_uses_concat() {
        let graph = build_filter_graph(&[(0.0, 58.0), (140.0, 600.0)], 0.0);
        assert!(graph.contains("[k0][k1]concat=n=2:v=0:a=1[out]"));
        assert!(!graph.contains("acrossfade"));
    }

    #[test]
    fn filter_graph_is_deterministic() {
        let keeps = [(0.0, 58.0), (140.0, 600.0)];
        assert_eq!(build_filter_graph(&keeps, 2.5), build_filter_graph(&keeps, 2.5));
    }
}
