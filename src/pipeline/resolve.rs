//! Merges raw per-segment identifications into the final cut list.
//!
//! Pure functions over persisted rows: no database access, so the whole
//! merge/filter policy is unit-testable and re-running it over the same
//! identification set always yields the same blocks.

use std::collections::HashMap;

use crate::config::OutputConfig;
use crate::db::models::{AdLabel, Identification, TranscriptSegment};

/// A resolved, contiguous audio-time span marked for removal.
#[derive(Debug, Clone, PartialEq)]
pub struct AdBlock {
    pub start: f64,
    pub end: f64,
    /// Weakest identification that contributed to this block; the
    /// confidence gate rejects the block if any contributor fell below
    /// threshold.
    pub min_confidence: f64,
}

impl AdBlock {
    pub fn length(&self) -> f64 {
        self.end - self.start
    }
}

/// Resolve the episode's ad blocks from its segments and identification
/// history.
///
/// Policy, in order: latest identification wins per segment; adjacent ad
/// spans merge when the gap between them is under the separation threshold;
/// merged blocks shorter than the minimum length are dropped; a block with
/// any contributing confidence under the minimum is left as content.
pub fn resolve_ad_blocks(
    segments: &[TranscriptSegment],
    identifications: &[Identification],
    output: &OutputConfig,
) -> Vec<AdBlock> {
    // Latest identification per segment. Rows are ordered by insertion, so
    // the last write for a segment is its current verdict.
    let mut latest: HashMap<i64, &Identification> = HashMap::new();
    for identification in identifications {
        latest.insert(identification.segment_id, identification);
    }

    // Ad spans in timeline order. Segments are already sorted by sequence,
    // and each segment contributes at most one span, so a re-submitted
    // boundary segment can never be counted twice.
    let mut spans: Vec<AdBlock> = Vec::new();
    for segment in segments {
        let Some(identification) = latest.get(&segment.id) else {
            continue;
        };
        if identification.label != AdLabel::Ad {
            continue;
        }
        spans.push(AdBlock {
            start: segment.start_time,
            end: segment.end_time,
            min_confidence: identification.confidence,
        });
    }

    // Merge spans separated by less than the configured gap.
    let mut merged: Vec<AdBlock> = Vec::new();
    for span in spans {
        match merged.last_mut() {
            Some(current)
                if span.start - current.end < output.min_ad_segement_separation_seconds =>
            {
                current.end = current.end.max(span.end);
                current.min_confidence = current.min_confidence.min(span.min_confidence);
            }
            _ => merged.push(span),
        }
    }

    merged
        .into_iter()
        .filter(|block| block.length() >= output.min_ad_segment_length_seconds)
        .filter(|block| block.min_confidence >= output.min_confidence)
        .collect()
}

/// The cut spans consumed by the renderer.
pub fn cut_spans(blocks: &[AdBlock]) -> Vec<(f64, f64)> {
    blocks.iter().map(|b| (b.start, b.end)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(id: i64, sequence: i64, start: f64, end: f64) -> TranscriptSegment {
        TranscriptSegment {
            id,
            episode_id: 1,
            sequence,
            start_time: start,
            end_time: end,
            text: format!("segment {}", sequence),
            label: None,
            mixed: false,
        }
    }

    fn identification(id: i64, segment_id: i64, label: AdLabel, confidence: f64) -> Identification {
        Identification {
            id,
            segment_id,
            model_call_id: 1,
            label,
            confidence,
            mixed: false,
            created_at: String::new(),
        }
    }

    fn output_config(separation: f64, min_length: f64, min_confidence: f64) -> OutputConfig {
        OutputConfig {
            fade_ms: 0,
            min_ad_segement_separation_seconds: separation,
            min_ad_segment_length_seconds: min_length,
            min_confidence,
        }
    }

    #[test]
    fn nearby_ads_merge_into_one_block() {
        // 600s episode, ads at [58,122) and [130,140), separation 60,
        // min length 14: the 8s gap merges into a single 82s block.
        let segments = vec![
            segment(1, 0, 0.0, 58.0),
            segment(2, 1, 58.0, 122.0),
            segment(3, 2, 122.0, 130.0),
            segment(4, 3, 130.0, 140.0),
            segment(5, 4, 140.0, 600.0),
        ];
        let identifications = vec![
            identification(1, 1, AdLabel::Content, 0.99),
            identification(2, 2, AdLabel::Ad, 0.95),
            identification(3, 3, AdLabel::Content, 0.9),
            identification(4, 4, AdLabel::Ad, 0.92),
            identification(5, 5, AdLabel::Content, 0.99),
        ];

        let blocks = resolve_ad_blocks(&segments, &identifications, &output_config(60.0, 14.0, 0.8));
        assert_eq!(
            blocks,
            vec![AdBlock {
                start: 58.0,
                end: 140.0,
                min_confidence: 0.92,
            }]
        );
        assert!((blocks[0].length() - 82.0).abs() < f64::EPSILON);
    }

    #[test]
    fn low_confidence_contributor_rejects_whole_merged_block() {
        // Same shape, but the second ad identification has confidence 0.4
        // against a 0.9 gate: the merged block is left as content entirely.
        let segments = vec![
            segment(1, 0, 58.0, 122.0),
            segment(2, 1, 130.0, 140.0),
        ];
        let identifications = vec![
            identification(1, 1, AdLabel::Ad, 0.95),
            identification(2, 2, AdLabel::Ad, 0.4),
        ];

        let blocks = resolve_ad_blocks(&segments, &identifications, &output_config(60.0, 14.0, 0.9));
        assert!(blocks.is_empty());
        assert!(cut_spans(&blocks).is_empty());
    }

    #[test]
    fn short_blocks_are_dropped() {
        let segments = vec![segment(1, 0, 100.0, 110.0)];
        let identifications = vec![identification(1, 1, AdLabel::Ad, 0.99)];

        // 10s block against a 14s minimum.
        let blocks = resolve_ad_blocks(&segments, &identifications, &output_config(60.0, 14.0, 0.5));
        assert!(blocks.is_empty());
    }

    #[test]
    fn distant_ads_stay_separate_blocks() {
        let segments = vec![
            segment(1, 0, 0.0, 30.0),
            segment(2, 1, 200.0, 230.0),
        ];
        let identifications = vec![
            identification(1, 1, AdLabel::Ad, 0.9),
            identification(2, 2, AdLabel::Ad, 0.9),
        ];

        // 170s gap with a 60s threshold.
        let blocks = resolve_ad_blocks(&segments, &identifications, &output_config(60.0, 14.0, 0.5));
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn resolver_is_idempotent() {
        let segments = vec![
            segment(1, 0, 10.0, 40.0),
            segment(2, 1, 45.0, 80.0),
            segment(3, 2, 300.0, 340.0),
        ];
        let identifications = vec![
            identification(1, 1, AdLabel::Ad, 0.9),
            identification(2, 2, AdLabel::Ad, 0.85),
            identification(3, 3, AdLabel::Ad, 0.95),
        ];
        let config = output_config(60.0, 14.0, 0.8);

        let first = resolve_ad_blocks(&segments, &identifications, &config);
        let second = resolve_ad_blocks(&segments, &identifications, &config);
        assert_eq!(first, second);
    }

    #[test]
    fn latest_identification_wins() {
        let segments = vec![segment(1, 0, 0.0, 30.0)];
        // First pass called it an ad; a re-classification disagreed.
        let identifications = vec![
            identification(1, 1, AdLabel::Ad, 0.9),
            identification(2, 1, AdLabel::Content, 0.9),
        ];

        let blocks = resolve_ad_blocks(&segments, &identifications, &output_config(60.0, 14.0, 0.5));
        assert!(blocks.is_empty());
    }

    #[test]
    fn no_identifications_yields_no_blocks() {
        let segments = vec![segment(1, 0, 0.0, 30.0)];
        let blocks = resolve_ad_blocks(&segments, &[], &output_config(60.0, 14.0, 0.5));
        assert!(blocks.is_empty());
    }
}
