//! Context-aware transcript chunking for classification.
//!
//! Segments are grouped into fixed-size windows, one window per model call.
//! Ads routinely straddle a window boundary, so when the tail of window N
//! comes back labeled as advertising, window N+1 is expanded to re-include
//! that trailing ad run, so the model sees the preamble that makes the
//! continuation recognizable. `context_len` marks how many leading segments
//! of a chunk are re-submissions so they are never double-counted
//! downstream.

use std::collections::HashMap;

use crate::db::models::{AdLabel, TranscriptSegment};

/// One classification window: carried-over ad context followed by fresh
/// segments.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub segments: Vec<TranscriptSegment>,
    /// Leading segments already classified in the previous chunk.
    pub context_len: usize,
}

impl Chunk {
    pub fn first_sequence(&self) -> i64 {
        self.segments.first().map(|s| s.sequence).unwrap_or(0)
    }

    pub fn last_sequence(&self) -> i64 {
        self.segments.last().map(|s| s.sequence).unwrap_or(0)
    }

    /// Segments seen for the first time in this chunk.
    pub fn fresh(&self) -> &[TranscriptSegment] {
        &self.segments[self.context_len..]
    }
}

/// Plans classification windows over an episode's segment list.
///
/// Restartable by construction: given the persisted segments and the last
/// successfully classified sequence number, a fresh planner resumes exactly
/// where the previous run stopped, carried-over ad context included.
pub struct ChunkPlanner {
    segments: Vec<TranscriptSegment>,
    chunk_size: usize,
    /// Index of the first segment not yet classified.
    cursor: usize,
    /// Segments immediately before the cursor pending re-submission.
    pending_context: usize,
}

impl ChunkPlanner {
    pub fn new(
        segments: Vec<TranscriptSegment>,
        chunk_size: usize,
        last_classified_sequence: Option<i64>,
    ) -> Self {
        assert!(chunk_size > 0, "chunk size must be at least 1");
        let cursor = match last_classified_sequence {
            Some(sequence) => segments
                .iter()
                .position(|s| s.sequence > sequence)
                .unwrap_or(segments.len()),
            None => 0,
        };
        let pending_context = trailing_ad_run(&segments[..cursor]).min(chunk_size);
        Self {
            segments,
            chunk_size,
            cursor,
            pending_context,
        }
    }

    pub fn is_done(&self) -> bool {
        self.cursor >= self.segments.len()
    }

    /// The next window to submit, or None once every segment is classified.
    pub fn next_chunk(&self) -> Option<Chunk> {
        if self.is_done() {
            return None;
        }
        let fresh_end = (self.cursor + self.chunk_size).min(self.segments.len());
        let context_start = self.cursor - self.pending_context;
        Some(Chunk {
            segments: self.segments[context_start..fresh_end].to_vec(),
            context_len: self.pending_context,
        })
    }

    /// Fold the chunk's accepted labels back in and advance the cursor.
    /// The trailing ad run of the classified prefix becomes the next
    /// chunk's carried-over context.
    pub fn record_result(&mut self, chunk: &Chunk, labels: &HashMap<i64, AdLabel>) {
        let fresh_end = (self.cursor + chunk.fresh().len()).min(self.segments.len());
        let context_start = self.cursor - self.pending_context;
        for segment in &mut self.segments[context_start..fresh_end] {
            if let Some(label) = labels.get(&segment.sequence) {
                segment.label = Some(*label);
            }
        }
        self.cursor = fresh_end;
        self.pending_context = trailing_ad_run(&self.segments[..self.cursor]).min(self.chunk_size);
    }
}

/// Length of the ad-labeled run at the tail of `segments`.
fn trailing_ad_run(segments: &[TranscriptSegment]) -> usize {
    segments
        .iter()
        .rev()
        .take_while(|s| s.label == Some(AdLabel::Ad))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_segments(count: usize) -> Vec<TranscriptSegment> {
        (0..count)
            .map(|i| TranscriptSegment {
                id: i as i64 + 1,
                episode_id: 1,
                sequence: i as i64,
                start_time: i as f64 * 10.0,
                end_time: (i as f64 + 1.0) * 10.0,
                text: format!("segment {}", i),
                label: None,
                mixed: false,
            })
            .collect()
    }

    fn label_all(chunk: &Chunk, label: AdLabel) -> HashMap<i64, AdLabel> {
        chunk
            .segments
            .iter()
            .map(|s| (s.sequence, label))
            .collect()
    }

    #[test]
    fn chunks_partition_without_gaps_or_overlaps_when_content_only() {
        let mut planner = ChunkPlanner::new(make_segments(25), 10, None);
        let mut seen = Vec::new();
        while let Some(chunk) = planner.next_chunk() {
            assert_eq!(chunk.context_len, 0);
            seen.extend(chunk.fresh().iter().map(|s| s.sequence));
            let labels = label_all(&chunk, AdLabel::Content);
            planner.record_result(&chunk, &labels);
        }
        assert_eq!(seen, (0..25).collect::<Vec<i64>>());
    }

    #[test]
    fn ad_tail_is_resubmitted_verbatim_in_next_chunk() {
        let mut planner = ChunkPlanner::new(make_segments(20), 10, None);

        let first = planner.next_chunk().unwrap();
        assert_eq!(first.first_sequence(), 0);
        assert_eq!(first.last_sequence(), 9);

        // Tail of the first chunk (7..=9) is an ad still going at the boundary.
        let mut labels = label_all(&first, AdLabel::Content);
        for sequence in 7..=9 {
            labels.insert(sequence, AdLabel::Ad);
        }
        planner.record_result(&first, &labels);

        let second = planner.next_chunk().unwrap();
        assert_eq!(second.context_len, 3);
        assert_eq!(second.first_sequence(), 7);
        // Re-submitted context is the same segments, text and all.
        for (context_seg, original_seq) in second.segments[..3].iter().zip(7..) {
            assert_eq!(context_seg.sequence, original_seq);
            assert_eq!(context_seg.text, format!("segment {}", original_seq));
        }
        // Fresh part continues where chunk one stopped.
        assert_eq!(second.fresh().first().unwrap().sequence, 10);
        assert_eq!(second.last_sequence(), 19);
    }

    #[test]
    fn no_context_when_tail_is_content() {
        let mut planner = ChunkPlanner::new(make_segments(20), 10, None);
        let first = planner.next_chunk().unwrap();
        let mut labels = label_all(&first, AdLabel::Ad);
        // Ad in the middle but content at the tail: nothing to carry.
        labels.insert(8, AdLabel::Content);
        labels.insert(9, AdLabel::Content);
        planner.record_result(&first, &labels);

        let second = planner.next_chunk().unwrap();
        assert_eq!(second.context_len, 0);
        assert_eq!(second.first_sequence(), 10);
    }

    #[test]
    fn context_is_capped_at_chunk_size() {
        let mut planner = ChunkPlanner::new(make_segments(30), 5, None);
        // Two full chunks of ads in a row.
        for _ in 0..2 {
            let chunk = planner.next_chunk().unwrap();
            let labels = label_all(&chunk, AdLabel::Ad);
            planner.record_result(&chunk, &labels);
        }
        let third = planner.next_chunk().unwrap();
        assert_eq!(third.context_len, 5);
        assert_eq!(third.fresh().first().unwrap().sequence, 10);
    }

    #[test]
    fn resume_matches_live_run() {
        // Run live, stopping after two chunks with an ad tail.
        let mut live = ChunkPlanner::new(make_segments(30), 10, None);
        let first = live.next_chunk().unwrap();
        live.record_result(&first, &label_all(&first, AdLabel::Content));
        let second = live.next_chunk().unwrap();
        let mut labels = label_all(&second, AdLabel::Content);
        labels.insert(18, AdLabel::Ad);
        labels.insert(19, AdLabel::Ad);
        live.record_result(&second, &labels);
        let live_third = live.next_chunk().unwrap();

        // Rebuild from persisted state: labels on 0..=19, last classified 19.
        let mut persisted = make_segments(30);
        for segment in &mut persisted[..20] {
            segment.label = Some(if segment.sequence >= 18 {
                AdLabel::Ad
            } else {
                AdLabel::Content
            });
        }
        let resumed = ChunkPlanner::new(persisted, 10, Some(19));
        let resumed_third = resumed.next_chunk().unwrap();

        assert_eq!(resumed_third.context_len, live_third.context_len);
        assert_eq!(
            resumed_third
                .segments
                .iter()
                .map(|s| s.sequence)
                .collect::<Vec<_>>(),
            live_third
                .segments
                .iter()
                .map(|s| s.sequence)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn fully_classified_transcript_yields_no_chunks() {
        let planner = ChunkPlanner::new(make_segments(10), 4, Some(9));
        assert!(planner.next_chunk().is_none());
    }

    #[test]
    fn empty_transcript_yields_no_chunks() {
        let planner = ChunkPlanner::new(Vec::new(), 10, None);
        assert!(planner.next_chunk().is_none());
    }
}
