//! Stage 3: label transcript chunks as advertising or content.
//!
//! One model call per chunk. Every call is recorded as a ModelCall row
//! before the request goes out; failed attempts bump its retry count and the
//! surviving row ends up either success (with the raw response attached) or
//! failed (with the last error). Accepted labels become append-only
//! Identification rows, so a partial run leaves everything already accepted
//! in place for resumption.

use std::collections::HashMap;

use serde::Deserialize;

use crate::config::Config;
use crate::db::models::{AdLabel, NewIdentification};
use crate::db::{Database, WriteAction, Writer};
use crate::error::PipelineError;
use crate::llm::{extract_json_from_response, LlmClient};
use crate::pipeline::chunk::{Chunk, ChunkPlanner};

const DEFAULT_SYSTEM_PROMPT: &str = "\
You identify advertising in podcast transcripts. You are given numbered \
transcript segments with timestamps. Label every segment as either \"ad\" \
(sponsor reads, promo codes, product plugs, network cross-promotion) or \
\"content\" (the actual show). A segment that mixes both gets the label \
that covers most of it and \"mixed\": true. Respond with JSON only, in the \
form {\"segments\": [{\"sequence\": <number>, \"label\": \"ad\"|\"content\", \
\"confidence\": <0..1>, \"mixed\": <bool>}]} with one entry per segment.";

/// Classify every not-yet-labeled segment of the episode.
pub async fn run(
    db: &Database,
    writer: &Writer,
    llm: &LlmClient,
    config: &Config,
    episode_id: i64,
) -> Result<(), PipelineError> {
    let segments = db.get_segments(episode_id)?;
    let resume_after = db.last_classified_sequence(episode_id)?;
    let mut planner = ChunkPlanner::new(
        segments,
        config.processing.num_segments_to_input_to_prompt,
        resume_after,
    );

    if let Some(sequence) = resume_after {
        log::info!(
            "Episode {}: resuming classification after sequence {}",
            episode_id,
            sequence
        );
    }

    while let Some(chunk) = planner.next_chunk() {
        let labels = classify_chunk(writer, llm, config, episode_id, &chunk).await?;
        planner.record_result(&chunk, &labels);
    }

    Ok(())
}

/// One chunk: create the audit row, call the model with bounded retries,
/// persist the accepted identifications.
async fn classify_chunk(
    writer: &Writer,
    llm: &LlmClient,
    config: &Config,
    episode_id: i64,
    chunk: &Chunk,
) -> Result<HashMap<i64, AdLabel>, PipelineError> {
    let system_prompt = config
        .processing
        .system_prompt
        .as_deref()
        .unwrap_or(DEFAULT_SYSTEM_PROMPT);
    let user_prompt = build_user_prompt(chunk);

    let model_call_id = writer
        .perform(WriteAction::CreateModelCall {
            episode_id,
            first_sequence: chunk.first_sequence(),
            last_sequence: chunk.last_sequence(),
            model: llm.model().to_string(),
            prompt: user_prompt.clone(),
        })
        .await?
        .id();

    let attempts = config.llm.llm_max_retry_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 0..attempts {
        let outcome = match llm.chat(system_prompt, &user_prompt).await {
            Ok(response) => match parse_classification(&response, chunk) {
                Ok(parsed) => Some((response, parsed)),
                Err(e) => {
                    last_error = format!("unparseable response: {}", e);
                    None
                }
            },
            Err(e) => {
                last_error = e.to_string();
                None
            }
        };

        match outcome {
            Some((response, parsed)) => {
                writer
                    .perform(WriteAction::FinishModelCallSuccess {
                        model_call_id,
                        response,
                    })
                    .await?;

                let identifications: Vec<NewIdentification> = chunk
                    .segments
                    .iter()
                    .map(|segment| {
                        let verdict = &parsed[&segment.sequence];
                        NewIdentification {
                            segment_id: segment.id,
                            model_call_id,
                            label: verdict.label,
                            confidence: verdict.confidence,
                            mixed: verdict.mixed,
                        }
                    })
                    .collect();
                writer
                    .perform(WriteAction::RecordIdentifications {
                        items: identifications,
                    })
                    .await?;

                return Ok(parsed
                    .into_iter()
                    .map(|(sequence, verdict)| (sequence, verdict.label))
                    .collect());
            }
            None => {
                log::warn!(
                    "Classification attempt {} failed for episode {} chunk {}..={}: {}",
                    attempt + 1,
                    episode_id,
                    chunk.first_sequence(),
                    chunk.last_sequence(),
                    last_error
                );
                if attempt + 1 < attempts {
                    writer
                        .perform(WriteAction::BumpModelCallRetry { model_call_id })
                        .await?;
                }
            }
        }
    }

    writer
        .perform(WriteAction::FinishModelCallFailure {
            model_call_id,
            error: last_error.clone(),
        })
        .await?;
    Err(PipelineError::Classification(format!(
        "chunk {}..={} failed after {} attempts: {}",
        chunk.first_sequence(),
        chunk.last_sequence(),
        attempts,
        last_error
    )))
}

/// Render the chunk as numbered, timestamped lines.
fn build_user_prompt(chunk: &Chunk) -> String {
    let mut prompt = String::with_capacity(chunk.segments.len() * 80);
    for segment in &chunk.segments {
        prompt.push_str(&format!(
            "[{}] {:.1}-{:.1}: {}\n",
            segment.sequence, segment.start_time, segment.end_time, segment.text
        ));
    }
    prompt
}

/// A single segment verdict accepted from the model.
#[derive(Debug, Clone, Copy)]
pub struct SegmentVerdict {
    pub label: AdLabel,
    pub confidence: f64,
    pub mixed: bool,
}

#[derive(Deserialize)]
struct ClassificationResponse {
    segments: Vec<RawVerdict>,
}

#[derive(Deserialize)]
struct RawVerdict {
    sequence: i64,
    label: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    mixed: bool,
}

fn default_confidence() -> f64 {
    1.0
}

/// Parse and validate the model's response against the submitted chunk.
///
/// A sequence outside the chunk is a hard parse error (the model invented a
/// segment). Segments the model skipped default to content, since losing an ad
/// there is recoverable by reclassification, whereas inventing one is not.
pub fn parse_classification(
    response: &str,
    chunk: &Chunk,
) -> Result<HashMap<i64, SegmentVerdict>, String> {
    let json = extract_json_from_response(response).ok_or("no JSON object in response")?;
    let parsed: ClassificationResponse =
        serde_json::from_value(json).map_err(|e| format!("unexpected shape: {}", e))?;

    let mut verdicts: HashMap<i64, SegmentVerdict> = HashMap::new();
    for raw in parsed.segments {
        if raw.sequence < chunk.first_sequence() || raw.sequence > chunk.last_sequence() {
            return Err(format!(
                "sequence {} is outside submitted range {}..={}",
                raw.sequence,
                chunk.first_sequence(),
                chunk.last_sequence()
            ));
        }
        let label = AdLabel::parse(&raw.label)
            .ok_or_else(|| format!("unknown label {:?}", raw.label))?;
        verdicts.insert(
            raw.sequence,
            SegmentVerdict {
                label,
                confidence: raw.confidence.clamp(0.0, 1.0),
                mixed: raw.mixed,
            },
        );
    }

    for segment in &chunk.segments {
        verdicts.entry(segment.sequence).or_insert(SegmentVerdict {
            label: AdLabel::Content,
            confidence: default_confidence(),
            mixed: false,
        });
    }

    Ok(verdicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::TranscriptSegment;
    use crate::db::models::{ModelCallStatus, NewEpisode, NewSegment};
    use crate::db::{Database, Writer};
    use crate::llm::LlmClient;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn make_chunk(first: i64, count: i64, context_len: usize) -> Chunk {
        Chunk {
            segments: (first..first + count)
                .map(|sequence| TranscriptSegment {
                    id: sequence + 1,
                    episode_id: 1,
                    sequence,
                    start_time: sequence as f64 * 10.0,
                    end_time: (sequence as f64 + 1.0) * 10.0,
                    text: format!("segment {}", sequence),
                    label: None,
                    mixed: false,
                })
                .collect(),
            context_len,
        }
    }

    #[test]
    fn parses_complete_response() {
        let chunk = make_chunk(0, 2, 0);
        let response = r#"{"segments": [
            {"sequence": 0, "label": "content", "confidence": 0.98},
            {"sequence": 1, "label": "ad", "confidence": 0.91, "mixed": true}
        ]}"#;
        let verdicts = parse_classification(response, &chunk).unwrap();
        assert_eq!(verdicts[&0].label, AdLabel::Content);
        assert_eq!(verdicts[&1].label, AdLabel::Ad);
        assert!(verdicts[&1].mixed);
    }

    #[test]
    fn parses_fenced_response() {
        let chunk = make_chunk(5, 1, 0);
        let response = "Sure! Here is the labeling:\n```json\n{\"segments\": [{\"sequence\": 5, \"label\": \"ad\", \"confidence\": 0.8}]}\n```";
        let verdicts = parse_classification(response, &chunk).unwrap();
        assert_eq!(verdicts[&5].label, AdLabel::Ad);
    }

    #[test]
    fn skipped_segments_default_to_content() {
        let chunk = make_chunk(0, 3, 0);
        let response = r#"{"segments": [{"sequence": 1, "label": "ad", "confidence": 0.9}]}"#;
        let verdicts = parse_classification(response, &chunk).unwrap();
        assert_eq!(verdicts.len(), 3);
        assert_eq!(verdicts[&0].label, AdLabel::Content);
        assert_eq!(verdicts[&2].label, AdLabel::Content);
    }

    #[test]
    fn rejects_sequence_outside_chunk() {
        let chunk = make_chunk(0, 2, 0);
        let response = r#"{"segments": [{"sequence": 7, "label": "ad"}]}"#;
        assert!(parse_classification(response, &chunk).is_err());
    }

    #[test]
    fn rejects_unknown_label_and_missing_json() {
        let chunk = make_chunk(0, 1, 0);
        let bad_label = r#"{"segments": [{"sequence": 0, "label": "jingle"}]}"#;
        assert!(parse_classification(bad_label, &chunk).is_err());
        assert!(parse_classification("no json here", &chunk).is_err());
    }

    #[test]
    fn confidence_is_clamped() {
        let chunk = make_chunk(0, 1, 0);
        let response = r#"{"segments": [{"sequence": 0, "label": "ad", "confidence": 1.7}]}"#;
        let verdicts = parse_classification(response, &chunk).unwrap();
        assert_eq!(verdicts[&0].confidence, 1.0);
    }

    #[test]
    fn user_prompt_lists_context_segments_verbatim() {
        let chunk = make_chunk(7, 4, 2);
        let prompt = build_user_prompt(&chunk);
        for sequence in 7..11 {
            assert!(prompt.contains(&format!("[{}]", sequence)));
            assert!(prompt.contains(&format!("segment {}", sequence)));
        }
    }

    /// Fake chat-completions backend: drops the first `failures`
    /// connections without answering, then serves `body` as the completion
    /// content on every later request.
    async fn spawn_flaky_backend(failures: usize, content: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for served in 0.. {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                if served < failures {
                    // Read a little, then hang up mid-request.
                    let mut scratch = [0u8; 256];
                    let _ = socket.read(&mut scratch).await;
                    continue;
                }
                // Drain the request: headers, then Content-Length of body.
                let mut request = Vec::new();
                let mut buffer = [0u8; 1024];
                let header_end = loop {
                    let n = socket.read(&mut buffer).await.unwrap_or(0);
                    if n == 0 {
                        break None;
                    }
                    request.extend_from_slice(&buffer[..n]);
                    if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                        break Some(pos + 4);
                    }
                };
                let Some(header_end) = header_end else { continue };
                let headers = String::from_utf8_lossy(&request[..header_end]).to_string();
                let content_length: usize = headers
                    .lines()
                    .find_map(|l| {
                        l.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse().unwrap_or(0))
                    })
                    .unwrap_or(0);
                while request.len() < header_end + content_length {
                    let n = socket.read(&mut buffer).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buffer[..n]);
                }

                let completion = serde_json::json!({
                    "choices": [{"message": {"role": "assistant", "content": content}}]
                })
                .to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    completion.len(),
                    completion
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{}/v1", addr)
    }

    fn seed_episode(db: &Database, segment_count: usize) -> i64 {
        let episode_id = db
            .insert_episode(&NewEpisode {
                title: "Classify Test".into(),
                audio_url: "https://example.com/classify.mp3".into(),
                whitelisted: true,
            })
            .unwrap();
        let segments: Vec<NewSegment> = (0..segment_count)
            .map(|i| NewSegment {
                start_time: i as f64 * 10.0,
                end_time: (i as f64 + 1.0) * 10.0,
                text: format!("segment {}", i),
            })
            .collect();
        db.replace_segments(episode_id, &segments).unwrap();
        episode_id
    }

    #[tokio::test]
    async fn two_failures_then_success_records_retry_count_on_surviving_call() {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&temp_dir.path().join("test.db")).unwrap());
        let episode_id = seed_episode(&db, 3);

        let content = r#"{"segments": [
            {"sequence": 0, "label": "content", "confidence": 0.97},
            {"sequence": 1, "label": "ad", "confidence": 0.93},
            {"sequence": 2, "label": "content", "confidence": 0.95}
        ]}"#;
        let base_url = spawn_flaky_backend(2, content.to_string()).await;

        let mut config = crate::config::Config::default();
        config.llm.llm_base_url = base_url;
        config.llm.llm_max_retry_attempts = 3;
        config.processing.num_segments_to_input_to_prompt = 30;

        let llm = LlmClient::new(&config.llm).unwrap();
        let writer = Writer::spawn(db.clone());

        run(&db, &writer, &llm, &config, episode_id).await.unwrap();

        // One surviving call in success state carrying both failed attempts.
        let calls = db.get_model_calls(episode_id).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].status, ModelCallStatus::Success);
        assert_eq!(calls[0].retry_count, 2);
        assert_eq!(calls[0].first_sequence, 0);
        assert_eq!(calls[0].last_sequence, 2);

        // Identifications landed and the primary labels reflect them.
        assert_eq!(db.get_identifications(episode_id).unwrap().len(), 3);
        let segments = db.get_segments(episode_id).unwrap();
        assert_eq!(segments[1].label, Some(AdLabel::Ad));
        assert_eq!(segments[0].label, Some(AdLabel::Content));
        assert_eq!(db.last_classified_sequence(episode_id).unwrap(), Some(2));
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_chunk_and_keep_the_audit_row() {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&temp_dir.path().join("test.db")).unwrap());
        let episode_id = seed_episode(&db, 2);

        // Backend never answers successfully.
        let base_url = spawn_flaky_backend(usize::MAX, String::new()).await;

        let mut config = crate::config::Config::default();
        config.llm.llm_base_url = base_url;
        config.llm.llm_max_retry_attempts = 2;

        let llm = LlmClient::new(&config.llm).unwrap();
        let writer = Writer::spawn(db.clone());

        let err = run(&db, &writer, &llm, &config, episode_id)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Classification(_)));

        let calls = db.get_model_calls(episode_id).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].status, ModelCallStatus::Failed);
        assert_eq!(calls[0].retry_count, 1);
        assert!(calls[0].error_message.is_some());
        // Nothing accepted, so a resume starts from the beginning.
        assert!(db.last_classified_sequence(episode_id).unwrap().is_none());
    }
}
