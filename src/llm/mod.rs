//! Classification backend client.
//!
//! Speaks the OpenAI-compatible chat completions API, which covers both
//! hosted providers and local Ollama (`http://localhost:11434/v1`). The
//! client owns the two provider-protection mechanisms: a semaphore bounding
//! simultaneous in-flight calls and an optional sliding-window limiter on
//! input tokens per minute.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use crate::config::LlmConfig;
use crate::error::PipelineError;

pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    permits: Arc<Semaphore>,
    rate_limiter: Option<TokenRateLimiter>,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.llm_timeout_seconds))
            .build()
            .map_err(|e| PipelineError::Config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.llm_base_url.trim_end_matches('/').to_string(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
            max_tokens: config.llm_max_tokens,
            permits: Arc::new(Semaphore::new(config.llm_max_concurrent_calls)),
            rate_limiter: config
                .llm_max_input_tokens_per_minute
                .map(TokenRateLimiter::new),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Issue one chat completion and return the raw text content.
    ///
    /// Blocks on a concurrency permit first, then on the token budget, so a
    /// burst of chunk submissions drains at whatever rate the provider can
    /// actually take.
    pub async fn chat(&self, system: &str, user: &str) -> Result<String, PipelineError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PipelineError::Classification("LLM client shut down".into()))?;

        if let Some(limiter) = &self.rate_limiter {
            limiter
                .acquire(estimate_tokens(system) + estimate_tokens(user))
                .await;
        }

        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user.to_string(),
                },
            ],
            // Lower temperature for more consistent labeling
            temperature: 0.3,
            max_tokens: self.max_tokens,
            stream: false,
        };

        log::info!(
            "Sending classification request: model={}, prompt_len={}",
            self.model,
            user.len()
        );

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| PipelineError::Classification(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Classification(format!(
                "backend returned {}: {}",
                status, body
            )));
        }

        let result: ChatResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Classification(format!("unreadable response: {}", e)))?;

        let content = result
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| PipelineError::Classification("response had no choices".into()))?;

        log::info!("Classification response received: {} chars", content.len());
        Ok(content)
    }
}

/// Rough token estimate for budget accounting (≈4 chars per token).
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64 + 3) / 4
}

/// Sliding one-minute window over submitted input tokens.
///
/// `acquire` parks the caller until the window has room. A request larger
/// than the whole budget is admitted alone on an empty window rather than
/// deadlocking.
pub struct TokenRateLimiter {
    budget_per_minute: u64,
    window: Mutex<VecDeque<(Instant, u64)>>,
}

impl TokenRateLimiter {
    pub fn new(budget_per_minute: u64) -> Self {
        Self {
            budget_per_minute,
            window: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn acquire(&self, tokens: u64) {
        loop {
            let now = Instant::now();
            let mut window = self.window.lock().await;
            while window
                .front()
                .is_some_and(|(at, _)| now.duration_since(*at) >= Duration::from_secs(60))
            {
                window.pop_front();
            }
            let used: u64 = window.iter().map(|(_, t)| t).sum();
            if used + tokens <= self.budget_per_minute || window.is_empty() {
                window.push_back((now, tokens));
                return;
            }
            // Wait for the oldest entry to age out of the window.
            let oldest = window.front().map(|(at, _)| *at).unwrap_or(now);
            drop(window);
            let wake = oldest + Duration::from_secs(60);
            tokio::time::sleep_until(wake.max(now + Duration::from_millis(50))).await;
        }
    }
}

/// Extract JSON from an LLM response (handles markdown code blocks and
/// surrounding prose).
pub fn extract_json_from_response(response: &str) -> Option<serde_json::Value> {
    let trimmed = response.trim();

    // Try direct parse first
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Some(json);
    }

    // Try to extract from markdown code block
    for marker in ["```json", "```"] {
        if let Some(start) = trimmed.find(marker) {
            let after_marker = &trimmed[start + marker.len()..];
            if let Some(end) = after_marker.find("```") {
                let json_str = after_marker[..end].trim();
                if let Ok(json) = serde_json::from_str::<serde_json::Value>(json_str) {
                    return Some(json);
                }
            }
        }
    }

    // Try to find a balanced JSON object in the response
    if let Some(start) = trimmed.find('{') {
        let mut depth = 0;
        let mut end = start;
        for (i, c) in trimmed[start..].char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = start + i + 1;
                        break;
                    }
                }
                _ => {}
            }
        }
        if end > start {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(&trimmed[start..end]) {
                return Some(json);
            }
        }
    }

    None
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_response() {
        // Direct JSON
        let json = extract_json_from_response(r#"{"segments": []}"#);
        assert!(json.is_some());

        // Markdown code block
        let json = extract_json_from_response(
            r#"Here's the labeling:
```json
{"segments": [{"sequence": 1, "label": "ad", "confidence": 0.9}]}
```
"#,
        );
        assert!(json.is_some());

        // JSON embedded in prose
        let json = extract_json_from_response(
            r#"The result is: {"segments": [{"sequence": 0}]} as requested."#,
        );
        assert!(json.is_some());

        // No JSON at all
        assert!(extract_json_from_response("I cannot label this transcript.").is_none());
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_delays_over_budget_submissions() {
        let limiter = TokenRateLimiter::new(100);
        let start = Instant::now();

        limiter.acquire(60).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        // 60 + 60 > 100: must wait for the first entry to age out.
        limiter.acquire(60).await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_admits_oversized_request_on_empty_window() {
        let limiter = TokenRateLimiter::new(10);
        let start = Instant::now();
        limiter.acquire(500).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
