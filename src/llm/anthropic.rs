//! Anthropic messages-API client for structured order extraction.

use log::{debug, warn};
use serde_json::{json, Value};
use std::time::Duration;

use async_trait::async_trait;

use super::coerce::{coerce_chat, coerce_single};
use super::prompt::{
    chat_tool_schema, prune_messages, render_transcript, single_message_tool_schema,
    CHAT_SYSTEM_PROMPT, EXTRACTION_TOOL_NAME, SINGLE_MESSAGE_SYSTEM_PROMPT,
};
use super::{CancelSignal, ExtractError, ExtractedOrder, OrderExtractor};
use crate::shared::config::LlmConfig;
use crate::shared::models::ChatMessage;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_ATTEMPTS: u32 = 4;
const BASE_DELAY_MS: u64 = 2_000;
const MAX_DELAY_MS: u64 = 10_000;
const MAX_TOKENS: u32 = 2_048;

pub struct AnthropicExtractor {
    client: reqwest::Client,
    config: LlmConfig,
}

impl AnthropicExtractor {
    pub fn new(config: LlmConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self { client, config })
    }

    /// Exponential backoff with full jitter: `min(10s, 2s * 2^attempt)` plus
    /// up to one second of random spread.
    fn retry_delay(attempt: u32) -> Duration {
        let base = BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(16)).min(MAX_DELAY_MS);
        let jitter = (rand::random::<f64>() * 1_000.0) as u64;
        Duration::from_millis(base + jitter)
    }

    fn request_body(&self, model: &str, system: &str, user_content: &str, schema: Value) -> Value {
        json!({
            "model": model,
            "max_tokens": MAX_TOKENS,
            "system": [{
                "type": "text",
                "text": system,
                "cache_control": { "type": "ephemeral" }
            }],
            "tools": [{
                "name": EXTRACTION_TOOL_NAME,
                "description": "Record the structured order extracted from the conversation",
                "input_schema": schema
            }],
            "tool_choice": { "type": "tool", "name": EXTRACTION_TOOL_NAME },
            "messages": [{ "role": "user", "content": user_content }]
        })
    }

    async fn call_tool(
        &self,
        model: &str,
        system: &str,
        user_content: &str,
        schema: Value,
        mut cancel: CancelSignal,
    ) -> Result<Value, ExtractError> {
        let body = self.request_body(model, system, user_content, schema);
        let url = format!("{}/messages", self.config.base_url);
        let mut last_error = String::new();

        for attempt in 0..MAX_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(ExtractError::Cancelled);
            }

            let request = self
                .client
                .post(&url)
                .header("x-api-key", &self.config.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send();

            let delay = tokio::select! {
                _ = cancel.cancelled() => return Err(ExtractError::Cancelled),
                result = request => match result {
                    Ok(response) => {
                        let status = response.status();
                        if status.is_success() {
                            let payload: Value = response
                                .json()
                                .await
                                .map_err(|e| ExtractError::Malformed(format!("invalid json body: {e}")))?;
                            return find_tool_input(&payload);
                        }

                        if status.as_u16() == 429 {
                            // A server-advised delay overrides the computed backoff.
                            let advised = retry_after_secs(response.headers());
                            last_error = format!("rate limited ({status})");
                            advised
                                .map(Duration::from_secs)
                                .unwrap_or_else(|| Self::retry_delay(attempt))
                        } else if status.is_client_error() {
                            let detail = response.text().await.unwrap_or_default();
                            return Err(ExtractError::UpstreamBadRequest(format!(
                                "{status}: {detail}"
                            )));
                        } else {
                            last_error = format!("server error {status}");
                            Self::retry_delay(attempt)
                        }
                    }
                    Err(err) => {
                        // Timeouts and connect failures are retryable.
                        last_error = err.to_string();
                        Self::retry_delay(attempt)
                    }
                },
            };

            if attempt + 1 < MAX_ATTEMPTS {
                debug!(
                    "llm attempt {}/{} failed ({last_error}), retrying in {:?}",
                    attempt + 1,
                    MAX_ATTEMPTS,
                    delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ExtractError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        warn!("llm call failed after {MAX_ATTEMPTS} attempts: {last_error}");
        Err(ExtractError::Unavailable(last_error))
    }
}

/// The call contract requires exactly one tool invocation; anything else is a
/// malformed response.
fn find_tool_input(payload: &Value) -> Result<Value, ExtractError> {
    let blocks = payload
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| ExtractError::Malformed("response has no content blocks".into()))?;

    blocks
        .iter()
        .find(|block| {
            block.get("type").and_then(Value::as_str) == Some("tool_use")
                && block.get("name").and_then(Value::as_str) == Some(EXTRACTION_TOOL_NAME)
        })
        .and_then(|block| block.get("input"))
        .cloned()
        .ok_or_else(|| ExtractError::Malformed("response contains no tool_use block".into()))
}

fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

#[async_trait]
impl OrderExtractor for AnthropicExtractor {
    async fn extract_single(
        &self,
        message: &str,
        cancel: CancelSignal,
    ) -> Result<ExtractedOrder, ExtractError> {
        let input = self
            .call_tool(
                &self.config.single_message_model,
                SINGLE_MESSAGE_SYSTEM_PROMPT,
                message,
                single_message_tool_schema(),
                cancel,
            )
            .await?;
        Ok(coerce_single(&input))
    }

    async fn extract_chat(
        &self,
        messages: &[ChatMessage],
        cancel: CancelSignal,
    ) -> Result<ExtractedOrder, ExtractError> {
        let window = prune_messages(messages, self.config.max_prompt_chars);
        let transcript = render_transcript(&window);
        let input = self
            .call_tool(
                &self.config.chat_model,
                CHAT_SYSTEM_PROMPT,
                &transcript,
                chat_tool_schema(),
                cancel,
            )
            .await?;
        Ok(coerce_chat(&input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_is_bounded() {
        for attempt in 0..8 {
            let delay = AnthropicExtractor::retry_delay(attempt).as_millis() as u64;
            let base = BASE_DELAY_MS.saturating_mul(1 << attempt).min(MAX_DELAY_MS);
            assert!(delay >= base, "attempt {attempt}: {delay} < {base}");
            assert!(delay <= base + 1_000, "attempt {attempt}: {delay} over jitter cap");
        }
    }

    #[test]
    fn retry_delay_doubles_then_caps() {
        // Deterministic part only: 2s, 4s, 8s, then capped at 10s.
        for (attempt, expected) in [(0u32, 2_000u64), (1, 4_000), (2, 8_000), (3, 10_000), (6, 10_000)] {
            let delay = AnthropicExtractor::retry_delay(attempt).as_millis() as u64;
            assert!(delay >= expected && delay <= expected + 1_000);
        }
    }

    #[test]
    fn finds_tool_input_among_blocks() {
        let payload = json!({
            "content": [
                { "type": "text", "text": "Recording the order." },
                { "type": "tool_use", "name": EXTRACTION_TOOL_NAME, "input": {"items": []} }
            ]
        });
        let input = find_tool_input(&payload).unwrap();
        assert_eq!(input, json!({"items": []}));
    }

    #[test]
    fn missing_tool_use_is_malformed() {
        let payload = json!({ "content": [{ "type": "text", "text": "5 kg rice" }] });
        assert!(matches!(
            find_tool_input(&payload),
            Err(ExtractError::Malformed(_))
        ));

        let empty = json!({ "id": "msg_x" });
        assert!(matches!(find_tool_input(&empty), Err(ExtractError::Malformed(_))));
    }

    #[test]
    fn retry_after_header_parses_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("retry-after", "2".parse().unwrap());
        assert_eq!(retry_after_secs(&headers), Some(2));

        headers.insert("retry-after", "soon".parse().unwrap());
        assert_eq!(retry_after_secs(&headers), None);
    }
}
