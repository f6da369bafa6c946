use crate::config::LlmApiConfig;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::warn;

#[derive(Debug, Error)]
pub enum LlmError {
    /// Token quota exhausted (403 or a documented quota phrase). Promoted
    /// by the caller to a dialer pause.
    #[error("llm quota exhausted: {0}")]
    QuotaExhausted(String),
    #[error("malformed llm response: {0}")]
    Malformed(String),
    #[error("llm request failed: {0}")]
    Transient(String),
}

pub type LlmResult<T> = Result<T, LlmError>;

/// Chat-completion client against an OpenAI-compatible endpoint. The
/// provider sometimes answers with an SSE stream instead of plain JSON, so
/// both shapes are handled.
pub struct LlmClient {
    config: LlmApiConfig,
    client: Client,
    semaphore: Arc<Semaphore>,
}

impl LlmClient {
    pub fn new(
        config: LlmApiConfig,
        timeout: f64,
        max_connections: usize,
        semaphore: Arc<Semaphore>,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs_f64(timeout))
            .pool_max_idle_per_host(max_connections)
            .build()?;
        Ok(Self {
            config,
            client,
            semaphore,
        })
    }

    pub fn has_api_key(&self) -> bool {
        !self.config.api_key.is_empty()
    }

    /// Send one user message and return the assistant text, trimmed and
    /// lowercased for intent matching.
    pub async fn classify(&self, prompt: &str) -> LlmResult<String> {
        let raw = self.chat(prompt).await?;
        Ok(raw.trim().to_lowercase())
    }

    pub async fn chat(&self, prompt: &str) -> LlmResult<String> {
        if !self.has_api_key() {
            warn!("LLM API key not configured; returning empty response");
            return Ok(String::new());
        }
        let payload = json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": self.config.temperature,
        });

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| LlmError::Transient(e.to_string()))?;
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::Transient(e.to_string()))?;

        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::Transient(e.to_string()))?;

        if status.as_u16() == 403 || is_quota_body(&body) {
            return Err(LlmError::QuotaExhausted(truncate(&body, 200)));
        }
        if !status.is_success() {
            return Err(LlmError::Transient(format!(
                "status {}: {}",
                status,
                truncate(&body, 200)
            )));
        }

        if content_type.contains("text/event-stream") || body.trim_start().starts_with("data:") {
            return Ok(extract_from_sse(&body));
        }

        let payload: Value =
            serde_json::from_str(&body).map_err(|e| LlmError::Malformed(e.to_string()))?;
        payload
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| LlmError::Malformed("no choices[0].message.content".into()))
    }
}

/// Reassemble assistant text from OpenAI-style SSE chunks.
fn extract_from_sse(raw: &str) -> String {
    let mut parts = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        let Some(payload) = line.strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            continue;
        }
        let Ok(item) = serde_json::from_str::<Value>(payload) else {
            continue;
        };
        if let Some(chunk) = item
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str())
        {
            parts.push(chunk.to_string());
        }
    }
    parts.join("")
}

fn is_quota_body(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("pre_consume_token_quota_failed") || lower.contains("token quota is not enough")
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        text.to_string()
    } else {
        let mut end = limit;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_from_sse() {
        let raw = "data: {\"choices\":[{\"delta\":{\"content\":\"ye\"}}]}\n\
                   data: {\"choices\":[{\"delta\":{\"content\":\"s\"}}]}\n\
                   data: [DONE]\n";
        assert_eq!(extract_from_sse(raw), "yes");
    }

    #[test]
    fn test_extract_from_sse_skips_garbage() {
        let raw = "event: ping\ndata: not-json\ndata: {\"choices\":[]}\n\
                   data: {\"choices\":[{\"delta\":{\"content\":\"no\"}}]}\n";
        assert_eq!(extract_from_sse(raw), "no");
    }

    #[test]
    fn test_quota_phrases() {
        assert!(is_quota_body(r#"{"error":{"code":"pre_consume_token_quota_failed"}}"#));
        assert!(is_quota_body("Token quota is not enough"));
        assert!(!is_quota_body(r#"{"choices":[]}"#));
    }
}
