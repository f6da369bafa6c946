use crate::config::SttConfig;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct Synthesis {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
}

/// Synthesis client for the same speech gateway as the STT adapter.
pub struct TtsClient {
    config: SttConfig,
    client: Client,
    semaphore: Arc<Semaphore>,
}

impl TtsClient {
    pub fn new(
        config: SttConfig,
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

    pub async fn synthesize(&self, text: &str, speaker: &str, speed: f64) -> anyhow::Result<Synthesis> {
        if self.config.tts_token.is_empty() {
            warn!("TTS token missing; synthesis skipped");
            return Ok(Synthesis {
                status: "unauthorized".into(),
                filename: None,
                url: None,
                duration: None,
            });
        }
        let payload = json!({
            "text": text,
            "speaker": speaker,
            "speed": speed,
            "timestamp": false,
        });
        let _permit = self.semaphore.acquire().await?;
        let response = self
            .client
            .post(&self.config.tts_url)
            .header("gateway-token", &self.config.tts_token)
            .header("accept", "application/json")
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        let status = body
            .get("status")
            .and_then(|s| s.as_str())
            .unwrap_or("unknown")
            .to_string();
        let mut result: Synthesis = body
            .get("data")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or(Synthesis {
                status: String::new(),
                filename: None,
                url: None,
                duration: None,
            });
        if result.status.is_empty() {
            result.status = status;
        }
        Ok(result)
    }
}
