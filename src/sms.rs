use crate::config::SmsConfig;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

/// Minimal SMS gateway adapter used by the failure cascade to page admins.
pub struct SmsClient {
    config: SmsConfig,
    client: Client,
}

impl SmsClient {
    pub fn new(config: SmsConfig) -> Option<Self> {
        if config.api_key.is_empty() || config.sender.is_empty() {
            return None;
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .ok()?;
        Some(Self { config, client })
    }

    pub async fn send_alert(&self, text: &str) -> anyhow::Result<()> {
        if self.config.admins.is_empty() {
            warn!("no SMS recipients configured; skipping alert");
            return Ok(());
        }
        let payload = json!({
            "from": self.config.sender,
            "to": self.config.admins,
            "text": text,
            "udh": "",
        });
        let url = format!(
            "https://console.melipayamak.com/api/send/advanced/{}",
            self.config.api_key
        );
        let response = self.client.post(&url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("sms send failed: {} {}", status, body);
        }
        info!("sms alert sent to {} admins", self.config.admins.len());
        Ok(())
    }
}
