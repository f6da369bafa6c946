use crate::config::PanelConfig;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Reports that fail to transmit are kept in a bounded queue and retried
/// before the next batch poll; beyond this many the oldest are dropped.
const MAX_PENDING_REPORTS: usize = 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct PanelContact {
    #[serde(default)]
    pub id: Option<i64>,
    pub phone_number: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PanelScenario {
    #[serde(default)]
    pub id: Option<i64>,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PanelLine {
    #[serde(default)]
    pub id: Option<i64>,
    pub phone_number: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PanelAgent {
    #[serde(default)]
    pub id: Option<i64>,
    pub phone_number: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NextBatch {
    #[serde(default)]
    pub call_allowed: bool,
    #[serde(default)]
    pub retry_after_seconds: Option<u64>,
    #[serde(default)]
    pub contacts: Vec<PanelContact>,
    #[serde(default)]
    pub active_scenarios: Vec<PanelScenario>,
    #[serde(default)]
    pub outbound_lines: Vec<PanelLine>,
    #[serde(default)]
    pub inbound_agents: Vec<PanelAgent>,
    #[serde(default)]
    pub outbound_agents: Vec<PanelAgent>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultReport {
    pub company: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    pub status: String,
    pub reason: String,
    pub attempted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbound_line_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_allowed: Option<bool>,
}

/// Campaign-panel RPC client. Panel failures never abort a call: reports
/// queue in memory and are flushed opportunistically.
pub struct PanelClient {
    client: Client,
    base_url: String,
    company: String,
    default_retry: u64,
    pending_reports: Mutex<VecDeque<ResultReport>>,
}

impl PanelClient {
    pub fn new(
        config: &PanelConfig,
        company: String,
        timeout: f64,
        max_connections: usize,
        default_retry: u64,
    ) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth =
            reqwest::header::HeaderValue::from_str(&format!("Bearer {}", config.api_token))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);
        let client = Client::builder()
            .timeout(Duration::from_secs_f64(timeout))
            .pool_max_idle_per_host(max_connections)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            company,
            default_retry,
            pending_reports: Mutex::new(VecDeque::new()),
        })
    }

    pub async fn register_scenarios(&self, scenarios: &[(String, String)]) -> anyhow::Result<()> {
        let payload = json!({
            "company": self.company,
            "scenarios": scenarios
                .iter()
                .map(|(name, display_name)| json!({"name": name, "display_name": display_name}))
                .collect::<Vec<_>>(),
        });
        self.client
            .post(format!("{}/api/dialer/register-scenarios", self.base_url))
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        info!("registered {} scenarios with panel", scenarios.len());
        Ok(())
    }

    pub async fn register_outbound_lines(
        &self,
        lines: &[(String, String)],
    ) -> anyhow::Result<()> {
        let payload = json!({
            "company": self.company,
            "lines": lines
                .iter()
                .map(|(phone_number, display_name)| {
                    json!({"phone_number": phone_number, "display_name": display_name})
                })
                .collect::<Vec<_>>(),
        });
        self.client
            .post(format!(
                "{}/api/dialer/register-outbound-lines",
                self.base_url
            ))
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        info!("registered {} outbound lines with panel", lines.len());
        Ok(())
    }

    /// Fetch the next contact batch. Failures are reported as a disallowed
    /// batch with the default retry interval so the dialer just waits.
    pub async fn get_next_batch(&self, size: usize) -> NextBatch {
        self.flush_pending().await;
        let result = async {
            let response = self
                .client
                .get(format!("{}/api/dialer/next-batch", self.base_url))
                .query(&[("company", self.company.as_str()), ("size", &size.to_string())])
                .send()
                .await?
                .error_for_status()?;
            let batch: NextBatch = response.json().await?;
            Ok::<_, anyhow::Error>(batch)
        }
        .await;
        match result {
            Ok(batch) => batch,
            Err(err) => {
                warn!("panel next-batch failed: {}", err);
                NextBatch {
                    call_allowed: false,
                    retry_after_seconds: Some(self.default_retry),
                    reason: Some(err.to_string()),
                    ..Default::default()
                }
            }
        }
    }

    /// Send one result report; on failure the report is queued (bounded,
    /// drop-oldest) for a later flush. Never raises.
    pub async fn report_result(&self, mut report: ResultReport) {
        report.company = self.company.clone();
        match self.post_report(&report).await {
            Ok(()) => {
                info!(
                    "reported result to panel number_id={:?} status={}",
                    report.number_id, report.status
                );
            }
            Err(err) => {
                warn!(
                    "failed to report result (status={}); queueing: {}",
                    report.status, err
                );
                let mut pending = self.pending_reports.lock().await;
                if pending.len() >= MAX_PENDING_REPORTS {
                    let dropped = pending.pop_front();
                    warn!(
                        "panel report queue full; dropping oldest (status={:?})",
                        dropped.map(|r| r.status)
                    );
                }
                pending.push_back(report);
            }
        }
    }

    /// Retry queued reports in order, stopping at the first failure so the
    /// remainder waits for the next flush.
    pub async fn flush_pending(&self) {
        let queued: Vec<ResultReport> = {
            let mut pending = self.pending_reports.lock().await;
            pending.drain(..).collect()
        };
        if queued.is_empty() {
            return;
        }
        let mut failed_at = None;
        for (idx, report) in queued.iter().enumerate() {
            if report.number_id.is_none() && report.phone_number.is_none() {
                debug!("dropping queued report without number: {}", report.status);
                continue;
            }
            if let Err(err) = self.post_report(report).await {
                warn!("flush of queued report failed; requeueing rest: {}", err);
                failed_at = Some(idx);
                break;
            }
            info!("flushed queued report number_id={:?}", report.number_id);
        }
        if let Some(idx) = failed_at {
            let mut pending = self.pending_reports.lock().await;
            for report in queued.into_iter().skip(idx) {
                if pending.len() >= MAX_PENDING_REPORTS {
                    pending.pop_front();
                }
                pending.push_back(report);
            }
        }
    }

    async fn post_report(&self, report: &ResultReport) -> anyhow::Result<()> {
        self.client
            .post(format!("{}/api/dialer/report-result", self.base_url))
            .json(report)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn pending_count(&self) -> usize {
        self.pending_reports.lock().await.len()
    }
}

impl ResultReport {
    pub fn new(status: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            company: String::new(),
            number_id: None,
            phone_number: None,
            status: status.into(),
            reason: reason.into(),
            attempted_at: Utc::now(),
            scenario_id: None,
            outbound_line_id: None,
            agent_id: None,
            agent_phone: None,
            user_message: None,
            call_allowed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_serializes_exact_field_names() {
        let mut report = ResultReport::new("CONNECTED", "User said yes");
        report.company = "acme".into();
        report.number_id = Some(42);
        report.phone_number = Some("09123456789".into());
        report.outbound_line_id = Some(7);
        report.user_message = Some("بله حتما".into());
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["company"], "acme");
        assert_eq!(value["number_id"], 42);
        assert_eq!(value["phone_number"], "09123456789");
        assert_eq!(value["status"], "CONNECTED");
        assert_eq!(value["outbound_line_id"], 7);
        assert_eq!(value["user_message"], "بله حتما");
        assert!(value.get("agent_id").is_none());
        assert!(value.get("call_allowed").is_none());
    }

    #[test]
    fn test_batch_decodes_with_defaults() {
        let batch: NextBatch = serde_json::from_str(
            r#"{
                "call_allowed": true,
                "contacts": [{"id": 1, "phone_number": "09120000001"}],
                "active_scenarios": [{"id": 3, "name": "salehi"}],
                "outbound_lines": [{"id": 9, "phone_number": "02191302954", "display_name": "main"}]
            }"#,
        )
        .unwrap();
        assert!(batch.call_allowed);
        assert_eq!(batch.contacts.len(), 1);
        assert_eq!(batch.active_scenarios[0].name, "salehi");
        assert_eq!(batch.outbound_lines[0].id, Some(9));
        assert!(batch.inbound_agents.is_empty());
    }
}
