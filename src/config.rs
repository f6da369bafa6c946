use clap::Parser;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Parser, Debug)]
#[command(version, about = "ARI call-control engine")]
pub struct Cli {
    /// Env file loaded before reading configuration.
    #[clap(long, default_value = ".env")]
    pub env_file: String,
}

fn env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AriConfig {
    pub base_url: String,
    pub ws_url: String,
    pub app_name: String,
    pub username: String,
    pub password: String,
}

impl AriConfig {
    fn from_env() -> Self {
        Self {
            base_url: env_str("ARI_BASE_URL", "http://127.0.0.1:8088/ari"),
            ws_url: env_str("ARI_WS_URL", "ws://127.0.0.1:8088/ari/events"),
            app_name: env_str("ARI_APP_NAME", "dialflow"),
            username: env_str("ARI_USERNAME", "dialflow"),
            password: env_str("ARI_PASSWORD", "changeme"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DialerConfig {
    pub outbound_trunk: String,
    pub outbound_numbers: Vec<String>,
    pub default_caller_id: String,
    pub origination_timeout: u32,
    pub max_concurrent_calls: usize,
    pub max_concurrent_outbound_calls: usize,
    pub max_concurrent_inbound_calls: usize,
    pub max_calls_per_minute: usize,
    pub max_calls_per_day: usize,
    pub max_originations_per_second: f64,
    pub static_contacts: Vec<String>,
    pub batch_size: usize,
    pub default_retry: u64,
}

impl DialerConfig {
    fn from_env() -> Self {
        let max_concurrent = env_parse("MAX_CONCURRENT_CALLS", 2usize);
        let per_minute = env_parse("MAX_CALLS_PER_MINUTE", 10usize);
        Self {
            outbound_trunk: env_str("OUTBOUND_TRUNK", "outbound-trunk"),
            outbound_numbers: env_list("OUTBOUND_NUMBERS"),
            default_caller_id: env_str("DEFAULT_CALLER_ID", "1000"),
            origination_timeout: env_parse("ORIGINATION_TIMEOUT", 30u32),
            max_concurrent_calls: max_concurrent,
            max_concurrent_outbound_calls: env_parse(
                "MAX_CONCURRENT_OUTBOUND_CALLS",
                max_concurrent,
            ),
            max_concurrent_inbound_calls: env_parse("MAX_CONCURRENT_INBOUND_CALLS", max_concurrent),
            max_calls_per_minute: per_minute,
            max_calls_per_day: env_parse("MAX_CALLS_PER_DAY", 200usize),
            max_originations_per_second: env_parse("MAX_ORIGINATIONS_PER_SECOND", 3.0f64),
            static_contacts: env_list("STATIC_CONTACTS"),
            batch_size: env_parse("DIALER_BATCH_SIZE", per_minute),
            default_retry: env_parse("DIALER_DEFAULT_RETRY", 60u64),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OperatorConfig {
    pub extension: String,
    pub trunk: String,
    pub caller_id: String,
    pub timeout: u32,
    pub endpoint: String,
    pub mobile_numbers: Vec<String>,
}

impl OperatorConfig {
    fn from_env(dialer: &DialerConfig) -> Self {
        Self {
            extension: env_str("OPERATOR_EXTENSION", "200"),
            trunk: env_str("OPERATOR_TRUNK", &dialer.outbound_trunk),
            caller_id: env_str("OPERATOR_CALLER_ID", &dialer.default_caller_id),
            timeout: env_parse("OPERATOR_TIMEOUT", 30u32),
            endpoint: env_str("OPERATOR_ENDPOINT", ""),
            mobile_numbers: env_list("OPERATOR_MOBILE_NUMBERS"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SttConfig {
    pub stt_url: String,
    pub stt_token: String,
    pub tts_url: String,
    pub tts_token: String,
    /// Enhanced recordings are archived here for audit.
    pub archive_dir: String,
}

impl SttConfig {
    fn from_env() -> Self {
        Self {
            stt_url: env_str(
                "STT_URL",
                "https://partai.gw.isahab.ir/avanegar/v2/avanegar/request",
            ),
            stt_token: env_str("STT_TOKEN", ""),
            tts_url: env_str(
                "TTS_URL",
                "https://partai.gw.isahab.ir/avasho/v2/avasho/request",
            ),
            tts_token: env_str("TTS_TOKEN", ""),
            archive_dir: env_str("STT_ARCHIVE_DIR", "recordings/enhanced"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
}

impl LlmApiConfig {
    fn from_env() -> Self {
        Self {
            base_url: env_str("LLM_BASE_URL", "https://api.openai.com/v1"),
            api_key: env_str("LLM_API_KEY", ""),
            model: env_str("LLM_MODEL", "gpt-4o-mini"),
            temperature: env_parse("LLM_TEMPERATURE", 0.2f32),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PanelConfig {
    pub base_url: String,
    pub api_token: String,
}

impl PanelConfig {
    fn from_env() -> Self {
        Self {
            base_url: env_str("PANEL_BASE_URL", ""),
            api_token: env_str("PANEL_API_TOKEN", ""),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.base_url.is_empty() && !self.api_token.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmsConfig {
    pub api_key: String,
    pub sender: String,
    pub admins: Vec<String>,
    pub fail_alert_threshold: u32,
}

impl SmsConfig {
    fn from_env() -> Self {
        Self {
            api_key: env_str("SMS_API_KEY", ""),
            sender: env_str("SMS_FROM", ""),
            admins: env_list("SMS_ADMINS"),
            fail_alert_threshold: env_parse("FAIL_ALERT_THRESHOLD", 3u32),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConcurrencyConfig {
    pub max_parallel_stt: usize,
    pub max_parallel_tts: usize,
    pub max_parallel_llm: usize,
    pub http_max_connections: usize,
}

impl ConcurrencyConfig {
    fn from_env() -> Self {
        Self {
            max_parallel_stt: env_parse("MAX_PARALLEL_STT", 50usize),
            max_parallel_tts: env_parse("MAX_PARALLEL_TTS", 50usize),
            max_parallel_llm: env_parse("MAX_PARALLEL_LLM", 10usize),
            http_max_connections: env_parse("HTTP_MAX_CONNECTIONS", 100usize),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    pub http_timeout: f64,
    pub stt_timeout: f64,
    pub tts_timeout: f64,
    pub llm_timeout: f64,
    pub ari_timeout: f64,
    pub playback_watchdog_secs: u64,
}

impl TimeoutConfig {
    fn from_env() -> Self {
        Self {
            http_timeout: env_parse("HTTP_TIMEOUT", 10.0f64),
            stt_timeout: env_parse("STT_TIMEOUT", 30.0f64),
            tts_timeout: env_parse("TTS_TIMEOUT", 30.0f64),
            llm_timeout: env_parse("LLM_TIMEOUT", 20.0f64),
            ari_timeout: env_parse("ARI_TIMEOUT", 10.0f64),
            playback_watchdog_secs: env_parse("PLAYBACK_WATCHDOG_SECS", 45u64),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub ari: AriConfig,
    pub dialer: DialerConfig,
    pub operator: OperatorConfig,
    pub stt: SttConfig,
    pub llm: LlmApiConfig,
    pub panel: PanelConfig,
    pub sms: SmsConfig,
    pub concurrency: ConcurrencyConfig,
    pub timeouts: TimeoutConfig,
    pub company: String,
    pub scenarios_dir: String,
    pub log_level: String,
    pub log_dir: String,
}

impl Config {
    pub fn from_env() -> Self {
        let dialer = DialerConfig::from_env();
        let operator = OperatorConfig::from_env(&dialer);
        Self {
            ari: AriConfig::from_env(),
            dialer,
            operator,
            stt: SttConfig::from_env(),
            llm: LlmApiConfig::from_env(),
            panel: PanelConfig::from_env(),
            sms: SmsConfig::from_env(),
            concurrency: ConcurrencyConfig::from_env(),
            timeouts: TimeoutConfig::from_env(),
            company: env_str("COMPANY", ""),
            scenarios_dir: env_str("SCENARIOS_DIR", "config/scenarios"),
            log_level: env_str("LOG_LEVEL", "info"),
            log_dir: env_str("LOG_DIR", "logs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_list_parsing() {
        env::set_var("TEST_CONFIG_LIST", "02191302954, 02191302955 ,,02191302956");
        let parsed = env_list("TEST_CONFIG_LIST");
        assert_eq!(parsed, vec!["02191302954", "02191302955", "02191302956"]);
        env::remove_var("TEST_CONFIG_LIST");
    }

    #[test]
    fn test_operator_inherits_dialer_trunk() {
        let dialer = DialerConfig::from_env();
        let operator = OperatorConfig::from_env(&dialer);
        assert_eq!(operator.trunk, dialer.outbound_trunk);
    }
}
