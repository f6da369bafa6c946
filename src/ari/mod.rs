use crate::config::AriConfig;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub mod ws;

pub use ws::AriWebSocketClient;

/// Failure categories for telephony REST operations. Only
/// `TransientNetwork` is a candidate for caller-side retries; everything
/// else reflects a definitive answer from the server.
#[derive(Debug, Error)]
pub enum AriError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("server error ({status}): {body}")]
    Server { status: u16, body: String },
}

impl AriError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AriError::NotFound(_))
    }
}

pub type AriResult<T> = Result<T, AriError>;

#[derive(Debug, Deserialize)]
pub struct ChannelHandle {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct BridgeHandle {
    pub id: String,
    #[serde(default)]
    pub bridge_type: String,
}

#[derive(Debug, Deserialize)]
pub struct PlaybackHandle {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct RecordingHandle {
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct VariableValue {
    value: String,
}

/// Typed wrapper over the telephony server's REST operations. The pool is
/// bounded and every call carries the configured deadline; retry policy
/// belongs to the caller.
pub struct AriClient {
    client: Client,
    base_url: String,
    app_name: String,
    username: String,
    password: String,
}

impl AriClient {
    pub fn new(config: &AriConfig, timeout: f64, max_connections: usize) -> AriResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs_f64(timeout))
            .pool_max_idle_per_host(max_connections)
            .build()
            .map_err(|e| AriError::TransientNetwork(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            app_name: config.app_name.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, &str)],
    ) -> AriResult<String> {
        let url = format!("{}{}", self.base_url, path);
        debug!("ARI {} {} params={:?}", method, path, params);
        let response = self
            .client
            .request(method, &url)
            .basic_auth(&self.username, Some(&self.password))
            .query(params)
            .send()
            .await
            .map_err(|e| AriError::TransientNetwork(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AriError::TransientNetwork(e.to_string()))?;
        match status {
            s if s.is_success() => Ok(body),
            StatusCode::NOT_FOUND => Err(AriError::NotFound(path.to_string())),
            StatusCode::CONFLICT => Err(AriError::Conflict(body)),
            s if s.is_client_error() => Err(AriError::Rejected {
                status: s.as_u16(),
                body,
            }),
            s => Err(AriError::Server {
                status: s.as_u16(),
                body,
            }),
        }
    }

    async fn request_json<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, &str)],
    ) -> AriResult<T> {
        let body = self.request(method, path, params).await?;
        serde_json::from_str(&body).map_err(|e| AriError::Server {
            status: 0,
            body: format!("undecodable response for {}: {}", path, e),
        })
    }

    pub async fn answer(&self, channel_id: &str) -> AriResult<()> {
        self.request(
            Method::POST,
            &format!("/channels/{}/answer", channel_id),
            &[],
        )
        .await
        .map(|_| ())
    }

    pub async fn hangup(&self, channel_id: &str) -> AriResult<()> {
        self.request(
            Method::DELETE,
            &format!("/channels/{}", channel_id),
            &[("reason", "normal")],
        )
        .await
        .map(|_| ())
    }

    pub async fn originate(
        &self,
        endpoint: &str,
        app_args: &str,
        caller_id: &str,
        timeout: u32,
    ) -> AriResult<ChannelHandle> {
        let timeout = timeout.to_string();
        self.request_json(
            Method::POST,
            "/channels",
            &[
                ("endpoint", endpoint),
                ("app", &self.app_name),
                ("appArgs", app_args),
                ("callerId", caller_id),
                ("timeout", &timeout),
            ],
        )
        .await
    }

    pub async fn create_bridge(&self, name: &str) -> AriResult<BridgeHandle> {
        self.request_json(
            Method::POST,
            "/bridges",
            &[("type", "mixing"), ("name", name)],
        )
        .await
    }

    pub async fn destroy_bridge(&self, bridge_id: &str) -> AriResult<()> {
        self.request(Method::DELETE, &format!("/bridges/{}", bridge_id), &[])
            .await
            .map(|_| ())
    }

    pub async fn add_channel_to_bridge(&self, bridge_id: &str, channel_id: &str) -> AriResult<()> {
        self.request(
            Method::POST,
            &format!("/bridges/{}/addChannel", bridge_id),
            &[("channel", channel_id)],
        )
        .await
        .map(|_| ())
    }

    pub async fn play_on_channel(&self, channel_id: &str, media: &str) -> AriResult<PlaybackHandle> {
        self.request_json(
            Method::POST,
            &format!("/channels/{}/play", channel_id),
            &[("media", media)],
        )
        .await
    }

    pub async fn play_on_bridge(&self, bridge_id: &str, media: &str) -> AriResult<PlaybackHandle> {
        self.request_json(
            Method::POST,
            &format!("/bridges/{}/play", bridge_id),
            &[("media", media)],
        )
        .await
    }

    pub async fn stop_playback(&self, playback_id: &str) -> AriResult<()> {
        self.request(Method::DELETE, &format!("/playbacks/{}", playback_id), &[])
            .await
            .map(|_| ())
    }

    pub async fn record_channel(
        &self,
        channel_id: &str,
        name: &str,
        max_duration: u32,
        max_silence: u32,
    ) -> AriResult<RecordingHandle> {
        let max_duration = max_duration.to_string();
        let max_silence = max_silence.to_string();
        self.request_json(
            Method::POST,
            &format!("/channels/{}/record", channel_id),
            &[
                ("name", name),
                ("format", "wav"),
                ("maxDurationSeconds", &max_duration),
                ("maxSilenceSeconds", &max_silence),
                ("ifExists", "overwrite"),
                ("beep", "false"),
            ],
        )
        .await
    }

    pub async fn stop_recording(&self, name: &str) -> AriResult<()> {
        self.request(
            Method::DELETE,
            &format!("/recordings/live/{}", urlencoding::encode(name)),
            &[],
        )
        .await
        .map(|_| ())
    }

    pub async fn fetch_stored_recording(&self, name: &str) -> AriResult<Vec<u8>> {
        let url = format!(
            "{}/recordings/stored/{}/file",
            self.base_url,
            urlencoding::encode(name)
        );
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| AriError::TransientNetwork(e.to_string()))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(AriError::NotFound(name.to_string()));
        }
        if !status.is_success() {
            return Err(AriError::Server {
                status: status.as_u16(),
                body: format!("fetching recording {}", name),
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| AriError::TransientNetwork(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// Read a channel variable; missing variables resolve to `None` rather
    /// than an error so SIP header probes stay best-effort.
    pub async fn get_channel_var(&self, channel_id: &str, variable: &str) -> Option<String> {
        let result: AriResult<VariableValue> = self
            .request_json(
                Method::GET,
                &format!("/channels/{}/variable", channel_id),
                &[("variable", variable)],
            )
            .await;
        match result {
            Ok(var) if !var.value.is_empty() => Some(var.value),
            Ok(_) => None,
            Err(err) => {
                debug!("channel var {} on {} unavailable: {}", variable, channel_id, err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let rejected = AriError::Rejected {
            status: 400,
            body: "bad endpoint".into(),
        };
        assert!(rejected.to_string().contains("400"));
        assert!(AriError::NotFound("/channels/x".into()).is_not_found());
        assert!(!rejected.is_not_found());
    }
}
