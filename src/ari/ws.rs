use crate::config::AriConfig;
use crate::event::AriEvent;
use anyhow::Result;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Receiver side of the event-stream hand-off. The consumer never blocks on
/// session work: decoded events are pushed through this sink and picked up
/// by the session manager's dispatcher.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: AriEvent);
}

/// Long-lived subscription to the telephony server's event stream with
/// exponential backoff reconnect.
pub struct AriWebSocketClient {
    url: String,
    sink: Arc<dyn EventSink>,
    cancel_token: CancellationToken,
}

impl AriWebSocketClient {
    pub fn new(config: &AriConfig, sink: Arc<dyn EventSink>, cancel_token: CancellationToken) -> Self {
        let url = format!(
            "{}?app={}&api_key={}:{}&subscribeAll=true",
            config.ws_url,
            urlencoding::encode(&config.app_name),
            urlencoding::encode(&config.username),
            urlencoding::encode(&config.password),
        );
        Self {
            url,
            sink,
            cancel_token,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if self.cancel_token.is_cancelled() {
                return Ok(());
            }
            match connect_async(self.url.as_str()).await {
                Ok((stream, _response)) => {
                    info!("event stream connected");
                    backoff = INITIAL_BACKOFF;
                    self.consume(stream).await;
                }
                Err(err) => {
                    warn!("event stream connect failed: {}", err);
                }
            }
            if self.cancel_token.is_cancelled() {
                return Ok(());
            }
            info!("reconnecting event stream in {:?}", backoff);
            tokio::select! {
                _ = sleep(backoff) => {}
                _ = self.cancel_token.cancelled() => return Ok(()),
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn consume<S>(&self, stream: tokio_tungstenite::WebSocketStream<S>)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (_write, mut read) = stream.split();
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => return,
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(event) = AriEvent::decode(&text) {
                                self.sink.deliver(event);
                            }
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            info!("event stream closed by server: {:?}", frame);
                            return;
                        }
                        Some(Ok(other)) => {
                            debug!("ignoring non-text frame: {:?}", other);
                        }
                        Some(Err(err)) => {
                            warn!("event stream read error: {}", err);
                            return;
                        }
                        None => {
                            info!("event stream ended");
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CollectSink(Mutex<Vec<AriEvent>>);

    impl EventSink for CollectSink {
        fn deliver(&self, event: AriEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn test_subscription_url() {
        let config = AriConfig {
            base_url: "http://127.0.0.1:8088/ari".into(),
            ws_url: "ws://127.0.0.1:8088/ari/events".into(),
            app_name: "dialflow".into(),
            username: "user".into(),
            password: "p@ss".into(),
        };
        let sink = Arc::new(CollectSink(Mutex::new(Vec::new())));
        let client = AriWebSocketClient::new(&config, sink, CancellationToken::new());
        assert!(client.url.starts_with("ws://127.0.0.1:8088/ari/events?app=dialflow"));
        assert!(client.url.contains("api_key=user:p%40ss"));
        assert!(client.url.ends_with("subscribeAll=true"));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let mut backoff = INITIAL_BACKOFF;
        for _ in 0..10 {
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        assert_eq!(backoff, MAX_BACKOFF);
    }
}
