use crate::ari::{AriClient, AriWebSocketClient};
use crate::config::Config;
use crate::dialer::Dialer;
use crate::flow::FlowEngine;
use crate::llm::LlmClient;
use crate::logs::CallLogs;
use crate::panel::PanelClient;
use crate::scenario::ScenarioRegistry;
use crate::session::manager::{LineCoordinator, ManagerSink, ScenarioHandler, SessionManager};
use crate::stt::{SttClient, TtsClient};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct AppBuilder {
    config: Option<Config>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self { config: None }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<App> {
        let config = Arc::new(self.config.unwrap_or_else(Config::from_env));
        let cancel_token = CancellationToken::new();
        let logs = Arc::new(CallLogs::open(&config.log_dir)?);

        let stt_semaphore = Arc::new(Semaphore::new(config.concurrency.max_parallel_stt));
        let tts_semaphore = Arc::new(Semaphore::new(config.concurrency.max_parallel_tts));
        let llm_semaphore = Arc::new(Semaphore::new(config.concurrency.max_parallel_llm));

        let ari = Arc::new(AriClient::new(
            &config.ari,
            config.timeouts.ari_timeout,
            config.concurrency.http_max_connections,
        )?);
        let stt = Arc::new(SttClient::new(
            config.stt.clone(),
            config.timeouts.stt_timeout,
            config.concurrency.http_max_connections,
            stt_semaphore,
        )?);
        let tts = Arc::new(TtsClient::new(
            config.stt.clone(),
            config.timeouts.tts_timeout,
            config.concurrency.http_max_connections,
            tts_semaphore,
        )?);
        let llm = Arc::new(LlmClient::new(
            config.llm.clone(),
            config.timeouts.llm_timeout,
            config.concurrency.http_max_connections,
            llm_semaphore,
        )?);
        let panel = if config.panel.enabled() {
            Some(Arc::new(PanelClient::new(
                &config.panel,
                config.company.clone(),
                config.timeouts.http_timeout,
                config.concurrency.http_max_connections,
                config.dialer.default_retry,
            )?))
        } else {
            None
        };

        info!("loading scenarios from {}", config.scenarios_dir);
        let registry = Arc::new(ScenarioRegistry::load(&config.scenarios_dir, &config.company));
        info!("loaded {} scenarios: {:?}", registry.names().len(), registry.names());

        let session_manager = SessionManager::new(
            ari.clone(),
            registry.clone(),
            logs.clone(),
            &config.dialer.outbound_numbers,
            config.dialer.max_concurrent_inbound_calls,
        );
        let flow = FlowEngine::new(
            config.clone(),
            ari.clone(),
            stt.clone(),
            llm.clone(),
            session_manager.clone(),
            registry.clone(),
            panel.clone(),
            logs.clone(),
        );
        session_manager.set_handler(flow.clone() as Arc<dyn ScenarioHandler>);

        let dialer = Dialer::new(
            config.clone(),
            ari.clone(),
            session_manager.clone(),
            registry.clone(),
            panel.clone(),
            cancel_token.child_token(),
        );
        session_manager.attach_dialer(dialer.clone() as Arc<dyn LineCoordinator>);
        flow.attach_dialer(dialer.clone());
        dialer.attach_flow(flow.clone());

        let ws_client = Arc::new(AriWebSocketClient::new(
            &config.ari,
            Arc::new(ManagerSink(session_manager.clone())),
            cancel_token.child_token(),
        ));

        Ok(App {
            config,
            registry,
            session_manager,
            flow,
            dialer,
            ws_client,
            panel,
            tts,
            cancel_token,
        })
    }
}

pub struct App {
    pub config: Arc<Config>,
    pub registry: Arc<ScenarioRegistry>,
    pub session_manager: Arc<SessionManager>,
    pub flow: Arc<FlowEngine>,
    pub dialer: Arc<Dialer>,
    pub ws_client: Arc<AriWebSocketClient>,
    pub panel: Option<Arc<PanelClient>>,
    pub tts: Arc<TtsClient>,
    pub cancel_token: CancellationToken,
}

impl App {
    /// Run until the cancel token fires, then shut down in order: stop the
    /// dialer, drain the event consumer, tear down active sessions with a
    /// hangup, and flush the panel queue best-effort.
    pub async fn run(&self) -> Result<()> {
        if let Some(panel) = &self.panel {
            let scenarios: Vec<(String, String)> = self
                .registry
                .names()
                .into_iter()
                .filter_map(|name| {
                    self.registry
                        .get(&name)
                        .map(|s| (name.clone(), s.panel_display_name().to_string()))
                })
                .collect();
            if !scenarios.is_empty() {
                if let Err(err) = panel.register_scenarios(&scenarios).await {
                    tracing::warn!("scenario registration failed: {}", err);
                }
            }
            let lines: Vec<(String, String)> = self
                .config
                .dialer
                .outbound_numbers
                .iter()
                .map(|number| (number.clone(), number.clone()))
                .collect();
            if !lines.is_empty() {
                if let Err(err) = panel.register_outbound_lines(&lines).await {
                    tracing::warn!("line registration failed: {}", err);
                }
            }
        }

        info!("starting event stream listener and dialer");
        let ws_client = self.ws_client.clone();
        let ws_task = tokio::spawn(async move { ws_client.run().await });
        let dialer = self.dialer.clone();
        let dialer_task = tokio::spawn(async move { dialer.run().await });

        self.cancel_token.cancelled().await;

        info!("shutting down");
        dialer_task.await.ok();
        ws_task.await.ok();
        self.session_manager.shutdown().await;
        if let Some(panel) = &self.panel {
            panel.flush_pending().await;
            let left = panel.pending_count().await;
            if left > 0 {
                tracing::warn!("{} panel reports still queued at shutdown", left);
            }
        }
        info!("shutdown complete");
        Ok(())
    }

    pub fn stop(&self) {
        self.cancel_token.cancel();
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}
