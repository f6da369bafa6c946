use crate::ari::AriClient;
use crate::config::Config;
use crate::dialer::Dialer;
use crate::llm::{LlmClient, LlmError};
use crate::logs::{stamp, CallLogs};
use crate::panel::{PanelClient, ResultReport};
use crate::scenario::{ScenarioConfig, ScenarioRegistry, StepKind};
use crate::session::{LegDirection, LegState, ScenarioHandler, Session, SessionManager};
use crate::stt::{SttClient, SttError, Transcription};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod report;

use report::{map_result, status_carries_transcript};

#[derive(Debug, Clone)]
pub struct Agent {
    pub id: Option<i64>,
    pub phone_number: String,
}

#[derive(Default)]
struct AgentRosters {
    inbound: Vec<Agent>,
    outbound: Vec<Agent>,
    busy: HashSet<String>,
    inbound_cursor: usize,
    outbound_cursor: usize,
}

impl AgentRosters {
    fn next_available(&mut self, agent_type: &str) -> Option<Agent> {
        let (agents, cursor) = if agent_type == "inbound" {
            (&self.inbound, &mut self.inbound_cursor)
        } else {
            (&self.outbound, &mut self.outbound_cursor)
        };
        if agents.is_empty() {
            return None;
        }
        let n = agents.len();
        for offset in 0..n {
            let idx = (*cursor + offset) % n;
            let agent = &agents[idx];
            if !self.busy.contains(&agent.phone_number) {
                let picked = agent.clone();
                *cursor = (idx + 1) % n;
                return Some(picked);
            }
        }
        None
    }
}

/// Declarative step interpreter: drives each session through its scenario
/// graph, reacting to the session-manager hooks and orchestrating the
/// telephony, STT, and LLM calls.
pub struct FlowEngine {
    config: Arc<Config>,
    ari: Arc<AriClient>,
    stt: Arc<SttClient>,
    llm: Arc<LlmClient>,
    session_manager: Arc<SessionManager>,
    registry: Arc<ScenarioRegistry>,
    panel: Option<Arc<PanelClient>>,
    logs: Arc<CallLogs>,
    dialer: OnceLock<Arc<Dialer>>,
    agents: Mutex<AgentRosters>,
    self_ref: OnceLock<Weak<FlowEngine>>,
}

impl FlowEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        ari: Arc<AriClient>,
        stt: Arc<SttClient>,
        llm: Arc<LlmClient>,
        session_manager: Arc<SessionManager>,
        registry: Arc<ScenarioRegistry>,
        panel: Option<Arc<PanelClient>>,
        logs: Arc<CallLogs>,
    ) -> Arc<Self> {
        let mut rosters = AgentRosters::default();
        // Static operator numbers seed the roster; panel rosters replace it.
        for number in &config.operator.mobile_numbers {
            if !number.is_empty() {
                rosters.outbound.push(Agent {
                    id: None,
                    phone_number: number.clone(),
                });
            }
        }
        let engine = Arc::new(Self {
            config,
            ari,
            stt,
            llm,
            session_manager,
            registry,
            panel,
            logs,
            dialer: OnceLock::new(),
            agents: Mutex::new(rosters),
            self_ref: OnceLock::new(),
        });
        engine.self_ref.set(Arc::downgrade(&engine)).ok();
        engine
    }

    pub fn attach_dialer(&self, dialer: Arc<Dialer>) {
        self.dialer.set(dialer).ok();
    }

    fn dialer(&self) -> Option<&Arc<Dialer>> {
        self.dialer.get()
    }

    fn rosters(&self) -> std::sync::MutexGuard<'_, AgentRosters> {
        self.agents.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- Agent rosters -----------------------------------------------------

    pub fn set_inbound_agents(&self, agents: Vec<Agent>) {
        if agents.is_empty() {
            return;
        }
        let mut rosters = self.rosters();
        info!("updated inbound agents: {}", agents.len());
        rosters.inbound = agents;
        rosters.inbound_cursor = 0;
    }

    pub fn set_outbound_agents(&self, agents: Vec<Agent>) {
        if agents.is_empty() {
            return;
        }
        let mut rosters = self.rosters();
        info!("updated outbound agents: {}", agents.len());
        rosters.outbound = agents;
        rosters.outbound_cursor = 0;
    }

    fn release_agent(&self, phone_number: &str) {
        self.rosters().busy.remove(phone_number);
    }

    // -- Scenario helpers --------------------------------------------------

    async fn scenario_for(&self, session: &Arc<Session>) -> Option<&ScenarioConfig> {
        let name = {
            let state = session.state.lock().await;
            state.meta("scenario_name").map(|s| s.to_string())
        }?;
        self.registry.get(&name)
    }

    async fn customer_channel(&self, session: &Arc<Session>) -> Option<String> {
        let state = session.state.lock().await;
        state.customer_channel_id()
    }

    fn spawn_engine_task<F, Fut>(&self, f: F)
    where
        F: FnOnce(Arc<FlowEngine>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Some(engine) = self.self_ref.get().and_then(|w| w.upgrade()) {
            tokio::spawn(f(engine));
        }
    }

    // -- Flow execution ----------------------------------------------------

    /// Walk the flow from `start`, chaining synchronous steps and stopping
    /// at steps that suspend until the next event (playback, recording,
    /// operator answer).
    fn run_flow<'a>(
        &'a self,
        session: &'a Arc<Session>,
        start: &'a str,
        inbound: bool,
    ) -> futures::future::BoxFuture<'a, ()> {
        Box::pin(self.run_flow_inner(session, start, inbound))
    }

    async fn run_flow_inner(&self, session: &Arc<Session>, start: &str, inbound: bool) {
        let Some(scenario) = self.scenario_for(session).await else {
            return;
        };
        let mut current = start.to_string();
        loop {
            {
                let mut state = session.state.lock().await;
                if state.hungup() {
                    return;
                }
                state.set_meta("flow_inbound", if inbound { "1" } else { "0" });
                state.set_meta("current_step", current.clone());
            }
            let Some(step) = scenario.get_step(&current, inbound) else {
                warn!(
                    "step '{}' missing in scenario '{}' for session {}",
                    current, scenario.name, session.session_id
                );
                return;
            };
            debug!(
                "executing step '{}' for session {}",
                step.step, session.session_id
            );
            match &step.kind {
                StepKind::Entry { next } => match next {
                    Some(next) => current = next.clone(),
                    None => return,
                },
                StepKind::PlayPrompt {
                    prompt,
                    next,
                    on_failure,
                } => {
                    {
                        let mut state = session.state.lock().await;
                        state.set_meta("pending_playback_step", step.step.clone());
                        state.set_meta(
                            "pending_playback_next",
                            next.clone().unwrap_or_default(),
                        );
                    }
                    if self.play_prompt(session, prompt, scenario).await {
                        return;
                    }
                    // Play failed: fall through to on_failure, else next.
                    match on_failure.clone().or_else(|| next.clone()) {
                        Some(target) => current = target,
                        None => return,
                    }
                }
                StepKind::Record {
                    next,
                    on_empty,
                    on_failure,
                } => {
                    match self
                        .start_recording(session, &step.step, scenario, next, on_empty, on_failure)
                        .await
                    {
                        Ok(()) => return,
                        Err(()) => match on_failure.clone() {
                            Some(target) => current = target,
                            None => return,
                        },
                    }
                }
                StepKind::ClassifyIntent { next, on_failure } => {
                    match self.classify_intent(session, scenario).await {
                        Ok(()) => match next.clone() {
                            Some(target) => current = target,
                            None => return,
                        },
                        Err(()) => match on_failure.clone() {
                            Some(target) => current = target,
                            None => return,
                        },
                    }
                }
                StepKind::RouteByIntent { routes } => {
                    let intent = {
                        let state = session.state.lock().await;
                        state
                            .meta("last_intent")
                            .unwrap_or("unknown")
                            .to_string()
                    };
                    match routes.get(&intent).or_else(|| routes.get("unknown")) {
                        Some(target) => current = target.clone(),
                        None => {
                            // No declared route: implicit hangup.
                            self.hangup(session).await;
                            return;
                        }
                    }
                }
                StepKind::CheckRetryLimit {
                    counter,
                    max_count,
                    within_limit,
                    exceeded,
                } => {
                    let key = counter.clone().unwrap_or_else(|| "retry_count".into());
                    let count = {
                        let mut state = session.state.lock().await;
                        let entry = state.counters.entry(key).or_insert(0);
                        *entry += 1;
                        *entry
                    };
                    let limit = max_count.unwrap_or(1);
                    let target = if count <= limit {
                        within_limit.clone()
                    } else {
                        exceeded.clone()
                    };
                    match target {
                        Some(target) => current = target,
                        None => return,
                    }
                }
                StepKind::SetResult { result, next } => {
                    self.set_result(session, result, true, true).await;
                    match next.clone() {
                        Some(target) => current = target,
                        None => return,
                    }
                }
                StepKind::TransferToOperator {
                    agent_type,
                    on_success,
                    on_failure,
                } => {
                    {
                        let mut state = session.state.lock().await;
                        state.set_meta(
                            "transfer_on_success",
                            on_success.clone().unwrap_or_default(),
                        );
                        state.set_meta(
                            "transfer_on_failure",
                            on_failure.clone().unwrap_or_default(),
                        );
                    }
                    let agent_type = agent_type.clone().unwrap_or_else(|| "outbound".into());
                    self.play_onhold(session).await;
                    self.connect_to_operator(session, &agent_type).await;
                    return;
                }
                StepKind::Disconnect | StepKind::Hangup => {
                    self.hangup(session).await;
                    return;
                }
                StepKind::Wait => return,
            }
        }
    }

    // -- Step implementations ----------------------------------------------

    /// Start a playback on the session's bridge (falling back to the
    /// customer channel) and arm the finish watchdog. Returns false when
    /// the play call itself failed.
    async fn play_prompt(
        &self,
        session: &Arc<Session>,
        prompt_key: &str,
        scenario: &ScenarioConfig,
    ) -> bool {
        let (bridge_id, channel_id, hungup) = {
            let state = session.state.lock().await;
            (
                state.bridge.as_ref().map(|b| b.bridge_id.clone()),
                state.customer_channel_id(),
                state.hungup(),
            )
        };
        if hungup {
            return false;
        }
        let media = scenario.prompt_media(prompt_key);
        let played = if let Some(bridge_id) = &bridge_id {
            self.ari.play_on_bridge(bridge_id, &media).await
        } else if let Some(channel_id) = &channel_id {
            self.ari.play_on_channel(channel_id, &media).await
        } else {
            warn!(
                "no target to play {} for session {}",
                prompt_key, session.session_id
            );
            return false;
        };
        let playback = match played {
            Ok(playback) => playback,
            Err(err) => {
                warn!(
                    "failed to play {} for session {}: {}",
                    prompt_key, session.session_id, err
                );
                return false;
            }
        };
        {
            let mut state = session.state.lock().await;
            state
                .playbacks
                .insert(playback.id.clone(), prompt_key.to_string());
        }
        self.session_manager
            .register_playback(&session.session_id, &playback.id);
        info!(
            "playing prompt {} for session {}",
            prompt_key, session.session_id
        );
        // The server does not report media durations, so the watchdog uses
        // a configured upper bound; the wake is idempotent.
        let watchdog = Duration::from_secs(self.config.timeouts.playback_watchdog_secs);
        let session = session.clone();
        let playback_id = playback.id.clone();
        self.spawn_engine_task(move |engine| async move {
            tokio::select! {
                _ = tokio::time::sleep(watchdog) => {
                    engine.on_playback_finished(&session, &playback_id).await;
                }
                _ = session.cancel_token.cancelled() => {}
            }
        });
        true
    }

    async fn play_onhold(&self, session: &Arc<Session>) {
        if let Some(scenario) = self.scenario_for(session).await {
            self.play_prompt(session, "onhold", scenario).await;
        }
    }

    async fn stop_onhold(&self, session: &Arc<Session>) {
        let hold_playbacks: Vec<String> = {
            let state = session.state.lock().await;
            state
                .playbacks
                .iter()
                .filter(|(_, key)| key.as_str() == "onhold")
                .map(|(id, _)| id.clone())
                .collect()
        };
        for playback_id in hold_playbacks {
            if let Err(err) = self.ari.stop_playback(&playback_id).await {
                debug!("failed to stop onhold playback {}: {}", playback_id, err);
            }
        }
    }

    async fn start_recording(
        &self,
        session: &Arc<Session>,
        phase: &str,
        scenario: &ScenarioConfig,
        next: &Option<String>,
        on_empty: &Option<String>,
        on_failure: &Option<String>,
    ) -> Result<(), ()> {
        let Some(channel_id) = self.customer_channel(session).await else {
            return Err(());
        };
        let recording_name = format!("{}-{}", phase, session.session_id);
        {
            let mut state = session.state.lock().await;
            if state.hungup() {
                return Ok(());
            }
            state.set_meta("recording_phase", phase);
            state.set_meta("recording_name", recording_name.clone());
            state.set_meta("pending_record_next", next.clone().unwrap_or_default());
            state.set_meta("pending_record_on_empty", on_empty.clone().unwrap_or_default());
            state.set_meta(
                "pending_record_on_failure",
                on_failure.clone().unwrap_or_default(),
            );
        }
        info!("recording {} for session {}", phase, session.session_id);
        match self
            .ari
            .record_channel(
                &channel_id,
                &recording_name,
                scenario.stt.max_duration,
                scenario.stt.max_silence,
            )
            .await
        {
            Ok(_) => {
                self.session_manager
                    .register_recording(&session.session_id, &recording_name);
                Ok(())
            }
            Err(err) => {
                warn!(
                    "failed to start recording for session {}: {}",
                    session.session_id, err
                );
                Err(())
            }
        }
    }

    async fn process_recording(
        &self,
        session: Arc<Session>,
        recording_name: String,
        phase: String,
        inbound: bool,
        next: Option<String>,
        on_empty: Option<String>,
        on_failure: Option<String>,
    ) {
        let Some(scenario) = self.scenario_for(&session).await else {
            return;
        };
        let audio = match self.ari.fetch_stored_recording(&recording_name).await {
            Ok(audio) => audio,
            Err(err) => {
                warn!(
                    "failed to fetch recording {} for session {}: {}",
                    recording_name, session.session_id, err
                );
                if let Some(target) = on_failure {
                    self.run_flow(&session, &target, inbound).await;
                }
                return;
            }
        };

        let hotwords = scenario.stt.hotwords.clone();
        match self.stt.transcribe(audio, &recording_name, &hotwords).await {
            Ok(Transcription::Empty) => {
                info!("recording empty for session {}", session.session_id);
                if let Some(target) = on_empty {
                    self.run_flow(&session, &target, inbound).await;
                }
            }
            Ok(Transcription::Text(transcript)) => {
                let text = transcript.text.trim().to_string();
                {
                    let state = session.state.lock().await;
                    if state.hungup() {
                        return;
                    }
                }
                info!(
                    "stt ({}) session {}: {}",
                    phase, session.session_id, text
                );
                if text.is_empty() {
                    if let Some(target) = on_empty {
                        self.run_flow(&session, &target, inbound).await;
                    }
                    return;
                }
                {
                    let mut state = session.state.lock().await;
                    state.set_meta("last_transcript", text.clone());
                    state.responses.push(crate::session::ResponseEntry {
                        phase,
                        text,
                        intent: None,
                    });
                }
                if let Some(target) = next {
                    self.run_flow(&session, &target, inbound).await;
                }
            }
            Err(SttError::QuotaExhausted(detail)) => {
                warn!(
                    "stt quota exhausted for session {}: {}",
                    session.session_id, detail
                );
                self.handle_quota_error(&session, "failed:vira_quota").await;
            }
            Err(SttError::EmptyAudio(_)) => {
                // The service's empty-audio sentinel means the caller is
                // already gone.
                self.set_result(&session, "hangup", true, true).await;
                self.hangup(&session).await;
            }
            Err(SttError::Transient(detail)) => {
                warn!(
                    "transcription failed for session {}: {}",
                    session.session_id, detail
                );
                if let Some(target) = on_failure {
                    self.run_flow(&session, &target, inbound).await;
                }
            }
        }
    }

    async fn classify_intent(
        &self,
        session: &Arc<Session>,
        scenario: &ScenarioConfig,
    ) -> Result<(), ()> {
        let transcript = {
            let state = session.state.lock().await;
            state.meta("last_transcript").unwrap_or("").to_string()
        };
        if transcript.is_empty() {
            return Err(());
        }
        let intent = match self.detect_intent(&transcript, scenario).await {
            Ok(intent) => intent,
            Err(LlmError::QuotaExhausted(detail)) => {
                warn!(
                    "llm quota exhausted for session {}: {}",
                    session.session_id, detail
                );
                self.handle_quota_error(session, "failed:llm_quota").await;
                return Err(());
            }
            Err(err) => {
                warn!(
                    "intent classification failed for session {}: {}",
                    session.session_id, err
                );
                scenario.llm.classify_fallback(&transcript)
            }
        };

        {
            let mut state = session.state.lock().await;
            state.set_meta("last_intent", intent.clone());
            if let Some(last) = state.responses.last_mut() {
                last.intent = Some(intent.clone());
            }
            match intent.as_str() {
                "yes" => {
                    state.set_flag("intent_yes");
                    state.set_meta("yes_at", now_secs());
                }
                "no" => state.set_flag("intent_no"),
                _ => {}
            }
        }

        let line = stamp(&format!(
            "session={} intent={} transcript={}",
            session.session_id, intent, transcript
        ));
        match intent.as_str() {
            "yes" => self.logs.positive_stt.write_line(&line),
            "no" => self.logs.negative_stt.write_line(&line),
            _ => self.logs.unknown_stt.write_line(&line),
        }
        Ok(())
    }

    /// LLM classification with the scenario's prompt, degrading to the
    /// declared fallback tokens. Quota errors propagate; they must pause
    /// the dialer instead of degrading.
    async fn detect_intent(
        &self,
        transcript: &str,
        scenario: &ScenarioConfig,
    ) -> Result<String, LlmError> {
        // Fast path for unambiguous agreement tokens.
        for token in ["بله", "آره"] {
            if transcript.contains(token) {
                return Ok("yes".into());
            }
        }

        if self.llm.has_api_key() {
            let prompt = build_intent_prompt(transcript, scenario);
            match self.llm.classify(&prompt).await {
                Ok(normalized) => {
                    if let Some(intent) = extract_intent_label(&normalized, scenario) {
                        return Ok(intent);
                    }
                }
                Err(LlmError::QuotaExhausted(detail)) => {
                    return Err(LlmError::QuotaExhausted(detail));
                }
                Err(err) => {
                    warn!("llm intent call failed, using fallback tokens: {}", err);
                }
            }
        }
        Ok(scenario.llm.classify_fallback(transcript))
    }

    // -- Operator transfer -------------------------------------------------

    async fn connect_to_operator(&self, session: &Arc<Session>, agent_type: &str) {
        {
            let mut state = session.state.lock().await;
            if state.hungup() || state.meta_flag("operator_call_started") {
                return;
            }
            state.set_flag("operator_call_started");
            state.metadata.remove("operator_tried");
        }
        if self.customer_channel(session).await.is_none() {
            warn!(
                "no customer channel for operator connect, session {}",
                session.session_id
            );
            return;
        }

        let agent = self.rosters().next_available(agent_type);
        let have_rosters = {
            let rosters = self.rosters();
            !rosters.inbound.is_empty() || !rosters.outbound.is_empty()
        };

        let (endpoint, agent, line) = match agent {
            Some(agent) => {
                let Some(line) = self.reserve_line().await else {
                    warn!(
                        "no outbound line for operator, session {}",
                        session.session_id
                    );
                    self.fail_transfer(session, "no outbound line").await;
                    return;
                };
                let endpoint = format!(
                    "PJSIP/{}@{}",
                    agent.phone_number, self.config.dialer.outbound_trunk
                );
                (endpoint, Some(agent), Some(line))
            }
            None if have_rosters => {
                warn!("no available agents for session {}", session.session_id);
                self.fail_transfer(session, "no available agents").await;
                return;
            }
            None => {
                let endpoint = if !self.config.operator.endpoint.is_empty() {
                    self.config.operator.endpoint.clone()
                } else {
                    format!(
                        "PJSIP/{}@{}",
                        self.config.operator.extension, self.config.operator.trunk
                    )
                };
                (endpoint, None, None)
            }
        };

        self.originate_operator(session, endpoint, agent, line).await;
    }

    async fn originate_operator(
        &self,
        session: &Arc<Session>,
        endpoint: String,
        agent: Option<Agent>,
        line: Option<String>,
    ) {
        let caller_id = {
            let state = session.state.lock().await;
            if state.hungup() {
                if let Some(line) = line {
                    self.release_line(&line).await;
                }
                return;
            }
            state
                .meta("contact_number")
                .map(|s| s.to_string())
                .unwrap_or_else(|| self.config.operator.caller_id.clone())
        };
        {
            let mut state = session.state.lock().await;
            state.set_meta("operator_endpoint", endpoint.clone());
            if let Some(agent) = &agent {
                state.set_meta("operator_mobile", agent.phone_number.clone());
                if let Some(id) = agent.id {
                    state.set_meta("operator_agent_id", id.to_string());
                }
            }
            if let Some(line) = &line {
                state.set_meta("operator_outbound_line", line.clone());
            }
        }

        let app_args = format!("operator,{},{}", session.session_id, endpoint);
        info!(
            "connecting session {} to operator {}",
            session.session_id, endpoint
        );
        match self
            .ari
            .originate(
                &endpoint,
                &app_args,
                &caller_id,
                self.config.operator.timeout,
            )
            .await
        {
            Ok(handle) => {
                self.session_manager
                    .index_channel(&session.session_id, &handle.id);
                if let Some(agent) = &agent {
                    self.rosters().busy.insert(agent.phone_number.clone());
                }
                self.arm_operator_watchdog(session);
            }
            Err(err) => {
                warn!(
                    "operator originate failed for session {}: {}",
                    session.session_id, err
                );
                {
                    let mut state = session.state.lock().await;
                    state.result = Some("failed:operator_failed".into());
                    state.metadata.remove("operator_outbound_line");
                }
                if let Some(line) = line {
                    self.release_line(&line).await;
                }
                // Leave the caller with a goodbye if the scenario has one.
                if let Some(scenario) = self.scenario_for(session).await {
                    for key in ["goodbye", "goodby"] {
                        if scenario.prompts.contains_key(key) {
                            self.play_prompt(session, key, scenario).await;
                            break;
                        }
                    }
                }
            }
        }
    }

    fn arm_operator_watchdog(&self, session: &Arc<Session>) {
        let wait = Duration::from_secs(self.config.operator.timeout as u64 + 5);
        let session = session.clone();
        self.spawn_engine_task(move |engine| async move {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    let pending = {
                        let state = session.state.lock().await;
                        !state.meta_flag("operator_connected") && !state.hungup()
                            && state.meta_flag("operator_call_started")
                    };
                    if pending {
                        warn!(
                            "operator wait timed out for session {}",
                            session.session_id
                        );
                        engine.handle_operator_failure(&session, "operator timeout").await;
                    }
                }
                _ = session.cancel_token.cancelled() => {}
            }
        });
    }

    async fn reserve_line(&self) -> Option<String> {
        match self.dialer() {
            Some(dialer) => dialer.reserve_operator_line().await,
            None => None,
        }
    }

    async fn release_line(&self, line: &str) {
        if let Some(dialer) = self.dialer() {
            dialer.release_operator_line(line).await;
        }
    }

    /// Operator leg failed before answer: release the agent, try the next
    /// untried one, and only then give up through the transfer failure
    /// route.
    async fn handle_operator_failure(&self, session: &Arc<Session>, reason: &str) {
        let (current_mobile, line, tried_raw, agent_type) = {
            let mut state = session.state.lock().await;
            let mobile = state.meta("operator_mobile").map(|s| s.to_string());
            let line = state.meta("operator_outbound_line").map(|s| s.to_string());
            let tried = state.meta("operator_tried").unwrap_or("").to_string();
            let agent_type = if state.meta_flag("inbound_direct") {
                "inbound"
            } else {
                "outbound"
            };
            state.metadata.remove("operator_outbound_line");
            (mobile, line, tried, agent_type)
        };
        let mut tried: HashSet<String> = tried_raw
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
        if let Some(mobile) = &current_mobile {
            self.release_agent(mobile);
            tried.insert(mobile.clone());
        }
        if let Some(line) = &line {
            self.release_line(line).await;
        }

        // Hangup a still-ringing operator leg so it cannot answer late.
        let operator_channel = {
            let state = session.state.lock().await;
            state
                .operator_leg
                .as_ref()
                .filter(|leg| leg.is_live())
                .map(|leg| leg.channel_id.clone())
        };
        if let Some(channel_id) = operator_channel {
            self.ari.hangup(&channel_id).await.ok();
        }

        if current_mobile.is_some() {
            if self.retry_operator(session, &tried, agent_type).await {
                return;
            }
        }
        self.fail_transfer(session, reason).await;
    }

    async fn retry_operator(
        &self,
        session: &Arc<Session>,
        tried: &HashSet<String>,
        agent_type: &str,
    ) -> bool {
        let next_agent = {
            let mut rosters = self.rosters();
            let mut found = None;
            let roster_len = if agent_type == "inbound" {
                rosters.inbound.len()
            } else {
                rosters.outbound.len()
            };
            for _ in 0..roster_len {
                match rosters.next_available(agent_type) {
                    Some(agent) if tried.contains(&agent.phone_number) => continue,
                    Some(agent) => {
                        found = Some(agent);
                        break;
                    }
                    None => break,
                }
            }
            found
        };
        let Some(agent) = next_agent else {
            debug!("operator retry: no agents left for session {}", session.session_id);
            return false;
        };
        let Some(line) = self.reserve_line().await else {
            debug!("operator retry: no line for session {}", session.session_id);
            return false;
        };
        {
            let mut state = session.state.lock().await;
            if state.hungup() {
                drop(state);
                self.release_line(&line).await;
                return false;
            }
            let mut all_tried: Vec<String> = tried.iter().cloned().collect();
            all_tried.push(agent.phone_number.clone());
            state.set_meta("operator_tried", all_tried.join(","));
            state.operator_leg = None;
        }
        let endpoint = format!(
            "PJSIP/{}@{}",
            agent.phone_number, self.config.dialer.outbound_trunk
        );
        info!(
            "retrying operator for session {} via {}",
            session.session_id, endpoint
        );
        self.originate_operator(session, endpoint, Some(agent), Some(line))
            .await;
        true
    }

    /// Terminal transfer failure: stop hold music, run the scenario's
    /// declared failure route when present, otherwise settle the result
    /// directly and hang up.
    async fn fail_transfer(&self, session: &Arc<Session>, reason: &str) {
        info!(
            "operator transfer failed for session {}: {}",
            session.session_id, reason
        );
        self.stop_onhold(session).await;
        let (on_failure, inbound_flow, is_inbound_direct, yes_intent, current_result) = {
            let mut state = session.state.lock().await;
            state.metadata.remove("operator_call_started");
            (
                state.meta("transfer_on_failure").unwrap_or("").to_string(),
                state.meta_flag("flow_inbound"),
                state.meta_flag("inbound_direct"),
                state.meta_flag("intent_yes"),
                state.result.clone(),
            )
        };
        if !on_failure.is_empty() {
            // Boxed: this re-enters the interpreter from inside a step.
            self.run_flow(session, &on_failure, inbound_flow).await;
            return;
        }
        let result_value = if is_inbound_direct {
            "disconnected".to_string()
        } else if current_result
            .as_deref()
            .map(|r| r.starts_with("failed:operator"))
            .unwrap_or(false)
        {
            current_result.unwrap_or_default()
        } else if yes_intent {
            "disconnected".to_string()
        } else {
            "hangup".to_string()
        };
        self.set_result(session, &result_value, true, true).await;
        self.hangup(session).await;
    }

    // -- Quota and result handling -----------------------------------------

    /// External-service quota errors are promoted to a process-level pause:
    /// record the failure, trip the dialer, page the admins, end the call.
    async fn handle_quota_error(&self, session: &Arc<Session>, code: &str) {
        {
            let mut state = session.state.lock().await;
            // Suppress the per-call FAILED report; the pause notification
            // carries the state change to the panel.
            state.set_meta("panel_last_status", "FAILED");
        }
        self.set_result(session, code, true, true).await;
        if let Some(dialer) = self.dialer() {
            dialer.force_failure_pause(code).await;
        }
        self.hangup(session).await;
        self.session_manager.cleanup_session(session).await;
    }

    async fn set_result(&self, session: &Arc<Session>, value: &str, force: bool, report: bool) {
        let updated = {
            let mut state = session.state.lock().await;
            let replaceable = matches!(
                state.result.as_deref(),
                None | Some("user_didnt_answer") | Some("missed")
            );
            if force || replaceable {
                state.result = Some(value.to_string());
                true
            } else {
                false
            }
        };
        if updated && report {
            self.report_result(session).await;
        }
    }

    /// Report the session's current result. De-duplicated per distinct
    /// mapped panel status; transitions through several codes report each
    /// status once, in order.
    async fn report_result(&self, session: &Arc<Session>) {
        let (snapshot, notify_dialer) = {
            let mut state = session.state.lock().await;
            // The failure cascade counts each call once, on its first
            // settled result.
            let notify_dialer = !state.meta_flag("dialer_notified");
            state.set_flag("dialer_notified");
            let snapshot = ReportSnapshot {
                result: state.result.clone().unwrap_or_else(|| "unknown".into()),
                inbound_direct: state.meta_flag("inbound_direct"),
                number_id: state.meta("number_id").and_then(|v| v.parse().ok()),
                contact_number: state.meta("contact_number").map(|s| s.to_string()),
                attempted_at: state
                    .meta("attempted_at")
                    .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                    .map(|dt| dt.with_timezone(&Utc)),
                scenario_name: state.meta("scenario_name").map(|s| s.to_string()),
                outbound_line_id: state.meta("outbound_line_id").and_then(|v| v.parse().ok()),
                agent_id: state.meta("operator_agent_id").and_then(|v| v.parse().ok()),
                agent_phone: state.meta("operator_mobile").map(|s| s.to_string()),
                last_message: state.responses.last().map(|r| r.text.clone()),
            };
            (snapshot, notify_dialer)
        };

        if notify_dialer {
            if let Some(dialer) = self.dialer() {
                dialer
                    .on_result(&session.session_id, &snapshot.result, snapshot.number_id)
                    .await;
            }
        }
        let Some(panel) = &self.panel else {
            return;
        };
        if snapshot.number_id.is_none() && snapshot.contact_number.is_none() {
            return;
        }
        let outcome = map_result(&snapshot.result, snapshot.inbound_direct);
        {
            let mut state = session.state.lock().await;
            if state.meta("panel_last_status") == Some(outcome.status) {
                return;
            }
            state.set_meta("panel_last_status", outcome.status);
        }
        let mut report = ResultReport::new(outcome.status, outcome.reason);
        report.number_id = snapshot.number_id;
        report.phone_number = snapshot.contact_number;
        if let Some(attempted_at) = snapshot.attempted_at {
            report.attempted_at = attempted_at;
        }
        report.scenario_id = snapshot
            .scenario_name
            .as_deref()
            .and_then(|name| self.registry.panel_id(name));
        report.outbound_line_id = snapshot.outbound_line_id;
        report.agent_id = snapshot.agent_id;
        report.agent_phone = snapshot.agent_phone;
        if status_carries_transcript(outcome.status) {
            report.user_message = snapshot.last_message;
        }
        panel.report_result(report).await;
    }

    async fn hangup(&self, session: &Arc<Session>) {
        let Some(channel_id) = self.customer_channel(session).await else {
            return;
        };
        {
            let mut state = session.state.lock().await;
            state.set_flag("app_hangup");
        }
        if let Err(err) = self.ari.hangup(&channel_id).await {
            if err.is_not_found() {
                debug!("hangup for session {}: already gone", session.session_id);
            } else {
                warn!("hangup failed for session {}: {}", session.session_id, err);
            }
        }
    }
}

struct ReportSnapshot {
    result: String,
    inbound_direct: bool,
    number_id: Option<i64>,
    contact_number: Option<String>,
    attempted_at: Option<DateTime<Utc>>,
    scenario_name: Option<String>,
    outbound_line_id: Option<i64>,
    agent_id: Option<i64>,
    agent_phone: Option<String>,
    last_message: Option<String>,
}

fn now_secs() -> String {
    format!(
        "{:.3}",
        chrono::Utc::now().timestamp_millis() as f64 / 1000.0
    )
}

fn build_intent_prompt(transcript: &str, scenario: &ScenarioConfig) -> String {
    let llm = &scenario.llm;
    if !llm.prompt_template.is_empty() {
        return llm
            .prompt_template
            .replace("{transcript}", transcript)
            .replace("{intent_categories}", &llm.intent_categories.join(", "));
    }
    let examples = |category: &str, cap: usize| -> String {
        llm.fallback_tokens
            .get(category)
            .map(|tokens| {
                tokens
                    .iter()
                    .take(cap)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .unwrap_or_default()
    };
    format!(
        "Classify intent into one word: yes / no / number_question / unknown.\n\
         YES = interest or any question about price/place/time/links.\n\
         Examples YES: {}.\n\
         NO = reject/decline. Examples NO: {}.\n\
         NUMBER_QUESTION = asks where we got their number. Examples: {}.\n\
         User: {}",
        examples("yes", 30),
        examples("no", 20),
        examples("number_question", 10),
        transcript
    )
}

fn extract_intent_label(normalized: &str, scenario: &ScenarioConfig) -> Option<String> {
    let first = normalized
        .split_whitespace()
        .map(|tok| tok.trim_matches(|c: char| " ,.;!?\"'".contains(c)))
        .find(|tok| !tok.is_empty())?;
    for category in &scenario.llm.intent_categories {
        if first == category {
            return Some(category.clone());
        }
    }
    if ["yes", "y", "yeah", "ok", "okay"].contains(&first) {
        return Some("yes".into());
    }
    if ["no", "nah", "nope"].contains(&first) {
        return Some("no".into());
    }
    if normalized.contains("number_question") || normalized.contains("number question") {
        return Some("number_question".into());
    }
    None
}

// -- ScenarioHandler hooks ------------------------------------------------

#[async_trait]
impl ScenarioHandler for FlowEngine {
    async fn on_outbound_channel_created(&self, session: &Arc<Session>) {
        debug!("outbound channel ready for session {}", session.session_id);
    }

    async fn on_inbound_channel_created(&self, session: &Arc<Session>) {
        // The session manager assigns the inbound scenario at creation.
        let scenario_name = {
            let state = session.state.lock().await;
            state.meta("scenario_name").map(|s| s.to_string())
        };
        if let Some(name) = scenario_name {
            {
                let mut state = session.state.lock().await;
                if state.meta_flag("flow_started") {
                    return;
                }
                state.set_flag("flow_started");
            }
            info!(
                "running inbound flow '{}' for session {}",
                name, session.session_id
            );
            let entry = self
                .scenario_for(session)
                .await
                .and_then(|s| s.entry_step(true).map(|step| step.step.clone()));
            if let Some(entry) = entry {
                self.run_flow(session, &entry, true).await;
            }
            return;
        }
        // No scenario declares an inbound flow: bridge straight to an agent.
        {
            let mut state = session.state.lock().await;
            state.set_flag("inbound_direct");
        }
        info!(
            "inbound session {} connecting directly to agent",
            session.session_id
        );
        self.play_onhold(session).await;
        self.connect_to_operator(session, "inbound").await;
    }

    async fn on_operator_channel_created(&self, session: &Arc<Session>) {
        debug!("operator leg created for session {}", session.session_id);
    }

    async fn on_call_answered(&self, session: &Arc<Session>, direction: LegDirection) {
        if direction == LegDirection::Operator {
            let on_success = {
                let mut state = session.state.lock().await;
                let result = if state.meta_flag("inbound_direct") {
                    "inbound_call"
                } else {
                    "connected_to_operator"
                };
                if state.result.is_none() {
                    state.result = Some(result.into());
                }
                state.set_flag("operator_connected");
                state.set_meta("operator_connected_at", now_secs());
                state.meta("transfer_on_success").unwrap_or("").to_string()
            };
            self.stop_onhold(session).await;
            info!("operator answered for session {}", session.session_id);
            if !on_success.is_empty() {
                let inbound = {
                    let state = session.state.lock().await;
                    state.meta_flag("flow_inbound")
                };
                self.run_flow(session, &on_success, inbound).await;
            }
            return;
        }
        if direction == LegDirection::Inbound {
            // Inbound flows start from on_inbound_channel_created.
            let mut state = session.state.lock().await;
            state.set_meta("answered_at", now_secs());
            return;
        }

        // Customer (outbound) leg answered: start the scenario.
        {
            let mut state = session.state.lock().await;
            state.set_meta("answered_at", now_secs());
            if state.meta_flag("flow_started") {
                return;
            }
            state.set_flag("flow_started");
        }
        info!("call answered for session {} (customer)", session.session_id);
        let entry = match self.scenario_for(session).await {
            Some(scenario) => scenario.entry_step(false).map(|s| s.step.clone()),
            None => {
                warn!(
                    "no scenario for session {}; hanging up",
                    session.session_id
                );
                self.hangup(session).await;
                return;
            }
        };
        if let Some(entry) = entry {
            self.run_flow(session, &entry, false).await;
        }
    }

    async fn on_playback_finished(&self, session: &Arc<Session>, playback_id: &str) {
        let prompt_key = {
            let mut state = session.state.lock().await;
            state.playbacks.remove(playback_id)
        };
        let Some(prompt_key) = prompt_key else {
            return;
        };
        debug!(
            "playback {} ({}) finished for session {}",
            playback_id, prompt_key, session.session_id
        );
        if prompt_key == "onhold" {
            let operator_connected = {
                let state = session.state.lock().await;
                state.meta_flag("operator_connected") || state.hungup()
            };
            if !operator_connected {
                self.play_onhold(session).await;
            }
            return;
        }
        let (pending_next, inbound) = {
            let mut state = session.state.lock().await;
            let next = state.metadata.remove("pending_playback_next");
            state.metadata.remove("pending_playback_step");
            (next, state.meta_flag("flow_inbound"))
        };
        if let Some(next) = pending_next.filter(|n| !n.is_empty()) {
            self.run_flow(session, &next, inbound).await;
        }
    }

    async fn on_recording_finished(&self, session: &Arc<Session>, recording_name: &str) {
        let job = {
            let mut state = session.state.lock().await;
            if state.meta("recording_name") != Some(recording_name)
                || state.meta("recording_phase").is_none()
            {
                return;
            }
            if !state.processed_recordings.insert(recording_name.to_string()) {
                return;
            }
            (
                state.meta("recording_phase").unwrap_or("").to_string(),
                state.meta_flag("flow_inbound"),
                state.meta("pending_record_next").map(|s| s.to_string()),
                state.meta("pending_record_on_empty").map(|s| s.to_string()),
                state
                    .meta("pending_record_on_failure")
                    .map(|s| s.to_string()),
            )
        };
        let (phase, inbound, next, on_empty, on_failure) = job;
        let session = session.clone();
        let recording_name = recording_name.to_string();
        // Transcription and classification happen off the event path.
        self.spawn_engine_task(move |engine| async move {
            engine
                .process_recording(
                    session,
                    recording_name,
                    phase,
                    inbound,
                    none_if_empty(next),
                    none_if_empty(on_empty),
                    none_if_empty(on_failure),
                )
                .await;
        });
    }

    async fn on_recording_failed(&self, session: &Arc<Session>, recording_name: &str, cause: &str) {
        let job = {
            let mut state = session.state.lock().await;
            if state.meta("recording_name") != Some(recording_name) || state.hungup() {
                return;
            }
            if !state.processed_recordings.insert(recording_name.to_string()) {
                return;
            }
            (
                state.meta_flag("flow_inbound"),
                state
                    .meta("pending_record_on_failure")
                    .map(|s| s.to_string()),
            )
        };
        warn!(
            "recording {} failed for session {} cause={}",
            recording_name, session.session_id, cause
        );
        let (inbound, on_failure) = job;
        if let Some(target) = none_if_empty(on_failure) {
            self.run_flow(session, &target, inbound).await;
        }
    }

    async fn on_call_failed(&self, session: &Arc<Session>, reason: &str) {
        let operator_failed = {
            let state = session.state.lock().await;
            state
                .operator_leg
                .as_ref()
                .map(|leg| matches!(leg.state, LegState::Failed | LegState::Hungup))
                .unwrap_or(false)
                && !state.meta_flag("operator_connected")
        };
        if operator_failed {
            self.handle_operator_failure(session, reason).await;
            return;
        }

        {
            let state = session.state.lock().await;
            if let Some(result) = &state.result {
                debug!(
                    "skipping duplicate on_call_failed for session {} (result={})",
                    session.session_id, result
                );
                return;
            }
        }

        // Customer leg failed: classify from the recorded cause.
        let (cause, cause_txt) = {
            let state = session.state.lock().await;
            (
                state
                    .meta("hangup_cause")
                    .and_then(|c| c.parse::<i64>().ok()),
                state.meta("hangup_cause_txt").unwrap_or("").to_string(),
            )
        };
        let reason_l = reason.to_lowercase();
        let result_value = cause
            .and_then(crate::event::result_for_cause)
            .or_else(|| crate::event::result_for_cause_txt(&cause_txt))
            .unwrap_or({
                if reason_l.contains("busy") {
                    "busy"
                } else if reason_l.contains("congest") || reason_l.contains("failed") {
                    "banned"
                } else {
                    "missed"
                }
            });
        self.set_result(session, result_value, true, true).await;
        warn!(
            "call failed session={} reason={} result={}",
            session.session_id, reason, result_value
        );
        self.hangup(session).await;
    }

    async fn on_call_hangup(&self, session: &Arc<Session>) {
        let snapshot = {
            let mut state = session.state.lock().await;
            state.set_flag("hungup");
            HangupSnapshot {
                operator_connected: state.meta_flag("operator_connected"),
                operator_call_started: state.meta_flag("operator_call_started"),
                inbound_direct: state.meta_flag("inbound_direct"),
                yes_intent: state.meta_flag("intent_yes"),
                no_intent: state.meta_flag("intent_no"),
                app_hangup: state.meta_flag("app_hangup"),
                cause: state
                    .meta("hangup_cause")
                    .and_then(|c| c.parse::<i64>().ok()),
                cause_txt: state.meta("hangup_cause_txt").unwrap_or("").to_string(),
                result: state.result.clone(),
                pending_recording: state
                    .meta("recording_name")
                    .filter(|name| !state.processed_recordings.contains(*name))
                    .map(|s| s.to_string()),
                operator_channel: state
                    .operator_leg
                    .as_ref()
                    .filter(|leg| leg.is_live())
                    .map(|leg| leg.channel_id.clone()),
                operator_mobile: state.meta("operator_mobile").map(|s| s.to_string()),
            }
        };

        // A cancelled step must not leave a recording running.
        if let Some(recording) = &snapshot.pending_recording {
            self.ari.stop_recording(recording).await.ok();
        }

        if snapshot.operator_connected {
            if snapshot.inbound_direct {
                self.set_result(session, "inbound_call", true, true).await;
            }
            return;
        }

        if snapshot.operator_call_started {
            if let Some(channel_id) = &snapshot.operator_channel {
                self.ari.hangup(channel_id).await.ok();
            }
            if let Some(mobile) = &snapshot.operator_mobile {
                self.release_agent(mobile);
            }
            {
                let mut state = session.state.lock().await;
                state.metadata.remove("operator_mobile");
            }
            self.set_result(session, "disconnected", true, true).await;
            self.stop_onhold(session).await;
            return;
        }

        let cause_result = snapshot
            .cause
            .and_then(crate::event::result_for_cause)
            .or_else(|| crate::event::result_for_cause_txt(&snapshot.cause_txt));
        if let Some(cause_result) = cause_result {
            let replaceable = matches!(
                snapshot.result.as_deref(),
                None | Some("user_didnt_answer") | Some("missed") | Some("hangup")
                    | Some("disconnected")
            );
            if replaceable {
                self.set_result(session, cause_result, true, true).await;
                self.stop_onhold(session).await;
                self.hangup(session).await;
                return;
            }
        }

        let replaceable = matches!(
            snapshot.result.as_deref(),
            None | Some("user_didnt_answer") | Some("missed")
        );
        if replaceable {
            if snapshot.yes_intent {
                self.set_result(session, "disconnected", true, true).await;
            } else if snapshot.no_intent {
                self.set_result(session, "not_interested", true, true).await;
            } else if !snapshot.app_hangup {
                self.set_result(session, "hangup", true, true).await;
            } else {
                let fallback = snapshot.result.unwrap_or_else(|| "failed:hangup".into());
                self.set_result(session, &fallback, true, true).await;
            }
        }
        self.stop_onhold(session).await;
    }

    async fn on_call_finished(&self, session: &Arc<Session>) {
        let (result, operator_mobile, operator_line) = {
            let mut state = session.state.lock().await;
            let inbound_direct = state.meta_flag("inbound_direct");
            match &state.result {
                None => {
                    state.result = Some(if inbound_direct {
                        "inbound_call".into()
                    } else {
                        "user_didnt_answer".into()
                    });
                }
                Some(result)
                    if inbound_direct && result != "inbound_call" && result != "disconnected" =>
                {
                    state.result = Some("inbound_call".into());
                }
                _ => {}
            }
            (
                state.result.clone().unwrap_or_default(),
                state.meta("operator_mobile").map(|s| s.to_string()),
                state
                    .meta("operator_outbound_line")
                    .map(|s| s.to_string()),
            )
        };
        if let Some(mobile) = operator_mobile {
            self.release_agent(&mobile);
        }
        if let Some(line) = operator_line {
            self.release_line(&line).await;
        }
        info!(
            "call finished session={} result={}",
            session.session_id, result
        );
        self.report_result(session).await;
    }
}

struct HangupSnapshot {
    operator_connected: bool,
    operator_call_started: bool,
    inbound_direct: bool,
    yes_intent: bool,
    no_intent: bool,
    app_hangup: bool,
    cause: Option<i64>,
    cause_txt: String,
    result: Option<String>,
    pending_recording: Option<String>,
    operator_channel: Option<String>,
    operator_mobile: Option<String>,
}

fn none_if_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{LlmSettings, ScenarioConfig};
    use std::collections::HashMap;

    fn scenario_with_tokens() -> ScenarioConfig {
        let mut fallback = HashMap::new();
        fallback.insert("yes".to_string(), vec!["باشه".to_string()]);
        fallback.insert("no".to_string(), vec!["ممنون".to_string()]);
        ScenarioConfig {
            llm: LlmSettings {
                prompt_template: String::new(),
                intent_categories: vec![
                    "yes".into(),
                    "no".into(),
                    "number_question".into(),
                    "unknown".into(),
                ],
                fallback_tokens: fallback,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_extract_intent_label() {
        let scenario = scenario_with_tokens();
        assert_eq!(
            extract_intent_label("yes", &scenario).as_deref(),
            Some("yes")
        );
        assert_eq!(
            extract_intent_label("yes.", &scenario).as_deref(),
            Some("yes")
        );
        assert_eq!(
            extract_intent_label("okay sure", &scenario).as_deref(),
            Some("yes")
        );
        assert_eq!(
            extract_intent_label("nope", &scenario).as_deref(),
            Some("no")
        );
        assert_eq!(
            extract_intent_label("number_question", &scenario).as_deref(),
            Some("number_question")
        );
        assert_eq!(extract_intent_label("hmm not sure", &scenario), None);
    }

    #[test]
    fn test_build_intent_prompt_template() {
        let mut scenario = scenario_with_tokens();
        scenario.llm.prompt_template =
            "Transcript: {transcript}. Categories: {intent_categories}.".into();
        let prompt = build_intent_prompt("بله", &scenario);
        assert_eq!(
            prompt,
            "Transcript: بله. Categories: yes, no, number_question, unknown."
        );
    }

    #[test]
    fn test_build_intent_prompt_default_includes_examples() {
        let scenario = scenario_with_tokens();
        let prompt = build_intent_prompt("الو", &scenario);
        assert!(prompt.contains("باشه"));
        assert!(prompt.contains("ممنون"));
        assert!(prompt.ends_with("الو"));
    }

    #[test]
    fn test_agent_round_robin_skips_busy() {
        let mut rosters = AgentRosters::default();
        for n in ["0911", "0912", "0913"] {
            rosters.outbound.push(Agent {
                id: None,
                phone_number: n.into(),
            });
        }
        rosters.busy.insert("0912".into());
        assert_eq!(rosters.next_available("outbound").unwrap().phone_number, "0911");
        assert_eq!(rosters.next_available("outbound").unwrap().phone_number, "0913");
        assert_eq!(rosters.next_available("outbound").unwrap().phone_number, "0911");
        rosters.busy.insert("0911".into());
        rosters.busy.insert("0913".into());
        assert!(rosters.next_available("outbound").is_none());
    }

    #[test]
    fn test_none_if_empty() {
        assert_eq!(none_if_empty(Some(String::new())), None);
        assert_eq!(none_if_empty(Some("x".into())).as_deref(), Some("x"));
        assert_eq!(none_if_empty(None), None);
    }
}
