use crate::ari::ws::EventSink;
use crate::ari::AriClient;
use crate::event::{result_for_cause, result_for_cause_txt, AriEvent, Channel};
use crate::logs::{stamp, CallLogs};
use crate::scenario::ScenarioRegistry;
use crate::session::{
    normalize_contact_number, normalize_number, BridgeInfo, CallLeg, LegDirection, LegState,
    Session, SessionStatus,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Line label assigned to inbound calls whose DID matches no configured
/// line; such calls are subject to global limits only.
pub const UNMAPPED_LINE: &str = "unmapped";

/// Hooks the flow engine implements; every invocation is guarded by the
/// session manager so no hook failure can take down event dispatch.
#[async_trait]
pub trait ScenarioHandler: Send + Sync {
    async fn on_outbound_channel_created(&self, session: &Arc<Session>);
    async fn on_inbound_channel_created(&self, session: &Arc<Session>);
    async fn on_operator_channel_created(&self, session: &Arc<Session>);
    async fn on_call_answered(&self, session: &Arc<Session>, direction: LegDirection);
    async fn on_call_failed(&self, session: &Arc<Session>, reason: &str);
    async fn on_call_hangup(&self, session: &Arc<Session>);
    async fn on_call_finished(&self, session: &Arc<Session>);
    async fn on_playback_finished(&self, session: &Arc<Session>, playback_id: &str);
    async fn on_recording_finished(&self, session: &Arc<Session>, recording_name: &str);
    async fn on_recording_failed(&self, session: &Arc<Session>, recording_name: &str, cause: &str);
}

/// Dialer-side line accounting the session manager needs for inbound
/// sharing of per-line concurrency.
#[async_trait]
pub trait LineCoordinator: Send + Sync {
    /// Returns false when the line is at capacity; the caller queues.
    async fn register_inbound_session(&self, session_id: &str, line: &str) -> bool;
    async fn try_register_waiting_inbound(&self, session_id: &str, line: &str) -> bool;
    async fn cancel_waiting_inbound(&self, line: &str);
    async fn on_session_completed(&self, session_id: &str);
}

struct TableState {
    sessions: HashMap<String, Arc<Session>>,
    channel_to_session: HashMap<String, String>,
    playback_to_session: HashMap<String, String>,
    recording_to_session: HashMap<String, String>,
    /// line -> FIFO of (session_id, channel_id) waiting for a free slot.
    waiting_inbound: HashMap<String, VecDeque<(String, String)>>,
    queues: HashMap<String, mpsc::UnboundedSender<AriEvent>>,
}

/// The single consistent view of all live calls and the sole mutator of
/// the session table. Events are serialised per session through dedicated
/// queues so one slow session cannot stall another; the table lock is only
/// held for map lookups, inserts, and removes.
pub struct SessionManager {
    ari: Arc<AriClient>,
    registry: Arc<ScenarioRegistry>,
    logs: Arc<CallLogs>,
    inbound_lines: Vec<String>,
    max_inbound_calls: usize,
    handler: OnceLock<Arc<dyn ScenarioHandler>>,
    dialer: OnceLock<Arc<dyn LineCoordinator>>,
    state: Mutex<TableState>,
    self_ref: OnceLock<std::sync::Weak<SessionManager>>,
}

/// Event-stream hand-off into the manager's per-session queues.
pub struct ManagerSink(pub Arc<SessionManager>);

impl EventSink for ManagerSink {
    fn deliver(&self, event: AriEvent) {
        self.0.deliver(event);
    }
}

impl SessionManager {
    pub fn new(
        ari: Arc<AriClient>,
        registry: Arc<ScenarioRegistry>,
        logs: Arc<CallLogs>,
        allowed_inbound_numbers: &[String],
        max_inbound_calls: usize,
    ) -> Arc<Self> {
        let inbound_lines = allowed_inbound_numbers
            .iter()
            .filter_map(|n| normalize_number(n))
            .collect();
        let manager = Arc::new(Self {
            ari,
            registry,
            logs,
            inbound_lines,
            max_inbound_calls,
            handler: OnceLock::new(),
            dialer: OnceLock::new(),
            state: Mutex::new(TableState {
                sessions: HashMap::new(),
                channel_to_session: HashMap::new(),
                playback_to_session: HashMap::new(),
                recording_to_session: HashMap::new(),
                waiting_inbound: HashMap::new(),
                queues: HashMap::new(),
            }),
            self_ref: OnceLock::new(),
        });
        manager
            .self_ref
            .set(Arc::downgrade(&manager))
            .ok();
        manager
    }

    pub fn set_handler(&self, handler: Arc<dyn ScenarioHandler>) {
        self.handler.set(handler).ok();
    }

    pub fn attach_dialer(&self, dialer: Arc<dyn LineCoordinator>) {
        self.dialer.set(dialer).ok();
    }

    fn handler(&self) -> Option<&Arc<dyn ScenarioHandler>> {
        self.handler.get()
    }

    fn dialer(&self) -> Option<&Arc<dyn LineCoordinator>> {
        self.dialer.get()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- Event hand-off ----------------------------------------------------

    /// Resolve the owning session and enqueue the event on its queue. Never
    /// blocks on session work.
    pub fn deliver(&self, event: AriEvent) {
        let key = match self.dispatch_key(&event) {
            Some(key) => key,
            None => {
                match &event {
                    AriEvent::Dial { dialstatus, .. } => {
                        info!("dial event (no session): dialstatus={}", dialstatus)
                    }
                    other => debug!("event for unknown session: {:?}", other),
                }
                return;
            }
        };
        let mut table = self.table();
        let sender = table.queues.entry(key.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            if let Some(manager) = self.self_ref.get().and_then(|w| w.upgrade()) {
                tokio::spawn(manager.run_session_queue(key.clone(), rx));
            }
            tx
        });
        sender.send(event).ok();
    }

    fn dispatch_key(&self, event: &AriEvent) -> Option<String> {
        let table = self.table();
        match event {
            AriEvent::StasisStart { channel, args } => {
                match args.first().map(|s| s.as_str()) {
                    Some("outbound") | Some("operator") if args.len() >= 2 => {
                        Some(args[1].clone())
                    }
                    _ => Some(channel.id.clone()),
                }
            }
            AriEvent::PlaybackStarted { playback } | AriEvent::PlaybackFinished { playback } => {
                table
                    .playback_to_session
                    .get(&playback.id)
                    .cloned()
                    .or_else(|| {
                        target_channel(&playback.target_uri)
                            .and_then(|ch| table.channel_to_session.get(&ch).cloned())
                    })
            }
            AriEvent::RecordingFinished { recording } | AriEvent::RecordingFailed { recording } => {
                table
                    .recording_to_session
                    .get(&recording.name)
                    .cloned()
                    .or_else(|| {
                        target_channel(&recording.target_uri)
                            .and_then(|ch| table.channel_to_session.get(&ch).cloned())
                    })
            }
            other => other.channel_id().and_then(|ch| {
                table.channel_to_session.get(ch).cloned().or_else(|| {
                    // Inbound sessions are keyed by their channel id; events
                    // racing the StasisStart still land on the right queue.
                    table.queues.contains_key(ch).then(|| ch.to_string())
                })
            }),
        }
    }

    async fn run_session_queue(
        self: Arc<Self>,
        key: String,
        mut rx: mpsc::UnboundedReceiver<AriEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            self.process_event(&key, event).await;
        }
        debug!("session queue {} drained", key);
    }

    async fn process_event(&self, key: &str, event: AriEvent) {
        match event {
            AriEvent::StasisStart { channel, args } => {
                self.handle_stasis_start(key, channel, args).await
            }
            AriEvent::ChannelStateChange {
                channel,
                cause,
                cause_txt,
            } => {
                self.handle_state_change(channel, cause, cause_txt).await
            }
            AriEvent::ChannelHangupRequest {
                channel,
                cause,
                cause_txt,
            } => self.handle_hangup(channel, cause, cause_txt).await,
            AriEvent::ChannelDestroyed {
                channel,
                cause,
                cause_txt,
            } => self.handle_destroyed(channel, cause, cause_txt).await,
            AriEvent::StasisEnd { channel } => self.handle_stasis_end(channel).await,
            AriEvent::PlaybackStarted { playback } => {
                let mut table = self.table();
                if !table.playback_to_session.contains_key(&playback.id) {
                    if let Some(session_id) = target_channel(&playback.target_uri)
                        .and_then(|ch| table.channel_to_session.get(&ch).cloned())
                    {
                        table.playback_to_session.insert(playback.id, session_id);
                    }
                }
            }
            AriEvent::PlaybackFinished { playback } => {
                if let Some(session) = self.session_for_key(key) {
                    if let Some(handler) = self.handler() {
                        handler.on_playback_finished(&session, &playback.id).await;
                    }
                }
            }
            AriEvent::RecordingFinished { recording } => {
                if let Some(session) = self.session_for_key(key) {
                    if let Some(handler) = self.handler() {
                        handler
                            .on_recording_finished(&session, &recording.name)
                            .await;
                    }
                }
            }
            AriEvent::RecordingFailed { recording } => {
                if let Some(session) = self.session_for_key(key) {
                    if let Some(handler) = self.handler() {
                        handler
                            .on_recording_failed(&session, &recording.name, &recording.cause)
                            .await;
                    }
                }
            }
            AriEvent::Dial { peer, dialstatus } => {
                // Pre-stasis diagnostics; the cause mapping happens on the
                // hangup events, this only records the status for later.
                info!("dial event: dialstatus={} peer={:?}", dialstatus, peer.as_ref().map(|p| &p.id));
                if dialstatus.is_empty() {
                    return;
                }
                if let Some(session) = self.session_for_key(key) {
                    let mut state = session.state.lock().await;
                    state.set_meta("dialstatus", dialstatus);
                }
            }
        }
    }

    fn session_for_key(&self, key: &str) -> Option<Arc<Session>> {
        self.table().sessions.get(key).cloned()
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.session_for_key(session_id)
    }

    // -- Session creation --------------------------------------------------

    /// Pre-create an outbound session; the dialer calls this right before
    /// origination and the StasisStart for the new leg attaches to it.
    pub async fn create_outbound_session(
        &self,
        contact_number: &str,
        metadata: HashMap<String, String>,
    ) -> Arc<Session> {
        let session_id = Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(session_id.clone(), LegDirection::Outbound));
        {
            let mut state = session.state.lock().await;
            state.set_meta("contact_number", contact_number);
            for (key, value) in metadata {
                state.metadata.insert(key, value);
            }
        }
        self.table()
            .sessions
            .insert(session_id.clone(), session.clone());
        info!("created outbound session {} for {}", session_id, contact_number);
        session
    }

    async fn handle_stasis_start(&self, key: &str, channel: Channel, args: Vec<String>) {
        match args.first().map(|s| s.as_str()) {
            Some("outbound") if args.len() >= 2 => {
                self.attach_outbound_leg(&args[1], channel).await;
            }
            Some("operator") if args.len() >= 2 => {
                let endpoint = args.get(2).cloned().unwrap_or_else(|| "operator".into());
                self.attach_operator_leg(&args[1], channel, endpoint).await;
            }
            _ => {
                self.start_inbound(key, channel).await;
            }
        }
    }

    async fn attach_outbound_leg(&self, session_id: &str, channel: Channel) {
        let session = match self.session_for_key(session_id) {
            Some(session) => session,
            None => {
                // Origination response raced the event; adopt the leg anyway.
                let session = Arc::new(Session::new(session_id.to_string(), LegDirection::Outbound));
                self.table()
                    .sessions
                    .insert(session_id.to_string(), session.clone());
                session
            }
        };
        let channel_id = channel.id.clone();
        {
            let mut state = session.state.lock().await;
            let endpoint = state
                .meta("contact_number")
                .unwrap_or("unknown")
                .to_string();
            state.outbound_leg = Some(CallLeg::new(
                channel_id.clone(),
                LegDirection::Outbound,
                endpoint,
            ));
            state.status = SessionStatus::Ringing;
        }
        self.index_channel(session_id, &channel_id);
        self.ensure_bridge(&session).await;
        self.add_to_bridge(&session, &channel_id).await;
        self.maybe_mark_answered(&session, &channel_id, &channel.state)
            .await;
        if let Some(handler) = self.handler() {
            handler.on_outbound_channel_created(&session).await;
        }
        info!("outbound channel {} joined session {}", channel_id, session_id);
    }

    async fn attach_operator_leg(&self, session_id: &str, channel: Channel, endpoint: String) {
        let session = match self.session_for_key(session_id) {
            Some(session) => session,
            None => {
                // Customer leg already gone; tear down the orphan leg.
                info!(
                    "operator leg {} has no session {}; hanging up",
                    channel.id, session_id
                );
                if let Err(err) = self.ari.hangup(&channel.id).await {
                    debug!("failed to hangup orphan operator leg: {}", err);
                }
                return;
            }
        };
        let channel_id = channel.id.clone();
        {
            let mut state = session.state.lock().await;
            state.operator_leg = Some(CallLeg::new(
                channel_id.clone(),
                LegDirection::Operator,
                endpoint,
            ));
            state.status = SessionStatus::Ringing;
        }
        self.index_channel(session_id, &channel_id);
        self.ensure_bridge(&session).await;
        self.add_to_bridge(&session, &channel_id).await;
        self.maybe_mark_answered(&session, &channel_id, &channel.state)
            .await;
        if let Some(handler) = self.handler() {
            handler.on_operator_channel_created(&session).await;
        }
        info!("operator channel {} joined session {}", channel_id, session_id);
    }

    async fn start_inbound(&self, session_id: &str, channel: Channel) {
        let channel_id = channel.id.clone();
        if self.max_inbound_calls > 0 {
            let active = self.inbound_active_count().await;
            if active >= self.max_inbound_calls {
                warn!(
                    "inbound concurrency limit reached ({}); rejecting channel {}",
                    self.max_inbound_calls, channel_id
                );
                self.ari.hangup(&channel_id).await.ok();
                return;
            }
        }

        let inbound_line = self.detect_inbound_line(&channel);
        let inbound_scenario = self.registry.next_inbound();
        let mut waiting_for_slot = false;
        if let (Some(line), Some(dialer)) = (&inbound_line, self.dialer()) {
            waiting_for_slot = !dialer.register_inbound_session(session_id, line).await;
            if waiting_for_slot {
                info!(
                    "inbound channel {} queued for line {} (capacity full)",
                    channel_id, line
                );
            }
        }

        let session = Arc::new(Session::new(session_id.to_string(), LegDirection::Inbound));
        let caller_number = channel.caller.number.clone();
        {
            let mut state = session.state.lock().await;
            state.inbound_leg = Some(CallLeg::new(
                channel_id.clone(),
                LegDirection::Inbound,
                if caller_number.is_empty() {
                    "unknown".into()
                } else {
                    caller_number.clone()
                },
            ));
            state.status = if waiting_for_slot {
                SessionStatus::Initiating
            } else {
                SessionStatus::Ringing
            };
            if !caller_number.is_empty() {
                state.set_meta("caller_number", caller_number.clone());
                state.set_meta("contact_number", caller_number.clone());
            }
            state.set_meta(
                "inbound_line",
                inbound_line.clone().unwrap_or_else(|| UNMAPPED_LINE.into()),
            );
            if let Some(name) = &inbound_scenario {
                state.set_meta("scenario_name", name.clone());
            }
            if waiting_for_slot {
                state.set_flag("inbound_waiting");
            }
        }
        self.table()
            .sessions
            .insert(session_id.to_string(), session.clone());
        self.update_contact_number(&session, &[Some(caller_number)])
            .await;
        self.index_channel(session_id, &channel_id);
        self.ensure_bridge(&session).await;
        self.add_to_bridge(&session, &channel_id).await;
        if waiting_for_slot {
            if let Some(line) = inbound_line {
                self.table()
                    .waiting_inbound
                    .entry(line)
                    .or_default()
                    .push_back((session_id.to_string(), channel_id));
            }
            return;
        }
        self.accept_inbound(&session, &channel_id, Some(&channel.state))
            .await;
    }

    /// Auto-answer an inbound leg and hand the session to the scenario. SIP
    /// header probes refine the contact number afterwards.
    async fn accept_inbound(
        &self,
        session: &Arc<Session>,
        channel_id: &str,
        channel_state: Option<&str>,
    ) {
        if let Err(err) = self.ari.answer(channel_id).await {
            warn!("failed to answer inbound channel {}: {}", channel_id, err);
        }
        if let Some(state) = channel_state {
            self.maybe_mark_answered(session, channel_id, state).await;
        }
        if let Some(handler) = self.handler() {
            handler.on_inbound_channel_created(session).await;
        }
        let diversion = self.read_sip_header(channel_id, "Diversion").await;
        let asserted = self.read_sip_header(channel_id, "P-Asserted-Identity").await;
        self.update_contact_number(session, &[asserted.clone(), diversion.clone()])
            .await;
        {
            let mut state = session.state.lock().await;
            if let Some(diversion) = diversion {
                state.set_meta("diversion", diversion);
            }
            if let Some(asserted) = asserted {
                state.set_meta("p_asserted_identity", asserted);
            }
        }
        info!(
            "inbound channel {} active in session {}",
            channel_id, session.session_id
        );
    }

    async fn read_sip_header(&self, channel_id: &str, name: &str) -> Option<String> {
        self.ari
            .get_channel_var(channel_id, &format!("PJSIP_HEADER(read,{})", name))
            .await
    }

    // -- State transitions -------------------------------------------------

    async fn handle_state_change(
        &self,
        channel: Channel,
        cause: Option<i64>,
        cause_txt: Option<String>,
    ) {
        let Some(session) = self.session_by_channel(&channel.id) else {
            info!("state change for unknown channel {}", channel.id);
            return;
        };
        let mut answered = false;
        let mut failed = false;
        {
            let mut state = session.state.lock().await;
            let Some(leg) = state.find_leg_mut(&channel.id) else {
                debug!("no leg mapped for channel {}", channel.id);
                return;
            };
            match channel.state.as_str() {
                "Up" => {
                    leg.state = LegState::Answered;
                    answered = true;
                }
                "Ringing" => leg.state = LegState::Ringing,
                "Busy" | "Failed" => {
                    leg.state = LegState::Failed;
                    failed = true;
                    let is_operator = leg.direction == LegDirection::Operator;
                    state.status = SessionStatus::Failed;
                    if is_operator && state.result.is_none() {
                        state.result = Some("failed:operator_failed".into());
                    }
                }
                _ => {}
            }
            if answered {
                state.status = SessionStatus::Active;
            }
        }

        if answered {
            self.maybe_mark_answered(&session, &channel.id, "Up").await;
            return;
        }
        if failed {
            if let Some(handler) = self.handler() {
                handler
                    .on_call_failed(&session, cause_txt.as_deref().unwrap_or(&channel.state))
                    .await;
            }
            return;
        }
        // Early busy/congestion signals may ride on progress updates.
        let cause_hit = cause.and_then(result_for_cause).is_some()
            || cause_txt
                .as_deref()
                .and_then(result_for_cause_txt)
                .is_some();
        if cause_hit {
            self.remember_cause(&session, cause, cause_txt.as_deref()).await;
            if let Some(handler) = self.handler() {
                let reason = cause_txt
                    .or_else(|| cause.map(|c| c.to_string()))
                    .unwrap_or_default();
                handler.on_call_failed(&session, &reason).await;
            }
        }
    }

    async fn remember_cause(
        &self,
        session: &Arc<Session>,
        cause: Option<i64>,
        cause_txt: Option<&str>,
    ) {
        let mut state = session.state.lock().await;
        if let Some(cause) = cause {
            state.set_meta("hangup_cause", cause.to_string());
        }
        if let Some(cause_txt) = cause_txt {
            state.set_meta("hangup_cause_txt", cause_txt);
        }
    }

    async fn handle_hangup(
        &self,
        channel: Channel,
        cause: Option<i64>,
        cause_txt: Option<String>,
    ) {
        let Some(session) = self.session_by_channel(&channel.id) else {
            debug!("hangup for unknown channel {}", channel.id);
            return;
        };
        self.remember_cause(&session, cause, cause_txt.as_deref()).await;
        let (leg_direction, contact, result) = {
            let mut state = session.state.lock().await;
            let direction = state
                .find_leg_mut(&channel.id)
                .map(|leg| {
                    leg.state = LegState::Hungup;
                    leg.direction
                });
            if direction != Some(LegDirection::Operator) {
                state.status = SessionStatus::Completed;
            }
            if let Some(direction) = direction {
                state.set_meta("hungup_by", direction.as_str());
            }
            (
                direction,
                state.meta("contact_number").unwrap_or("-").to_string(),
                state.result.clone(),
            )
        };

        self.logs.hangups.write_line(&stamp(&format!(
            "Hangup session={} contact={} channel={} leg={} cause={:?} cause_txt={:?} result={:?}",
            session.session_id,
            contact,
            channel.id,
            leg_direction.map(|d| d.as_str()).unwrap_or("unknown"),
            cause,
            cause_txt,
            result,
        )));

        // Operator leg dropping before answer is a transfer failure, not
        // the end of the customer call.
        if leg_direction == Some(LegDirection::Operator) {
            let customer_live = {
                let state = session.state.lock().await;
                !state.meta_flag("operator_connected")
                    && state.customer_leg().map(|l| l.is_live()).unwrap_or(false)
            };
            if customer_live {
                if let Some(handler) = self.handler() {
                    let reason = cause_txt.unwrap_or_else(|| "operator hangup".into());
                    handler.on_call_failed(&session, &reason).await;
                }
                return;
            }
        }

        if leg_direction == Some(LegDirection::Outbound) {
            self.log_userdrop(&session, cause, cause_txt.as_deref()).await;
        }

        // Clear failure causes shortcut the scenario before cleanup.
        let cause_hit = cause.and_then(result_for_cause).is_some()
            || cause_txt
                .as_deref()
                .and_then(result_for_cause_txt)
                .is_some();
        if cause_hit {
            if let Some(handler) = self.handler() {
                let reason = cause_txt
                    .clone()
                    .or_else(|| cause.map(|c| c.to_string()))
                    .unwrap_or_default();
                handler.on_call_failed(&session, &reason).await;
            }
        }

        if let Some(handler) = self.handler() {
            handler.on_call_hangup(&session).await;
        }
        self.cleanup_session(&session).await;
    }

    async fn log_userdrop(&self, session: &Arc<Session>, cause: Option<i64>, cause_txt: Option<&str>) {
        let state = session.state.lock().await;
        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        let delta = |key: &str| -> String {
            state
                .meta(key)
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| *v > 0.0)
                .map(|v| format!("{:.3}", now - v))
                .unwrap_or_else(|| "na".into())
        };
        self.logs.userdrop.write_line(&stamp(&format!(
            "UserDrop session={} contact={} result={:?} cause={:?} cause_txt={:?} t_answer_to_hang={} t_yes_to_hang={}",
            session.session_id,
            state.meta("contact_number").unwrap_or("-"),
            state.result,
            cause,
            cause_txt,
            delta("answered_at"),
            delta("yes_at"),
        )));
    }

    async fn handle_destroyed(
        &self,
        channel: Channel,
        cause: Option<i64>,
        cause_txt: Option<String>,
    ) {
        let Some(session) = self.session_by_channel(&channel.id) else {
            return;
        };
        self.remember_cause(&session, cause, cause_txt.as_deref()).await;
        let (leg_direction, customer_live) = {
            let mut state = session.state.lock().await;
            let direction = state.find_leg_mut(&channel.id).map(|leg| {
                leg.state = LegState::Hungup;
                leg.direction
            });
            let customer_live = !state.meta_flag("operator_connected")
                && state.customer_leg().map(|l| l.is_live()).unwrap_or(false);
            if direction != Some(LegDirection::Operator) {
                state.status = SessionStatus::Completed;
            }
            (direction, customer_live)
        };
        if leg_direction == Some(LegDirection::Operator) && customer_live {
            // Operator originate timed out or was rejected before Stasis.
            if let Some(handler) = self.handler() {
                let reason = cause_txt.unwrap_or_else(|| "operator destroyed".into());
                handler.on_call_failed(&session, &reason).await;
            }
            return;
        }
        self.cleanup_session(&session).await;
    }

    async fn handle_stasis_end(&self, channel: Channel) {
        let Some(session) = self.session_by_channel(&channel.id) else {
            return;
        };
        let is_operator = {
            let state = session.state.lock().await;
            state
                .operator_leg
                .as_ref()
                .map(|l| l.channel_id == channel.id)
                .unwrap_or(false)
        };
        if is_operator {
            // Handled by the destroyed/hangup path for the operator leg.
            return;
        }
        self.cleanup_session(&session).await;
    }

    async fn maybe_mark_answered(&self, session: &Arc<Session>, channel_id: &str, channel_state: &str) {
        if channel_state != "Up" {
            return;
        }
        let direction = {
            let mut state = session.state.lock().await;
            let direction = state.find_leg_mut(channel_id).map(|leg| {
                leg.state = LegState::Answered;
                leg.direction
            });
            if direction.is_some() {
                state.status = SessionStatus::Active;
            }
            direction
        };
        if let (Some(direction), Some(handler)) = (direction, self.handler()) {
            handler.on_call_answered(session, direction).await;
        }
    }

    // -- Bridge and index upkeep -------------------------------------------

    async fn ensure_bridge(&self, session: &Arc<Session>) {
        {
            let state = session.state.lock().await;
            if state.bridge.is_some() {
                return;
            }
        }
        match self
            .ari
            .create_bridge(&format!("session-{}", session.session_id))
            .await
        {
            Ok(bridge) => {
                let mut state = session.state.lock().await;
                if state.bridge.is_none() {
                    info!(
                        "bridge {} created for session {}",
                        bridge.id, session.session_id
                    );
                    state.bridge = Some(BridgeInfo {
                        bridge_id: bridge.id,
                    });
                }
            }
            Err(err) => {
                warn!(
                    "failed to create bridge for session {}: {}",
                    session.session_id, err
                );
            }
        }
    }

    async fn add_to_bridge(&self, session: &Arc<Session>, channel_id: &str) {
        let bridge_id = {
            let state = session.state.lock().await;
            state.bridge.as_ref().map(|b| b.bridge_id.clone())
        };
        if let Some(bridge_id) = bridge_id {
            if let Err(err) = self.ari.add_channel_to_bridge(&bridge_id, channel_id).await {
                warn!(
                    "failed to add channel {} to bridge {}: {}",
                    channel_id, bridge_id, err
                );
            }
        }
    }

    /// Also used by the dialer and flow engine right after an origination
    /// response, so events racing the StasisStart still resolve.
    pub fn index_channel(&self, session_id: &str, channel_id: &str) {
        self.table()
            .channel_to_session
            .insert(channel_id.to_string(), session_id.to_string());
    }

    fn session_by_channel(&self, channel_id: &str) -> Option<Arc<Session>> {
        let table = self.table();
        table
            .channel_to_session
            .get(channel_id)
            .and_then(|id| table.sessions.get(id))
            .cloned()
    }

    pub fn register_playback(&self, session_id: &str, playback_id: &str) {
        self.table()
            .playback_to_session
            .insert(playback_id.to_string(), session_id.to_string());
    }

    pub fn register_recording(&self, session_id: &str, recording_name: &str) {
        self.table()
            .recording_to_session
            .insert(recording_name.to_string(), session_id.to_string());
    }

    pub async fn inbound_active_count(&self) -> usize {
        let sessions: Vec<Arc<Session>> = self.table().sessions.values().cloned().collect();
        let mut count = 0;
        for session in sessions {
            if session.direction != LegDirection::Inbound {
                continue;
            }
            let state = session.state.lock().await;
            if matches!(state.status, SessionStatus::Ringing | SessionStatus::Active)
                && !state.meta_flag("inbound_waiting")
            {
                count += 1;
            }
        }
        count
    }

    pub fn active_session_count(&self) -> usize {
        self.table().sessions.len()
    }

    // -- Inbound line mapping ----------------------------------------------

    fn detect_inbound_line(&self, channel: &Channel) -> Option<String> {
        for raw in [&channel.connected.number, &channel.dialplan.exten] {
            let Some(norm) = normalize_number(raw) else {
                continue;
            };
            if let Some(line) = self.match_line_number(&norm) {
                return Some(line);
            }
        }
        None
    }

    /// Match an inbound DID against configured lines: exact,
    /// zero-trimmed, or last-four-digit match, first configured line wins.
    fn match_line_number(&self, candidate: &str) -> Option<String> {
        let trimmed_candidate = candidate.trim_start_matches('0');
        for line in &self.inbound_lines {
            if candidate == line {
                return Some(line.clone());
            }
            let trimmed_line = line.trim_start_matches('0');
            if !trimmed_candidate.is_empty() && trimmed_candidate == trimmed_line {
                return Some(line.clone());
            }
            if line.len() >= 4 && candidate.len() >= 4 && candidate[candidate.len() - 4..] == line[line.len() - 4..] {
                return Some(line.clone());
            }
        }
        None
    }

    async fn update_contact_number(&self, session: &Arc<Session>, candidates: &[Option<String>]) {
        let mut state = session.state.lock().await;
        let current = state
            .meta("contact_number")
            .and_then(normalize_contact_number);
        let mut resolved = current.clone();
        for candidate in candidates.iter().flatten() {
            let Some(norm) = normalize_contact_number(candidate) else {
                continue;
            };
            match &resolved {
                Some(existing) => {
                    // Prefer the variant with the leading zero restored.
                    if !existing.starts_with('0') && norm.starts_with('0') && norm.ends_with(existing.as_str()) {
                        resolved = Some(norm);
                    }
                }
                None => resolved = Some(norm),
            }
            break;
        }
        if let Some(resolved) = resolved {
            state.set_meta("contact_number", resolved);
        }
    }

    // -- Cleanup -----------------------------------------------------------

    /// Idempotent teardown: final report, best-effort leg hangup, index
    /// removal, bridge deletion, line release, inbound wake-up.
    pub async fn cleanup_session(&self, session: &Arc<Session>) {
        {
            let mut state = session.state.lock().await;
            if state.meta_flag("cleanup_done") {
                return;
            }
            state.set_flag("cleanup_done");
        }
        session.cancel_token.cancel();

        let report = {
            let mut state = session.state.lock().await;
            if state.meta_flag("finished_reported") {
                false
            } else {
                state.set_flag("finished_reported");
                true
            }
        };
        if report {
            if let Some(handler) = self.handler() {
                handler.on_call_finished(session).await;
            }
        }

        let live_legs = {
            let state = session.state.lock().await;
            state.live_legs()
        };
        for leg in live_legs {
            if let Err(err) = self.ari.hangup(&leg.channel_id).await {
                if !err.is_not_found() {
                    warn!(
                        "failed to hangup leg {} of session {}: {}",
                        leg.channel_id, session.session_id, err
                    );
                }
            }
        }

        let (bridge_id, inbound_line) = {
            let state = session.state.lock().await;
            (
                state.bridge.as_ref().map(|b| b.bridge_id.clone()),
                state
                    .meta("inbound_line")
                    .or(state.meta("outbound_line"))
                    .map(|s| s.to_string()),
            )
        };

        let waiting_line = {
            let mut table = self.table();
            table
                .channel_to_session
                .retain(|_, id| id != &session.session_id);
            table
                .playback_to_session
                .retain(|_, id| id != &session.session_id);
            table
                .recording_to_session
                .retain(|_, id| id != &session.session_id);
            table.sessions.remove(&session.session_id);
            table.queues.remove(&session.session_id);
            let mut waiting_line = None;
            for (line, queue) in table.waiting_inbound.iter_mut() {
                let before = queue.len();
                queue.retain(|(sid, _)| sid != &session.session_id);
                if queue.len() != before {
                    waiting_line = Some(line.clone());
                }
            }
            table.waiting_inbound.retain(|_, q| !q.is_empty());
            waiting_line
        };
        if let (Some(line), Some(dialer)) = (waiting_line, self.dialer()) {
            dialer.cancel_waiting_inbound(&line).await;
        }

        if let Some(bridge_id) = bridge_id {
            if let Err(err) = self.ari.destroy_bridge(&bridge_id).await {
                if err.is_not_found() {
                    debug!("bridge {} already gone", bridge_id);
                } else {
                    warn!(
                        "failed to delete bridge {} for session {}: {}",
                        bridge_id, session.session_id, err
                    );
                }
            }
        }

        if let Some(dialer) = self.dialer() {
            dialer.on_session_completed(&session.session_id).await;
        }
        if let Some(line) = inbound_line {
            if line != UNMAPPED_LINE {
                self.wake_waiting_inbound(&line).await;
            }
        }
        info!("cleaned session {}", session.session_id);
    }

    /// Promote queued inbound callers on a freed line, FIFO. Outbound
    /// origination on the line stays blocked while this queue is non-empty.
    pub async fn wake_waiting_inbound(&self, line: &str) {
        let Some(dialer) = self.dialer() else {
            return;
        };
        loop {
            let head = {
                let table = self.table();
                table
                    .waiting_inbound
                    .get(line)
                    .and_then(|q| q.front().cloned())
            };
            let Some((session_id, channel_id)) = head else {
                return;
            };
            if !dialer.try_register_waiting_inbound(&session_id, line).await {
                return;
            }
            {
                let mut table = self.table();
                if let Some(queue) = table.waiting_inbound.get_mut(line) {
                    if queue.front().map(|(sid, _)| sid == &session_id).unwrap_or(false) {
                        queue.pop_front();
                    }
                    if queue.is_empty() {
                        table.waiting_inbound.remove(line);
                    }
                }
            }
            let Some(session) = self.session_for_key(&session_id) else {
                dialer.on_session_completed(&session_id).await;
                continue;
            };
            {
                let mut state = session.state.lock().await;
                state.metadata.remove("inbound_waiting");
                state.status = SessionStatus::Ringing;
            }
            self.accept_inbound(&session, &channel_id, None).await;
            return;
        }
    }

    pub fn waiting_inbound_count(&self, line: &str) -> usize {
        self.table()
            .waiting_inbound
            .get(line)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Orderly shutdown: cancel and tear down every live session.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.table().sessions.values().cloned().collect();
        for session in sessions {
            session.cancel_token.cancel();
            self.cleanup_session(&session).await;
        }
    }
}

fn target_channel(target_uri: &str) -> Option<String> {
    target_uri
        .strip_prefix("channel:")
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_lines(lines: &[&str]) -> Arc<SessionManager> {
        let dir = tempfile::tempdir().unwrap();
        let logs = Arc::new(CallLogs::open(dir.path().to_str().unwrap()).unwrap());
        std::mem::forget(dir);
        let ari = Arc::new(
            AriClient::new(
                &crate::config::AriConfig {
                    base_url: "http://127.0.0.1:1".into(),
                    ws_url: "ws://127.0.0.1:1".into(),
                    app_name: "test".into(),
                    username: "u".into(),
                    password: "p".into(),
                },
                1.0,
                1,
            )
            .unwrap(),
        );
        let registry = Arc::new(ScenarioRegistry::from_scenarios(
            Default::default(),
            Vec::new(),
        ));
        let lines: Vec<String> = lines.iter().map(|s| s.to_string()).collect();
        SessionManager::new(ari, registry, logs, &lines, 0)
    }

    #[test]
    fn test_line_matching_last_four() {
        let manager = manager_with_lines(&["02191302954", "02191302955"]);
        assert_eq!(
            manager.match_line_number("2954").as_deref(),
            Some("02191302954")
        );
        assert_eq!(
            manager.match_line_number("91302954").as_deref(),
            Some("02191302954")
        );
        assert_eq!(
            manager.match_line_number("02191302955").as_deref(),
            Some("02191302955")
        );
        assert_eq!(manager.match_line_number("09121111111"), None);
    }

    #[test]
    fn test_line_matching_trimmed_zero() {
        let manager = manager_with_lines(&["02191302954"]);
        assert_eq!(
            manager.match_line_number("2191302954").as_deref(),
            Some("02191302954")
        );
    }

    #[test]
    fn test_target_channel_parsing() {
        assert_eq!(target_channel("channel:c1").as_deref(), Some("c1"));
        assert_eq!(target_channel("bridge:b1"), None);
    }

    #[tokio::test]
    async fn test_create_outbound_session_indexes() {
        let manager = manager_with_lines(&[]);
        let session = manager
            .create_outbound_session("09123456789", HashMap::new())
            .await;
        assert!(manager.get_session(&session.session_id).is_some());
        let state = session.state.lock().await;
        assert_eq!(state.meta("contact_number"), Some("09123456789"));
    }
}
