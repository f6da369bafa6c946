use crate::ari::AriClient;
use crate::config::Config;
use crate::flow::{Agent, FlowEngine};
use crate::panel::{NextBatch, PanelClient, ResultReport};
use crate::scenario::ScenarioRegistry;
use crate::session::manager::LineCoordinator;
use crate::session::{normalize_number, SessionManager, SessionStatus};
use crate::sms::SmsClient;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ContactItem {
    pub phone_number: String,
    pub number_id: Option<i64>,
}

struct LineStats {
    panel_id: Option<i64>,
    active: usize,
    inbound_active: usize,
    attempts: VecDeque<DateTime<Utc>>,
    daily: usize,
    daily_marker: NaiveDate,
    last_originated: Option<Instant>,
}

impl LineStats {
    fn new() -> Self {
        Self {
            panel_id: None,
            active: 0,
            inbound_active: 0,
            attempts: VecDeque::new(),
            daily: 0,
            daily_marker: Local::now().date_naive(),
            last_originated: None,
        }
    }

    fn total_active(&self) -> usize {
        self.active + self.inbound_active
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - ChronoDuration::minutes(1);
        while self
            .attempts
            .front()
            .map(|t| *t < cutoff)
            .unwrap_or(false)
        {
            self.attempts.pop_front();
        }
        let today = Local::now().date_naive();
        if self.daily_marker != today {
            self.daily_marker = today;
            self.daily = 0;
        }
    }

    fn originations_this_second(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - ChronoDuration::seconds(1);
        self.attempts.iter().filter(|t| **t >= cutoff).count()
    }
}

struct DialerState {
    contacts: VecDeque<ContactItem>,
    lines: HashMap<String, LineStats>,
    line_order: Vec<String>,
    session_line: HashMap<String, String>,
    inbound_session_line: HashMap<String, String>,
    waiting_inbound: HashMap<String, usize>,
    daily_counter: usize,
    daily_marker: NaiveDate,
    window_start: Option<Instant>,
    window_count: usize,
    failure_streak: u32,
    paused_by_failures: bool,
    paused_reason: String,
    next_panel_poll: DateTime<Utc>,
    last_failure: Option<(Option<i64>, Option<String>)>,
}

/// Outbound dialer: acquires contact batches, picks the least-loaded
/// permissible line, throttles originations, watches for silent attempts,
/// and pauses itself on cascading failures.
pub struct Dialer {
    config: Arc<Config>,
    ari: Arc<AriClient>,
    session_manager: Arc<SessionManager>,
    registry: Arc<ScenarioRegistry>,
    panel: Option<Arc<PanelClient>>,
    sms: Option<SmsClient>,
    flow: OnceLock<Arc<FlowEngine>>,
    state: Mutex<DialerState>,
    cancel_token: CancellationToken,
    self_ref: OnceLock<Weak<Dialer>>,
}

impl Dialer {
    pub fn new(
        config: Arc<Config>,
        ari: Arc<AriClient>,
        session_manager: Arc<SessionManager>,
        registry: Arc<ScenarioRegistry>,
        panel: Option<Arc<PanelClient>>,
        cancel_token: CancellationToken,
    ) -> Arc<Self> {
        let mut lines = HashMap::new();
        let mut line_order = Vec::new();
        for number in &config.dialer.outbound_numbers {
            let Some(norm) = normalize_number(number) else {
                continue;
            };
            if !lines.contains_key(&norm) {
                line_order.push(norm.clone());
                lines.insert(norm, LineStats::new());
            }
        }
        let contacts = config
            .dialer
            .static_contacts
            .iter()
            .map(|number| ContactItem {
                phone_number: number.clone(),
                number_id: None,
            })
            .collect();
        let sms = SmsClient::new(config.sms.clone());
        let dialer = Arc::new(Self {
            config,
            ari,
            session_manager,
            registry,
            panel,
            sms,
            flow: OnceLock::new(),
            state: Mutex::new(DialerState {
                contacts,
                lines,
                line_order,
                session_line: HashMap::new(),
                inbound_session_line: HashMap::new(),
                waiting_inbound: HashMap::new(),
                daily_counter: 0,
                daily_marker: Local::now().date_naive(),
                window_start: None,
                window_count: 0,
                failure_streak: 0,
                paused_by_failures: false,
                paused_reason: String::new(),
                next_panel_poll: Utc::now(),
                last_failure: None,
            }),
            cancel_token,
            self_ref: OnceLock::new(),
        });
        dialer.self_ref.set(Arc::downgrade(&dialer)).ok();
        dialer
    }

    pub fn attach_flow(&self, flow: Arc<FlowEngine>) {
        self.flow.set(flow).ok();
    }

    pub async fn run(&self) {
        info!(
            "dialer started with {} queued contacts",
            self.state.lock().await.contacts.len()
        );
        loop {
            if self.cancel_token.is_cancelled() {
                break;
            }
            self.reset_daily_if_needed().await;
            self.maybe_refill_from_panel().await;

            if self.state.lock().await.paused_by_failures {
                self.sleep(Duration::from_secs(2)).await;
                continue;
            }
            if self.available_line().await.is_none() {
                // Inbound-priority yield point.
                self.sleep(Duration::from_millis(100)).await;
                continue;
            }
            let contact = {
                let mut state = self.state.lock().await;
                state.contacts.pop_front()
            };
            let Some(contact) = contact else {
                self.sleep(Duration::from_secs(5)).await;
                continue;
            };
            self.throttle_originations().await;
            if self.cancel_token.is_cancelled() {
                break;
            }
            self.originate(contact).await;
            self.sleep(Duration::from_millis(50)).await;
        }
        info!("dialer stopped");
    }

    async fn sleep(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.cancel_token.cancelled() => {}
        }
    }

    /// Global origination throttle: no more than
    /// `MAX_ORIGINATIONS_PER_SECOND` across all lines in any window.
    async fn throttle_originations(&self) {
        let rate = self.config.dialer.max_originations_per_second;
        if rate <= 0.0 {
            return;
        }
        let limit = rate.floor().max(1.0) as usize;
        let wait = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            match state.window_start {
                Some(start) if now.duration_since(start) < Duration::from_secs(1) => {
                    if state.window_count >= limit {
                        Some(Duration::from_secs(1) - now.duration_since(start))
                    } else {
                        state.window_count += 1;
                        None
                    }
                }
                _ => {
                    state.window_start = Some(now);
                    state.window_count = 1;
                    None
                }
            }
        };
        if let Some(wait) = wait {
            self.sleep(wait).await;
            let mut state = self.state.lock().await;
            state.window_start = Some(Instant::now());
            state.window_count = 1;
        }
    }

    async fn reset_daily_if_needed(&self) {
        let today = Local::now().date_naive();
        let mut state = self.state.lock().await;
        if state.daily_marker != today {
            info!("resetting daily counters");
            state.daily_marker = today;
            state.daily_counter = 0;
            for stats in state.lines.values_mut() {
                stats.daily = 0;
                stats.daily_marker = today;
            }
        }
    }

    // -- Line selection ----------------------------------------------------

    /// Least-loaded permissible line: skip lines at concurrency, rate, or
    /// daily caps, lines with queued inbound callers, and lines originated
    /// on within the per-second spacing. Ties break on originations this
    /// second, then configuration order.
    async fn available_line(&self) -> Option<String> {
        let mut state = self.state.lock().await;
        self.pick_line(&mut state)
    }

    fn pick_line(&self, state: &mut DialerState) -> Option<String> {
        let now = Utc::now();
        let spacing = if self.config.dialer.max_originations_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / self.config.dialer.max_originations_per_second)
        } else {
            Duration::ZERO
        };
        let mut best: Option<(usize, usize, String)> = None;
        let order = state.line_order.clone();
        for line in order {
            let waiting = state.waiting_inbound.get(&line).copied().unwrap_or(0)
                + self.session_manager.waiting_inbound_count(&line);
            let Some(stats) = state.lines.get_mut(&line) else {
                continue;
            };
            stats.prune(now);
            if waiting > 0 {
                continue;
            }
            if stats.total_active() >= self.config.dialer.max_concurrent_calls {
                continue;
            }
            if stats.attempts.len() >= self.config.dialer.max_calls_per_minute {
                continue;
            }
            if stats.daily >= self.config.dialer.max_calls_per_day {
                continue;
            }
            if !spacing.is_zero() {
                if let Some(last) = stats.last_originated {
                    if last.elapsed() < spacing {
                        continue;
                    }
                }
            }
            let load = (stats.total_active(), stats.originations_this_second(now));
            match &best {
                Some((total, per_sec, _)) if (load.0, load.1) >= (*total, *per_sec) => {}
                _ => best = Some((load.0, load.1, line)),
            }
        }
        best.map(|(_, _, line)| line)
    }

    fn charge_line(state: &mut DialerState, line: &str) {
        let now = Utc::now();
        if let Some(stats) = state.lines.get_mut(line) {
            stats.active += 1;
            stats.attempts.push_back(now);
            stats.daily += 1;
            stats.last_originated = Some(Instant::now());
        }
        state.daily_counter += 1;
    }

    // -- Origination -------------------------------------------------------

    async fn originate(&self, contact: ContactItem) {
        let line = {
            let mut state = self.state.lock().await;
            match self.pick_line(&mut state) {
                Some(line) => line,
                None => {
                    info!(
                        "no available outbound line for {}; requeueing",
                        contact.phone_number
                    );
                    state.contacts.push_back(contact);
                    drop(state);
                    self.sleep(Duration::from_secs(1)).await;
                    return;
                }
            }
        };

        let scenario_name = self.registry.next_outbound();
        let attempted_at = Utc::now();
        let mut metadata = HashMap::new();
        metadata.insert("attempted_at".to_string(), attempted_at.to_rfc3339());
        metadata.insert("outbound_line".to_string(), line.clone());
        if let Some(number_id) = contact.number_id {
            metadata.insert("number_id".to_string(), number_id.to_string());
        }
        if let Some(name) = &scenario_name {
            metadata.insert("scenario_name".to_string(), name.clone());
        }
        {
            let state = self.state.lock().await;
            if let Some(panel_id) = state.lines.get(&line).and_then(|s| s.panel_id) {
                metadata.insert("outbound_line_id".to_string(), panel_id.to_string());
            }
        }

        let session = self
            .session_manager
            .create_outbound_session(&contact.phone_number, metadata)
            .await;
        let endpoint = self.build_endpoint(&contact.phone_number, &line);
        let app_args = format!("outbound,{}", session.session_id);
        let result = self
            .ari
            .originate(
                &endpoint,
                &app_args,
                &self.config.dialer.default_caller_id,
                self.config.dialer.origination_timeout,
            )
            .await;
        match result {
            Ok(handle) => {
                self.session_manager
                    .index_channel(&session.session_id, &handle.id);
                {
                    let mut state = self.state.lock().await;
                    Self::charge_line(&mut state, &line);
                    state
                        .session_line
                        .insert(session.session_id.clone(), line.clone());
                }
                self.schedule_timeout_watch(session.session_id.clone());
                info!(
                    "origination requested for {} (session {}) via line {}",
                    contact.phone_number, session.session_id, line
                );
            }
            Err(err) => {
                warn!(
                    "failed to originate call to {}: {}",
                    contact.phone_number, err
                );
                // No events will ever arrive; settle the session now.
                {
                    let mut state = session.state.lock().await;
                    state.result = Some("missed".to_string());
                }
                self.session_manager.cleanup_session(&session).await;
            }
        }
    }

    /// Dial string: last four digits of the chosen line prefix the
    /// customer's number, routed through the outbound trunk.
    fn build_endpoint(&self, phone_number: &str, line: &str) -> String {
        let digits = normalize_number(phone_number).unwrap_or_else(|| phone_number.to_string());
        let suffix = if line.len() >= 4 {
            &line[line.len() - 4..]
        } else {
            line
        };
        format!(
            "PJSIP/{}{}@{}",
            suffix, digits, self.config.dialer.outbound_trunk
        )
    }

    /// If no channel event ever arrives for an origination, declare the
    /// attempt missed and clean up.
    fn schedule_timeout_watch(&self, session_id: String) {
        let delay = Duration::from_secs(self.config.dialer.origination_timeout as u64 + 15);
        let Some(dialer) = self.self_ref.get().and_then(|w| w.upgrade()) else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(session) = dialer.session_manager.get_session(&session_id) else {
                return;
            };
            {
                let mut state = session.state.lock().await;
                if matches!(
                    state.status,
                    SessionStatus::Active | SessionStatus::Completed
                ) || state.result.is_some()
                {
                    return;
                }
                state.result = Some("missed".to_string());
            }
            warn!("session {} marked missed: no events before timeout", session_id);
            dialer.session_manager.cleanup_session(&session).await;
        });
    }

    // -- Panel refill ------------------------------------------------------

    async fn maybe_refill_from_panel(&self) {
        let Some(panel) = &self.panel else {
            return;
        };
        let now = Utc::now();
        let capacity = {
            let mut state = self.state.lock().await;
            if now < state.next_panel_poll {
                return;
            }
            self.available_capacity(&mut state)
        };
        if capacity == 0 {
            return;
        }
        let size = capacity.min(self.config.dialer.batch_size);
        let batch = panel.get_next_batch(size).await;
        self.apply_batch(batch, now).await;
    }

    async fn apply_batch(&self, batch: NextBatch, now: DateTime<Utc>) {
        {
            let mut state = self.state.lock().await;
            if batch.call_allowed && state.paused_by_failures {
                // Explicit operator action on the panel is the only resume.
                info!("panel re-enabled calling; resuming dialer");
                state.paused_by_failures = false;
                state.failure_streak = 0;
                state.paused_reason.clear();
            }
            if !batch.call_allowed {
                let retry = batch
                    .retry_after_seconds
                    .unwrap_or(self.config.dialer.default_retry);
                state.next_panel_poll = now + ChronoDuration::seconds(retry as i64);
                info!(
                    "panel disallowed calls; retry in {}s reason={:?}",
                    retry, batch.reason
                );
                return;
            }
            state.next_panel_poll = now + ChronoDuration::seconds(60);

            // Adopt panel line ids (and any lines configured panel-side).
            for line in &batch.outbound_lines {
                let Some(norm) = normalize_number(&line.phone_number) else {
                    continue;
                };
                if !state.lines.contains_key(&norm) {
                    state.line_order.push(norm.clone());
                    state.lines.insert(norm.clone(), LineStats::new());
                }
                if let Some(stats) = state.lines.get_mut(&norm) {
                    stats.panel_id = line.id;
                }
            }
            let contacts: Vec<ContactItem> = batch
                .contacts
                .iter()
                .map(|c| ContactItem {
                    phone_number: c.phone_number.clone(),
                    number_id: c.id,
                })
                .collect();
            if !contacts.is_empty() {
                info!("queued {} contacts from panel batch", contacts.len());
                state.contacts.extend(contacts);
            }
        }

        self.registry.set_active(&batch.active_scenarios);
        if let Some(flow) = self.flow.get() {
            flow.set_inbound_agents(to_agents(&batch.inbound_agents));
            flow.set_outbound_agents(to_agents(&batch.outbound_agents));
        }
    }

    fn available_capacity(&self, state: &mut DialerState) -> usize {
        let now = Utc::now();
        let mut slots = 0usize;
        let mut outbound_active_total = 0usize;
        let order = state.line_order.clone();
        for line in order {
            let waiting = state.waiting_inbound.get(&line).copied().unwrap_or(0)
                + self.session_manager.waiting_inbound_count(&line);
            let Some(stats) = state.lines.get_mut(&line) else {
                continue;
            };
            stats.prune(now);
            outbound_active_total += stats.active;
            if waiting > 0 {
                continue;
            }
            let concurrency = self
                .config
                .dialer
                .max_concurrent_calls
                .saturating_sub(stats.total_active());
            let per_minute = self
                .config
                .dialer
                .max_calls_per_minute
                .saturating_sub(stats.attempts.len());
            let daily = self
                .config
                .dialer
                .max_calls_per_day
                .saturating_sub(stats.daily);
            slots += concurrency.min(per_minute).min(daily);
        }
        if self.config.dialer.max_concurrent_outbound_calls > 0 {
            let remaining = self
                .config
                .dialer
                .max_concurrent_outbound_calls
                .saturating_sub(outbound_active_total);
            slots = slots.min(remaining);
        }
        slots
    }

    // -- Results and the failure cascade -----------------------------------

    /// Called for every settled result. Non-connecting outcomes grow the
    /// consecutive-failure streak; reaching the threshold trips the pause.
    pub async fn on_result(&self, _session_id: &str, result: &str, number_id: Option<i64>) {
        let tripped = {
            let mut state = self.state.lock().await;
            if is_failed_origination(result) {
                state.failure_streak += 1;
                state.last_failure = Some((number_id, None));
            } else {
                state.failure_streak = 0;
            }
            state.failure_streak >= self.config.sms.fail_alert_threshold
                && !state.paused_by_failures
        };
        if tripped {
            self.trip_failure_pause(result).await;
        }
    }

    /// Immediate pause used for quota errors: the streak is forced to the
    /// threshold so ordinary accounting cannot un-trip it.
    pub async fn force_failure_pause(&self, reason: &str) {
        let already_paused = {
            let mut state = self.state.lock().await;
            let already = state.paused_by_failures;
            state.failure_streak = state
                .failure_streak
                .max(self.config.sms.fail_alert_threshold);
            already
        };
        if !already_paused {
            self.trip_failure_pause(reason).await;
        }
    }

    async fn trip_failure_pause(&self, last_result: &str) {
        let (streak, last_failure) = {
            let mut state = self.state.lock().await;
            state.paused_by_failures = true;
            state.paused_reason = "consecutive_failures".to_string();
            (state.failure_streak, state.last_failure.clone())
        };
        let message = format!(
            "Dialer paused after {} consecutive failures. Last result={}",
            streak, last_result
        );
        tracing::error!("{}", message);
        if let Some(sms) = &self.sms {
            if let Err(err) = sms.send_alert(&message).await {
                warn!("sms alert send failed: {}", err);
            }
        }
        if let Some(panel) = &self.panel {
            let (number_id, phone_number) = last_failure.unwrap_or((None, None));
            let mut report = ResultReport::new("FAILED", last_result);
            report.number_id = number_id;
            report.phone_number = phone_number;
            report.call_allowed = Some(false);
            panel.report_result(report).await;
        }
    }

    pub async fn is_paused(&self) -> bool {
        self.state.lock().await.paused_by_failures
    }

    pub async fn calls_today(&self) -> usize {
        self.state.lock().await.daily_counter
    }

    // -- Operator line reservation ------------------------------------------

    /// Reserve a line for an operator leg, waiting briefly for one to free
    /// up. Charges the same counters as a regular origination.
    pub async fn reserve_operator_line(&self) -> Option<String> {
        let deadline =
            Instant::now() + Duration::from_secs(self.config.operator.timeout.max(5) as u64);
        while Instant::now() < deadline {
            {
                let mut state = self.state.lock().await;
                if let Some(line) = self.pick_line(&mut state) {
                    Self::charge_line(&mut state, &line);
                    return Some(line);
                }
            }
            if self.cancel_token.is_cancelled() {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }

    pub async fn release_operator_line(&self, line: &str) {
        let mut state = self.state.lock().await;
        if let Some(stats) = state.lines.get_mut(line) {
            stats.active = stats.active.saturating_sub(1);
        }
    }
}

fn to_agents(agents: &[crate::panel::PanelAgent]) -> Vec<Agent> {
    agents
        .iter()
        .filter(|a| !a.phone_number.is_empty())
        .map(|a| Agent {
            id: a.id,
            phone_number: a.phone_number.clone(),
        })
        .collect()
}

/// Results that count as a failed origination for the cascade: the call
/// never reached a live customer.
fn is_failed_origination(result: &str) -> bool {
    matches!(
        result,
        "missed" | "user_didnt_answer" | "busy" | "power_off" | "banned"
    ) || result.starts_with("failed")
}

#[async_trait]
impl LineCoordinator for Dialer {
    async fn register_inbound_session(&self, session_id: &str, line: &str) -> bool {
        let mut state = self.state.lock().await;
        let max_concurrent = self.config.dialer.max_concurrent_calls;
        let Some(stats) = state.lines.get_mut(line) else {
            return true;
        };
        if stats.total_active() >= max_concurrent {
            *state.waiting_inbound.entry(line.to_string()).or_insert(0) += 1;
            return false;
        }
        stats.inbound_active += 1;
        state
            .inbound_session_line
            .insert(session_id.to_string(), line.to_string());
        true
    }

    async fn try_register_waiting_inbound(&self, session_id: &str, line: &str) -> bool {
        let mut state = self.state.lock().await;
        let max_concurrent = self.config.dialer.max_concurrent_calls;
        let Some(stats) = state.lines.get_mut(line) else {
            return true;
        };
        if stats.total_active() >= max_concurrent {
            return false;
        }
        stats.inbound_active += 1;
        state
            .inbound_session_line
            .insert(session_id.to_string(), line.to_string());
        if let Some(count) = state.waiting_inbound.get_mut(line) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.waiting_inbound.remove(line);
            }
        }
        true
    }

    async fn cancel_waiting_inbound(&self, line: &str) {
        let mut state = self.state.lock().await;
        if let Some(count) = state.waiting_inbound.get_mut(line) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.waiting_inbound.remove(line);
            }
        }
    }

    async fn on_session_completed(&self, session_id: &str) {
        debug!("session {} completed; dialer notified", session_id);
        let mut state = self.state.lock().await;
        if let Some(line) = state.session_line.remove(session_id) {
            if let Some(stats) = state.lines.get_mut(&line) {
                stats.active = stats.active.saturating_sub(1);
            }
        }
        if let Some(line) = state.inbound_session_line.remove(session_id) {
            if let Some(stats) = state.lines.get_mut(&line) {
                stats.inbound_active = stats.inbound_active.saturating_sub(1);
            }
        }
        if !state.paused_by_failures {
            state.failure_streak = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::CallLogs;

    fn build_dialer(lines: &[&str]) -> Arc<Dialer> {
        let mut config = crate::config::Config::from_env();
        config.dialer.outbound_numbers = lines.iter().map(|s| s.to_string()).collect();
        let config = Arc::new(config);
        let dir = tempfile::tempdir().unwrap();
        let logs = Arc::new(CallLogs::open(dir.path().to_str().unwrap()).unwrap());
        std::mem::forget(dir);
        let ari = Arc::new(
            AriClient::new(&config.ari, config.timeouts.ari_timeout, 1).unwrap(),
        );
        let registry = Arc::new(ScenarioRegistry::from_scenarios(
            Default::default(),
            Vec::new(),
        ));
        let manager = SessionManager::new(
            ari.clone(),
            registry.clone(),
            logs,
            &config.dialer.outbound_numbers,
            0,
        );
        Dialer::new(
            config,
            ari,
            manager,
            registry,
            None,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_daily_counter_rolls_at_midnight() {
        let dialer = build_dialer(&["02191302954"]);
        let yesterday = Local::now().date_naive() - ChronoDuration::days(1);
        {
            let mut state = dialer.state.lock().await;
            Dialer::charge_line(&mut state, "02191302954");
            assert_eq!(state.daily_counter, 1);
            assert_eq!(state.lines["02191302954"].daily, 1);
            state.daily_marker = yesterday;
            state.lines.get_mut("02191302954").unwrap().daily_marker = yesterday;
        }
        dialer.reset_daily_if_needed().await;
        assert_eq!(dialer.calls_today().await, 0);
        {
            let mut state = dialer.state.lock().await;
            Dialer::charge_line(&mut state, "02191302954");
            assert_eq!(state.daily_counter, 1);
            assert_eq!(state.lines["02191302954"].daily, 1);
        }
    }

    #[tokio::test]
    async fn test_pick_line_prefers_least_loaded() {
        let dialer = build_dialer(&["02191302954", "02191302955"]);
        {
            let mut state = dialer.state.lock().await;
            state.lines.get_mut("02191302954").unwrap().active = 1;
        }
        let picked = dialer.available_line().await;
        assert_eq!(picked.as_deref(), Some("02191302955"));
    }

    #[tokio::test]
    async fn test_pick_line_skips_lines_with_waiting_inbound() {
        let dialer = build_dialer(&["02191302954", "02191302955"]);
        {
            let mut state = dialer.state.lock().await;
            state.waiting_inbound.insert("02191302955".into(), 1);
            state.lines.get_mut("02191302954").unwrap().active = 1;
        }
        // The less-loaded line has inbound callers waiting, so the busier
        // line wins.
        let picked = dialer.available_line().await;
        assert_eq!(picked.as_deref(), Some("02191302954"));
    }

    #[tokio::test]
    async fn test_endpoint_dial_string() {
        let dialer = build_dialer(&["02191302954"]);
        let endpoint = dialer.build_endpoint("0912 345 6789", "02191302954");
        assert!(endpoint.starts_with("PJSIP/295409123456789@"));
    }

    #[test]
    fn test_failed_origination_classes() {
        for result in [
            "missed",
            "user_didnt_answer",
            "busy",
            "power_off",
            "banned",
            "failed:vira_quota",
            "failed:stt_failure",
            "failed",
        ] {
            assert!(is_failed_origination(result), "{}", result);
        }
        for result in [
            "connected_to_operator",
            "not_interested",
            "hangup",
            "disconnected",
            "unknown",
            "inbound_call",
        ] {
            assert!(!is_failed_origination(result), "{}", result);
        }
    }

    #[test]
    fn test_line_stats_prune_window() {
        let mut stats = LineStats::new();
        let now = Utc::now();
        stats.attempts.push_back(now - ChronoDuration::seconds(90));
        stats.attempts.push_back(now - ChronoDuration::seconds(30));
        stats.attempts.push_back(now);
        stats.prune(now);
        assert_eq!(stats.attempts.len(), 2);
        assert_eq!(stats.originations_this_second(now), 1);
    }

    #[test]
    fn test_line_stats_daily_rollover() {
        let mut stats = LineStats::new();
        stats.daily = 10;
        stats.daily_marker = Local::now().date_naive() - ChronoDuration::days(1);
        stats.prune(Utc::now());
        assert_eq!(stats.daily, 0);
    }
}
