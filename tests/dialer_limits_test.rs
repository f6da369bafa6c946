use dialflow::ari::AriClient;
use dialflow::config::Config;
use dialflow::dialer::Dialer;
use dialflow::logs::CallLogs;
use dialflow::scenario::ScenarioRegistry;
use dialflow::session::manager::LineCoordinator;
use dialflow::session::SessionManager;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn test_config(lines: &[&str], max_concurrent: usize) -> Config {
    let mut config = Config::from_env();
    config.dialer.outbound_numbers = lines.iter().map(|s| s.to_string()).collect();
    config.dialer.max_concurrent_calls = max_concurrent;
    config.sms.fail_alert_threshold = 3;
    config
}

fn build_dialer(lines: &[&str], max_concurrent: usize) -> (Arc<Dialer>, Arc<SessionManager>) {
    let config = Arc::new(test_config(lines, max_concurrent));
    let log_dir = tempfile::tempdir().unwrap();
    let logs = Arc::new(CallLogs::open(log_dir.path().to_str().unwrap()).unwrap());
    std::mem::forget(log_dir);
    let ari = Arc::new(
        AriClient::new(&config.ari, config.timeouts.ari_timeout, 4).unwrap(),
    );
    let registry = Arc::new(ScenarioRegistry::from_scenarios(HashMap::new(), Vec::new()));
    let manager = SessionManager::new(
        ari.clone(),
        registry.clone(),
        logs,
        &config.dialer.outbound_numbers,
        0,
    );
    let dialer = Dialer::new(
        config,
        ari,
        manager.clone(),
        registry,
        None,
        CancellationToken::new(),
    );
    manager.attach_dialer(dialer.clone());
    (dialer, manager)
}

#[tokio::test]
async fn test_inbound_registration_respects_line_capacity() {
    let (dialer, _manager) = build_dialer(&["02191302954"], 2);
    assert!(dialer.register_inbound_session("s1", "02191302954").await);
    assert!(dialer.register_inbound_session("s2", "02191302954").await);
    // Third caller exceeds MAX_CONCURRENT_CALLS and must wait.
    assert!(!dialer.register_inbound_session("s3", "02191302954").await);
}

#[tokio::test]
async fn test_unknown_line_never_blocks_inbound() {
    let (dialer, _manager) = build_dialer(&["02191302954"], 1);
    assert!(dialer.register_inbound_session("s1", "09999999999").await);
    assert!(dialer.register_inbound_session("s2", "09999999999").await);
}

#[tokio::test]
async fn test_waiting_inbound_promoted_after_completion() {
    let (dialer, _manager) = build_dialer(&["02191302954"], 1);
    let line = "02191302954";
    assert!(dialer.register_inbound_session("s1", line).await);
    assert!(!dialer.register_inbound_session("s2", line).await);
    // Still full: the waiting caller cannot be promoted yet.
    assert!(!dialer.try_register_waiting_inbound("s2", line).await);
    dialer.on_session_completed("s1").await;
    assert!(dialer.try_register_waiting_inbound("s2", line).await);
}

#[tokio::test]
async fn test_cancel_waiting_inbound_is_saturating() {
    let (dialer, _manager) = build_dialer(&["02191302954"], 1);
    let line = "02191302954";
    assert!(dialer.register_inbound_session("s1", line).await);
    assert!(!dialer.register_inbound_session("s2", line).await);
    dialer.cancel_waiting_inbound(line).await;
    // Extra cancels must not underflow the waiting count.
    dialer.cancel_waiting_inbound(line).await;
    dialer.on_session_completed("s1").await;
    assert!(dialer.try_register_waiting_inbound("s3", line).await);
}

#[tokio::test]
async fn test_failure_streak_resets_on_completion() {
    let (dialer, _manager) = build_dialer(&["02191302954"], 2);
    dialer.on_result("s1", "missed", Some(1)).await;
    dialer.on_result("s2", "busy", Some(2)).await;
    assert!(!dialer.is_paused().await);
    // A completed session resets the streak before the threshold trips.
    dialer.on_session_completed("s1").await;
    dialer.on_result("s3", "power_off", Some(3)).await;
    dialer.on_result("s4", "not_interested", Some(4)).await;
    assert!(!dialer.is_paused().await);
}

#[tokio::test]
async fn test_consecutive_failures_trip_pause() {
    // FAIL_ALERT_THRESHOLD defaults to 3.
    let (dialer, _manager) = build_dialer(&["02191302954"], 2);
    dialer.on_result("s1", "missed", Some(1)).await;
    dialer.on_result("s2", "failed:vira_quota", Some(2)).await;
    dialer.on_result("s3", "banned", Some(3)).await;
    assert!(dialer.is_paused().await);
}

#[tokio::test]
async fn test_quota_pause_is_immediate() {
    let (dialer, _manager) = build_dialer(&["02191302954"], 2);
    dialer.force_failure_pause("failed:llm_quota").await;
    assert!(dialer.is_paused().await);
}
