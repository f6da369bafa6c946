use dialflow::ari::AriClient;
use dialflow::config::Config;
use dialflow::dialer::Dialer;
use dialflow::flow::FlowEngine;
use dialflow::llm::LlmClient;
use dialflow::logs::CallLogs;
use dialflow::scenario::ScenarioRegistry;
use dialflow::session::manager::{LineCoordinator, ScenarioHandler};
use dialflow::session::{LegDirection, Session, SessionManager};
use dialflow::stt::SttClient;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

const SCENARIO: &str = r#"
scenario:
  name: salehi
  prompts:
    hello: "sound:custom/hello"
    goodby: "sound:custom/goodby"
  llm:
    fallback_tokens:
      yes: ["بله", "باشه"]
      no: ["نه", "ممنون"]
      number_question: ["از کجا"]
  flow:
    - {step: start, type: entry, next: hello}
    - {step: hello, type: play_prompt, prompt: hello, next: classify}
    - {step: classify, type: classify_intent, next: route, on_failure: fail}
    - step: route
      type: route_by_intent
      routes: {yes: accept, no: decline, unknown: decline}
    - {step: accept, type: set_result, result: connected_to_operator, next: bye}
    - {step: decline, type: set_result, result: not_interested, next: bye}
    - {step: fail, type: set_result, result: "failed:stt_failure", next: bye}
    - {step: bye, type: hangup}
"#;

struct Harness {
    flow: Arc<FlowEngine>,
    manager: Arc<SessionManager>,
}

fn build_harness() -> Harness {
    let mut config = Config::from_env();
    // Point at a closed port so telephony calls fail fast; the engine must
    // degrade, not hang.
    config.ari.base_url = "http://127.0.0.1:9".into();
    config.timeouts.ari_timeout = 1.0;
    config.llm.api_key = String::new();
    config.dialer.outbound_numbers = vec!["02191302954".into()];
    let config = Arc::new(config);

    let log_dir = tempfile::tempdir().unwrap();
    let logs = Arc::new(CallLogs::open(log_dir.path().to_str().unwrap()).unwrap());
    std::mem::forget(log_dir);

    let ari = Arc::new(AriClient::new(&config.ari, config.timeouts.ari_timeout, 4).unwrap());
    let stt = Arc::new(
        SttClient::new(config.stt.clone(), 1.0, 4, Arc::new(Semaphore::new(2))).unwrap(),
    );
    let llm = Arc::new(
        LlmClient::new(config.llm.clone(), 1.0, 4, Arc::new(Semaphore::new(2))).unwrap(),
    );

    let scenario = {
        let value: serde_yaml::Value = serde_yaml::from_str(SCENARIO).unwrap();
        serde_yaml::from_value(value["scenario"].clone()).unwrap()
    };
    let mut scenarios = HashMap::new();
    scenarios.insert("salehi".to_string(), scenario);
    let registry = Arc::new(ScenarioRegistry::from_scenarios(
        scenarios,
        vec!["salehi".into()],
    ));

    let manager = SessionManager::new(
        ari.clone(),
        registry.clone(),
        logs.clone(),
        &config.dialer.outbound_numbers,
        0,
    );
    let flow = FlowEngine::new(
        config.clone(),
        ari.clone(),
        stt,
        llm,
        manager.clone(),
        registry.clone(),
        None,
        logs,
    );
    manager.set_handler(flow.clone() as Arc<dyn ScenarioHandler>);
    let dialer = Dialer::new(
        config,
        ari,
        manager.clone(),
        registry,
        None,
        CancellationToken::new(),
    );
    manager.attach_dialer(dialer.clone() as Arc<dyn LineCoordinator>);
    flow.attach_dialer(dialer.clone());
    dialer.attach_flow(flow.clone());
    Harness { flow, manager }
}

async fn outbound_session(harness: &Harness) -> Arc<Session> {
    let mut metadata = HashMap::new();
    metadata.insert("scenario_name".to_string(), "salehi".to_string());
    harness
        .manager
        .create_outbound_session("09123456789", metadata)
        .await
}

#[tokio::test]
async fn test_answered_call_walks_flow_past_failed_playback() {
    let harness = build_harness();
    let session = outbound_session(&harness).await;

    // Play fails (no telephony server) and the flow must fall through to
    // the next step: classify with no transcript routes to on_failure.
    harness
        .flow
        .on_call_answered(&session, LegDirection::Outbound)
        .await;

    let state = session.state.lock().await;
    assert_eq!(state.result.as_deref(), Some("failed:stt_failure"));
    assert!(state.meta_flag("flow_started"));
    assert_eq!(state.meta("current_step"), Some("bye"));
}

#[tokio::test]
async fn test_playback_finished_resumes_into_classification_no() {
    let harness = build_harness();
    let session = outbound_session(&harness).await;
    {
        let mut state = session.state.lock().await;
        state.set_meta("last_transcript", "نه، ممنون");
        state.set_meta("pending_playback_next", "classify");
        state.playbacks.insert("pb-1".to_string(), "hello".to_string());
    }

    harness.flow.on_playback_finished(&session, "pb-1").await;

    let state = session.state.lock().await;
    assert_eq!(state.meta("last_intent"), Some("no"));
    assert_eq!(state.result.as_deref(), Some("not_interested"));
}

#[tokio::test]
async fn test_playback_finished_resumes_into_classification_yes() {
    let harness = build_harness();
    let session = outbound_session(&harness).await;
    {
        let mut state = session.state.lock().await;
        state.set_meta("last_transcript", "بله حتما");
        state.set_meta("pending_playback_next", "classify");
        state.playbacks.insert("pb-2".to_string(), "hello".to_string());
    }

    harness.flow.on_playback_finished(&session, "pb-2").await;

    let state = session.state.lock().await;
    assert_eq!(state.meta("last_intent"), Some("yes"));
    assert!(state.meta_flag("intent_yes"));
    assert!(state.meta("yes_at").is_some());
    assert_eq!(state.result.as_deref(), Some("connected_to_operator"));
}

#[tokio::test]
async fn test_duplicate_playback_wakeups_are_idempotent() {
    let harness = build_harness();
    let session = outbound_session(&harness).await;
    {
        let mut state = session.state.lock().await;
        state.set_meta("last_transcript", "نه");
        state.set_meta("pending_playback_next", "classify");
        state.playbacks.insert("pb-3".to_string(), "hello".to_string());
    }
    harness.flow.on_playback_finished(&session, "pb-3").await;
    let first_result = session.state.lock().await.result.clone();
    // A late watchdog firing after the real event must be a no-op.
    harness.flow.on_playback_finished(&session, "pb-3").await;
    let state = session.state.lock().await;
    assert_eq!(state.result, first_result);
}

#[tokio::test]
async fn test_hangup_during_flow_settles_results() {
    let harness = build_harness();

    // Caller hung up without any intent: result is hangup.
    let session = outbound_session(&harness).await;
    harness.flow.on_call_hangup(&session).await;
    assert_eq!(
        session.state.lock().await.result.as_deref(),
        Some("hangup")
    );

    // Caller hung up after a yes: result is disconnected.
    let session = outbound_session(&harness).await;
    {
        let mut state = session.state.lock().await;
        state.set_flag("intent_yes");
    }
    harness.flow.on_call_hangup(&session).await;
    assert_eq!(
        session.state.lock().await.result.as_deref(),
        Some("disconnected")
    );

    // SIP busy recorded on the channel wins over intent flags.
    let session = outbound_session(&harness).await;
    {
        let mut state = session.state.lock().await;
        state.set_meta("hangup_cause", "17");
    }
    harness.flow.on_call_hangup(&session).await;
    assert_eq!(session.state.lock().await.result.as_deref(), Some("busy"));
}

#[tokio::test]
async fn test_call_failed_maps_sip_causes() {
    let cases = [("17", "busy"), ("18", "power_off"), ("41", "banned")];
    for (cause, expected) in cases {
        let harness = build_harness();
        let session = outbound_session(&harness).await;
        {
            let mut state = session.state.lock().await;
            state.set_meta("hangup_cause", cause);
        }
        harness.flow.on_call_failed(&session, "progress cause").await;
        let state = session.state.lock().await;
        assert_eq!(state.result.as_deref(), Some(expected), "cause {}", cause);
        // The scenario never started for these early failures.
        assert!(!state.meta_flag("flow_started"));
    }
}

#[tokio::test]
async fn test_call_finished_defaults_to_user_didnt_answer() {
    let harness = build_harness();
    let session = outbound_session(&harness).await;
    harness.flow.on_call_finished(&session).await;
    assert_eq!(
        session.state.lock().await.result.as_deref(),
        Some("user_didnt_answer")
    );
}
