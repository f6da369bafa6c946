use dialflow::scenario::{ScenarioRegistry, StepKind};
use std::fs;

const SALEHI: &str = r#"
scenario:
  name: salehi
  display_name: "Salehi"
  company: acme
  prompts:
    hello: "sound:custom/salehi_hello"
    yes: "sound:custom/salehi_yes"
    goodby: "sound:custom/salehi_goodby"
    number: "sound:custom/salehi_number"
  stt:
    hotwords: ["بله", "نه", "شماره"]
    max_duration: 8
    max_silence: 3
  llm:
    fallback_tokens:
      yes: ["بله", "باشه", "اوکی"]
      no: ["نه", "ممنون"]
      number_question: ["از کجا"]
  flow:
    - {step: start, type: entry, next: hello}
    - {step: hello, type: play_prompt, prompt: hello, next: listen}
    - {step: listen, type: record, next: classify, on_empty: retry, on_failure: fail}
    - {step: classify, type: classify_intent, next: route, on_failure: fail}
    - step: route
      type: route_by_intent
      routes: {yes: accept, no: decline, number_question: explain, unknown: decline}
    - {step: accept, type: set_result, result: connected_to_operator, next: play_yes}
    - {step: play_yes, type: play_prompt, prompt: yes, next: bye}
    - {step: explain, type: play_prompt, prompt: number, next: listen}
    - {step: decline, type: set_result, result: not_interested, next: play_bye}
    - {step: play_bye, type: play_prompt, prompt: goodby, next: bye}
    - {step: retry, type: check_retry_limit, counter: empty, max_count: 2, within_limit: hello, exceeded: bye}
    - {step: fail, type: set_result, result: "failed:stt_failure", next: bye}
    - {step: bye, type: hangup}
"#;

const AGRAD: &str = r#"
scenario:
  name: agrad
  company: acme
  transfer_to_operator: true
  prompts:
    hello: "sound:custom/agrad_hello"
    onhold: "sound:custom/agrad_onhold"
  flow:
    - {step: start, type: entry, next: hello}
    - {step: hello, type: play_prompt, prompt: hello, next: bye}
    - {step: bye, type: hangup}
  inbound_flow:
    - {step: in_start, type: entry, next: in_transfer}
    - {step: in_transfer, type: transfer_to_operator, agent_type: inbound, on_success: in_wait, on_failure: in_bye}
    - {step: in_wait, type: wait}
    - {step: in_bye, type: disconnect}
"#;

const OTHER_COMPANY: &str = r#"
scenario:
  name: foreign
  company: другая
  flow:
    - {step: start, type: entry}
"#;

fn write_dir(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, body) in files {
        fs::write(dir.path().join(name), body).unwrap();
    }
    dir
}

#[test]
fn test_load_directory_filters_by_company() {
    let dir = write_dir(&[
        ("salehi.yaml", SALEHI),
        ("agrad.yaml", AGRAD),
        ("foreign.yaml", OTHER_COMPANY),
    ]);
    let registry = ScenarioRegistry::load(dir.path().to_str().unwrap(), "acme");
    let mut names = registry.names();
    names.sort();
    assert_eq!(names, vec!["agrad", "salehi"]);
}

#[test]
fn test_flow_graph_is_fully_linked() {
    let dir = write_dir(&[("salehi.yaml", SALEHI)]);
    let registry = ScenarioRegistry::load(dir.path().to_str().unwrap(), "");
    let scenario = registry.get("salehi").unwrap();

    // Every transition target must resolve to a step in the same flow.
    for step in &scenario.flow {
        let targets: Vec<Option<&String>> = match &step.kind {
            StepKind::Entry { next } => vec![next.as_ref()],
            StepKind::PlayPrompt { next, on_failure, .. } => {
                vec![next.as_ref(), on_failure.as_ref()]
            }
            StepKind::Record {
                next,
                on_empty,
                on_failure,
            } => vec![next.as_ref(), on_empty.as_ref(), on_failure.as_ref()],
            StepKind::ClassifyIntent { next, on_failure } => {
                vec![next.as_ref(), on_failure.as_ref()]
            }
            StepKind::RouteByIntent { routes } => routes.values().map(Some).collect(),
            StepKind::CheckRetryLimit {
                within_limit,
                exceeded,
                ..
            } => vec![within_limit.as_ref(), exceeded.as_ref()],
            StepKind::SetResult { next, .. } => vec![next.as_ref()],
            StepKind::TransferToOperator {
                on_success,
                on_failure,
                ..
            } => vec![on_success.as_ref(), on_failure.as_ref()],
            StepKind::Disconnect | StepKind::Hangup | StepKind::Wait => vec![],
        };
        for target in targets.into_iter().flatten() {
            assert!(
                scenario.get_step(target, false).is_some(),
                "step '{}' links to missing step '{}'",
                step.step,
                target
            );
        }
    }
}

#[test]
fn test_inbound_round_robin_only_offers_inbound_flows() {
    let dir = write_dir(&[("salehi.yaml", SALEHI), ("agrad.yaml", AGRAD)]);
    let registry = ScenarioRegistry::load(dir.path().to_str().unwrap(), "acme");
    // salehi has no inbound_flow, so inbound selection always lands on agrad.
    assert_eq!(registry.next_inbound().as_deref(), Some("agrad"));
    assert_eq!(registry.next_inbound().as_deref(), Some("agrad"));
    // Outbound selection alternates between both.
    let first = registry.next_outbound().unwrap();
    let second = registry.next_outbound().unwrap();
    assert_ne!(first, second);
}

#[test]
fn test_transfer_flag_and_stt_settings() {
    let dir = write_dir(&[("agrad.yaml", AGRAD), ("salehi.yaml", SALEHI)]);
    let registry = ScenarioRegistry::load(dir.path().to_str().unwrap(), "acme");
    assert!(registry.get("agrad").unwrap().transfer_to_operator);
    let salehi = registry.get("salehi").unwrap();
    assert!(!salehi.transfer_to_operator);
    assert_eq!(salehi.stt.max_duration, 8);
    assert_eq!(salehi.stt.max_silence, 3);
    assert_eq!(salehi.stt.hotwords.len(), 3);
}
