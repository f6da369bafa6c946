use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{error, info, warn};

fn default_max_duration() -> u32 {
    10
}

fn default_max_silence() -> u32 {
    2
}

fn default_intent_categories() -> Vec<String> {
    vec![
        "yes".to_string(),
        "no".to_string(),
        "number_question".to_string(),
        "unknown".to_string(),
    ]
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SttSettings {
    pub hotwords: Vec<String>,
    pub max_duration: u32,
    pub max_silence: u32,
}

impl Default for SttSettings {
    fn default() -> Self {
        Self {
            hotwords: Vec::new(),
            max_duration: default_max_duration(),
            max_silence: default_max_silence(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmSettings {
    /// Prompt with `{transcript}` and `{intent_categories}` placeholders.
    pub prompt_template: String,
    pub intent_categories: Vec<String>,
    pub fallback_tokens: HashMap<String, Vec<String>>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            prompt_template: String::new(),
            intent_categories: default_intent_categories(),
            fallback_tokens: HashMap::new(),
        }
    }
}

impl LlmSettings {
    /// Substring-match the declared fallback tokens against a transcript.
    /// First category (in declaration order) with a matching token wins.
    pub fn classify_fallback(&self, transcript: &str) -> String {
        let lower = transcript.to_lowercase();
        for category in &self.intent_categories {
            let Some(tokens) = self.fallback_tokens.get(category) else {
                continue;
            };
            if tokens.iter().any(|t| !t.is_empty() && lower.contains(&t.to_lowercase())) {
                return category.clone();
            }
        }
        "unknown".to_string()
    }
}

/// One node of a call flow. All transitions are explicit step ids; there is
/// no fallthrough.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlowStep {
    pub step: String,
    #[serde(flatten)]
    pub kind: StepKind,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Entry {
        next: Option<String>,
    },
    PlayPrompt {
        prompt: String,
        next: Option<String>,
        #[serde(default)]
        on_failure: Option<String>,
    },
    Record {
        next: Option<String>,
        #[serde(default)]
        on_empty: Option<String>,
        #[serde(default)]
        on_failure: Option<String>,
    },
    ClassifyIntent {
        next: Option<String>,
        #[serde(default)]
        on_failure: Option<String>,
    },
    RouteByIntent {
        routes: HashMap<String, String>,
    },
    CheckRetryLimit {
        #[serde(default)]
        counter: Option<String>,
        #[serde(default)]
        max_count: Option<u32>,
        #[serde(default)]
        within_limit: Option<String>,
        #[serde(default)]
        exceeded: Option<String>,
    },
    SetResult {
        result: String,
        next: Option<String>,
    },
    TransferToOperator {
        #[serde(default)]
        agent_type: Option<String>,
        #[serde(default)]
        on_success: Option<String>,
        #[serde(default)]
        on_failure: Option<String>,
    },
    Disconnect,
    Hangup,
    Wait,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub name: String,
    pub display_name: String,
    pub panel_name: String,
    pub company: String,
    pub transfer_to_operator: bool,
    /// prompt key -> media reference understood by the telephony server,
    /// e.g. `sound:custom/hello`.
    pub prompts: HashMap<String, String>,
    pub stt: SttSettings,
    pub llm: LlmSettings,
    pub flow: Vec<FlowStep>,
    pub inbound_flow: Vec<FlowStep>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            display_name: String::new(),
            panel_name: String::new(),
            company: String::new(),
            transfer_to_operator: false,
            prompts: HashMap::new(),
            stt: SttSettings::default(),
            llm: LlmSettings::default(),
            flow: Vec::new(),
            inbound_flow: Vec::new(),
        }
    }
}

impl ScenarioConfig {
    pub fn get_step(&self, step_id: &str, inbound: bool) -> Option<&FlowStep> {
        let steps = if inbound { &self.inbound_flow } else { &self.flow };
        steps.iter().find(|s| s.step == step_id)
    }

    pub fn entry_step(&self, inbound: bool) -> Option<&FlowStep> {
        let steps = if inbound { &self.inbound_flow } else { &self.flow };
        steps
            .iter()
            .find(|s| matches!(s.kind, StepKind::Entry { .. }))
            .or_else(|| steps.first())
    }

    pub fn has_inbound_flow(&self) -> bool {
        !self.inbound_flow.is_empty()
    }

    pub fn prompt_media(&self, key: &str) -> String {
        self.prompts
            .get(key)
            .cloned()
            .unwrap_or_else(|| format!("sound:custom/{}", key))
    }

    pub fn panel_display_name(&self) -> &str {
        if !self.panel_name.is_empty() {
            &self.panel_name
        } else if !self.display_name.is_empty() {
            &self.display_name
        } else {
            &self.name
        }
    }
}

fn parse_scenario(raw: &str) -> anyhow::Result<ScenarioConfig> {
    let value: serde_yaml::Value = serde_yaml::from_str(raw)?;
    // Files may wrap the definition under a top-level `scenario:` key.
    let body = value.get("scenario").cloned().unwrap_or(value);
    Ok(serde_yaml::from_value(body)?)
}

struct RegistryState {
    enabled: Vec<String>,
    panel_ids: HashMap<String, i64>,
    outbound_cursor: usize,
    inbound_cursor: usize,
}

/// Loaded scenarios plus the round-robin cursors used to pick one per
/// outbound contact and per inbound call.
pub struct ScenarioRegistry {
    scenarios: HashMap<String, ScenarioConfig>,
    state: Mutex<RegistryState>,
}

impl ScenarioRegistry {
    pub fn load(scenarios_dir: &str, company: &str) -> Self {
        let mut scenarios = HashMap::new();
        let mut enabled = Vec::new();
        let company = company.trim().to_lowercase();
        let dir = Path::new(scenarios_dir);
        let mut files: Vec<_> = match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("yaml") | Some("yml")
                    )
                })
                .collect(),
            Err(err) => {
                warn!("scenarios directory {:?} unreadable: {}", dir, err);
                Vec::new()
            }
        };
        files.sort();
        for path in files {
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(err) => {
                    error!("failed to read scenario {:?}: {}", path, err);
                    continue;
                }
            };
            let mut config = match parse_scenario(&raw) {
                Ok(config) => config,
                Err(err) => {
                    error!("failed to parse scenario {:?}: {}", path, err);
                    continue;
                }
            };
            if config.name.is_empty() {
                config.name = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string();
            }
            let scenario_company = config.company.trim().to_lowercase();
            if !company.is_empty() && !scenario_company.is_empty() && scenario_company != company {
                info!(
                    "skipping scenario '{}' (company={}, current={})",
                    config.name, scenario_company, company
                );
                continue;
            }
            info!(
                "loaded scenario '{}' from {:?} ({} outbound steps, {} inbound steps)",
                config.name,
                path.file_name().unwrap_or_default(),
                config.flow.len(),
                config.inbound_flow.len()
            );
            enabled.push(config.name.clone());
            scenarios.insert(config.name.clone(), config);
        }
        Self::from_scenarios(scenarios, enabled)
    }

    pub fn from_scenarios(
        scenarios: HashMap<String, ScenarioConfig>,
        enabled: Vec<String>,
    ) -> Self {
        Self {
            scenarios,
            state: Mutex::new(RegistryState {
                enabled,
                panel_ids: HashMap::new(),
                outbound_cursor: 0,
                inbound_cursor: 0,
            }),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ScenarioConfig> {
        self.scenarios.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.scenarios.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    /// Replace the enabled set with the panel's active scenarios,
    /// intersected with what is loaded locally. An empty or fully-unknown
    /// list leaves the current set untouched.
    pub fn set_active(&self, active: &[crate::panel::PanelScenario]) {
        let valid: Vec<String> = active
            .iter()
            .filter(|s| self.scenarios.contains_key(&s.name))
            .map(|s| s.name.clone())
            .collect();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for scenario in active {
            if let Some(id) = scenario.id {
                state.panel_ids.insert(scenario.name.clone(), id);
            }
        }
        if valid.is_empty() {
            if !active.is_empty() {
                warn!("no locally loaded scenario in panel active set");
            }
            return;
        }
        if state.enabled != valid {
            info!("active scenarios updated: {:?}", valid);
            state.enabled = valid;
            state.outbound_cursor = 0;
            state.inbound_cursor = 0;
        }
    }

    pub fn panel_id(&self, name: &str) -> Option<i64> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.panel_ids.get(name).copied()
    }

    /// Round-robin pick for the next outbound contact.
    pub fn next_outbound(&self) -> Option<String> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.enabled.is_empty() {
            return None;
        }
        let idx = state.outbound_cursor % state.enabled.len();
        state.outbound_cursor = (idx + 1) % state.enabled.len();
        Some(state.enabled[idx].clone())
    }

    /// Round-robin pick among enabled scenarios that declare an inbound
    /// flow. `None` means callers get the direct-to-agent default.
    pub fn next_inbound(&self) -> Option<String> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let candidates: Vec<String> = state
            .enabled
            .iter()
            .filter(|n| {
                self.scenarios
                    .get(n.as_str())
                    .map(|s| s.has_inbound_flow())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let idx = state.inbound_cursor % candidates.len();
        state.inbound_cursor = (idx + 1) % candidates.len();
        Some(candidates[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO_YAML: &str = r#"
scenario:
  name: salehi
  display_name: "Salehi Campaign"
  prompts:
    hello: "sound:custom/salehi_hello"
    yes: "sound:custom/salehi_yes"
    goodby: "sound:custom/salehi_goodby"
  stt:
    hotwords: ["بله", "نه"]
    max_duration: 8
    max_silence: 3
  llm:
    intent_categories: ["yes", "no", "number_question", "unknown"]
    fallback_tokens:
      yes: ["بله", "باشه"]
      no: ["نه", "ممنون"]
      number_question: ["از کجا"]
  flow:
    - step: start
      type: entry
      next: hello
    - step: hello
      type: play_prompt
      prompt: hello
      next: listen
    - step: listen
      type: record
      next: classify
      on_empty: retry_check
      on_failure: fail_out
    - step: classify
      type: classify_intent
      next: route
      on_failure: fail_out
    - step: route
      type: route_by_intent
      routes:
        yes: accept
        no: decline
        unknown: decline
    - step: accept
      type: set_result
      result: connected_to_operator
      next: bye
    - step: decline
      type: set_result
      result: not_interested
      next: bye
    - step: retry_check
      type: check_retry_limit
      counter: empty_retries
      max_count: 2
      within_limit: hello
      exceeded: bye
    - step: fail_out
      type: set_result
      result: "failed:stt_failure"
      next: bye
    - step: bye
      type: hangup
"#;

    fn registry_with(yaml: &str) -> ScenarioRegistry {
        let config = parse_scenario(yaml).unwrap();
        let name = config.name.clone();
        let mut scenarios = HashMap::new();
        scenarios.insert(name.clone(), config);
        ScenarioRegistry::from_scenarios(scenarios, vec![name])
    }

    #[test]
    fn test_parse_scenario_yaml() {
        let config = parse_scenario(SCENARIO_YAML).unwrap();
        assert_eq!(config.name, "salehi");
        assert_eq!(config.stt.max_duration, 8);
        assert_eq!(config.prompts["hello"], "sound:custom/salehi_hello");
        assert_eq!(config.flow.len(), 10);
        assert!(!config.has_inbound_flow());

        let entry = config.entry_step(false).unwrap();
        assert_eq!(entry.step, "start");
        match &config.get_step("route", false).unwrap().kind {
            StepKind::RouteByIntent { routes } => {
                assert_eq!(routes["yes"], "accept");
            }
            other => panic!("unexpected step kind: {:?}", other),
        }
    }

    #[test]
    fn test_prompt_media_fallback() {
        let config = parse_scenario(SCENARIO_YAML).unwrap();
        assert_eq!(config.prompt_media("hello"), "sound:custom/salehi_hello");
        assert_eq!(config.prompt_media("onhold"), "sound:custom/onhold");
    }

    #[test]
    fn test_fallback_classification_order() {
        let config = parse_scenario(SCENARIO_YAML).unwrap();
        assert_eq!(config.llm.classify_fallback("بله حتما"), "yes");
        assert_eq!(config.llm.classify_fallback("نه، ممنون"), "no");
        assert_eq!(
            config.llm.classify_fallback("شماره منو از کجا آوردید"),
            "number_question"
        );
        assert_eq!(config.llm.classify_fallback("الو؟"), "unknown");
    }

    #[test]
    fn test_round_robin_outbound() {
        let a = parse_scenario(SCENARIO_YAML).unwrap();
        let mut b = a.clone();
        b.name = "agrad".into();
        let mut scenarios = HashMap::new();
        scenarios.insert(a.name.clone(), a);
        scenarios.insert(b.name.clone(), b);
        let registry = ScenarioRegistry::from_scenarios(
            scenarios,
            vec!["salehi".into(), "agrad".into()],
        );
        assert_eq!(registry.next_outbound().as_deref(), Some("salehi"));
        assert_eq!(registry.next_outbound().as_deref(), Some("agrad"));
        assert_eq!(registry.next_outbound().as_deref(), Some("salehi"));
    }

    #[test]
    fn test_set_active_intersects_with_loaded() {
        let registry = registry_with(SCENARIO_YAML);
        registry.set_active(&[
            crate::panel::PanelScenario {
                id: Some(5),
                name: "salehi".into(),
            },
            crate::panel::PanelScenario {
                id: Some(6),
                name: "not-loaded".into(),
            },
        ]);
        assert_eq!(registry.panel_id("salehi"), Some(5));
        assert_eq!(registry.next_outbound().as_deref(), Some("salehi"));
    }

    #[test]
    fn test_no_inbound_scenarios() {
        let registry = registry_with(SCENARIO_YAML);
        assert!(registry.next_inbound().is_none());
    }
}
