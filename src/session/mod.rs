use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub mod manager;

pub use manager::{ScenarioHandler, SessionManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LegDirection {
    Inbound,
    Outbound,
    Operator,
}

impl LegDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            LegDirection::Inbound => "inbound",
            LegDirection::Outbound => "outbound",
            LegDirection::Operator => "operator",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegState {
    Created,
    Ringing,
    Answered,
    Hungup,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Initiating,
    Ringing,
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct CallLeg {
    pub channel_id: String,
    pub direction: LegDirection,
    pub endpoint: String,
    pub state: LegState,
}

impl CallLeg {
    pub fn new(channel_id: String, direction: LegDirection, endpoint: String) -> Self {
        Self {
            channel_id,
            direction,
            endpoint,
            state: LegState::Created,
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self.state, LegState::Hungup | LegState::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct BridgeInfo {
    pub bridge_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseEntry {
    pub phase: String,
    pub text: String,
    pub intent: Option<String>,
}

/// Mutable per-session state. All mutation happens behind the session
/// mutex; events for one session are applied in stream order.
#[derive(Default)]
pub struct SessionState {
    pub bridge: Option<BridgeInfo>,
    pub inbound_leg: Option<CallLeg>,
    pub outbound_leg: Option<CallLeg>,
    pub operator_leg: Option<CallLeg>,
    pub status: SessionStatus,
    pub result: Option<String>,
    pub metadata: HashMap<String, String>,
    /// playback id -> prompt key, for waking the flow on PlaybackFinished.
    pub playbacks: HashMap<String, String>,
    pub responses: Vec<ResponseEntry>,
    pub processed_recordings: HashSet<String>,
    pub counters: HashMap<String, u32>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus::Initiating
    }
}

impl SessionState {
    pub fn customer_leg(&self) -> Option<&CallLeg> {
        self.outbound_leg.as_ref().or(self.inbound_leg.as_ref())
    }

    pub fn customer_channel_id(&self) -> Option<String> {
        self.customer_leg().map(|leg| leg.channel_id.clone())
    }

    pub fn find_leg_mut(&mut self, channel_id: &str) -> Option<&mut CallLeg> {
        for leg in [
            self.inbound_leg.as_mut(),
            self.outbound_leg.as_mut(),
            self.operator_leg.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            if leg.channel_id == channel_id {
                return Some(leg);
            }
        }
        None
    }

    pub fn live_legs(&self) -> Vec<CallLeg> {
        [
            self.inbound_leg.as_ref(),
            self.outbound_leg.as_ref(),
            self.operator_leg.as_ref(),
        ]
        .into_iter()
        .flatten()
        .filter(|leg| leg.is_live())
        .cloned()
        .collect()
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|s| s.as_str())
    }

    pub fn meta_flag(&self, key: &str) -> bool {
        self.meta(key) == Some("1")
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<String>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn set_flag(&mut self, key: &str) {
        self.set_meta(key, "1");
    }

    pub fn hungup(&self) -> bool {
        self.meta_flag("hungup")
    }
}

/// One prospect interaction: a bridge, a customer leg, and at most one
/// operator leg.
pub struct Session {
    pub session_id: String,
    pub direction: LegDirection,
    pub cancel_token: CancellationToken,
    pub state: Mutex<SessionState>,
}

impl Session {
    pub fn new(session_id: String, direction: LegDirection) -> Self {
        Self {
            session_id,
            direction,
            cancel_token: CancellationToken::new(),
            state: Mutex::new(SessionState::default()),
        }
    }
}

/// Strip everything but digits. `None` when nothing is left.
pub fn normalize_number(number: &str) -> Option<String> {
    let digits: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Normalise a contact number: digits only, and a purely numeric 10-digit
/// number gets its leading `0` restored. Idempotent.
pub fn normalize_contact_number(number: &str) -> Option<String> {
    let digits = normalize_number(number)?;
    if digits.len() == 10 && !digits.starts_with('0') {
        Some(format!("0{}", digits))
    } else {
        Some(digits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_number() {
        assert_eq!(normalize_number("+98 912 345-6789").as_deref(), Some("989123456789"));
        assert_eq!(normalize_number("abc"), None);
    }

    #[test]
    fn test_contact_number_gets_leading_zero() {
        assert_eq!(
            normalize_contact_number("9123456789").as_deref(),
            Some("09123456789")
        );
        assert_eq!(
            normalize_contact_number("09123456789").as_deref(),
            Some("09123456789")
        );
    }

    #[test]
    fn test_contact_number_idempotent() {
        for raw in ["9123456789", "+989123456789", "0912 345 6789"] {
            let once = normalize_contact_number(raw).unwrap();
            let twice = normalize_contact_number(&once).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_find_leg_mut() {
        let mut state = SessionState::default();
        state.outbound_leg = Some(CallLeg::new(
            "c1".into(),
            LegDirection::Outbound,
            "09123456789".into(),
        ));
        state.operator_leg = Some(CallLeg::new(
            "c2".into(),
            LegDirection::Operator,
            "op".into(),
        ));
        assert_eq!(
            state.find_leg_mut("c2").map(|l| l.direction),
            Some(LegDirection::Operator)
        );
        assert!(state.find_leg_mut("missing").is_none());
        assert_eq!(state.customer_channel_id().as_deref(), Some("c1"));
    }

    #[test]
    fn test_live_legs_excludes_finished() {
        let mut state = SessionState::default();
        let mut leg = CallLeg::new("c1".into(), LegDirection::Outbound, "x".into());
        leg.state = LegState::Hungup;
        state.outbound_leg = Some(leg);
        state.operator_leg = Some(CallLeg::new("c2".into(), LegDirection::Operator, "y".into()));
        let live = state.live_legs();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].channel_id, "c2");
    }
}
