use serde::Deserialize;
use tracing::debug;

/// Channel payload as delivered inside ARI events. Only the fields the
/// engine correlates on are decoded; the rest of the payload is dropped.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Channel {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub caller: Party,
    #[serde(default)]
    pub connected: Party,
    #[serde(default)]
    pub dialplan: Dialplan,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Party {
    #[serde(default)]
    pub number: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Dialplan {
    #[serde(default)]
    pub exten: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Playback {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub target_uri: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Recording {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub target_uri: String,
    #[serde(default)]
    pub cause: String,
}

/// Events the engine reacts to, decoded from the ARI WebSocket stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum AriEvent {
    StasisStart {
        channel: Channel,
        #[serde(default)]
        args: Vec<String>,
    },
    StasisEnd {
        channel: Channel,
    },
    ChannelStateChange {
        channel: Channel,
        #[serde(default)]
        cause: Option<i64>,
        #[serde(default)]
        cause_txt: Option<String>,
    },
    ChannelHangupRequest {
        channel: Channel,
        #[serde(default)]
        cause: Option<i64>,
        #[serde(default)]
        cause_txt: Option<String>,
    },
    ChannelDestroyed {
        channel: Channel,
        #[serde(default)]
        cause: Option<i64>,
        #[serde(default)]
        cause_txt: Option<String>,
    },
    PlaybackStarted {
        playback: Playback,
    },
    PlaybackFinished {
        playback: Playback,
    },
    RecordingFinished {
        recording: Recording,
    },
    RecordingFailed {
        recording: Recording,
    },
    Dial {
        #[serde(default)]
        peer: Option<Channel>,
        #[serde(default)]
        dialstatus: String,
    },
}

impl AriEvent {
    /// Decode one stream frame. Unknown event kinds are logged and dropped.
    pub fn decode(raw: &str) -> Option<AriEvent> {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => {
                debug!("undecodable event frame: {}", err);
                return None;
            }
        };
        let kind = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
        match serde_json::from_value::<AriEvent>(value.clone()) {
            Ok(event) => Some(event),
            Err(err) => {
                debug!("dropping event type={} ({})", kind, err);
                None
            }
        }
    }

    /// Channel id used to correlate this event to a session, if any.
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            AriEvent::StasisStart { channel, .. }
            | AriEvent::StasisEnd { channel }
            | AriEvent::ChannelStateChange { channel, .. }
            | AriEvent::ChannelHangupRequest { channel, .. }
            | AriEvent::ChannelDestroyed { channel, .. } => Some(channel.id.as_str()),
            AriEvent::Dial { peer, .. } => peer.as_ref().map(|c| c.id.as_str()),
            _ => None,
        }
    }
}

/// Terminal result implied by a SIP hangup cause, when the call never
/// reached the scenario. Covers the carrier-specific causes observed in
/// production alongside the standard ones.
pub fn result_for_cause(cause: i64) -> Option<&'static str> {
    match cause {
        16 | 31 | 32 => Some("hangup"),
        17 => Some("busy"),
        18 | 19 | 20 => Some("power_off"),
        0 | 1 | 3 | 22 | 27 | 38 => Some("power_off"),
        21 | 34 | 41 | 42 => Some("banned"),
        _ => None,
    }
}

pub fn result_for_cause_txt(cause_txt: &str) -> Option<&'static str> {
    let lower = cause_txt.to_lowercase();
    if lower.contains("request terminated") {
        Some("missed")
    } else if lower.contains("busy") {
        Some("busy")
    } else if lower.contains("congest") {
        Some("banned")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_stasis_start() {
        let raw = r#"{
            "type": "StasisStart",
            "args": ["outbound", "abc-123"],
            "channel": {
                "id": "1722470000.17",
                "state": "Ring",
                "caller": {"number": "09123456789"},
                "dialplan": {"exten": "s"}
            }
        }"#;
        match AriEvent::decode(raw) {
            Some(AriEvent::StasisStart { channel, args }) => {
                assert_eq!(channel.id, "1722470000.17");
                assert_eq!(args, vec!["outbound", "abc-123"]);
                assert_eq!(channel.caller.number, "09123456789");
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_decode_hangup_with_cause() {
        let raw = r#"{
            "type": "ChannelHangupRequest",
            "cause": 17,
            "channel": {"id": "c1", "state": "Down"}
        }"#;
        match AriEvent::decode(raw) {
            Some(AriEvent::ChannelHangupRequest { cause, .. }) => {
                assert_eq!(cause, Some(17));
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_dropped() {
        let raw = r#"{"type": "BridgeMerged", "bridge": {"id": "b1"}}"#;
        assert!(AriEvent::decode(raw).is_none());
    }

    #[test]
    fn test_cause_mapping() {
        assert_eq!(result_for_cause(17), Some("busy"));
        for cause in [18, 19, 20] {
            assert_eq!(result_for_cause(cause), Some("power_off"));
        }
        for cause in [21, 34, 41, 42] {
            assert_eq!(result_for_cause(cause), Some("banned"));
        }
        assert_eq!(result_for_cause(16), Some("hangup"));
        assert_eq!(result_for_cause(99), None);
    }

    #[test]
    fn test_cause_txt_mapping() {
        assert_eq!(result_for_cause_txt("User busy"), Some("busy"));
        assert_eq!(result_for_cause_txt("Circuit congested"), Some("banned"));
        assert_eq!(result_for_cause_txt("Request Terminated"), Some("missed"));
        assert_eq!(result_for_cause_txt("Normal Clearing"), None);
    }
}
