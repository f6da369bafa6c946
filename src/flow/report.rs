/// Panel status plus the human-readable reason sent alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelOutcome {
    pub status: &'static str,
    pub reason: String,
}

/// Statuses that carry the caller's transcript to the panel.
const TRANSCRIPT_STATUSES: &[&str] = &[
    "UNKNOWN",
    "DISCONNECTED",
    "CONNECTED",
    "NOT_INTERESTED",
    "INBOUND_CALL",
];

/// Total mapping from internal result codes to panel statuses. Panel
/// statuses map to themselves, which makes the translation idempotent.
pub fn map_result(result: &str, inbound_direct: bool) -> PanelOutcome {
    let outcome = |status: &'static str, reason: &str| PanelOutcome {
        status,
        reason: reason.to_string(),
    };
    match result {
        "connected_to_operator" => outcome("CONNECTED", "User said yes"),
        "inbound_call" => outcome("INBOUND_CALL", "Inbound call connected to agent"),
        "not_interested" => outcome("NOT_INTERESTED", "User declined"),
        "missed" | "user_didnt_answer" => outcome("MISSED", "No answer/busy/unreachable"),
        "hangup" => outcome("HANGUP", "Caller hung up"),
        "disconnected" => {
            if inbound_direct {
                outcome("INBOUND_CALL", "Inbound call connected to agent")
            } else {
                outcome("DISCONNECTED", "Caller disconnected")
            }
        }
        "unknown" => outcome("UNKNOWN", "Unknown intent"),
        "busy" => outcome("BUSY", "Line busy"),
        "power_off" => outcome("POWER_OFF", "Unavailable / powered off"),
        "banned" => outcome("BANNED", "Rejected by operator"),
        r if r.starts_with("failed:stt_failure") => {
            outcome("NOT_INTERESTED", "User did not respond")
        }
        r if r.starts_with("failed") => outcome("FAILED", r),
        // Already-mapped statuses pass through unchanged.
        "CONNECTED" => outcome("CONNECTED", result),
        "INBOUND_CALL" => outcome("INBOUND_CALL", result),
        "NOT_INTERESTED" => outcome("NOT_INTERESTED", result),
        "MISSED" => outcome("MISSED", result),
        "HANGUP" => outcome("HANGUP", result),
        "DISCONNECTED" => outcome("DISCONNECTED", result),
        "UNKNOWN" => outcome("UNKNOWN", result),
        "BUSY" => outcome("BUSY", result),
        "POWER_OFF" => outcome("POWER_OFF", result),
        "BANNED" => outcome("BANNED", result),
        "FAILED" => outcome("FAILED", result),
        other => outcome("FAILED", other),
    }
}

pub fn status_carries_transcript(status: &str) -> bool {
    TRANSCRIPT_STATUSES.contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_RESULTS: &[&str] = &[
        "connected_to_operator",
        "inbound_call",
        "not_interested",
        "missed",
        "user_didnt_answer",
        "hangup",
        "disconnected",
        "unknown",
        "busy",
        "power_off",
        "banned",
        "failed:stt_failure",
        "failed:vira_quota",
        "failed:llm_quota",
        "failed:operator_failed",
        "failed",
        "something_else_entirely",
    ];

    #[test]
    fn test_mapping_table() {
        let expect = [
            ("connected_to_operator", "CONNECTED"),
            ("not_interested", "NOT_INTERESTED"),
            ("disconnected", "DISCONNECTED"),
            ("unknown", "UNKNOWN"),
            ("hangup", "HANGUP"),
            ("missed", "MISSED"),
            ("user_didnt_answer", "MISSED"),
            ("busy", "BUSY"),
            ("power_off", "POWER_OFF"),
            ("banned", "BANNED"),
            ("failed:stt_failure", "NOT_INTERESTED"),
            ("failed:vira_quota", "FAILED"),
            ("failed:llm_quota", "FAILED"),
        ];
        for (result, status) in expect {
            assert_eq!(map_result(result, false).status, status, "result {}", result);
        }
    }

    #[test]
    fn test_mapping_total_and_idempotent() {
        for result in ALL_RESULTS {
            let once = map_result(result, false);
            let twice = map_result(once.status, false);
            assert_eq!(once.status, twice.status, "not idempotent for {}", result);
        }
    }

    #[test]
    fn test_inbound_direct_disconnect_is_inbound_call() {
        assert_eq!(map_result("disconnected", true).status, "INBOUND_CALL");
        assert_eq!(map_result("disconnected", false).status, "DISCONNECTED");
    }

    #[test]
    fn test_transcript_filter() {
        for status in ["CONNECTED", "NOT_INTERESTED", "DISCONNECTED", "UNKNOWN"] {
            assert!(status_carries_transcript(status));
        }
        for status in ["HANGUP", "MISSED", "BUSY", "POWER_OFF", "BANNED", "FAILED"] {
            assert!(!status_carries_transcript(status));
        }
    }
}
