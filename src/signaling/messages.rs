//! Message Types für das Call-Signaling
//!
//! Die Strukturen definieren das JSON-Wire-Format, das der externe
//! Signaling-Transport (Push/WebSocket der App) zwischen den beiden
//! Endpunkten relayt. Die Engine selbst hält keine Verbindung.

use crate::call_engine::SdpKind;
use serde::{Deserialize, Serialize};

// ============================================================================
// CALL STATUS
// ============================================================================

/// Lebenszyklus-Status einer Call-Session aus App-Sicht.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    Initiating,
    Ringing,
    Connected,
    Ended,
    Declined,
    Missed,
}

impl CallStatus {
    /// Terminal heißt: die Session kann nur noch abgeräumt werden.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Declined | Self::Missed)
    }
}

// ============================================================================
// OUTGOING PAYLOADS
// ============================================================================

/// SDP Offer oder Answer an die Gegenseite
#[derive(Debug, Clone, Serialize)]
pub struct SdpPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "fromUserId")]
    pub from_user_id: String,
    #[serde(rename = "toUserId")]
    pub to_user_id: String,
    pub kind: SdpKind,
    pub sdp: String,
}

impl SdpPayload {
    pub fn offer(session_id: String, from_user_id: String, to_user_id: String, sdp: String) -> Self {
        Self {
            msg_type: "sdp",
            session_id,
            from_user_id,
            to_user_id,
            kind: SdpKind::Offer,
            sdp,
        }
    }

    pub fn answer(
        session_id: String,
        from_user_id: String,
        to_user_id: String,
        sdp: String,
    ) -> Self {
        Self {
            msg_type: "sdp",
            session_id,
            from_user_id,
            to_user_id,
            kind: SdpKind::Answer,
            sdp,
        }
    }
}

/// ICE Candidate an die Gegenseite (Kandidat bleibt opakes JSON)
#[derive(Debug, Clone, Serialize)]
pub struct IceCandidatePayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "fromUserId")]
    pub from_user_id: String,
    #[serde(rename = "toUserId")]
    pub to_user_id: String,
    pub candidate: String,
}

impl IceCandidatePayload {
    pub fn new(
        session_id: String,
        from_user_id: String,
        to_user_id: String,
        candidate: String,
    ) -> Self {
        Self {
            msg_type: "ice_candidate",
            session_id,
            from_user_id,
            to_user_id,
            candidate,
        }
    }
}

/// Status-Übergang der Session (Ringing, Connected, Ended, ...)
#[derive(Debug, Clone, Serialize)]
pub struct CallStatusUpdate {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "fromUserId")]
    pub from_user_id: String,
    pub status: CallStatus,
}

impl CallStatusUpdate {
    pub fn new(session_id: String, from_user_id: String, status: CallStatus) -> Self {
        Self {
            msg_type: "call_status",
            session_id,
            from_user_id,
            status,
        }
    }
}

// ============================================================================
// INCOMING MESSAGES
// ============================================================================

/// Benachrichtigung über einen eingehenden Anruf.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingCallNotify {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "callerId")]
    pub caller_id: String,
    #[serde(rename = "callerName")]
    pub caller_name: String,
    #[serde(rename = "isVideoCall", default)]
    pub is_video_call: bool,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdp_payload_wire_format() {
        let payload = SdpPayload::offer(
            "s1".to_string(),
            "alice".to_string(),
            "bob".to_string(),
            "v=0\r\n".to_string(),
        );
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["type"], "sdp");
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["fromUserId"], "alice");
        assert_eq!(json["kind"], "offer");
    }

    #[test]
    fn test_call_status_screaming_snake() {
        let update =
            CallStatusUpdate::new("s1".to_string(), "alice".to_string(), CallStatus::Connected);
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["status"], "CONNECTED");

        let parsed: CallStatus = serde_json::from_str("\"DECLINED\"").unwrap();
        assert_eq!(parsed, CallStatus::Declined);
    }

    #[test]
    fn test_terminal_status() {
        assert!(CallStatus::Ended.is_terminal());
        assert!(CallStatus::Missed.is_terminal());
        assert!(!CallStatus::Ringing.is_terminal());
        assert!(!CallStatus::Connected.is_terminal());
    }

    #[test]
    fn test_incoming_call_defaults_to_audio() {
        let json = r#"{"sessionId":"s2","callerId":"bob","callerName":"Bob"}"#;
        let notify: IncomingCallNotify = serde_json::from_str(json).unwrap();
        assert!(!notify.is_video_call);
    }
}
