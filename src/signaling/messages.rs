use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::room::Role;

/// Message types for the real-time channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MessageType {
    // Client -> Server
    #[serde(rename = "join")]
    Join,
    #[serde(rename = "offer")]
    Offer,
    #[serde(rename = "answer")]
    Answer,
    #[serde(rename = "iceCandidate")]
    IceCandidate,
    #[serde(rename = "leave")]
    Leave,
    #[serde(rename = "end-meeting")]
    EndMeeting,
    #[serde(rename = "register-presence")]
    RegisterPresence,
    #[serde(rename = "instant-call-request")]
    InstantCallRequest,
    #[serde(rename = "instant-call-response")]
    InstantCallResponse,
    #[serde(rename = "instant-call-cancel")]
    InstantCallCancel,

    // Server -> Client
    #[serde(rename = "createdRoom")]
    CreatedRoom,
    #[serde(rename = "joinedRoom")]
    JoinedRoom,
    #[serde(rename = "user-joined-call")]
    UserJoinedCall,
    #[serde(rename = "user-left-call")]
    UserLeftCall,
    #[serde(rename = "meeting-timer-start")]
    MeetingTimerStart,
    #[serde(rename = "meeting-timer-warning")]
    MeetingTimerWarning,
    #[serde(rename = "meeting-auto-end")]
    MeetingAutoEnd,
    #[serde(rename = "meeting-force-end")]
    MeetingForceEnd,
    #[serde(rename = "instant-call-incoming")]
    InstantCallIncoming,
    #[serde(rename = "instant-call-sent")]
    InstantCallSent,
    #[serde(rename = "instant-call-accepted")]
    InstantCallAccepted,
    #[serde(rename = "instant-call-declined")]
    InstantCallDeclined,
    #[serde(rename = "instant-call-cancelled")]
    InstantCallCancelled,
    #[serde(rename = "user-online")]
    UserOnline,
    #[serde(rename = "user-offline")]
    UserOffline,
    #[serde(rename = "error")]
    Error,
}

/// Metadata attached to outbound messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessageMeta {
    pub timestamp: DateTime<Utc>,
}

/// Base structure for channel messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub payload: serde_json::Value,
    pub meta: Option<WireMessageMeta>,
}

/// Client-to-Server payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub room_id: Option<String>,
    pub peer_id: String,
    pub role: Role,
    pub user_id: String,
    pub meeting_id: Option<i64>,
}

/// Offer/answer/ICE envelope; the inner payload is relayed verbatim
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    pub room_id: String,
    pub payload: serde_json::Value,
    pub peer_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeavePayload {
    pub room_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndMeetingPayload {
    pub room_id: String,
    pub meeting_id: i64,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPresencePayload {
    pub user_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantCallRequestPayload {
    pub volunteer_id: String,
    pub student_id: String,
    pub volunteer_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantCallResponsePayload {
    pub call_id: String,
    pub accepted: bool,
    pub student_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantCallCancelPayload {
    pub call_id: String,
    pub volunteer_id: String,
}

/// Server-to-Client payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: String,
    pub role: Role,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoinedPayload {
    pub room_id: String,
    pub peer_id: String,
    pub is_creator: bool,
    pub existing_peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJoinedCallPayload {
    pub peer_id: String,
    pub role: Role,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeftCallPayload {
    pub peer_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerStartPayload {
    pub room_id: String,
    pub meeting_id: i64,
    pub duration_ms: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Remaining-time checkpoints (ms) at which warnings will fire.
    pub warnings: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerWarningPayload {
    pub remaining_ms: i64,
    pub remaining_minutes: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingEndPayload {
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantCallIncomingPayload {
    pub call_id: String,
    pub volunteer_id: String,
    pub volunteer_name: String,
    pub room_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantCallSentPayload {
    pub call_id: String,
    pub student_id: String,
    pub room_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantCallOutcomePayload {
    pub call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub user_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Helper functions for creating messages
impl WireMessage {
    pub fn new(message_type: MessageType, payload: serde_json::Value) -> Self {
        Self {
            message_type,
            payload,
            meta: Some(WireMessageMeta {
                timestamp: Utc::now(),
            }),
        }
    }

    /// Create a createdRoom message (first participant)
    pub fn created_room(room_id: String, peer_id: String) -> Self {
        let payload = RoomJoinedPayload {
            room_id,
            peer_id,
            is_creator: true,
            existing_peers: Vec::new(),
        };
        Self::new(
            MessageType::CreatedRoom,
            serde_json::to_value(payload).unwrap(),
        )
    }

    /// Create a joinedRoom message (subsequent participant)
    pub fn joined_room(room_id: String, peer_id: String, existing_peers: Vec<PeerInfo>) -> Self {
        let payload = RoomJoinedPayload {
            room_id,
            peer_id,
            is_creator: false,
            existing_peers,
        };
        Self::new(
            MessageType::JoinedRoom,
            serde_json::to_value(payload).unwrap(),
        )
    }

    pub fn user_joined_call(peer_id: String, role: Role, user_id: String) -> Self {
        let payload = UserJoinedCallPayload {
            peer_id,
            role,
            user_id,
        };
        Self::new(
            MessageType::UserJoinedCall,
            serde_json::to_value(payload).unwrap(),
        )
    }

    pub fn user_left_call(peer_id: String, user_id: String) -> Self {
        let payload = UserLeftCallPayload { peer_id, user_id };
        Self::new(
            MessageType::UserLeftCall,
            serde_json::to_value(payload).unwrap(),
        )
    }

    /// Re-wraps a relayed signaling payload under the given type
    pub fn relay(message_type: MessageType, payload: serde_json::Value) -> Self {
        Self::new(message_type, payload)
    }

    pub fn meeting_timer_start(payload: TimerStartPayload) -> Self {
        Self::new(
            MessageType::MeetingTimerStart,
            serde_json::to_value(payload).unwrap(),
        )
    }

    pub fn meeting_timer_warning(remaining_ms: i64, message: String) -> Self {
        let payload = TimerWarningPayload {
            remaining_ms,
            remaining_minutes: remaining_ms / 60_000,
            message,
        };
        Self::new(
            MessageType::MeetingTimerWarning,
            serde_json::to_value(payload).unwrap(),
        )
    }

    pub fn meeting_auto_end(reason: String) -> Self {
        let payload = MeetingEndPayload {
            reason,
            redirect_url: None,
        };
        Self::new(
            MessageType::MeetingAutoEnd,
            serde_json::to_value(payload).unwrap(),
        )
    }

    pub fn meeting_force_end(reason: String, redirect_url: String) -> Self {
        let payload = MeetingEndPayload {
            reason,
            redirect_url: Some(redirect_url),
        };
        Self::new(
            MessageType::MeetingForceEnd,
            serde_json::to_value(payload).unwrap(),
        )
    }

    pub fn instant_call_incoming(
        call_id: String,
        volunteer_id: String,
        volunteer_name: String,
        room_id: String,
    ) -> Self {
        let payload = InstantCallIncomingPayload {
            call_id,
            volunteer_id,
            volunteer_name,
            room_id,
        };
        Self::new(
            MessageType::InstantCallIncoming,
            serde_json::to_value(payload).unwrap(),
        )
    }

    pub fn instant_call_sent(call_id: String, student_id: String, room_id: String) -> Self {
        let payload = InstantCallSentPayload {
            call_id,
            student_id,
            room_id,
        };
        Self::new(
            MessageType::InstantCallSent,
            serde_json::to_value(payload).unwrap(),
        )
    }

    pub fn instant_call_accepted(call_id: String, room_id: String) -> Self {
        let payload = InstantCallOutcomePayload {
            call_id,
            room_id: Some(room_id),
            reason: None,
        };
        Self::new(
            MessageType::InstantCallAccepted,
            serde_json::to_value(payload).unwrap(),
        )
    }

    pub fn instant_call_declined(call_id: String) -> Self {
        let payload = InstantCallOutcomePayload {
            call_id,
            room_id: None,
            reason: None,
        };
        Self::new(
            MessageType::InstantCallDeclined,
            serde_json::to_value(payload).unwrap(),
        )
    }

    pub fn instant_call_cancelled(call_id: String, reason: Option<String>) -> Self {
        let payload = InstantCallOutcomePayload {
            call_id,
            room_id: None,
            reason,
        };
        Self::new(
            MessageType::InstantCallCancelled,
            serde_json::to_value(payload).unwrap(),
        )
    }

    pub fn user_online(user_id: String, role: Role) -> Self {
        let payload = PresencePayload { user_id, role };
        Self::new(
            MessageType::UserOnline,
            serde_json::to_value(payload).unwrap(),
        )
    }

    pub fn user_offline(user_id: String, role: Role) -> Self {
        let payload = PresencePayload { user_id, role };
        Self::new(
            MessageType::UserOffline,
            serde_json::to_value(payload).unwrap(),
        )
    }

    /// Create an error message
    pub fn error(message: String) -> Self {
        let payload = ErrorPayload { message };
        Self::new(MessageType::Error, serde_json::to_value(payload).unwrap())
    }

    /// Serialized form for the outbound channel
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_match_protocol() {
        assert_eq!(
            serde_json::to_string(&MessageType::IceCandidate).unwrap(),
            "\"iceCandidate\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::InstantCallRequest).unwrap(),
            "\"instant-call-request\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::CreatedRoom).unwrap(),
            "\"createdRoom\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::UserOffline).unwrap(),
            "\"user-offline\""
        );
    }

    #[test]
    fn test_join_payload_parses_camel_case() {
        let raw = r#"{"roomId":"r1","peerId":"p1","role":"volunteer","userId":"v1","meetingId":42}"#;
        let payload: JoinPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.room_id.as_deref(), Some("r1"));
        assert_eq!(payload.role, Role::Volunteer);
        assert_eq!(payload.meeting_id, Some(42));
    }

    #[test]
    fn test_message_constructors_and_serialization() {
        let m = WireMessage::created_room("r1".to_string(), "p1".to_string());
        assert!(matches!(m.message_type, MessageType::CreatedRoom));
        let s = m.to_json();
        let back: WireMessage = serde_json::from_str(&s).unwrap();
        assert!(matches!(back.message_type, MessageType::CreatedRoom));

        let w = WireMessage::meeting_timer_warning(600_000, "10 minutes left".to_string());
        let payload: TimerWarningPayload = serde_json::from_value(w.payload).unwrap();
        assert_eq!(payload.remaining_minutes, 10);

        let f = WireMessage::meeting_force_end("timer_expired".to_string(), "/done".to_string());
        let payload: MeetingEndPayload = serde_json::from_value(f.payload).unwrap();
        assert_eq!(payload.redirect_url.as_deref(), Some("/done"));

        let a = WireMessage::meeting_auto_end("manual".to_string());
        assert!(!a.to_json().contains("redirectUrl"));

        let e = WireMessage::error("bad join".to_string());
        assert!(matches!(e.message_type, MessageType::Error));
    }
}
