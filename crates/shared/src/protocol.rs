use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        CallId, ConversationId, CorrelationId, GroupId, MediaKind, MessageId, MessageKind,
        SendTarget, UserId,
    },
    error::Rejection,
};

/// Authoritative view of a message as the store knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub server_id: MessageId,
    pub correlation_id: CorrelationId,
    pub sender_id: UserId,
    pub target: SendTarget,
    pub body: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub starred_by: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    #[serde(default)]
    pub forwarded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub group_id: GroupId,
    pub name: String,
    pub owner_id: UserId,
    pub member_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEndReason {
    HungUp,
    Declined,
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Must be the first frame on a fresh channel; everything before it is
    /// dropped.
    Register {
        identity: UserId,
    },
    Send {
        target: SendTarget,
        body: String,
        kind: MessageKind,
        correlation_id: CorrelationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MessageId>,
    },
    MarkRead {
        other_id: UserId,
        upto: DateTime<Utc>,
    },
    Typing {
        conversation: ConversationId,
        is_typing: bool,
    },
    PlaceCall {
        callee_id: UserId,
        media_kind: MediaKind,
        offer: serde_json::Value,
    },
    AnswerCall {
        call_id: CallId,
        answer: serde_json::Value,
    },
    RelayCandidate {
        call_id: CallId,
        payload: serde_json::Value,
    },
    EndCall {
        call_id: CallId,
    },
    DeleteMessage {
        message_id: MessageId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    Online {
        user_id: UserId,
    },
    Offline {
        user_id: UserId,
        last_seen: DateTime<Utc>,
    },
    Typing {
        conversation: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    Received {
        message: MessagePayload,
    },
    /// Sent to every session of the sender so other open tabs splice their
    /// optimistic copy; `message` carries the full authoritative fields.
    Saved {
        correlation_id: CorrelationId,
        server_id: MessageId,
        message: MessagePayload,
    },
    Delivered {
        message_id: MessageId,
        delivered_at: DateTime<Utc>,
    },
    Read {
        reader_id: UserId,
        upto: DateTime<Utc>,
    },
    IncomingCall {
        call_id: CallId,
        caller_id: UserId,
        media_kind: MediaKind,
        offer: serde_json::Value,
    },
    CallAccepted {
        call_id: CallId,
        answer: serde_json::Value,
    },
    /// Opaque connectivity payload relayed verbatim between the two call
    /// parties; the engine never interprets it.
    Candidate {
        call_id: CallId,
        payload: serde_json::Value,
    },
    CallEnded {
        call_id: CallId,
        reason: CallEndReason,
    },
    Rejected(Rejection),
    GroupCreated {
        group: GroupSummary,
    },
    GroupUpdated {
        group: GroupSummary,
    },
    GroupDeleted {
        group_id: GroupId,
    },
    MessageDeleted {
        message_id: MessageId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_use_snake_case_tag_and_payload() {
        let frame = ClientFrame::MarkRead {
            other_id: UserId(4),
            upto: Utc::now(),
        };
        let value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(value["type"], "mark_read");
        assert_eq!(value["payload"]["other_id"], 4);
    }

    #[test]
    fn rejected_frame_round_trips_code() {
        let frame = ServerFrame::Rejected(Rejection::new(
            crate::error::RejectCode::Busy,
            "place_call",
        ));
        let text = serde_json::to_string(&frame).expect("serialize");
        let back: ServerFrame = serde_json::from_str(&text).expect("deserialize");
        match back {
            ServerFrame::Rejected(rejection) => {
                assert_eq!(rejection.code, crate::error::RejectCode::Busy);
                assert_eq!(rejection.context, "place_call");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn candidate_payload_is_passed_through_opaque() {
        let payload = serde_json::json!({"sdpMid": "0", "candidate": "host 10.0.0.1"});
        let frame = ServerFrame::Candidate {
            call_id: CallId(9),
            payload: payload.clone(),
        };
        let text = serde_json::to_string(&frame).expect("serialize");
        let back: ServerFrame = serde_json::from_str(&text).expect("deserialize");
        match back {
            ServerFrame::Candidate { payload: got, .. } => assert_eq!(got, payload),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
