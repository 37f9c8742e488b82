//! Wire format: event names, client payloads and server frames.
//!
//! Every frame in either direction is a JSON text message of the form
//! `{"event": "<name>", "data": <payload>}`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::store::{Attachment, MessageType};

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

/// Event names used on the wire.
pub struct EventName;

impl EventName {
    // Client → server
    pub const JOIN_CONVERSATIONS: &'static str = "joinConversations";
    pub const SEND_MESSAGE: &'static str = "sendMessage";
    pub const TYPING: &'static str = "typing";
    pub const STOP_TYPING: &'static str = "stopTyping";
    pub const JOIN_STREAM: &'static str = "joinStream";
    pub const LEAVE_STREAM: &'static str = "leaveStream";
    pub const STREAM_CHAT_MESSAGE: &'static str = "streamChatMessage";
    pub const JOIN_POST: &'static str = "joinPost";
    pub const LEAVE_POST: &'static str = "leavePost";
    pub const USER_BLOCKED: &'static str = "userBlocked";
    pub const USER_UNBLOCKED: &'static str = "userUnblocked";

    // Both directions
    pub const MESSAGE_READ: &'static str = "messageRead";
    pub const STREAM_REACTION: &'static str = "streamReaction";
    pub const PING: &'static str = "ping";
    pub const PONG: &'static str = "pong";

    // Server → client
    pub const CONNECTED: &'static str = "connected";
    pub const CONVERSATIONS_JOINED: &'static str = "conversationsJoined";
    pub const NEW_MESSAGE: &'static str = "newMessage";
    pub const MESSAGE_DELIVERED: &'static str = "messageDelivered";
    pub const MESSAGE_ERROR: &'static str = "messageError";
    pub const USER_JOINED_STREAM: &'static str = "userJoinedStream";
    pub const USER_LEFT_STREAM: &'static str = "userLeftStream";
    pub const VIEWER_COUNT_UPDATE: &'static str = "viewerCountUpdate";
    pub const CHAT_MESSAGE: &'static str = "chatMessage";
    pub const STREAM_ERROR: &'static str = "streamError";
    pub const BLOCKED_BY_USER: &'static str = "blockedByUser";
    pub const UNBLOCKED_BY_USER: &'static str = "unblockedByUser";
    pub const USER_STATUS: &'static str = "userStatus";
    pub const ERROR: &'static str = "error";
}

// ---------------------------------------------------------------------------
// Server → client frames
// ---------------------------------------------------------------------------

/// A serialized server frame, shared by every recipient of a broadcast.
pub type Frame = Arc<str>;

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    event: &'a str,
    data: &'a T,
}

/// Serialize an event into a frame once, before fan-out.
pub fn encode<T: Serialize>(event: &str, data: &T) -> Result<Frame, serde_json::Error> {
    let json = serde_json::to_string(&Envelope { event, data })?;
    Ok(Arc::from(json))
}

// ---------------------------------------------------------------------------
// Client → server frames
// ---------------------------------------------------------------------------

/// The outer shape of every client frame, before payload validation.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl ClientFrame {
    /// Liveness traffic is exempt from rate limiting.
    pub fn is_liveness(&self) -> bool {
        self.event == EventName::PING || self.event == EventName::PONG
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub conversation_id: String,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub message_type: Option<MessageType>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReadPayload {
    pub conversation_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub conversation_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChatPayload {
    pub stream_id: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamReactionPayload {
    pub stream_id: String,
    #[serde(default)]
    pub reaction: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserBlockedPayload {
    pub blocked_user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUnblockedPayload {
    pub unblocked_user_id: String,
}

/// `joinConversations` accepts a bare array or `{"conversationIds": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConversationIds {
    List(Vec<String>),
    Object {
        #[serde(rename = "conversationIds")]
        conversation_ids: Vec<String>,
    },
}

/// A validated client event.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    JoinConversations(Vec<String>),
    SendMessage(SendMessagePayload),
    MessageRead(MessageReadPayload),
    Typing(TypingPayload),
    StopTyping(TypingPayload),
    JoinStream(String),
    LeaveStream(String),
    StreamChatMessage(StreamChatPayload),
    StreamReaction(StreamReactionPayload),
    UserBlocked(UserBlockedPayload),
    UserUnblocked(UserUnblockedPayload),
    JoinPost(String),
    LeavePost(String),
    Ping,
    Pong,
}

impl ClientEvent {
    /// Decode the payload of a frame according to its event name.
    pub fn parse(frame: ClientFrame) -> Result<Self, GatewayError> {
        let ClientFrame { event, data } = frame;
        let event = match event.as_str() {
            EventName::JOIN_CONVERSATIONS => {
                let ids = match payload::<ConversationIds>(data)? {
                    ConversationIds::List(ids) => ids,
                    ConversationIds::Object { conversation_ids } => conversation_ids,
                };
                Self::JoinConversations(ids)
            }
            EventName::SEND_MESSAGE => Self::SendMessage(payload(data)?),
            EventName::MESSAGE_READ => Self::MessageRead(payload(data)?),
            EventName::TYPING => Self::Typing(payload(data)?),
            EventName::STOP_TYPING => Self::StopTyping(payload(data)?),
            EventName::JOIN_STREAM => Self::JoinStream(id_payload(data, "streamId")?),
            EventName::LEAVE_STREAM => Self::LeaveStream(id_payload(data, "streamId")?),
            EventName::STREAM_CHAT_MESSAGE => Self::StreamChatMessage(payload(data)?),
            EventName::STREAM_REACTION => Self::StreamReaction(payload(data)?),
            EventName::USER_BLOCKED => Self::UserBlocked(payload(data)?),
            EventName::USER_UNBLOCKED => Self::UserUnblocked(payload(data)?),
            EventName::JOIN_POST => Self::JoinPost(id_payload(data, "postId")?),
            EventName::LEAVE_POST => Self::LeavePost(id_payload(data, "postId")?),
            EventName::PING => Self::Ping,
            EventName::PONG => Self::Pong,
            other => {
                return Err(GatewayError::validation(format!("Unknown event '{other}'")));
            }
        };
        Ok(event)
    }
}

/// The scoped error event reported back for a failed client event.
pub fn error_event_for(event: &str) -> &'static str {
    match event {
        EventName::SEND_MESSAGE | EventName::MESSAGE_READ => EventName::MESSAGE_ERROR,
        EventName::JOIN_STREAM
        | EventName::LEAVE_STREAM
        | EventName::STREAM_CHAT_MESSAGE
        | EventName::STREAM_REACTION => EventName::STREAM_ERROR,
        _ => EventName::ERROR,
    }
}

fn payload<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, GatewayError> {
    serde_json::from_value(data).map_err(|e| GatewayError::validation(format!("Invalid payload: {e}")))
}

/// Ids may arrive bare (`"s1"`) or wrapped (`{"streamId": "s1"}`).
fn id_payload(data: Value, key: &str) -> Result<String, GatewayError> {
    match data {
        Value::String(id) => Ok(id),
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::String(id)) => Ok(id),
            _ => Err(GatewayError::validation(format!("Missing '{key}'"))),
        },
        _ => Err(GatewayError::validation(format!("Missing '{key}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(value: Value) -> ClientFrame {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn parses_send_message_with_defaults() {
        let event = ClientEvent::parse(frame(json!({
            "event": "sendMessage",
            "data": { "conversationId": "c1", "senderId": "u1", "content": "hi" }
        })))
        .unwrap();

        match event {
            ClientEvent::SendMessage(p) => {
                assert_eq!(p.conversation_id, "c1");
                assert_eq!(p.sender_id.as_deref(), Some("u1"));
                assert_eq!(p.content.as_deref(), Some("hi"));
                assert!(p.message_type.is_none());
                assert!(p.attachments.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn join_conversations_accepts_array_and_object() {
        let a = ClientEvent::parse(frame(json!({
            "event": "joinConversations", "data": ["c1", "c2"]
        })))
        .unwrap();
        let b = ClientEvent::parse(frame(json!({
            "event": "joinConversations", "data": { "conversationIds": ["c1", "c2"] }
        })))
        .unwrap();

        for event in [a, b] {
            match event {
                ClientEvent::JoinConversations(ids) => assert_eq!(ids, vec!["c1", "c2"]),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn stream_ids_accept_bare_and_wrapped_forms() {
        let bare = ClientEvent::parse(frame(json!({ "event": "joinStream", "data": "s1" }))).unwrap();
        let wrapped = ClientEvent::parse(frame(json!({
            "event": "leaveStream", "data": { "streamId": "s1" }
        })))
        .unwrap();
        assert!(matches!(bare, ClientEvent::JoinStream(ref id) if id == "s1"));
        assert!(matches!(wrapped, ClientEvent::LeaveStream(ref id) if id == "s1"));
    }

    #[test]
    fn ping_needs_no_payload() {
        let event = ClientEvent::parse(frame(json!({ "event": "ping" }))).unwrap();
        assert!(matches!(event, ClientEvent::Ping));
    }

    #[test]
    fn unknown_event_is_a_validation_error() {
        let err = ClientEvent::parse(frame(json!({ "event": "explode", "data": {} }))).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn malformed_payload_is_a_validation_error() {
        let err = ClientEvent::parse(frame(json!({
            "event": "typing", "data": { "wrong": 1 }
        })))
        .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn encode_wraps_event_and_data() {
        let frame = encode("pong", &json!({})).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "pong");
        assert!(value["data"].is_object());
    }

    #[test]
    fn errors_are_scoped_by_event_family() {
        assert_eq!(error_event_for("sendMessage"), "messageError");
        assert_eq!(error_event_for("streamChatMessage"), "streamError");
        assert_eq!(error_event_for("typing"), "error");
    }
}
