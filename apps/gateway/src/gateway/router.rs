//! Per-event handlers for client frames.
//!
//! Every event follows the same path: decode, rate-limit, authorize, persist,
//! broadcast. A failure at any step is reported to the originating
//! connection only, as a scoped error event; nothing is broadcast.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::error::GatewayError;
use crate::store::NewMessage;

use super::events::{
    error_event_for, ClientEvent, ClientFrame, EventName, MessageReadPayload, SendMessagePayload,
    StreamChatPayload, StreamReactionPayload, TypingPayload,
};
use super::rooms::{checked_id, RoomId};
use super::sanitize::sanitize_text;
use super::session::GatewaySession;
use super::Gateway;

/// Most attachments a single message may carry.
const MAX_ATTACHMENTS: usize = 10;
/// Most conversation ids accepted by one `joinConversations`.
const MAX_CONVERSATIONS_PER_JOIN: usize = 100;
/// Longest accepted stream reaction, in characters.
const MAX_REACTION_LENGTH: usize = 32;

// ---------------------------------------------------------------------------
// Outbound payloads
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageDelivered<'a> {
    message_id: &'a str,
    conversation_id: &'a str,
    delivered_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadReceipt<'a> {
    conversation_id: &'a str,
    message_id: &'a str,
    user_id: &'a str,
    read_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TypingIndicator<'a> {
    conversation_id: &'a str,
    user_id: &'a str,
    username: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamChat<'a> {
    stream_id: &'a str,
    user_id: &'a str,
    username: &'a str,
    message: String,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamReaction<'a> {
    stream_id: &'a str,
    user_id: &'a str,
    username: &'a str,
    reaction: String,
    timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Handle one text frame received from `session`.
pub async fn handle_frame(gateway: &Gateway, session: &GatewaySession, text: &str) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            let err = GatewayError::validation(format!("Invalid frame: {err}"));
            report(gateway, session, "unknown", &err);
            return;
        }
    };

    if !frame.is_liveness() {
        if let Err(err) = gateway.rate_limiter.check(session.user_id()) {
            tracing::warn!(
                user_id = %session.user_id(),
                connection_id = %session.connection_id,
                event = %frame.event,
                "rate limit exceeded"
            );
            report(gateway, session, &frame.event, &err);
            return;
        }
    }

    let event_name = frame.event.clone();
    let result = match ClientEvent::parse(frame) {
        Ok(event) => dispatch(gateway, session, event).await,
        Err(err) => Err(err),
    };

    if let Err(err) = result {
        report(gateway, session, &event_name, &err);
    }
}

/// Route a decoded event to its handler.
pub async fn dispatch(
    gateway: &Gateway,
    session: &GatewaySession,
    event: ClientEvent,
) -> Result<(), GatewayError> {
    match event {
        ClientEvent::JoinConversations(ids) => join_conversations(gateway, session, ids).await,
        ClientEvent::SendMessage(payload) => send_message(gateway, session, payload).await,
        ClientEvent::MessageRead(payload) => message_read(gateway, session, payload).await,
        ClientEvent::Typing(payload) => typing(gateway, session, payload, EventName::TYPING),
        ClientEvent::StopTyping(payload) => {
            typing(gateway, session, payload, EventName::STOP_TYPING)
        }
        ClientEvent::JoinStream(stream_id) => join_stream(gateway, session, &stream_id).await,
        ClientEvent::LeaveStream(stream_id) => leave_stream(gateway, session, &stream_id).await,
        ClientEvent::StreamChatMessage(payload) => stream_chat(gateway, session, payload),
        ClientEvent::StreamReaction(payload) => stream_reaction(gateway, session, payload),
        ClientEvent::UserBlocked(payload) => {
            block_notice(gateway, session, &payload.blocked_user_id, true)
        }
        ClientEvent::UserUnblocked(payload) => {
            block_notice(gateway, session, &payload.unblocked_user_id, false)
        }
        ClientEvent::JoinPost(post_id) => {
            let room = RoomId::Post(checked_id(&post_id)?.to_string());
            gateway.rooms.join(session, &room).await?;
            Ok(())
        }
        ClientEvent::LeavePost(post_id) => {
            let room = RoomId::Post(checked_id(&post_id)?.to_string());
            gateway.rooms.leave(session, &room);
            Ok(())
        }
        ClientEvent::Ping => {
            gateway
                .fanout
                .emit_to_connection(&session.connection_id, EventName::PONG, &json!({}));
            Ok(())
        }
        ClientEvent::Pong => Ok(()),
    }
}

fn report(gateway: &Gateway, session: &GatewaySession, event: &str, err: &GatewayError) {
    match err {
        GatewayError::Persistence(_) => tracing::warn!(
            connection_id = %session.connection_id,
            event,
            code = err.code(),
            "event failed"
        ),
        _ => tracing::debug!(
            connection_id = %session.connection_id,
            event,
            code = err.code(),
            %err,
            "event rejected"
        ),
    }
    gateway.fanout.emit_to_connection(
        &session.connection_id,
        error_event_for(event),
        &err.to_body(event),
    );
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

async fn join_conversations(
    gateway: &Gateway,
    session: &GatewaySession,
    ids: Vec<String>,
) -> Result<(), GatewayError> {
    if ids.len() > MAX_CONVERSATIONS_PER_JOIN {
        return Err(GatewayError::validation(format!(
            "At most {MAX_CONVERSATIONS_PER_JOIN} conversations per request"
        )));
    }

    let result = gateway.rooms.replace_conversations(session, &ids).await;
    tracing::debug!(
        connection_id = %session.connection_id,
        joined = result.joined.len(),
        rejected = result.rejected.len(),
        "conversation rooms replaced"
    );
    gateway.fanout.emit_to_connection(
        &session.connection_id,
        EventName::CONVERSATIONS_JOINED,
        &result,
    );
    Ok(())
}

async fn send_message(
    gateway: &Gateway,
    session: &GatewaySession,
    payload: SendMessagePayload,
) -> Result<(), GatewayError> {
    if payload
        .sender_id
        .as_deref()
        .is_some_and(|sender| sender != session.user_id())
    {
        return Err(GatewayError::access_denied(
            "Sender does not match the authenticated user",
        ));
    }

    let conversation_id = checked_id(&payload.conversation_id)?.to_string();
    let content = payload
        .content
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty());

    if content.is_none() && payload.attachments.is_empty() {
        return Err(GatewayError::validation(
            "Message must have content or an attachment",
        ));
    }
    let max = gateway.config().max_message_length;
    if content.is_some_and(|c| c.chars().count() > max) {
        return Err(GatewayError::validation(format!(
            "Message exceeds {max} characters"
        )));
    }
    if payload.attachments.len() > MAX_ATTACHMENTS {
        return Err(GatewayError::validation(format!(
            "At most {MAX_ATTACHMENTS} attachments per message"
        )));
    }
    if payload.attachments.iter().any(|a| a.url.trim().is_empty()) {
        return Err(GatewayError::validation("Attachment url is required"));
    }
    let reply_to = payload
        .reply_to
        .as_deref()
        .map(checked_id)
        .transpose()?
        .map(str::to_string);

    let conversation = gateway
        .store()
        .conversation(&conversation_id)
        .await?
        .ok_or_else(|| GatewayError::validation("Conversation not found"))?;
    if !conversation.has_participant(session.user_id()) {
        return Err(GatewayError::access_denied(
            "Not a participant of this conversation",
        ));
    }

    let message = gateway
        .store()
        .create_message(NewMessage {
            conversation_id,
            sender_id: session.user_id().to_string(),
            content: content.map(sanitize_text),
            message_type: payload.message_type.unwrap_or_default(),
            attachments: payload.attachments,
            reply_to,
        })
        .await?;

    let room = RoomId::Conversation(message.conversation_id.clone());
    let recipients = gateway.fanout.emit(&room, EventName::NEW_MESSAGE, &message);

    let delivered = MessageDelivered {
        message_id: &message.id,
        conversation_id: &message.conversation_id,
        delivered_at: Utc::now(),
    };
    gateway
        .fanout
        .emit(&room, EventName::MESSAGE_DELIVERED, &delivered);
    if !gateway.registry().is_member(&room, &session.connection_id) {
        gateway.fanout.emit_to_connection(
            &session.connection_id,
            EventName::MESSAGE_DELIVERED,
            &delivered,
        );
    }

    tracing::debug!(
        message_id = %message.id,
        room = %room,
        recipients,
        "message sent"
    );
    Ok(())
}

async fn message_read(
    gateway: &Gateway,
    session: &GatewaySession,
    payload: MessageReadPayload,
) -> Result<(), GatewayError> {
    let conversation_id = checked_id(&payload.conversation_id)?;
    let message_id = checked_id(&payload.message_id)?;

    let conversation = gateway
        .store()
        .conversation(conversation_id)
        .await?
        .ok_or_else(|| GatewayError::validation("Conversation not found"))?;
    if !conversation.has_participant(session.user_id()) {
        return Err(GatewayError::access_denied(
            "Not a participant of this conversation",
        ));
    }

    let read_at = Utc::now();
    let found = gateway
        .store()
        .mark_read(conversation_id, message_id, session.user_id(), read_at)
        .await?;
    if !found {
        return Err(GatewayError::validation("Message not found"));
    }

    gateway.fanout.emit(
        &RoomId::Conversation(conversation_id.to_string()),
        EventName::MESSAGE_READ,
        &ReadReceipt {
            conversation_id,
            message_id,
            user_id: session.user_id(),
            read_at,
        },
    );
    Ok(())
}

fn typing(
    gateway: &Gateway,
    session: &GatewaySession,
    payload: TypingPayload,
    event: &str,
) -> Result<(), GatewayError> {
    let conversation_id = checked_id(&payload.conversation_id)?;
    let room = RoomId::Conversation(conversation_id.to_string());
    if !gateway.registry().is_member(&room, &session.connection_id) {
        return Err(GatewayError::access_denied("Not joined to this conversation"));
    }

    gateway.fanout.emit_except(
        &room,
        &session.connection_id,
        event,
        &TypingIndicator {
            conversation_id,
            user_id: session.user_id(),
            username: &session.identity.username,
        },
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

async fn join_stream(
    gateway: &Gateway,
    session: &GatewaySession,
    stream_id: &str,
) -> Result<(), GatewayError> {
    let stream_id = checked_id(stream_id)?;
    let room = RoomId::Stream(stream_id.to_string());

    let stream = gateway.rooms.authorize(session, &room).await?;
    if stream.is_some_and(|s| !s.is_live) {
        return Err(GatewayError::validation("Stream is not live"));
    }

    if gateway.viewers.join(session, stream_id).changed {
        gateway.viewers.persist(stream_id).await;
    }
    Ok(())
}

async fn leave_stream(
    gateway: &Gateway,
    session: &GatewaySession,
    stream_id: &str,
) -> Result<(), GatewayError> {
    let stream_id = checked_id(stream_id)?;
    if gateway.viewers.leave(session, stream_id).changed {
        gateway.viewers.persist(stream_id).await;
    }
    Ok(())
}

fn joined_stream(
    gateway: &Gateway,
    session: &GatewaySession,
    stream_id: &str,
) -> Result<RoomId, GatewayError> {
    let room = RoomId::Stream(checked_id(stream_id)?.to_string());
    if !gateway.registry().is_member(&room, &session.connection_id) {
        return Err(GatewayError::access_denied("Not watching this stream"));
    }
    Ok(room)
}

fn stream_chat(
    gateway: &Gateway,
    session: &GatewaySession,
    payload: StreamChatPayload,
) -> Result<(), GatewayError> {
    let room = joined_stream(gateway, session, &payload.stream_id)?;

    // Stream chat is lossy: empty or overlong messages are dropped silently.
    let max = gateway.config().max_stream_chat_length;
    let Some(message) = payload
        .message
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty() && m.chars().count() <= max)
    else {
        tracing::trace!(connection_id = %session.connection_id, "dropped stream chat message");
        return Ok(());
    };

    gateway.fanout.emit(
        &room,
        EventName::CHAT_MESSAGE,
        &StreamChat {
            stream_id: &payload.stream_id,
            user_id: session.user_id(),
            username: &session.identity.username,
            message: sanitize_text(message),
            timestamp: Utc::now(),
        },
    );
    Ok(())
}

fn stream_reaction(
    gateway: &Gateway,
    session: &GatewaySession,
    payload: StreamReactionPayload,
) -> Result<(), GatewayError> {
    let room = joined_stream(gateway, session, &payload.stream_id)?;

    let Some(reaction) = payload
        .reaction
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty() && r.chars().count() <= MAX_REACTION_LENGTH)
    else {
        return Ok(());
    };

    gateway.fanout.emit_except(
        &room,
        &session.connection_id,
        EventName::STREAM_REACTION,
        &StreamReaction {
            stream_id: &payload.stream_id,
            user_id: session.user_id(),
            username: &session.identity.username,
            reaction: sanitize_text(reaction),
            timestamp: Utc::now(),
        },
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Blocking
// ---------------------------------------------------------------------------

/// Tell `target` they were (un)blocked and confirm to the sender. The block
/// itself is persisted by the HTTP side before the client emits this.
fn block_notice(
    gateway: &Gateway,
    session: &GatewaySession,
    target: &str,
    blocked: bool,
) -> Result<(), GatewayError> {
    let target = checked_id(target)?;
    if target == session.user_id() {
        return Err(GatewayError::validation("Cannot block yourself"));
    }

    let (notice, confirmation, ack) = if blocked {
        (
            EventName::BLOCKED_BY_USER,
            EventName::USER_BLOCKED,
            json!({ "blockedUserId": target, "success": true }),
        )
    } else {
        (
            EventName::UNBLOCKED_BY_USER,
            EventName::USER_UNBLOCKED,
            json!({ "unblockedUserId": target, "success": true }),
        )
    };

    gateway.fanout.emit(
        &RoomId::User(target.to_string()),
        notice,
        &json!({ "userId": session.user_id() }),
    );
    gateway
        .fanout
        .emit_to_connection(&session.connection_id, confirmation, &ack);
    Ok(())
}
