//! Room membership and join-time authorization.
//!
//! A room exists only while it has members. Membership is tracked in both
//! directions: room → connections (for fan-out) and connection → rooms (for
//! disconnect cleanup).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use drape_common::id::is_valid_id;
use serde::Serialize;

use crate::error::GatewayError;
use crate::store::{PersistenceStore, StreamInfo};

use super::events::Frame;
use super::session::{ConnectionHandle, GatewaySession};

// ---------------------------------------------------------------------------
// Room ids
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomId {
    /// Personal room; every connection of the user is in it.
    User(String),
    Conversation(String),
    Post(String),
    Stream(String),
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Conversation(id) => write!(f, "conversation:{id}"),
            Self::Post(id) => write!(f, "post:{id}"),
            Self::Stream(id) => write!(f, "stream:{id}"),
        }
    }
}

impl FromStr for RoomId {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| GatewayError::validation(format!("Invalid room '{s}'")))?;
        if !is_valid_id(id) {
            return Err(GatewayError::validation(format!("Invalid room '{s}'")));
        }
        let id = id.to_string();
        match kind {
            "user" => Ok(Self::User(id)),
            "conversation" => Ok(Self::Conversation(id)),
            "post" => Ok(Self::Post(id)),
            "stream" => Ok(Self::Stream(id)),
            _ => Err(GatewayError::validation(format!("Invalid room '{s}'"))),
        }
    }
}

/// Reject ids that cannot name a room.
pub fn checked_id(id: &str) -> Result<&str, GatewayError> {
    if is_valid_id(id) {
        Ok(id)
    } else {
        Err(GatewayError::validation("Invalid id"))
    }
}

// ---------------------------------------------------------------------------
// Membership registry
// ---------------------------------------------------------------------------

/// The live members of one room.
#[derive(Default)]
pub struct Room {
    members: HashMap<String, ConnectionHandle>,
}

impl Room {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.members.contains_key(connection_id)
    }

    /// Enqueue `frame` on every member except `except`. Returns the number of
    /// connections that accepted it.
    pub fn deliver(&self, frame: &Frame, except: Option<&str>) -> usize {
        let mut delivered = 0;
        for (connection_id, handle) in &self.members {
            if except == Some(connection_id.as_str()) {
                continue;
            }
            if handle.send(frame.clone()) {
                delivered += 1;
            }
        }
        delivered
    }
}

/// Outcome of a join or leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipChange {
    /// Whether membership actually changed (false for duplicate join/leave).
    pub changed: bool,
    /// Room size after the operation.
    pub size: usize,
}

/// Process-wide room membership.
///
/// Closures passed to [`RoomRegistry::join_with`] / [`RoomRegistry::leave_with`]
/// run while the room's shard is write-locked; they may deliver to the room
/// they are handed but must not call back into the registry.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<RoomId, Room>,
    memberships: DashMap<String, HashSet<RoomId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, room: &RoomId, handle: &ConnectionHandle) -> MembershipChange {
        self.join_with(room, handle, |_, _| {})
    }

    /// Add `handle` to `room`, then run `f` in the same critical section.
    pub fn join_with<F>(&self, room: &RoomId, handle: &ConnectionHandle, f: F) -> MembershipChange
    where
        F: FnOnce(MembershipChange, &Room),
    {
        let change = {
            let mut entry = self.rooms.entry(room.clone()).or_default();
            let changed = entry
                .members
                .insert(handle.connection_id.clone(), handle.clone())
                .is_none();
            let change = MembershipChange {
                changed,
                size: entry.len(),
            };
            f(change, &*entry);
            change
        };

        self.memberships
            .entry(handle.connection_id.clone())
            .or_default()
            .insert(room.clone());

        tracing::debug!(
            room = %room,
            connection_id = %handle.connection_id,
            room_size = change.size,
            "connection joined room"
        );
        change
    }

    pub fn leave(&self, room: &RoomId, connection_id: &str) -> MembershipChange {
        self.leave_with(room, connection_id, |_, _| {})
    }

    /// Remove `connection_id` from `room`, then run `f` in the same critical
    /// section. `f` is skipped when the connection was not a member.
    pub fn leave_with<F>(&self, room: &RoomId, connection_id: &str, f: F) -> MembershipChange
    where
        F: FnOnce(MembershipChange, &Room),
    {
        let change = match self.rooms.get_mut(room) {
            Some(mut entry) => {
                let changed = entry.members.remove(connection_id).is_some();
                let change = MembershipChange {
                    changed,
                    size: entry.len(),
                };
                if changed {
                    f(change, &*entry);
                }
                change
            }
            None => MembershipChange {
                changed: false,
                size: 0,
            },
        };

        if change.changed && change.size == 0 {
            self.rooms.remove_if(room, |_, r| r.is_empty());
        }

        if let Some(mut rooms) = self.memberships.get_mut(connection_id) {
            rooms.remove(room);
        }
        self.memberships.remove_if(connection_id, |_, rooms| rooms.is_empty());

        if change.changed {
            tracing::debug!(
                room = %room,
                %connection_id,
                room_size = change.size,
                "connection left room"
            );
        }
        change
    }

    /// Deliver a frame to a room. The room is held exclusively while frames
    /// are enqueued, so concurrent emissions reach all members in one order.
    pub fn emit(&self, room: &RoomId, frame: &Frame, except: Option<&str>) -> usize {
        match self.rooms.get_mut(room) {
            Some(entry) => entry.deliver(frame, except),
            None => 0,
        }
    }

    /// Remove and return the connection's room set.
    pub fn take_rooms(&self, connection_id: &str) -> Vec<RoomId> {
        self.memberships
            .remove(connection_id)
            .map(|(_, rooms)| rooms.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn rooms_of(&self, connection_id: &str) -> Vec<RoomId> {
        self.memberships
            .get(connection_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, room: &RoomId, connection_id: &str) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|r| r.contains(connection_id))
    }

    pub fn room_size(&self, room: &RoomId) -> usize {
        self.rooms.get(room).map_or(0, |r| r.len())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

// ---------------------------------------------------------------------------
// Join authorization
// ---------------------------------------------------------------------------

/// Authorizes joins against the persistence store and applies them to the
/// registry.
pub struct RoomManager {
    registry: Arc<RoomRegistry>,
    store: Arc<dyn PersistenceStore>,
}

/// Result of replacing a connection's conversation rooms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversationsJoined {
    pub joined: Vec<String>,
    pub rejected: Vec<String>,
}

impl RoomManager {
    pub fn new(registry: Arc<RoomRegistry>, store: Arc<dyn PersistenceStore>) -> Self {
        Self { registry, store }
    }

    /// Check whether `session` may join `room`.
    ///
    /// Returns the stream metadata for stream rooms so callers need not
    /// fetch it twice.
    pub async fn authorize(
        &self,
        session: &GatewaySession,
        room: &RoomId,
    ) -> Result<Option<StreamInfo>, GatewayError> {
        let user_id = session.user_id();
        match room {
            RoomId::User(id) => {
                if id != user_id {
                    return Err(GatewayError::access_denied(
                        "Cannot join another user's personal room",
                    ));
                }
                Ok(None)
            }
            RoomId::Conversation(id) => {
                let conversation = self.store.conversation(id).await?;
                match conversation {
                    Some(c) if c.has_participant(user_id) => Ok(None),
                    _ => Err(GatewayError::access_denied(
                        "Not a participant of this conversation",
                    )),
                }
            }
            RoomId::Post(_) => Ok(None),
            RoomId::Stream(id) => {
                let stream = self
                    .store
                    .stream(id)
                    .await?
                    .ok_or_else(|| GatewayError::validation("Stream not found"))?;
                if !stream.can_view(user_id) {
                    return Err(GatewayError::access_denied("This stream is private"));
                }
                Ok(Some(stream))
            }
        }
    }

    /// Authorize and join a non-stream room. Stream rooms go through the
    /// viewer reconciler so counts are recomputed in the same critical section.
    pub async fn join(
        &self,
        session: &GatewaySession,
        room: &RoomId,
    ) -> Result<MembershipChange, GatewayError> {
        self.authorize(session, room).await?;
        Ok(self.registry.join(room, &session.handle))
    }

    pub fn leave(&self, session: &GatewaySession, room: &RoomId) -> MembershipChange {
        self.registry.leave(room, &session.connection_id)
    }

    /// Make `conversation_ids` the connection's complete set of conversation
    /// rooms: rooms outside the set are left, authorized ids are joined.
    /// Personal, post and stream rooms are untouched.
    pub async fn replace_conversations(
        &self,
        session: &GatewaySession,
        conversation_ids: &[String],
    ) -> ConversationsJoined {
        let requested: HashSet<&str> = conversation_ids.iter().map(String::as_str).collect();

        for room in self.registry.rooms_of(&session.connection_id) {
            if let RoomId::Conversation(id) = &room {
                if !requested.contains(id.as_str()) {
                    self.registry.leave(&room, &session.connection_id);
                }
            }
        }

        let mut result = ConversationsJoined::default();
        let mut seen = HashSet::new();
        for id in conversation_ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            if !is_valid_id(id) {
                result.rejected.push(id.clone());
                continue;
            }
            let room = RoomId::Conversation(id.clone());
            match self.join(session, &room).await {
                Ok(_) => result.joined.push(id.clone()),
                Err(err) => {
                    // A participant removed since an earlier join loses the room.
                    self.registry.leave(&room, &session.connection_id);
                    tracing::debug!(
                        connection_id = %session.connection_id,
                        conversation_id = %id,
                        code = err.code(),
                        "conversation join rejected"
                    );
                    result.rejected.push(id.clone());
                }
            }
        }
        result
    }
}
