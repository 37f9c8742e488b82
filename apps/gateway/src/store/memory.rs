use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drape_common::id::{prefix, prefixed_ulid};
use parking_lot::Mutex;

use super::{
    AuthProvider, Conversation, Identity, NewMessage, PersistenceStore, StoreError, StoredMessage,
    StreamInfo,
};

/// Presence as last written by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
}

/// Collaborator calls that can be slowed down with [`MemoryStore::delay_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreCall {
    Conversation,
    RecordViewerCount,
    SetPresence,
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, Identity>,
    sessions: HashMap<String, String>,
    conversations: HashMap<String, Conversation>,
    messages: Vec<StoredMessage>,
    reads: HashMap<String, HashSet<String>>,
    streams: HashMap<String, StreamInfo>,
    viewer_counts: HashMap<String, usize>,
    presence: HashMap<String, PresenceSnapshot>,
    unavailable: bool,
    delays: HashMap<StoreCall, VecDeque<Duration>>,
}

// ---------------------------------------------------------------------------
// In-memory implementation (development binary / tests)
// ---------------------------------------------------------------------------

/// Implements both collaborator traits over process memory.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn add_user(&self, user_id: &str, username: &str) {
        self.inner.lock().users.insert(
            user_id.to_string(),
            Identity {
                user_id: user_id.to_string(),
                username: username.to_string(),
                suspended: false,
            },
        );
    }

    pub fn suspend_user(&self, user_id: &str) {
        if let Some(user) = self.inner.lock().users.get_mut(user_id) {
            user.suspended = true;
        }
    }

    /// Map a session credential to a user.
    pub fn add_session(&self, credential: &str, user_id: &str) {
        self.inner
            .lock()
            .sessions
            .insert(credential.to_string(), user_id.to_string());
    }

    pub fn add_conversation(&self, conversation_id: &str, participants: &[&str]) {
        self.inner.lock().conversations.insert(
            conversation_id.to_string(),
            Conversation {
                id: conversation_id.to_string(),
                participants: participants.iter().map(|p| p.to_string()).collect(),
            },
        );
    }

    pub fn add_stream(&self, stream: StreamInfo) {
        self.inner.lock().streams.insert(stream.id.clone(), stream);
    }

    /// Simulate an outage: every collaborator call fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    /// Make the next `call` take `delay` before it touches the data. Queued
    /// delays are consumed one per call, in call order.
    pub fn delay_next(&self, call: StoreCall, delay: Duration) {
        self.inner
            .lock()
            .delays
            .entry(call)
            .or_default()
            .push_back(delay);
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<StoredMessage> {
        self.inner
            .lock()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn readers(&self, message_id: &str) -> HashSet<String> {
        self.inner
            .lock()
            .reads
            .get(message_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn viewer_count(&self, stream_id: &str) -> Option<usize> {
        self.inner.lock().viewer_counts.get(stream_id).copied()
    }

    pub fn presence(&self, user_id: &str) -> Option<PresenceSnapshot> {
        self.inner.lock().presence.get(user_id).copied()
    }

    async fn pause(&self, call: StoreCall) {
        let delay = self
            .inner
            .lock()
            .delays
            .get_mut(&call)
            .and_then(VecDeque::pop_front);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn check_available(inner: &Inner) -> Result<(), StoreError> {
        if inner.unavailable {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AuthProvider for MemoryStore {
    async fn resolve_session(&self, credential: &str) -> Result<Option<Identity>, StoreError> {
        let inner = self.inner.lock();
        Self::check_available(&inner)?;
        Ok(inner
            .sessions
            .get(credential)
            .and_then(|user_id| inner.users.get(user_id))
            .cloned())
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, StoreError> {
        self.pause(StoreCall::Conversation).await;
        let inner = self.inner.lock();
        Self::check_available(&inner)?;
        Ok(inner.conversations.get(conversation_id).cloned())
    }

    async fn conversation_partners(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock();
        Self::check_available(&inner)?;
        let partners: HashSet<String> = inner
            .conversations
            .values()
            .filter(|c| c.has_participant(user_id))
            .flat_map(|c| c.participants.iter())
            .filter(|p| p.as_str() != user_id)
            .cloned()
            .collect();
        Ok(partners.into_iter().collect())
    }

    async fn create_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;

        let stored = StoredMessage {
            id: prefixed_ulid(prefix::MESSAGE),
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            content: message.content,
            message_type: message.message_type,
            attachments: message.attachments,
            reply_to: message.reply_to,
            created_at: Utc::now(),
        };
        inner.messages.push(stored.clone());
        Ok(stored)
    }

    async fn mark_read(
        &self,
        conversation_id: &str,
        message_id: &str,
        user_id: &str,
        _read_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;

        let exists = inner
            .messages
            .iter()
            .any(|m| m.id == message_id && m.conversation_id == conversation_id);
        if !exists {
            return Ok(false);
        }
        inner
            .reads
            .entry(message_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        Ok(true)
    }

    async fn stream(&self, stream_id: &str) -> Result<Option<StreamInfo>, StoreError> {
        let inner = self.inner.lock();
        Self::check_available(&inner)?;
        Ok(inner.streams.get(stream_id).cloned())
    }

    async fn record_viewer_count(&self, stream_id: &str, count: usize) -> Result<(), StoreError> {
        self.pause(StoreCall::RecordViewerCount).await;
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        inner.viewer_counts.insert(stream_id.to_string(), count);
        Ok(())
    }

    async fn set_presence(
        &self,
        user_id: &str,
        is_online: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.pause(StoreCall::SetPresence).await;
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        inner.presence.insert(
            user_id.to_string(),
            PresenceSnapshot {
                is_online,
                last_seen,
            },
        );
        Ok(())
    }
}
