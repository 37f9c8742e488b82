//! Collaborator interfaces consumed by the gateway.
//!
//! The gateway never talks to a database directly. It is constructed with an
//! [`AuthProvider`] and a [`PersistenceStore`]; production wires these to the
//! main application's services, the development binary and tests use
//! [`memory::MemoryStore`].

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store rejected the write: {0}")]
    Rejected(String),
}

/// Resolved user identity. Fetched once at connect time and never refreshed
/// for the life of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    pub suspended: bool,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub participants: Vec<String>,
}

impl Conversation {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Video,
    File,
    Outfit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// A validated, sanitized message ready to be persisted.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub content: Option<String>,
    pub message_type: MessageType,
    pub attachments: Vec<Attachment>,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: Option<String>,
    pub message_type: MessageType,
    pub attachments: Vec<Attachment>,
    pub reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub id: String,
    pub host_id: String,
    pub is_live: bool,
    pub is_private: bool,
    pub allowed_viewers: Vec<String>,
}

impl StreamInfo {
    /// Public streams are open; private ones admit the host and the allow-list.
    pub fn can_view(&self, user_id: &str) -> bool {
        !self.is_private
            || self.host_id == user_id
            || self.allowed_viewers.iter().any(|v| v == user_id)
    }
}

/// Resolves a session credential (the session cookie value) to an identity.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Returns `Ok(None)` when the credential does not map to a live session.
    async fn resolve_session(&self, credential: &str) -> Result<Option<Identity>, StoreError>;
}

/// Durable storage owned by the main application.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, StoreError>;

    /// Users sharing at least one conversation with `user_id`.
    async fn conversation_partners(&self, user_id: &str) -> Result<Vec<String>, StoreError>;

    async fn create_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError>;

    /// Records a read receipt. Returns `false` if the message does not exist
    /// in that conversation.
    async fn mark_read(
        &self,
        conversation_id: &str,
        message_id: &str,
        user_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn stream(&self, stream_id: &str) -> Result<Option<StreamInfo>, StoreError>;

    async fn record_viewer_count(&self, stream_id: &str, count: usize) -> Result<(), StoreError>;

    async fn set_presence(
        &self,
        user_id: &str,
        is_online: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
