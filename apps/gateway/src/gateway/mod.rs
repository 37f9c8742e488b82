//! Real-time connection gateway.

pub mod auth;
pub mod events;
pub mod fanout;
pub mod gate;
pub mod presence;
pub mod rate_limit;
pub mod rooms;
pub mod router;
pub mod sanitize;
pub mod server;
pub mod session;
pub mod viewers;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use drape_common::id::{prefix, prefixed_ulid};
use serde::Serialize;

use crate::config::Config;
use crate::store::{AuthProvider, Identity, PersistenceStore};

use events::EventName;
use fanout::Broadcaster;
use presence::{PresenceChange, PresenceTracker};
use rate_limit::RateLimiter;
use rooms::{RoomId, RoomManager, RoomRegistry};
use session::{GatewaySession, Outbound};
use viewers::ViewerReconciler;

/// Payload of `userStatus`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus<'a> {
    pub user_id: &'a str,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
}

/// Payload of `connected`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Connected<'a> {
    connection_id: &'a str,
    user_id: &'a str,
    username: &'a str,
}

/// Shared gateway state: every connection task holds an `Arc<Gateway>`.
pub struct Gateway {
    config: Arc<Config>,
    auth: Arc<dyn AuthProvider>,
    store: Arc<dyn PersistenceStore>,
    registry: Arc<RoomRegistry>,
    pub rooms: RoomManager,
    pub fanout: Broadcaster,
    pub rate_limiter: RateLimiter,
    pub presence: PresenceTracker,
    pub viewers: ViewerReconciler,
}

impl Gateway {
    pub fn new(
        config: Arc<Config>,
        auth: Arc<dyn AuthProvider>,
        store: Arc<dyn PersistenceStore>,
    ) -> Self {
        let registry = Arc::new(RoomRegistry::new());
        Self {
            rooms: RoomManager::new(registry.clone(), store.clone()),
            fanout: Broadcaster::new(registry.clone()),
            rate_limiter: RateLimiter::new(config.rate_limit_window, config.rate_limit_max_events),
            presence: PresenceTracker::new(),
            viewers: ViewerReconciler::new(registry.clone(), store.clone()),
            registry,
            config,
            auth,
            store,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn auth(&self) -> &dyn AuthProvider {
        self.auth.as_ref()
    }

    pub fn store(&self) -> &dyn PersistenceStore {
        self.store.as_ref()
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Emit an event to a room on behalf of the rest of the application
    /// (e.g. a new comment on a post).
    pub fn emit<T: Serialize>(&self, room: &RoomId, event: &str, payload: &T) -> usize {
        self.fanout.emit(room, event, payload)
    }

    /// Register a verified connection: personal room, `connected` frame and
    /// presence.
    pub async fn connect(&self, identity: Identity, tx: Outbound) -> GatewaySession {
        let session = GatewaySession::new(prefixed_ulid(prefix::CONNECTION), identity, tx);

        self.fanout.register(session.handle.clone());
        self.registry
            .join(&RoomId::User(session.user_id().to_string()), &session.handle);

        self.fanout.emit_to_connection(
            &session.connection_id,
            EventName::CONNECTED,
            &Connected {
                connection_id: &session.connection_id,
                user_id: session.user_id(),
                username: &session.identity.username,
            },
        );

        let _gate = self.presence.enter(session.user_id()).await;
        if let Some(change) = self.presence.connect(session.user_id()) {
            self.publish_presence(session.user_id(), change).await;
        }

        session
    }

    /// Tear down a connection: leave every room, then update presence. Safe
    /// to call more than once.
    pub async fn disconnect(&self, session: &GatewaySession) {
        self.fanout.unregister(&session.connection_id);
        let left = self.leave_all(session).await;

        tracing::debug!(
            connection_id = %session.connection_id,
            rooms = left.len(),
            "connection removed from rooms"
        );

        if left.is_empty() {
            // Already torn down; presence was released the first time.
            return;
        }

        let _gate = self.presence.enter(session.user_id()).await;
        if let Some(change) = self.presence.disconnect(session.user_id()) {
            self.rate_limiter.remove(session.user_id());
            self.publish_presence(session.user_id(), change).await;
        }
    }

    /// Remove the connection from every room it joined. Stream rooms go
    /// through the viewer reconciler so their counts stay exact.
    pub async fn leave_all(&self, session: &GatewaySession) -> Vec<RoomId> {
        let rooms = self.registry.take_rooms(&session.connection_id);
        for room in &rooms {
            match room {
                RoomId::Stream(stream_id) => {
                    if self.viewers.leave(session, stream_id).changed {
                        self.viewers.persist(stream_id).await;
                    }
                }
                _ => {
                    self.registry.leave(room, &session.connection_id);
                }
            }
        }
        rooms
    }

    async fn publish_presence(&self, user_id: &str, change: PresenceChange) {
        if let Err(err) = self
            .store
            .set_presence(user_id, change.is_online, change.last_seen)
            .await
        {
            tracing::warn!(?err, %user_id, "failed to persist presence");
        }

        let status = UserStatus {
            user_id,
            is_online: change.is_online,
            last_seen: change.last_seen,
        };

        match self.store.conversation_partners(user_id).await {
            Ok(partners) => {
                for partner in partners {
                    self.fanout
                        .emit(&RoomId::User(partner), EventName::USER_STATUS, &status);
                }
            }
            Err(err) => {
                tracing::warn!(?err, %user_id, "failed to load conversation partners");
            }
        }

        tracing::info!(%user_id, is_online = change.is_online, "presence changed");
    }
}
