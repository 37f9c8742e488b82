//! In-memory per-user presence tracking with multi-connection support.
//!
//! Presence is per-**user**, not per-connection. A user goes offline only when
//! ALL of their connections have closed.
//!
//! Callers hold [`PresenceTracker::enter`] across a transition and its
//! publication, so a reconnect can never be overtaken by the offline write of
//! the connection it replaced.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::gate::{GateGuard, KeyedGate};

/// Per-user presence state.
struct UserPresence {
    /// Number of open connections for this user.
    connection_count: usize,
    /// When the user was last seen (connect or disconnect).
    last_seen: DateTime<Utc>,
}

/// A presence transition the caller must persist and broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceChange {
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
}

/// Thread-safe, DashMap-backed presence registry.
pub struct PresenceTracker {
    inner: DashMap<String, UserPresence>,
    gate: KeyedGate<String>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
            gate: KeyedGate::new(),
        }
    }

    /// Serialize presence transitions of `user_id` until the guard drops.
    pub async fn enter(&self, user_id: &str) -> GateGuard<'_, String> {
        self.gate.enter(user_id.to_string()).await
    }

    /// Register a connection coming online.
    ///
    /// Returns a change only for the user's first open connection.
    pub fn connect(&self, user_id: &str) -> Option<PresenceChange> {
        let now = Utc::now();
        let mut entry = self
            .inner
            .entry(user_id.to_string())
            .or_insert_with(|| UserPresence {
                connection_count: 0,
                last_seen: now,
            });

        entry.connection_count += 1;
        entry.last_seen = now;

        (entry.connection_count == 1).then_some(PresenceChange {
            is_online: true,
            last_seen: now,
        })
    }

    /// Unregister a connection. Returns an offline change when it was the
    /// user's last connection; the entry is then dropped.
    pub fn disconnect(&self, user_id: &str) -> Option<PresenceChange> {
        let now = Utc::now();
        {
            let mut entry = self.inner.get_mut(user_id)?;
            entry.connection_count = entry.connection_count.saturating_sub(1);
            entry.last_seen = now;
        }

        // A connect may have slipped in since the guard was released; only
        // the removal decides whether the user actually went offline.
        self.inner
            .remove_if(user_id, |_, p| p.connection_count == 0)
            .map(|_| PresenceChange {
                is_online: false,
                last_seen: now,
            })
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.inner
            .get(user_id)
            .is_some_and(|p| p.connection_count > 0)
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.inner.get(user_id).map_or(0, |p| p.connection_count)
    }

    pub fn last_seen(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.inner.get(user_id).map(|p| p.last_seen)
    }

    /// Number of users with at least one open connection.
    pub fn online_users(&self) -> usize {
        self.inner.len()
    }
}
