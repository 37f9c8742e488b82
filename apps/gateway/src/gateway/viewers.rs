//! Live-stream viewer counts derived from stream room membership.
//!
//! The count is always the size of the room's connection set, recomputed in
//! the same critical section as the join or leave that changed it. Duplicate
//! joins, repeated leaves and reconnects therefore cannot make it drift.
//! Writes to the store are serialized per stream and always carry the count
//! as of the moment they are issued, so a slow write cannot leave a stale
//! count behind.

use std::sync::Arc;

use serde::Serialize;

use crate::store::PersistenceStore;

use super::events::EventName;
use super::fanout::encode_or_log;
use super::gate::KeyedGate;
use super::rooms::{MembershipChange, Room, RoomId, RoomRegistry};
use super::session::GatewaySession;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerCountUpdate<'a> {
    pub stream_id: &'a str,
    pub viewer_count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerEvent<'a> {
    pub stream_id: &'a str,
    pub user_id: &'a str,
    pub username: &'a str,
    pub viewer_count: usize,
}

pub struct ViewerReconciler {
    registry: Arc<RoomRegistry>,
    store: Arc<dyn PersistenceStore>,
    writes: KeyedGate<String>,
}

impl ViewerReconciler {
    pub fn new(registry: Arc<RoomRegistry>, store: Arc<dyn PersistenceStore>) -> Self {
        Self {
            registry,
            store,
            writes: KeyedGate::new(),
        }
    }

    /// Current viewer count of a stream.
    pub fn viewer_count(&self, stream_id: &str) -> usize {
        self.registry.room_size(&RoomId::Stream(stream_id.to_string()))
    }

    /// Add the connection to the stream room and broadcast the new count.
    /// Authorization is the caller's job.
    pub fn join(&self, session: &GatewaySession, stream_id: &str) -> MembershipChange {
        let room = RoomId::Stream(stream_id.to_string());
        self.registry.join_with(&room, &session.handle, |change, members| {
            if change.changed {
                announce(members, session, stream_id, EventName::USER_JOINED_STREAM, change.size);
            } else if let Some(frame) = encode_or_log(
                EventName::VIEWER_COUNT_UPDATE,
                &ViewerCountUpdate {
                    stream_id,
                    viewer_count: change.size,
                },
            ) {
                // Duplicate join: nothing changed for the room, but the
                // joining client still gets the current count.
                session.handle.send(frame);
            }
        })
    }

    /// Remove the connection from the stream room and broadcast the new count
    /// to the remaining viewers. No-op if it was not joined.
    pub fn leave(&self, session: &GatewaySession, stream_id: &str) -> MembershipChange {
        let room = RoomId::Stream(stream_id.to_string());
        self.registry
            .leave_with(&room, &session.connection_id, |change, members| {
                announce(members, session, stream_id, EventName::USER_LEFT_STREAM, change.size);
            })
    }

    /// Write the stream's current count to the store. Failures are logged.
    ///
    /// The count is read after the stream's previous write has finished, so
    /// the last write to land is always the latest count.
    pub async fn persist(&self, stream_id: &str) {
        let _gate = self.writes.enter(stream_id.to_string()).await;
        let count = self.viewer_count(stream_id);
        if let Err(err) = self.store.record_viewer_count(stream_id, count).await {
            tracing::warn!(?err, %stream_id, count, "failed to persist viewer count");
        }
    }
}

fn announce(members: &Room, session: &GatewaySession, stream_id: &str, event: &str, count: usize) {
    let viewer_event = ViewerEvent {
        stream_id,
        user_id: session.user_id(),
        username: &session.identity.username,
        viewer_count: count,
    };
    if let Some(frame) = encode_or_log(event, &viewer_event) {
        members.deliver(&frame, None);
    }
    let update = ViewerCountUpdate {
        stream_id,
        viewer_count: count,
    };
    if let Some(frame) = encode_or_log(EventName::VIEWER_COUNT_UPDATE, &update) {
        members.deliver(&frame, None);
    }
}
