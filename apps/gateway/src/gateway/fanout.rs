//! Fan-out of server events to rooms and single connections.
//!
//! Each connection owns a bounded outbound queue drained by its own task.
//! Events are serialized once and the resulting frame is shared by every
//! recipient. Delivery is at-most-once: connections that are not joined (or
//! not connected) at emission time never see the event, and a connection
//! whose queue is full loses the frame without slowing anyone else down.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use super::events::{encode, Frame};
use super::rooms::{RoomId, RoomRegistry};
use super::session::ConnectionHandle;

pub struct Broadcaster {
    registry: Arc<RoomRegistry>,
    connections: DashMap<String, ConnectionHandle>,
}

impl Broadcaster {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self {
            registry,
            connections: DashMap::new(),
        }
    }

    pub fn register(&self, handle: ConnectionHandle) {
        self.connections.insert(handle.connection_id.clone(), handle);
    }

    pub fn unregister(&self, connection_id: &str) {
        self.connections.remove(connection_id);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Emit to every member of `room`. Returns the number of recipients.
    pub fn emit<T: Serialize>(&self, room: &RoomId, event: &str, payload: &T) -> usize {
        self.emit_frame(room, event, payload, None)
    }

    /// Emit to every member of `room` except `connection_id`.
    pub fn emit_except<T: Serialize>(
        &self,
        room: &RoomId,
        connection_id: &str,
        event: &str,
        payload: &T,
    ) -> usize {
        self.emit_frame(room, event, payload, Some(connection_id))
    }

    /// Emit to one connection. Returns `false` if it is gone.
    pub fn emit_to_connection<T: Serialize>(
        &self,
        connection_id: &str,
        event: &str,
        payload: &T,
    ) -> bool {
        let Some(frame) = encode_or_log(event, payload) else {
            return false;
        };
        match self.connections.get(connection_id) {
            Some(handle) => handle.send(frame),
            None => false,
        }
    }

    fn emit_frame<T: Serialize>(
        &self,
        room: &RoomId,
        event: &str,
        payload: &T,
        except: Option<&str>,
    ) -> usize {
        let Some(frame) = encode_or_log(event, payload) else {
            return 0;
        };
        let delivered = self.registry.emit(room, &frame, except);
        tracing::trace!(%room, event, recipients = delivered, "broadcast event to room");
        delivered
    }
}

/// Serialize a payload, logging instead of failing the caller.
pub fn encode_or_log<T: Serialize>(event: &str, payload: &T) -> Option<Frame> {
    match encode(event, payload) {
        Ok(frame) => Some(frame),
        Err(err) => {
            tracing::error!(?err, event, "failed to serialize event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::session::{outbound_queue, OutboundRx, OUTBOUND_CAPACITY};
    use serde_json::{json, Value};

    fn handle(id: &str) -> (ConnectionHandle, OutboundRx) {
        let (tx, rx) = outbound_queue();
        (ConnectionHandle::new(id.to_string(), tx), rx)
    }

    fn decode(frame: Frame) -> Value {
        serde_json::from_str(&frame).unwrap()
    }

    #[test]
    fn emit_reaches_all_room_members() {
        let registry = Arc::new(RoomRegistry::new());
        let fanout = Broadcaster::new(registry.clone());
        let room = RoomId::Stream("s1".to_string());
        let (h1, mut rx1) = handle("c1");
        let (h2, mut rx2) = handle("c2");
        registry.join(&room, &h1);
        registry.join(&room, &h2);

        assert_eq!(fanout.emit(&room, "chatMessage", &json!({ "message": "yo" })), 2);
        for rx in [&mut rx1, &mut rx2] {
            let value = decode(rx.try_recv().unwrap());
            assert_eq!(value["event"], "chatMessage");
            assert_eq!(value["data"]["message"], "yo");
        }
    }

    #[test]
    fn emit_except_skips_sender() {
        let registry = Arc::new(RoomRegistry::new());
        let fanout = Broadcaster::new(registry.clone());
        let room = RoomId::Conversation("c1".to_string());
        let (h1, mut rx1) = handle("c1");
        let (h2, mut rx2) = handle("c2");
        registry.join(&room, &h1);
        registry.join(&room, &h2);

        assert_eq!(fanout.emit_except(&room, "c1", "typing", &json!({})), 1);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn emit_to_unknown_room_is_noop() {
        let fanout = Broadcaster::new(Arc::new(RoomRegistry::new()));
        assert_eq!(fanout.emit(&RoomId::Post("p".to_string()), "x", &json!(null)), 0);
    }

    #[test]
    fn emit_to_connection_requires_registration() {
        let fanout = Broadcaster::new(Arc::new(RoomRegistry::new()));
        let (h, mut rx) = handle("c1");

        assert!(!fanout.emit_to_connection("c1", "pong", &json!({})));
        fanout.register(h);
        assert!(fanout.emit_to_connection("c1", "pong", &json!({})));
        assert_eq!(decode(rx.try_recv().unwrap())["event"], "pong");

        fanout.unregister("c1");
        assert!(!fanout.emit_to_connection("c1", "pong", &json!({})));
    }

    #[test]
    fn closed_connections_are_skipped() {
        let registry = Arc::new(RoomRegistry::new());
        let fanout = Broadcaster::new(registry.clone());
        let room = RoomId::Post("p1".to_string());
        let (h1, rx1) = handle("c1");
        let (h2, mut rx2) = handle("c2");
        registry.join(&room, &h1);
        registry.join(&room, &h2);
        drop(rx1);

        assert_eq!(fanout.emit(&room, "postUpdate", &json!({})), 1);
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn stalled_connection_does_not_hold_back_others() {
        let registry = Arc::new(RoomRegistry::new());
        let fanout = Broadcaster::new(registry.clone());
        let room = RoomId::Stream("s1".to_string());
        let (slow, _slow_rx) = handle("slow");
        let (fast, mut fast_rx) = handle("fast");
        registry.join(&room, &slow);
        registry.join(&room, &fast);

        for _ in 0..OUTBOUND_CAPACITY {
            fanout.emit(&room, "chatMessage", &json!({}));
            fast_rx.try_recv().unwrap();
        }

        // The stalled reader's queue is full; the frame still reaches the
        // other member.
        assert_eq!(fanout.emit(&room, "chatMessage", &json!({})), 1);
        assert!(fast_rx.try_recv().is_ok());
    }
}
