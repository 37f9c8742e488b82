//! Per-connection gateway session state.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::store::Identity;

use super::events::Frame;

/// Frames a connection may have queued before further frames are dropped.
pub const OUTBOUND_CAPACITY: usize = 1024;

/// Sending half of a connection's outbound queue.
pub type Outbound = mpsc::Sender<Frame>;
/// Receiving half, drained by the connection's socket task.
pub type OutboundRx = mpsc::Receiver<Frame>;

/// Create a connection's bounded outbound queue.
pub fn outbound_queue() -> (Outbound, OutboundRx) {
    mpsc::channel(OUTBOUND_CAPACITY)
}

/// A cheap, cloneable handle used to deliver frames to one connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: String,
    tx: Outbound,
}

impl ConnectionHandle {
    pub fn new(connection_id: String, tx: Outbound) -> Self {
        Self { connection_id, tx }
    }

    /// Enqueue a frame without waiting. Returns `false` if the frame was
    /// dropped: the connection is gone or its queue is full.
    pub fn send(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    "outbound queue full, dropping frame"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(
                    connection_id = %self.connection_id,
                    "dropping frame for closed connection"
                );
                false
            }
        }
    }
}

/// State for a single WebSocket connection.
#[derive(Debug, Clone)]
pub struct GatewaySession {
    /// Unique connection identifier (`conn_` prefixed ULID).
    pub connection_id: String,
    /// Identity resolved at connect time. Immutable for the connection's life.
    pub identity: Identity,
    pub handle: ConnectionHandle,
}

impl GatewaySession {
    pub fn new(connection_id: String, identity: Identity, tx: Outbound) -> Self {
        let handle = ConnectionHandle::new(connection_id.clone(), tx);
        Self {
            connection_id,
            identity,
            handle,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }
}
