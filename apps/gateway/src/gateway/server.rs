//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::error::CLOSE_SESSION_TIMEOUT;
use crate::AppState;

use super::auth::{session_credential, verify_session};
use super::events::{encode, EventName, Frame};
use super::router::handle_frame;
use super::session::{outbound_queue, GatewaySession, OutboundRx};
use super::Gateway;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

pub fn router() -> Router<AppState> {
    Router::new().route("/socket", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let credential =
        session_credential(&headers, &state.config.session_cookie).map(str::to_string);
    ws.on_upgrade(move |socket| handle_connection(socket, state.gateway, credential))
}

async fn handle_connection(socket: WebSocket, gateway: Arc<Gateway>, credential: Option<String>) {
    let (mut ws_tx, ws_rx) = socket.split();

    let identity = match verify_session(gateway.auth(), credential.as_deref()).await {
        Ok(identity) => identity,
        Err(err) => {
            tracing::debug!(code = err.code(), "session verification failed");
            let _ = send_close(&mut ws_tx, err.close_code(), &err.to_string()).await;
            return;
        }
    };

    let (tx, rx) = outbound_queue();
    let session = gateway.connect(identity, tx).await;

    tracing::info!(
        connection_id = %session.connection_id,
        user_id = %session.user_id(),
        "gateway session established"
    );

    run_session(&gateway, &session, ws_tx, ws_rx, rx).await;

    gateway.disconnect(&session).await;

    tracing::info!(
        connection_id = %session.connection_id,
        user_id = %session.user_id(),
        "gateway session ended"
    );
}

/// Main session loop: handle client frames, flush the outbound queue, ping
/// liveness.
///
/// A ping is only counted as unanswered if a full interval passed without any
/// inbound traffic. Time spent inside a handler does not count, and a socket
/// that cannot take a frame within one interval is treated as dead.
async fn run_session(
    gateway: &Gateway,
    session: &GatewaySession,
    mut ws_tx: WsSink,
    mut ws_rx: WsStream,
    mut rx: OutboundRx,
) {
    let interval = gateway.config().heartbeat_interval;
    let mut heartbeat = time::interval(interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await; // First tick fires immediately; skip it.
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        awaiting_pong = false;
                        handle_frame(gateway, session, text.as_str()).await;
                        heartbeat.reset();
                    }
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %session.connection_id, "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }

            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if !write_frame(&mut ws_tx, session, &frame, interval).await {
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if awaiting_pong {
                    tracing::debug!(
                        connection_id = %session.connection_id,
                        "heartbeat timeout, closing connection"
                    );
                    let _ = time::timeout(
                        interval,
                        send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Heartbeat timeout"),
                    )
                    .await;
                    break;
                }
                awaiting_pong = true;
                let Ok(ping) = encode(EventName::PING, &json!({})) else { break };
                if !write_frame(&mut ws_tx, session, &ping, interval).await {
                    break;
                }
            }
        }
    }
}

/// Write one frame to the socket. Returns `false` if the socket failed or
/// did not accept the frame within `deadline`.
async fn write_frame(
    ws_tx: &mut WsSink,
    session: &GatewaySession,
    frame: &Frame,
    deadline: Duration,
) -> bool {
    let send = ws_tx.send(Message::Text(frame.to_string().into()));
    match time::timeout(deadline, send).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(?e, connection_id = %session.connection_id, "ws write error");
            false
        }
        Err(_) => {
            tracing::warn!(
                connection_id = %session.connection_id,
                "socket write stalled, closing connection"
            );
            false
        }
    }
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
