#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use drape_gateway::config::Config;
use drape_gateway::store::memory::MemoryStore;
use drape_gateway::store::StreamInfo;
use drape_gateway::AppState;

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const ALICE: &str = "alice-session";
pub const BOB: &str = "bob-session";
pub const CAROL: &str = "carol-session";
pub const DAVE: &str = "dave-session";

/// Build state backed by a seeded in-memory store.
///
/// alice and bob share conversation `c1`; carol is an outsider; dave is
/// suspended. Stream `s1` is live and public.
pub fn test_state(config: Config) -> (AppState, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    for (user, session) in [("alice", ALICE), ("bob", BOB), ("carol", CAROL), ("dave", DAVE)] {
        store.add_user(user, user);
        store.add_session(session, user);
    }
    store.suspend_user("dave");
    store.add_conversation("c1", &["alice", "bob"]);
    store.add_stream(StreamInfo {
        id: "s1".to_string(),
        host_id: "carol".to_string(),
        is_live: true,
        is_private: false,
        allowed_viewers: vec![],
    });

    let state = AppState::new(config, store.clone(), store.clone());
    (state, store)
}

pub fn test_app() -> (Router, AppState, Arc<MemoryStore>) {
    let (state, store) = test_state(Config::default());
    let app = drape_gateway::routes::router().with_state(state.clone());
    (app, state, store)
}

/// Start an actual TCP server for WebSocket testing. The server runs in the
/// background.
pub async fn start_ws_server(config: Config) -> (SocketAddr, AppState, Arc<MemoryStore>) {
    let (state, store) = test_state(config);
    let app = drape_gateway::routes::router().with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state, store)
}

/// Open a socket, presenting `session` as the session cookie if given.
pub async fn connect(addr: SocketAddr, session: Option<&str>) -> Ws {
    let mut request = format!("ws://{addr}/socket")
        .into_client_request()
        .expect("request");
    if let Some(session) = session {
        let cookie = format!("theme=dark; drape_session={session}");
        request
            .headers_mut()
            .insert(COOKIE, HeaderValue::from_str(&cookie).unwrap());
    }
    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("ws connect");
    ws
}

/// Connect and consume the `connected` frame.
pub async fn connect_as(addr: SocketAddr, session: &str) -> (Ws, Value) {
    let mut ws = connect(addr, Some(session)).await;
    let connected = expect_event(&mut ws, "connected").await;
    (ws, connected)
}

pub async fn send_event(ws: &mut Ws, event: &str, data: Value) {
    let frame = serde_json::json!({ "event": event, "data": data });
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .expect("send");
}

/// Read the next `{event, data}` frame, skipping control frames.
pub async fn next_event(ws: &mut Ws) -> Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for event")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("parse event"),
            Message::Close(frame) => panic!("connection closed: {frame:?}"),
            _ => continue,
        }
    }
}

/// Read frames until one named `event` arrives; return its data.
pub async fn expect_event(ws: &mut Ws, event: &str) -> Value {
    loop {
        let value = next_event(ws).await;
        if value["event"] == event {
            return value["data"].clone();
        }
    }
}

/// Send a `ping` and collect every event that arrives before the `pong`.
pub async fn flush(ws: &mut Ws) -> Vec<Value> {
    send_event(ws, "ping", Value::Null).await;
    let mut seen = Vec::new();
    loop {
        let value = next_event(ws).await;
        if value["event"] == "pong" {
            return seen;
        }
        seen.push(value);
    }
}

/// Read until the server closes the socket; return the close code.
pub async fn expect_close(ws: &mut Ws) -> u16 {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for close");
        match msg {
            Some(Ok(Message::Close(Some(frame)))) => return frame.code.into(),
            Some(Ok(Message::Close(None))) | None => panic!("closed without a code"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("ws read error: {e}"),
        }
    }
}

/// Poll `condition` until it holds, failing after a few seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}
