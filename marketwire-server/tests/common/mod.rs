//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use marketwire_server::config::ServerConfig;
use marketwire_server::identity::{Role, TokenResolver};
use marketwire_server::server::{Server, SharedState};

pub const SECRET: &str = "integration-secret";
pub const TIMEOUT: Duration = Duration::from_secs(5);

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<SharedState>,
    pub tokens: TokenResolver,
    _handle: tokio::task::JoinHandle<anyhow::Result<()>>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    pub fn http(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn token(&self, user: &str) -> String {
        self.tokens.issue(user, chrono::Duration::hours(1))
    }
}

/// Start a server on an ephemeral port backed by a temp-file database,
/// seeded with alice (client), bob (talent) and root (admin).
pub async fn start_server() -> TestServer {
    start_server_with(|_| {}).await
}

pub async fn start_server_with(configure: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        db_path: Some(dir.path().join("chat.db").to_string_lossy().into_owned()),
        ..Default::default()
    };
    configure(&mut config);

    let tokens = TokenResolver::new(SECRET);
    let server = Server::with_tokens(config, tokens.clone());
    let (addr, state, handle) = server.start().await.unwrap();
    {
        let db = state.db.lock();
        db.upsert_user("alice", Role::Client, Some("Alice")).unwrap();
        db.upsert_user("bob", Role::Talent, Some("Bob")).unwrap();
        db.upsert_user("root", Role::Admin, Some("Root")).unwrap();
    }
    TestServer { addr, state, tokens, _handle: handle, _dir: dir }
}

pub async fn connect(server: &TestServer) -> Ws {
    let url = format!("ws://{}/ws", server.addr);
    let (ws, _) = timeout(TIMEOUT, connect_async(&url)).await.expect("connect timed out").unwrap();
    ws
}

pub async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Next JSON text frame, skipping heartbeats.
pub async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let frame = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Wait for the server's close frame and return its code.
pub async fn close_code(ws: &mut Ws) -> u16 {
    loop {
        let frame = timeout(TIMEOUT, ws.next()).await.expect("timed out waiting for close");
        match frame {
            Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
            Some(Ok(Message::Close(None))) | None => panic!("closed without a code"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("socket error before close frame: {e}"),
        }
    }
}

/// Connect and authenticate as `user`.
pub async fn login(server: &TestServer, user: &str) -> Ws {
    let mut ws = connect(server).await;
    send_json(&mut ws, serde_json::json!({ "type": "auth", "token": server.token(user) })).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "authenticated", "auth reply for {user}: {reply}");
    ws
}

/// Poll until `cond` holds or the timeout elapses.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
