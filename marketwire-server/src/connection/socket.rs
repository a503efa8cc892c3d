//! WebSocket transport loop.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket};
use tokio::sync::mpsc;

use super::{CloseReason, Connection, FrameAction};
use crate::protocol::ServerFrame;
use crate::registry::Outbox;
use crate::server::SharedState;

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Drive one socket until either side closes it.
pub async fn serve(mut socket: WebSocket, state: Arc<SharedState>) {
    let (tx, mut rx) = mpsc::channel::<ServerFrame>(state.config.outbound_queue.max(2));
    let outbox = Outbox::new(tx);
    let evict = Arc::clone(&outbox.evict);
    let mut conn = Connection::new(state.registry.next_conn_id(), outbox);
    tracing::debug!(conn_id = conn.conn_id, "connection opened");

    let auth_deadline = tokio::time::sleep(Duration::from_secs(state.config.auth_timeout_secs));
    tokio::pin!(auth_deadline);
    let period = Duration::from_secs(state.config.ping_interval_secs.max(1));
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    let close = loop {
        tokio::select! {
            _ = &mut auth_deadline, if !conn.is_authenticated() => {
                tracing::info!(conn_id = conn.conn_id, "auth timeout");
                break Some(CloseReason::AuthTimeout);
            }
            _ = evict.notified() => {
                tracing::warn!(conn_id = conn.conn_id, user = ?conn.principal().map(|p| &p.user_id), "slow consumer, disconnecting");
                break Some(CloseReason::SlowConsumer);
            }
            _ = ping.tick() => {
                if socket.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                    break None;
                }
            }
            frame = rx.recv() => {
                let Some(frame) = frame else { break None };
                match tokio::time::timeout(SEND_TIMEOUT, socket.send(WsMessage::Text(frame.to_json().into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => {
                        tracing::debug!(conn_id = conn.conn_id, "WebSocket send failed or timed out");
                        break None;
                    }
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let FrameAction::Close(reason) = conn.on_frame(&state, text.as_str()) {
                            break Some(reason);
                        }
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        if !conn.is_authenticated() {
                            break Some(CloseReason::ProtocolViolation);
                        }
                        conn.reply(ServerFrame::error("binary frames are not supported"));
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break None,
                    Some(Ok(_)) => {} // Ping/Pong handled by axum
                    Some(Err(e)) => {
                        tracing::debug!(conn_id = conn.conn_id, error = %e, "WebSocket read error");
                        break None;
                    }
                }
            }
        }
    };

    conn.on_close(&state);
    if let Some(reason) = close {
        tracing::info!(conn_id = conn.conn_id, code = reason.code(), reason = reason.reason(), "closing connection");
        let frame = CloseFrame { code: reason.code(), reason: Utf8Bytes::from_static(reason.reason()) };
        let _ = socket.send(WsMessage::Close(Some(frame))).await;
    }
}
