//! Live protocol tests over a real WebSocket.
//!
//! Tests cover:
//! - Auth handshake, close codes for bad/expired/missing auth and timeouts
//! - Support aliasing in both directions with live delivery
//! - Admin pool fanout and support-ticket notifications
//! - Sender acks and echoes, resume after reconnect
//! - Registry cleanup on disconnect

mod common;

use serde_json::json;

use common::*;
use marketwire_server::identity::Claims;

#[tokio::test]
async fn auth_handshake_registers_connection() {
    let server = start_server().await;
    let _ws = login(&server, "alice").await;
    assert!(server.state.registry.is_online("alice"));
    assert_eq!(server.state.registry.connection_count(), 1);
}

#[tokio::test]
async fn bad_token_closes_with_4002() {
    let server = start_server().await;
    let mut ws = connect(&server).await;
    send_json(&mut ws, json!({ "type": "auth", "token": "not-a-token" })).await;
    assert_eq!(close_code(&mut ws).await, 4002);
    assert_eq!(server.state.registry.connection_count(), 0);
}

#[tokio::test]
async fn expired_token_closes_with_4001() {
    let server = start_server().await;
    let token = server.tokens.encode(&Claims { sub: "alice".into(), exp: 1 });
    let mut ws = connect(&server).await;
    send_json(&mut ws, json!({ "type": "auth", "token": token })).await;
    assert_eq!(close_code(&mut ws).await, 4001);
}

#[tokio::test]
async fn first_frame_must_be_auth() {
    let server = start_server().await;
    let mut ws = connect(&server).await;
    send_json(&mut ws, json!({ "type": "message", "receiver_id": "bob", "content": "hi" })).await;
    assert_eq!(close_code(&mut ws).await, 4003);
}

#[tokio::test]
async fn silent_connection_times_out() {
    let server = start_server_with(|config| config.auth_timeout_secs = 1).await;
    let mut ws = connect(&server).await;
    assert_eq!(close_code(&mut ws).await, 4000);
}

#[tokio::test]
async fn user_support_message_reaches_admin_pool() {
    let server = start_server().await;
    let mut root = login(&server, "root").await;
    let mut alice = login(&server, "alice").await;

    send_json(
        &mut alice,
        json!({ "type": "message", "receiver_id": "anything", "content": "help", "isSupport": true }),
    )
    .await;

    let ack = next_json(&mut alice).await;
    assert_eq!(ack["type"], "sent");
    assert_eq!(ack["message"]["senderId"], "alice");
    assert_eq!(ack["message"]["receiverId"], "support");

    let pushed = next_json(&mut root).await;
    assert_eq!(pushed["type"], "new_message");
    assert_eq!(pushed["message"]["id"], ack["message"]["id"]);

    let ticket = next_json(&mut root).await;
    assert_eq!(ticket["type"], "notification");
    assert_eq!(ticket["notification"]["type"], "support_ticket");
    assert_eq!(ticket["notification"]["data"]["messageId"], ack["message"]["id"]);
}

#[tokio::test]
async fn admin_reply_is_aliased_and_pushed() {
    let server = start_server().await;
    let mut alice = login(&server, "alice").await;
    let mut root = login(&server, "root").await;

    send_json(
        &mut root,
        json!({ "type": "message", "receiver_id": "alice", "content": "hi", "isSupport": true }),
    )
    .await;

    let pushed = next_json(&mut alice).await;
    assert_eq!(pushed["type"], "new_message");
    assert_eq!(pushed["message"]["senderId"], "support");
    assert_eq!(pushed["message"]["receiverId"], "alice");
    assert_eq!(pushed["message"]["content"], "hi");
    assert_eq!(next_json(&mut root).await["type"], "sent");
}

#[tokio::test]
async fn errors_keep_connection_open() {
    let server = start_server().await;
    let mut alice = login(&server, "alice").await;

    send_json(&mut alice, json!({ "type": "message", "receiver_id": "support", "content": "hi" })).await;
    assert_eq!(next_json(&mut alice).await["type"], "error");

    send_json(&mut alice, json!({ "type": "message", "receiver_id": "bob", "content": "   " })).await;
    assert_eq!(next_json(&mut alice).await["type"], "error");

    send_json(&mut alice, json!({ "type": "message", "receiver_id": "bob", "content": "ok" })).await;
    assert_eq!(next_json(&mut alice).await["type"], "sent");
}

#[tokio::test]
async fn messages_arrive_in_persisted_order() {
    let server = start_server().await;
    let mut bob = login(&server, "bob").await;
    let mut alice = login(&server, "alice").await;

    for i in 0..10 {
        send_json(&mut alice, json!({ "type": "message", "receiver_id": "bob", "content": format!("m{i}") })).await;
    }
    let mut last_id = 0;
    for i in 0..10 {
        let frame = next_json(&mut bob).await;
        assert_eq!(frame["message"]["content"], format!("m{i}"));
        let id = frame["message"]["id"].as_i64().unwrap();
        assert!(id > last_id);
        last_id = id;
    }
}

#[tokio::test]
async fn resume_fills_the_gap_after_reconnect() {
    let server = start_server().await;
    let mut bob = login(&server, "bob").await;
    let mut alice = login(&server, "alice").await;

    send_json(&mut alice, json!({ "type": "message", "receiver_id": "bob", "content": "first" })).await;
    let first = next_json(&mut bob).await;
    let cursor = first["message"]["id"].as_i64().unwrap();
    drop(bob);
    eventually(|| !server.state.registry.is_online("bob")).await;

    send_json(&mut alice, json!({ "type": "message", "receiver_id": "bob", "content": "missed" })).await;
    assert_eq!(next_json(&mut alice).await["type"], "sent");
    assert_eq!(next_json(&mut alice).await["type"], "sent");

    let mut bob = login(&server, "bob").await;
    send_json(&mut bob, json!({ "type": "resume", "after_id": cursor })).await;
    let replayed = next_json(&mut bob).await;
    assert_eq!(replayed["type"], "new_message");
    assert_eq!(replayed["message"]["content"], "missed");
    let done = next_json(&mut bob).await;
    assert_eq!(done["type"], "resumed");
    assert_eq!(done["cursor"], replayed["message"]["id"]);
    assert_eq!(done["more"], false);
}

#[tokio::test]
async fn read_frame_reports_counts() {
    let server = start_server().await;
    let mut alice = login(&server, "alice").await;
    let mut bob = login(&server, "bob").await;

    send_json(&mut bob, json!({ "type": "message", "receiver_id": "alice", "content": "ping" })).await;
    next_json(&mut alice).await;

    send_json(&mut alice, json!({ "type": "read", "isSupport": false })).await;
    let counts = next_json(&mut alice).await;
    assert_eq!(counts, json!({ "type": "unread", "general": 0, "support": 0 }));
}

#[tokio::test]
async fn disconnect_deregisters() {
    let server = start_server().await;
    let first = login(&server, "alice").await;
    let _second = login(&server, "alice").await;
    assert_eq!(server.state.registry.connections_for("alice").len(), 2);

    drop(first);
    eventually(|| server.state.registry.connections_for("alice").len() == 1).await;
}
