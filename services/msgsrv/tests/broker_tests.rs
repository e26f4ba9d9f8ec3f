//! Broker integration tests over in-process sessions

#![allow(clippy::disallowed_methods)] // Integration test - unwrap is acceptable

use axum::http::StatusCode;
use serde_json::json;
use tracing_test::traced_test;

use msgsrv::broker::Flow;
use msgsrv::stomp::{Command, Frame};

mod test_env;
use test_env::TestEnv;

fn header<'a>(frame: &'a str, name: &str) -> Option<&'a str> {
    let head = frame.split("\n\n").next()?;
    head.lines()
        .skip(1)
        .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
}

fn body(frame: &str) -> &str {
    frame
        .split_once("\n\n")
        .map(|(_, body)| body.trim_end_matches('\0'))
        .unwrap_or("")
}

#[tokio::test]
async fn test_broadcast_reaches_every_subscriber_once() {
    let env = TestEnv::create().await;
    let mut first = env.connect("alice").await;
    let mut second = env.connect("bob").await;
    env.subscribe(&first, "s1", "/topic/notice").await;
    env.subscribe(&second, "s2", "/topic/notice").await;
    let token = env.token_for("admin").await;

    let (status, _) = env
        .request(
            "POST",
            "/api/v1/websocket/sendToAll",
            Some(&token),
            Some(json!({"message": "hi"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    for (client, sub_id) in [(&mut first, "s1"), (&mut second, "s2")] {
        let frame = client.next_frame().await;
        assert!(frame.starts_with("MESSAGE\n"));
        assert_eq!(header(&frame, "destination"), Some("/topic/notice"));
        assert_eq!(header(&frame, "subscription"), Some(sub_id));
        assert_eq!(body(&frame), "\"hi\"");
        assert!(client.is_idle());
    }
}

#[tokio::test]
async fn test_direct_send_reaches_only_recipient() {
    let env = TestEnv::create().await;
    let mut alice = env.connect("alice").await;
    let mut bob = env.connect("bob").await;
    env.subscribe(&alice, "g", "/user/queue/greeting").await;
    env.subscribe(&bob, "g", "/user/queue/greeting").await;
    let token = env.token_for("admin").await;

    let (status, _) = env
        .request(
            "POST",
            "/api/v1/websocket/sendToUser",
            Some(&token),
            Some(json!({"username": "alice", "message": "hey"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let frame = alice.next_frame().await;
    assert_eq!(
        header(&frame, "destination"),
        Some("/user/alice/queue/greeting")
    );
    assert_eq!(body(&frame), "\"hey\"");
    assert!(bob.is_idle());
}

#[tokio::test]
async fn test_every_session_of_a_user_receives() {
    let env = TestEnv::create().await;
    let mut phone = env.connect("alice").await;
    let mut laptop = env.connect("alice").await;
    env.subscribe(&phone, "g", "/user/queue/greeting").await;
    env.subscribe(&laptop, "g", "/user/alice/queue/greeting").await;

    let delivered = env
        .state
        .broker
        .send_to_user("bob", "alice", bytes::Bytes::from_static(b"\"yo\""))
        .await;
    assert_eq!(delivered, 2);
    assert_eq!(body(&phone.next_frame().await), "\"yo\"");
    assert_eq!(body(&laptop.next_frame().await), "\"yo\"");
}

#[tokio::test]
async fn test_app_destination_routes_to_handler() {
    let env = TestEnv::create().await;
    let alice = env.connect("alice").await;
    let mut bob = env.connect("bob").await;
    env.subscribe(&bob, "g", "/user/queue/greeting").await;

    let send = Frame::new(Command::Send)
        .with_header("destination", "/app/sendToUser/bob")
        .with_body(bytes::Bytes::from_static(b"hello"));
    assert_eq!(env.send_frame(&alice, send).await, Flow::Continue);

    let frame = bob.next_frame().await;
    assert_eq!(header(&frame, "destination"), Some("/user/bob/queue/greeting"));
    assert_eq!(body(&frame), "\"hello\"");
}

#[tokio::test]
async fn test_client_send_to_topic_fans_out() {
    let env = TestEnv::create().await;
    let alice = env.connect("alice").await;
    let mut bob = env.connect("bob").await;
    env.subscribe(&bob, "chat", "/topic/chat").await;

    let send = Frame::new(Command::Send)
        .with_header("destination", "/topic/chat")
        .with_header("receipt", "r-1")
        .with_body(bytes::Bytes::from_static(b"{\"text\":\"x\"}"));
    assert_eq!(env.send_frame(&alice, send).await, Flow::Continue);

    let frame = bob.next_frame().await;
    assert_eq!(header(&frame, "subscription"), Some("chat"));
    assert_eq!(body(&frame), "{\"text\":\"x\"}");
}

#[tokio::test]
#[traced_test]
async fn test_unknown_app_destination_is_logged_and_dropped() {
    let env = TestEnv::create().await;
    let mut alice = env.connect("alice").await;

    let send = Frame::new(Command::Send)
        .with_header("destination", "/app/nowhere")
        .with_header("receipt", "r-7")
        .with_body(bytes::Bytes::from_static(b"{}"));
    assert_eq!(env.send_frame(&alice, send).await, Flow::Continue);

    // The session survives and still acknowledges the frame
    let receipt = alice.next_frame().await;
    assert_eq!(receipt, "RECEIPT\nreceipt-id:r-7\n\n\0");
    assert!(logs_contain("Unknown app destination: /app/nowhere"));
    assert_eq!(env.state.broker.online_count(), 1);
}

#[tokio::test]
async fn test_disconnect_cleans_up_everywhere() {
    let env = TestEnv::create().await;
    let mut alice = env.connect("alice").await;
    env.subscribe(&alice, "s1", "/topic/notice").await;
    env.subscribe(&alice, "s2", "/user/queue/greeting").await;
    assert_eq!(env.state.broker.subscriptions().subscription_count(), 2);

    let disconnect = Frame::new(Command::Disconnect).with_header("receipt", "bye");
    assert_eq!(env.send_frame(&alice, disconnect).await, Flow::Close);
    assert_eq!(alice.next_frame().await, "RECEIPT\nreceipt-id:bye\n\n\0");

    // The read loop closes the session on Flow::Close
    env.state.broker.close_session(alice.session_id).await;
    env.state.broker.close_session(alice.session_id).await;

    assert_eq!(env.state.broker.online_count(), 0);
    assert!(env.state.broker.registry().is_empty());
    assert_eq!(env.state.broker.subscriptions().subscription_count(), 0);
    assert_eq!(
        env.state
            .broker
            .broadcast_notice(bytes::Bytes::from_static(b"1"))
            .await,
        0
    );
}

#[tokio::test]
async fn test_foreign_queue_subscription_receives_nothing() {
    let env = TestEnv::create().await;
    let mut alice = env.connect("alice").await;
    let mut mallory = env.connect("mallory").await;
    env.subscribe(&alice, "g", "/user/queue/greeting").await;
    env.subscribe(&mallory, "g", "/user/alice/queue/greeting").await;

    env.state
        .broker
        .send_to_user("bob", "alice", bytes::Bytes::from_static(b"\"secret\""))
        .await;
    assert_eq!(body(&alice.next_frame().await), "\"secret\"");
    assert!(mallory.is_idle());
}

#[tokio::test]
async fn test_expired_token_cannot_connect() {
    let env = TestEnv::with_config(|c| c.auth.token_expired = 30).await;
    let token = env.token_for("alice").await;
    env.clock.advance_millis(31_000);

    let (sink, mut rx) = msgsrv::broker::ChannelSink::new();
    let id = env.state.broker.open_session(Box::new(sink)).id();
    let connect = Frame::new(Command::Connect).with_header("passcode", token);
    assert_eq!(env.state.broker.handle_frame(id, connect).await, Flow::Close);
    assert_eq!(
        rx.recv().await.unwrap().as_ref(),
        b"ERROR\nmessage:Authentication failed\n\n\0"
    );
}
