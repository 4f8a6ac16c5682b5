//! Integration tests for the push channel lifecycle.
//!
//! These drive a [`ConnectionManager`] over an in-memory transport with tokio's
//! paused clock, so heartbeat and reconnect timing is deterministic.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use case_sync::connection::{ConnectionManager, ConnectionOptions, ConnectionState, LifecycleEvent};
use case_sync::credentials::{SharedCredential, StaticCredential};
use case_sync::error::ConnectionErrorKind;
use case_sync::protocol::{EntityId, EventType, OutboundFrame};
use common::{settle, wait_for_state, Handshake, MockConnector, Sent};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::sleep;

use ConnectionState::{Closed, Closing, Connecting, Idle, Open};

const BASE_URL: &str = "https://casos.example.com";

fn manager_with(connector: &Arc<MockConnector>, credential: SharedCredential) -> ConnectionManager {
    ConnectionManager::with_connector(
        ConnectionOptions::for_url(BASE_URL),
        Arc::new(credential),
        Arc::clone(connector) as _,
    )
}

fn manager(connector: &Arc<MockConnector>) -> ConnectionManager {
    manager_with(connector, SharedCredential::new(Some("tok".into())))
}

fn transitions(rx: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<(ConnectionState, ConnectionState)> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let LifecycleEvent::StateChanged { from, to } = event {
            out.push((from, to));
        }
    }
    out
}

#[tokio::test(start_paused = true)]
async fn test_connect_derives_push_url_with_credential() {
    let connector = MockConnector::new();
    let manager = manager(&connector);

    manager.connect().unwrap();
    wait_for_state(&manager, Open).await;

    assert_eq!(
        connector.urls(),
        vec!["wss://casos.example.com/api/ws/notifications?token=tok".to_string()]
    );
    assert!(manager.is_connected());
    assert!(manager.heartbeat_running());
    assert_eq!(manager.connection_error(), None);
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_open_is_noop() {
    let connector = MockConnector::new();
    let manager = manager(&connector);

    manager.connect().unwrap();
    manager.connect().unwrap();
    wait_for_state(&manager, Open).await;
    manager.connect().unwrap();
    settle().await;

    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_without_credential_fails_without_attempt() {
    let connector = MockConnector::new();
    let manager = manager_with(&connector, SharedCredential::new(None));

    assert_eq!(manager.connect(), Err(ConnectionErrorKind::MissingCredential));
    settle().await;

    assert_eq!(manager.state(), Idle);
    assert_eq!(connector.attempts(), 0);
    assert_eq!(manager.connection_error(), Some(ConnectionErrorKind::MissingCredential));
}

#[tokio::test(start_paused = true)]
async fn test_connect_without_url_is_silent_noop() {
    let connector = MockConnector::new();
    let manager = ConnectionManager::with_connector(
        ConnectionOptions::default(),
        Arc::new(StaticCredential::new("tok")),
        Arc::clone(&connector) as _,
    );

    assert_eq!(manager.connect(), Ok(()));
    settle().await;
    assert_eq!(manager.state(), Idle);
    assert_eq!(connector.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_one_ping_after_thirty_five_seconds() {
    let connector = MockConnector::new();
    let manager = manager(&connector);

    manager.connect().unwrap();
    wait_for_state(&manager, Open).await;
    sleep(Duration::from_secs(35)).await;

    assert_eq!(connector.socket(0).pings(), 1);
    sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.socket(0).pings(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_no_pings_after_close() {
    let connector = MockConnector::new();
    let manager = manager(&connector);

    manager.connect().unwrap();
    wait_for_state(&manager, Open).await;
    manager.disconnect();
    wait_for_state(&manager, Closed).await;
    sleep(Duration::from_secs(120)).await;

    let socket = connector.socket(0);
    assert_eq!(socket.pings(), 0);
    assert!(!manager.heartbeat_running());
    assert_eq!(
        socket.sent().last(),
        Some(&Sent::Close(1000, "client disconnect".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_abnormal_close_reconnects_once_after_five_seconds() {
    let connector = MockConnector::new();
    let manager = manager(&connector);

    manager.connect().unwrap();
    wait_for_state(&manager, Open).await;
    connector.socket(0).drop_connection();
    wait_for_state(&manager, Closed).await;

    assert!(matches!(
        manager.connection_error(),
        Some(ConnectionErrorKind::ClosedUnexpectedly { code: 1006, .. })
    ));
    assert!(manager.reconnect_pending());
    assert!(!manager.heartbeat_running());

    sleep(Duration::from_millis(4900)).await;
    assert_eq!(connector.attempts(), 1);

    sleep(Duration::from_millis(200)).await;
    settle().await;
    assert_eq!(connector.attempts(), 2);
    wait_for_state(&manager, Open).await;
    assert_eq!(manager.connection_error(), None);
    assert_eq!(manager.reconnect_attempt().attempt_count, 0);

    // Only one reconnect was scheduled.
    sleep(Duration::from_secs(20)).await;
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_normal_close_from_server_is_not_retried() {
    let connector = MockConnector::new();
    let manager = manager(&connector);

    manager.connect().unwrap();
    wait_for_state(&manager, Open).await;
    connector.socket(0).push_close(1000, "bye");
    wait_for_state(&manager, Closed).await;

    assert!(!manager.reconnect_pending());
    sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_close_is_not_retried() {
    let connector = MockConnector::new();
    let manager = manager(&connector);

    manager.connect().unwrap();
    wait_for_state(&manager, Open).await;
    connector.socket(0).push_close(4001, "invalid token");
    wait_for_state(&manager, Closed).await;

    assert_eq!(manager.connection_error(), Some(ConnectionErrorKind::Unauthorized));
    assert!(!manager.reconnect_pending());
    sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_handshake_is_not_retried() {
    let connector = MockConnector::new();
    connector.script(Handshake::Reject(ConnectionErrorKind::Unauthorized));
    let manager = manager(&connector);

    manager.connect().unwrap();
    wait_for_state(&manager, Closed).await;

    assert_eq!(manager.connection_error(), Some(ConnectionErrorKind::Unauthorized));
    sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_handshake_is_retried() {
    let connector = MockConnector::new();
    connector.script(Handshake::Reject(ConnectionErrorKind::Transport(
        "connection refused".into(),
    )));
    let manager = manager(&connector);

    manager.connect().unwrap();
    wait_for_state(&manager, Closed).await;
    assert!(matches!(
        manager.connection_error(),
        Some(ConnectionErrorKind::Transport(_))
    ));

    sleep(Duration::from_secs(6)).await;
    wait_for_state(&manager, Open).await;
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cleared_credential_suppresses_reconnect() {
    let connector = MockConnector::new();
    let credential = SharedCredential::new(Some("tok".into()));
    let manager = manager_with(&connector, credential.clone());

    manager.connect().unwrap();
    wait_for_state(&manager, Open).await;
    credential.clear();
    connector.socket(0).drop_connection();
    wait_for_state(&manager, Closed).await;

    assert!(!manager.reconnect_pending());
    sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_credential_cleared_before_reconnect_fires() {
    let connector = MockConnector::new();
    let credential = SharedCredential::new(Some("tok".into()));
    let manager = manager_with(&connector, credential.clone());

    manager.connect().unwrap();
    wait_for_state(&manager, Open).await;
    connector.socket(0).drop_connection();
    wait_for_state(&manager, Closed).await;
    assert!(manager.reconnect_pending());

    credential.clear();
    sleep(Duration::from_secs(6)).await;
    settle().await;

    assert_eq!(connector.attempts(), 1);
    assert_eq!(manager.state(), Closed);
    assert_eq!(manager.connection_error(), Some(ConnectionErrorKind::MissingCredential));
}

#[tokio::test(start_paused = true)]
async fn test_explicit_connect_cancels_pending_reconnect() {
    let connector = MockConnector::new();
    let manager = manager(&connector);

    manager.connect().unwrap();
    wait_for_state(&manager, Open).await;
    connector.socket(0).drop_connection();
    wait_for_state(&manager, Closed).await;

    manager.connect().unwrap();
    wait_for_state(&manager, Open).await;
    assert!(!manager.reconnect_pending());

    sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_state_sequence_through_reconnect() {
    let connector = MockConnector::new();
    let manager = manager(&connector);
    let mut events = manager.subscribe_lifecycle();

    manager.connect().unwrap();
    wait_for_state(&manager, Open).await;
    connector.socket(0).drop_connection();
    wait_for_state(&manager, Closed).await;
    sleep(Duration::from_secs(5)).await;
    wait_for_state(&manager, Open).await;
    manager.disconnect();
    wait_for_state(&manager, Closed).await;

    assert_eq!(
        transitions(&mut events),
        vec![
            (Idle, Connecting),
            (Connecting, Open),
            (Open, Closing),
            (Closing, Closed),
            (Closed, Connecting),
            (Connecting, Open),
            (Open, Closing),
            (Closing, Closed),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_lifecycle_events_report_close_code() {
    let connector = MockConnector::new();
    let manager = manager(&connector);
    let mut events = manager.subscribe_lifecycle();

    manager.connect().unwrap();
    wait_for_state(&manager, Open).await;
    connector.socket(0).push_close(4001, "expired");
    wait_for_state(&manager, Closed).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if !matches!(event, LifecycleEvent::StateChanged { .. }) {
            seen.push(event);
        }
    }
    assert_eq!(
        seen,
        vec![
            LifecycleEvent::Connected,
            LifecycleEvent::Disconnected {
                code: 4001,
                reason: "expired".into()
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_close_during_handshake() {
    let connector = MockConnector::new();
    connector.script(Handshake::AcceptAfter(Duration::from_secs(2)));
    let manager = manager(&connector);

    let mut events = manager.subscribe_lifecycle();

    manager.connect().unwrap();
    settle().await;
    assert_eq!(manager.state(), Connecting);

    manager.disconnect();
    assert_eq!(manager.state(), Closed);
    assert_eq!(
        transitions(&mut events),
        vec![(Idle, Connecting), (Connecting, Closed)]
    );

    sleep(Duration::from_secs(10)).await;
    assert_eq!(manager.state(), Closed);
    assert!(!manager.reconnect_pending());
}

#[tokio::test(start_paused = true)]
async fn test_send_requires_open_channel() {
    let connector = MockConnector::new();
    let manager = manager(&connector);

    assert!(!manager.send(&OutboundFrame::MarkAllRead));

    manager.connect().unwrap();
    wait_for_state(&manager, Open).await;
    assert!(manager.send(&OutboundFrame::MarkNotificationRead {
        notification_id: EntityId::Num(7),
    }));
    assert!(manager.send_raw("subscribe", json!({"process_id": 3})));
    settle().await;

    let texts = connector.socket(0).sent_texts();
    assert_eq!(texts.len(), 2);
    let first: serde_json::Value = serde_json::from_str(&texts[0]).unwrap();
    assert_eq!(first, json!({"type": "mark_notification_read", "notification_id": 7}));
    let second: serde_json::Value = serde_json::from_str(&texts[1]).unwrap();
    assert_eq!(second, json!({"type": "subscribe", "process_id": 3}));

    manager.disconnect();
    assert!(!manager.send(&OutboundFrame::Ping));
}

#[tokio::test(start_paused = true)]
async fn test_inbound_frames_reach_handlers() {
    let connector = MockConnector::new();
    let manager = manager(&connector);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let _sub = {
        let seen = Arc::clone(&seen);
        manager.register(EventType::NewNotification, move |data, _| {
            seen.lock().unwrap().push(data["message"].as_str().unwrap_or_default().to_string());
            Ok(())
        })
    };
    let _failing = manager.register(EventType::NewNotification, |_, _| {
        anyhow::bail!("consumer broke")
    });

    manager.connect().unwrap();
    wait_for_state(&manager, Open).await;
    let socket = connector.socket(0);
    socket.push_text("not json");
    socket.push_text(r#"{"type":"future_event","data":{}}"#);
    socket.push_text(r#"{"type":"new_notification","data":{"message":"Prazo amanhã"}}"#);
    settle().await;

    assert_eq!(*seen.lock().unwrap(), vec!["Prazo amanhã".to_string()]);
    let last = manager.last_message().unwrap();
    assert_eq!(last.event_type, EventType::NewNotification);
    assert_eq!(manager.state(), Open);
}

#[tokio::test(start_paused = true)]
async fn test_server_ping_is_answered() {
    let connector = MockConnector::new();
    let manager = manager(&connector);

    manager.connect().unwrap();
    wait_for_state(&manager, Open).await;
    connector.socket(0).push_ping(b"hi");
    settle().await;

    assert_eq!(connector.socket(0).sent(), vec![Sent::Pong(b"hi".to_vec())]);
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_closes_abnormally() {
    let connector = MockConnector::new();
    let manager = manager(&connector);

    manager.connect().unwrap();
    wait_for_state(&manager, Open).await;
    let socket = connector.socket(0);
    socket.push_error("connection reset");
    wait_for_state(&manager, Closed).await;

    let error = manager.connection_error();
    assert!(
        matches!(&error, Some(ConnectionErrorKind::Transport(msg)) if msg.contains("connection reset")),
        "{error:?}"
    );
    assert!(manager.reconnect_pending());
    assert_eq!(manager.reconnect_attempt().last_error, error);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_clears_handlers() {
    let connector = MockConnector::new();
    let manager = manager(&connector);
    let sub = manager.register(EventType::Heartbeat, |_, _| Ok(()));
    sub.detach();
    assert_eq!(manager.dispatcher().handler_count(&EventType::Heartbeat), 1);

    manager.connect().unwrap();
    wait_for_state(&manager, Open).await;
    manager.teardown();
    wait_for_state(&manager, Closed).await;

    assert_eq!(manager.dispatcher().handler_count(&EventType::Heartbeat), 0);
    assert!(!manager.reconnect_pending());
}

#[tokio::test(start_paused = true)]
async fn test_instances_are_isolated() {
    let connector_a = MockConnector::new();
    let connector_b = MockConnector::new();
    let a = manager(&connector_a);
    let b = manager(&connector_b);

    a.connect().unwrap();
    wait_for_state(&a, Open).await;
    assert_eq!(b.state(), Idle);

    b.connect().unwrap();
    wait_for_state(&b, Open).await;
    a.disconnect();
    wait_for_state(&a, Closed).await;
    assert_eq!(b.state(), Open);
}
