//! Channel lifecycle tests against a real local WebSocket server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use flowdeck_sync::store::WorkflowEdge;
use flowdeck_sync::{
    ConnectionState, ControlPlaneClient, EventStreamClient, NodeStatus, RunMode, SyncConfig,
    WorkflowNode, WorkflowStateStore,
};

fn frame(event_type: &str, node_id: Option<&str>, timestamp: &str, extra: &str) -> String {
    let node_part = node_id
        .map(|id| format!("\\\"node_id\\\":\\\"{id}\\\","))
        .unwrap_or_default();
    format!(
        "{{\"event_type\":\"{event_type}\",\"data\":\"{{{node_part}\\\"execution_id\\\":\\\"exec-1\\\",\\\"workflow_id\\\":\\\"wf-1\\\"{extra}}}\",\"timestamp\":\"{timestamp}\"}}"
    )
}

fn test_config(ws_addr: std::net::SocketAddr, server_url: &str) -> SyncConfig {
    SyncConfig {
        server_url: server_url.to_string(),
        ws_url: format!("ws://{ws_addr}"),
        reconnect_base: Duration::from_millis(20),
        reconnect_cap: Duration::from_millis(80),
        max_reconnect_attempts: 2,
        dedup_capacity: 256,
        request_timeout: Duration::from_secs(2),
        ..SyncConfig::default()
    }
}

async fn seeded_store() -> WorkflowStateStore {
    let store = WorkflowStateStore::new(256);
    store
        .set_definition(
            "wf-1",
            vec![
                WorkflowNode::new("n1", "Fetch", "action"),
                WorkflowNode::new("n2", "Review", "approval"),
            ],
            vec![WorkflowEdge {
                id: "e1".to_string(),
                source: "n1".to_string(),
                target: "n2".to_string(),
            }],
        )
        .await;
    store.begin_run("exec-1").await;
    store
}

async fn wait_for_mode(store: &WorkflowStateStore, mode: RunMode) {
    let mut rx = store.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if store.mode().await == mode {
                return;
            }
            rx.changed().await.expect("store dropped");
        }
    })
    .await
    .expect("timed out waiting for run mode");
}

async fn wait_for_state(client: &EventStreamClient, state: ConnectionState) {
    let mut rx = client.subscribe_connection();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *rx.borrow_and_update() == state {
                return;
            }
            rx.changed().await.expect("client dropped");
        }
    })
    .await
    .expect("timed out waiting for connection state");
}

#[tokio::test]
async fn end_to_end_run_reaches_completed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let frames = [
            frame("node.started", Some("n1"), "100", ""),
            // Duplicate delivery of the same logical event.
            frame("node.started", Some("n1"), "100", ""),
            frame(
                "node.completed",
                Some("n1"),
                "105",
                ",\\\"result\\\":{\\\"ok\\\":true}",
            ),
            frame(
                "workflow.completed",
                None,
                "106",
                ",\\\"result\\\":{\\\"rows\\\":42}",
            ),
        ];
        for f in frames {
            ws.send(Message::Text(f)).await.unwrap();
        }

        // Drain until the client finishes the close handshake.
        while let Some(msg) = ws.next().await {
            if msg.is_err() {
                break;
            }
        }
    });

    let store = seeded_store().await;
    let config = test_config(addr, "http://127.0.0.1:1");
    let api = ControlPlaneClient::new(&config.server_url, config.request_timeout);
    let client = EventStreamClient::new(config, store.clone(), api);

    client.connect("exec-1").await;
    wait_for_mode(&store, RunMode::Completed).await;

    // The duplicate frame left no trace.
    assert_eq!(store.events_len().await, 3);
    assert_eq!(store.node_status("n1").await, Some(NodeStatus::Completed));

    let output = store.snapshot().await.output.unwrap();
    assert_eq!(output.result, serde_json::json!({"rows": 42}));

    // A run-terminal event tears the channel down normally.
    wait_for_state(&client, ConnectionState::Disconnected).await;
    assert!(!store.connected().await);

    client.disconnect().await;
    server.await.unwrap();
}

#[tokio::test]
async fn frames_for_another_run_leave_no_trace() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        // A frame tagged with a different run id.
        let stale = "{\"event_type\":\"node.started\",\"data\":\"{\\\"node_id\\\":\\\"n1\\\",\\\"execution_id\\\":\\\"exec-old\\\",\\\"workflow_id\\\":\\\"wf-1\\\"}\",\"timestamp\":\"90\"}";
        ws.send(Message::Text(stale.to_string())).await.unwrap();
        ws.send(Message::Text(frame("node.started", Some("n1"), "100", "")))
            .await
            .unwrap();
        ws.send(Message::Text(frame(
            "workflow.failed",
            None,
            "101",
            ",\\\"error\\\":\\\"agent quota exhausted\\\"",
        )))
        .await
        .unwrap();

        while let Some(msg) = ws.next().await {
            if msg.is_err() {
                break;
            }
        }
    });

    let store = seeded_store().await;
    let config = test_config(addr, "http://127.0.0.1:1");
    let api = ControlPlaneClient::new(&config.server_url, config.request_timeout);
    let client = EventStreamClient::new(config, store.clone(), api);

    client.connect("exec-1").await;
    wait_for_mode(&store, RunMode::Failed).await;

    let snapshot = store.snapshot().await;
    assert_eq!(snapshot.events.len(), 2);
    assert!(snapshot.events.iter().all(|e| e.execution_id == "exec-1"));
    assert_eq!(
        snapshot.output.unwrap().result,
        serde_json::json!("agent quota exhausted")
    );

    client.disconnect().await;
    server.await.unwrap();
}

#[tokio::test]
async fn reconnects_then_gives_up_after_budget() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));

    let server_accepts = accepts.clone();
    let server = tokio::spawn(async move {
        // Initial connection plus two retries, each dropped without a close
        // handshake.
        for _ in 0..3 {
            let (stream, _) = listener.accept().await.unwrap();
            server_accepts.fetch_add(1, Ordering::SeqCst);
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            drop(ws);
        }
    });

    let store = seeded_store().await;
    let config = test_config(addr, "http://127.0.0.1:1");
    let api = ControlPlaneClient::new(&config.server_url, config.request_timeout);
    let client = EventStreamClient::new(config, store.clone(), api);

    client.connect("exec-1").await;
    wait_for_state(&client, ConnectionState::Disconnected).await;
    server.await.unwrap();

    assert_eq!(accepts.load(Ordering::SeqCst), 3);
    assert!(!store.connected().await);
    // The run never finished; only the connection gave up.
    assert_eq!(store.mode().await, RunMode::Executing);

    client.disconnect().await;
}

#[tokio::test]
async fn peer_normal_close_does_not_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));

    let server_accepts = accepts.clone();
    let server = tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            server_accepts.fetch_add(1, Ordering::SeqCst);
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "server teardown".into(),
            }))
            .await
            .unwrap();
            while let Some(msg) = ws.next().await {
                if msg.is_err() {
                    break;
                }
            }
        }
    });

    let store = seeded_store().await;
    let config = test_config(addr, "http://127.0.0.1:1");
    let api = ControlPlaneClient::new(&config.server_url, config.request_timeout);
    let client = EventStreamClient::new(config, store.clone(), api);

    client.connect("exec-1").await;
    wait_for_state(&client, ConnectionState::Disconnected).await;

    // Give any (incorrect) reconnect attempt time to land.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(accepts.load(Ordering::SeqCst), 1);

    client.disconnect().await;
    server.abort();
}

#[tokio::test]
async fn reconnect_replays_missed_events() {
    // Mock control plane serving the replay endpoint with one overlapping
    // and one missed event.
    let replay = serde_json::json!({
        "execution_id": "exec-1",
        "events": [
            {
                "id": "100000-0",
                "timestamp": 100.0,
                "event_type": "node.started",
                "data": {"execution_id": "exec-1", "workflow_id": "wf-1", "node_id": "n1"}
            },
            {
                "id": "105000-0",
                "timestamp": 105.0,
                "event_type": "node.completed",
                "data": {"execution_id": "exec-1", "workflow_id": "wf-1", "node_id": "n1",
                         "result": {"ok": true}}
            }
        ],
        "count": 2
    });
    let app = axum::Router::new().route(
        "/events/replay/execution/{id}",
        axum::routing::get(move || {
            let replay = replay.clone();
            async move { axum::Json(replay) }
        }),
    );
    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = http_listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(http_listener, app).await.unwrap();
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        // First connection: one frame, then an abrupt drop.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::Text(frame("node.started", Some("n1"), "100", "")))
            .await
            .unwrap();
        drop(ws);

        // Second connection: the tail of the run, overlapping the replay.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::Text(frame(
            "node.completed",
            Some("n1"),
            "105",
            ",\\\"result\\\":{\\\"ok\\\":true}",
        )))
        .await
        .unwrap();
        ws.send(Message::Text(frame(
            "workflow.completed",
            None,
            "106",
            ",\\\"result\\\":{\\\"ok\\\":true}",
        )))
        .await
        .unwrap();
        while let Some(msg) = ws.next().await {
            if msg.is_err() {
                break;
            }
        }
    });

    let store = seeded_store().await;
    let config = test_config(addr, &format!("http://{http_addr}"));
    let api = ControlPlaneClient::new(&config.server_url, config.request_timeout);
    let client = EventStreamClient::new(config, store.clone(), api);

    client.connect("exec-1").await;
    wait_for_mode(&store, RunMode::Completed).await;

    // started (live) + completed (replay or live, deduped) + terminal.
    assert_eq!(store.events_len().await, 3);
    assert_eq!(store.node_status("n1").await, Some(NodeStatus::Completed));

    client.disconnect().await;
    server.await.unwrap();
}

#[tokio::test]
async fn connect_is_reentrant_and_switching_closes_previous() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));

    let server_accepts = accepts.clone();
    let server = tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            server_accepts.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                while let Some(msg) = ws.next().await {
                    if msg.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let store = seeded_store().await;
    let config = test_config(addr, "http://127.0.0.1:1");
    let api = ControlPlaneClient::new(&config.server_url, config.request_timeout);
    let client = EventStreamClient::new(config, store.clone(), api);

    client.connect("exec-1").await;
    wait_for_state(&client, ConnectionState::Connected).await;

    // Same id: no second connection.
    client.connect("exec-1").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
    assert_eq!(client.current_execution().await.as_deref(), Some("exec-1"));

    // Different id: close-then-reopen.
    store.begin_run("exec-2").await;
    client.connect("exec-2").await;
    wait_for_state(&client, ConnectionState::Connected).await;
    assert_eq!(accepts.load(Ordering::SeqCst), 2);
    assert_eq!(client.current_execution().await.as_deref(), Some("exec-2"));

    client.disconnect().await;
    assert_eq!(client.current_execution().await, None);
    server.abort();
}
