// Operator API gate tests: a real axum server on an ephemeral port, driven
// with reqwest, sharing its database with an in-process delivery driver.

use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

use fleetq::api::{build_router, ApiState};
use fleetq::config::{Config, RetentionConfig};
use fleetq::db::{ApprovalStatus, MessageStatus, NewQueueMessage, QueueStore};
use fleetq::handlers::HandlerRegistry;
use fleetq::metrics::QueueMetrics;
use fleetq::processor::MessageProcessor;
use fleetq::transport::ConnectionManager;

// ── Helpers ──────────────────────────────────────────────────────

fn setup() -> (TempDir, Arc<QueueStore>) {
    let tmp = TempDir::new().unwrap();
    let store = QueueStore::open(&tmp.path().join("queue.db")).unwrap();
    store
        .create_host("h1", "web-01.example.com", ApprovalStatus::Approved)
        .unwrap();
    store
        .create_host("h2", "web-02.example.com", ApprovalStatus::Pending)
        .unwrap();
    (tmp, Arc::new(store))
}

/// Helper: start an in-process axum server on a random port.
async fn start_test_server(
    store: Arc<QueueStore>,
    metrics: QueueMetrics,
) -> (String, tokio::sync::watch::Sender<bool>) {
    let app = build_router(ApiState {
        store,
        metrics,
        retention: RetentionConfig::default(),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base_url = format!("http://127.0.0.1:{}", addr.port());

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            })
            .await
            .unwrap();
    });

    (base_url, shutdown_tx)
}

// ══════════════════════════════════════════════════════════════════
// Gate 1: Enqueue over HTTP, deliver, observe via stats and metrics
// ══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn gate1_enqueue_deliver_and_observe() -> Result<()> {
    let (_tmp, store) = setup();
    let metrics = QueueMetrics::new()?;
    let (base_url, _shutdown) = start_test_server(store.clone(), metrics.clone()).await;
    let client = reqwest::Client::new();

    let connections = Arc::new(ConnectionManager::new());
    let mut agent_rx = connections.register("h1", 8);
    let processor = MessageProcessor::new(
        store.clone(),
        Arc::new(HandlerRegistry::with_defaults()),
        connections,
        &Config::default(),
        metrics,
    );

    let resp = client
        .post(format!("{base_url}/api/queue/messages"))
        .json(&json!({
            "message_type": "command",
            "host_id": "h1",
            "priority": "urgent",
            "payload": {"cmd": "systemctl restart nginx"}
        }))
        .send()
        .await?;
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await?;
    let id = body["message_id"].as_str().unwrap().to_string();

    let stats: Value = client
        .get(format!("{base_url}/api/queue/stats?host_id=h1"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(stats["stats"]["pending"], 1);

    processor.run_cycle().await?;
    let delivered = agent_rx.recv().await.unwrap();
    assert_eq!(delivered["message_id"], id.as_str());

    let row: Value = client
        .get(format!("{base_url}/api/queue/messages/{id}"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(row["status"], "sent");
    assert_eq!(row["payload"]["cmd"], "systemctl restart nginx");

    let stats: Value = client
        .get(format!("{base_url}/api/queue/stats?direction=outbound"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(stats["stats"]["sent"], 1);
    assert_eq!(stats["stats"]["pending"], 0);

    let text = client
        .get(format!("{base_url}/metrics"))
        .send()
        .await?
        .text()
        .await?;
    assert!(text.contains(r#"fleetq_messages_processed_total{direction="outbound",outcome="sent"} 1"#));
    assert!(text.contains(r#"fleetq_queue_depth{status="sent"} 1"#));
    Ok(())
}

// ══════════════════════════════════════════════════════════════════
// Gate 2: Producer validation maps to HTTP status, writes nothing
// ══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn gate2_enqueue_validation() -> Result<()> {
    let (_tmp, store) = setup();
    let (base_url, _shutdown) = start_test_server(store.clone(), QueueMetrics::new()?).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base_url}/api/queue/messages"))
        .json(&json!({"message_type": "command", "host_id": "nope"}))
        .send()
        .await?;
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(format!("{base_url}/api/queue/messages"))
        .json(&json!({"message_type": "command", "host_id": "h1", "payload": [1, 2, 3]}))
        .send()
        .await?;
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("{base_url}/api/queue/messages"))
        .json(&json!({"message_type": "command", "host_id": "h1", "priority": "whenever"}))
        .send()
        .await?;
    assert!(resp.status().is_client_error());

    let resp = client
        .post(format!("{base_url}/api/queue/messages"))
        .json(&json!({"message_type": "command", "host_id": "h1", "message_id": "fixed"}))
        .send()
        .await?;
    assert_eq!(resp.status(), 201);
    let resp = client
        .post(format!("{base_url}/api/queue/messages"))
        .json(&json!({"message_type": "command", "host_id": "h1", "message_id": "fixed"}))
        .send()
        .await?;
    assert_eq!(resp.status(), 400);

    assert_eq!(store.get_queue_stats(None, None)?.total, 1);
    Ok(())
}

// ══════════════════════════════════════════════════════════════════
// Gate 3: Failed-message triage over HTTP
// ══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn gate3_failed_triage() -> Result<()> {
    let (_tmp, store) = setup();
    let (base_url, _shutdown) = start_test_server(store.clone(), QueueMetrics::new()?).await;
    let client = reqwest::Client::new();

    let mut ids = Vec::new();
    for i in 0..3 {
        let id = store.enqueue_message(
            &NewQueueMessage::outbound("command", json!({"n": i})).for_host("h1"),
        )?;
        assert!(store.mark_processing(&id)?);
        assert!(store.mark_failed(&id, Some("exit code 1"), false)?);
        ids.push(id);
    }

    let listed: Value = client
        .get(format!("{base_url}/api/queue/failed?limit=2"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(listed["count"], 2);
    assert_eq!(listed["messages"][0]["message_id"], ids[2].as_str());

    let deleted: Value = client
        .post(format!("{base_url}/api/queue/failed/delete"))
        .json(&json!({"ids": [ids[0], ids[1]]}))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(deleted["deleted"], 2);
    assert_eq!(store.get_queue_stats(None, None)?.count(MessageStatus::Failed), 1);

    let resp = client
        .get(format!("{base_url}/api/queue/messages/{}", ids[0]))
        .send()
        .await?;
    assert_eq!(resp.status(), 404);
    Ok(())
}

// ══════════════════════════════════════════════════════════════════
// Gate 4: Host purge and unknown endpoints
// ══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn gate4_host_purge_and_fallback() -> Result<()> {
    let (_tmp, store) = setup();
    let (base_url, _shutdown) = start_test_server(store.clone(), QueueMetrics::new()?).await;
    let client = reqwest::Client::new();

    for _ in 0..4 {
        store.enqueue_message(&NewQueueMessage::inbound("inventory", json!({})).for_host("h2"))?;
    }
    store.enqueue_message(&NewQueueMessage::inbound("inventory", json!({})).for_host("h1"))?;

    let body: Value = client
        .delete(format!("{base_url}/api/hosts/h2/messages"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["deleted"], 4);
    assert_eq!(store.get_queue_stats(None, None)?.total, 1);

    let resp = client.get(format!("{base_url}/api/nothing/here")).send().await?;
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await?;
    assert_eq!(body["error"], "Unknown API endpoint");

    let health: Value = client
        .get(format!("{base_url}/api/health"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(health["status"], "ok");
    Ok(())
}
