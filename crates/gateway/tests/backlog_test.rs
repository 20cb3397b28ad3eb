//! Drain behaviour against a controllable broker stub: outage buffering,
//! in-order recovery, and restart durability.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use gateway::backlog::{BacklogManager, PublishSink, PublishToken};
use gateway::error::GatewayError;
use serde_json::{json, Value};
use store::{Store, StoreConfig};
use tempfile::TempDir;

struct StubBroker {
    connected: AtomicBool,
    published: Mutex<Vec<(String, Value)>>,
}

impl StubBroker {
    fn new(connected: bool) -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(connected),
            published: Mutex::new(Vec::new()),
        })
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl PublishSink for StubBroker {
    async fn publish(
        &self,
        topic: &str,
        payload: &Value,
        _qos: u8,
        _retain: bool,
    ) -> gateway::Result<PublishToken> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(GatewayError::broker_unavailable("stub not connected"));
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.clone()));
        Ok(PublishToken::resolved())
    }
}

async fn open_store() -> (TempDir, Store) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(StoreConfig {
        path: dir.path().join("edge.db"),
        retention_days: 7,
    })
    .await
    .unwrap();
    (dir, store)
}

async fn wait_until<F: Fn() -> bool>(deadline: Duration, check: F) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn outage_buffers_then_drains_in_order() {
    let (_dir, store) = open_store().await;
    let broker = StubBroker::new(false);
    let manager = BacklogManager::new(store.clone(), broker.clone(), 10, 200);

    for i in 0..3 {
        let payload = json!({"status": "ok", "seq": i, "ts": Utc::now().to_rfc3339()});
        manager
            .enqueue("v1/farm/T/gw/status", &payload, 1, None)
            .await
            .unwrap();
    }
    manager.start().await;

    // While the broker is down nothing drains.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.backlog_counts().await.unwrap().queued, 3);
    assert!(broker.published().is_empty());

    // Recovery: all three go out promptly, in insertion order.
    broker.set_connected(true);
    let drained = wait_until(Duration::from_secs(2), || broker.published().len() == 3).await;
    assert!(drained, "expected 3 publishes after recovery");
    let seqs: Vec<i64> = broker
        .published()
        .iter()
        .map(|(_, payload)| payload["seq"].as_i64().unwrap())
        .collect();
    assert_eq!(seqs, vec![0, 1, 2]);

    let mut queued = u64::MAX;
    for _ in 0..100 {
        queued = store.backlog_counts().await.unwrap().queued;
        if queued == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(queued, 0, "queued should reach 0 after confirms");

    manager.stop().await;
}

#[tokio::test]
async fn stop_is_prompt_even_while_broker_is_down() {
    let (_dir, store) = open_store().await;
    let broker = StubBroker::new(false);
    let manager = BacklogManager::new(store.clone(), broker.clone(), 10, 100);
    manager
        .enqueue("t", &json!({"n": 1}), 1, None)
        .await
        .unwrap();
    manager.start().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(3), manager.stop())
        .await
        .expect("stop must not hang on a dead broker");
    assert_eq!(store.backlog_counts().await.unwrap().queued, 1);
}

#[tokio::test]
async fn unacked_rows_survive_restart_and_drain_later() {
    let (_dir, store) = open_store().await;

    // First run: broker down the whole time.
    {
        let broker = StubBroker::new(false);
        let manager = BacklogManager::new(store.clone(), broker.clone(), 10, 100);
        for i in 0..2 {
            manager
                .enqueue("t/restart", &json!({"seq": i}), 1, Some("idem"))
                .await
                .unwrap();
        }
        manager.start().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        manager.stop().await;
    }
    assert_eq!(store.backlog_counts().await.unwrap().queued, 2);

    // Second run over the same store: everything drains.
    let broker = StubBroker::new(true);
    let manager = BacklogManager::new(store.clone(), broker.clone(), 10, 100);
    manager.start().await;
    let drained = wait_until(Duration::from_secs(2), || broker.published().len() == 2).await;
    assert!(drained, "restart must drain rows enqueued before it");
    manager.stop().await;
}

#[tokio::test]
async fn start_is_idempotent() {
    let (_dir, store) = open_store().await;
    let broker = StubBroker::new(true);
    let manager = BacklogManager::new(store.clone(), broker.clone(), 10, 100);
    manager.start().await;
    manager.start().await; // second start is a no-op

    manager
        .enqueue("t/idem", &json!({"n": 1}), 1, None)
        .await
        .unwrap();
    let drained = wait_until(Duration::from_secs(2), || !broker.published().is_empty()).await;
    assert!(drained);
    // A duplicate drain task would have published twice.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.published().len(), 1);
    manager.stop().await;
}
