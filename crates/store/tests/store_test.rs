//! Contract tests for the durable store: drain ordering, fold semantics,
//! and retention safety.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use store::{Store, StoreConfig};
use tempfile::TempDir;

async fn open_store(retention_days: u32) -> (TempDir, Store) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(StoreConfig {
        path: dir.path().join("edge.db"),
        retention_days,
    })
    .await
    .unwrap();
    (dir, store)
}

fn metrics(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect()
}

#[tokio::test]
async fn telemetry_folds_by_asset() {
    let (_dir, store) = open_store(7).await;
    let ts = Utc::now();
    store
        .store_telemetry(ts, "A-PP-01", &metrics(&[("t_c", 28.5), ("rh", 62.1)]), Some(-60))
        .await
        .unwrap();
    store
        .store_telemetry(
            ts + Duration::seconds(5),
            "A-PP-01",
            &metrics(&[("mq135_ppm", 120.0)]),
            Some(-58),
        )
        .await
        .unwrap();

    let latest = store.latest_telemetry(100).await.unwrap();
    assert_eq!(latest.len(), 1);
    let asset = &latest[0];
    assert_eq!(asset.asset_id, "A-PP-01");
    assert_eq!(asset.metrics["t_c"], 28.5);
    assert_eq!(asset.metrics["mq135_ppm"], 120.0);
    // The newest non-null rssi wins, and ts is the maximum seen.
    assert_eq!(asset.rssi_dbm, Some(-58));
    assert_eq!(asset.ts.timestamp(), (ts + Duration::seconds(5)).timestamp());
}

#[tokio::test]
async fn newest_metric_value_wins_in_fold() {
    let (_dir, store) = open_store(7).await;
    let ts = Utc::now();
    store
        .store_telemetry(ts, "A-PP-02", &metrics(&[("t_c", 20.0)]), None)
        .await
        .unwrap();
    store
        .store_telemetry(ts + Duration::seconds(30), "A-PP-02", &metrics(&[("t_c", 25.0)]), None)
        .await
        .unwrap();

    let latest = store.latest_telemetry(100).await.unwrap();
    assert_eq!(latest[0].metrics["t_c"], 25.0);
}

#[tokio::test]
async fn backlog_round_trip_preserves_insertion_order() {
    let (_dir, store) = open_store(7).await;
    let ts = Utc::now();
    let mut ids = Vec::new();
    for i in 0..3 {
        let id = store
            .put_backlog(
                ts + Duration::seconds(i),
                "v1/farm/KIN-GOLIATH/esp32gw-01/telemetry/env",
                "{}",
                1,
                Some(&format!("key-{}", i)),
            )
            .await
            .unwrap();
        ids.push(id);
    }

    let counts = store.backlog_counts().await.unwrap();
    assert_eq!(counts.queued, 3);
    assert_eq!(counts.inflight, 0);
    assert!(counts.oldest_ts.is_some());

    // Fetch order equals ascending id equals insertion order.
    let rows = store.fetch_backlog(500).await.unwrap();
    let fetched: Vec<i64> = rows.iter().map(|r| r.id).collect();
    assert_eq!(fetched, ids);

    store.mark_sent(&ids, true).await.unwrap();
    let purged = store.purge_backlog().await.unwrap();
    assert_eq!(purged, 3);
    assert_eq!(store.backlog_counts().await.unwrap().queued, 0);
}

#[tokio::test]
async fn mark_sent_without_ack_counts_as_inflight() {
    let (_dir, store) = open_store(7).await;
    let id = store
        .put_backlog(Utc::now(), "t", "{}", 1, None)
        .await
        .unwrap();
    store.mark_sent(&[id], false).await.unwrap();

    let counts = store.backlog_counts().await.unwrap();
    assert_eq!(counts.queued, 1, "unacked rows stay queued");
    assert_eq!(counts.inflight, 1);

    // Purge only removes confirmed rows.
    assert_eq!(store.purge_backlog().await.unwrap(), 0);
}

#[tokio::test]
async fn retention_purge_never_drops_unacked_rows() {
    let (_dir, store) = open_store(28).await;
    let old = Utc::now() - Duration::days(60);
    let unacked = store.put_backlog(old, "t", "{}", 1, None).await.unwrap();
    let acked = store.put_backlog(old, "t", "{}", 1, None).await.unwrap();
    store.mark_sent(&[acked], true).await.unwrap();

    store.purge_retention().await.unwrap();

    let rows = store.fetch_backlog(10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, unacked);
}

#[tokio::test]
async fn retention_purge_ages_out_history_tables() {
    let (_dir, store) = open_store(28).await;
    let old = Utc::now() - Duration::days(60);
    store
        .store_telemetry(old, "A-PP-01", &metrics(&[("t_c", 1.0)]), None)
        .await
        .unwrap();
    store
        .store_telemetry(Utc::now(), "A-PP-01", &metrics(&[("t_c", 2.0)]), None)
        .await
        .unwrap();
    store
        .store_ack(old, "A-PP-01", "c-old", true, None)
        .await
        .unwrap();
    store
        .store_event(old, "A-PP-01", "boot", "{}")
        .await
        .unwrap();

    store.purge_retention().await.unwrap();

    let latest = store.latest_telemetry(100).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].metrics["t_c"], 2.0);
    assert!(store.recent_acks(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn acks_are_recorded_and_listed_newest_first() {
    let (_dir, store) = open_store(7).await;
    let ts = Utc::now();
    store
        .store_ack(ts, "A-PP-01", "c1", true, Some("applied"))
        .await
        .unwrap();
    store
        .store_ack(ts + Duration::seconds(1), "A-PP-01", "c2", false, Some("timeout"))
        .await
        .unwrap();

    let acks = store.recent_acks(10).await.unwrap();
    assert_eq!(acks.len(), 2);
    assert_eq!(acks[0].correlation_id, "c2");
    assert!(!acks[0].ok);
    assert_eq!(acks[1].correlation_id, "c1");
    assert!(acks[1].ok);
}

#[tokio::test]
async fn backlog_entries_expose_flags() {
    let (_dir, store) = open_store(7).await;
    let id = store
        .put_backlog(Utc::now(), "topic/a", "{\"n\":1}", 1, Some("idem-1"))
        .await
        .unwrap();
    store.mark_sent(&[id], false).await.unwrap();

    let entries = store.backlog_entries(50).await.unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.id, id);
    assert!(entry.sent);
    assert!(!entry.acked);
    assert_eq!(entry.idempotency_key.as_deref(), Some("idem-1"));
}
