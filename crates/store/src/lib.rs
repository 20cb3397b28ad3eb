//! Durable SQLite store for the gateway: outbound backlog, telemetry,
//! acknowledgements, and events.
//!
//! The store is a contention point by design: one connection behind one
//! mutex serialises all SQL, and every query runs on the blocking pool so it
//! never stalls the async runtime. Timestamps are stored as millisecond
//! precision RFC 3339 UTC strings and compared after parsing, never as raw
//! strings.

pub mod error;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{debug, info, warn};

pub use error::{Result, StoreError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS queue_out (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts TEXT NOT NULL,
    topic TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    qos INTEGER NOT NULL DEFAULT 1,
    sent INTEGER NOT NULL DEFAULT 0,
    acked INTEGER NOT NULL DEFAULT 0,
    idempotency_key TEXT
);
CREATE INDEX IF NOT EXISTS idx_queue_drain ON queue_out(acked, id);

CREATE TABLE IF NOT EXISTS telemetry (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts TEXT NOT NULL,
    asset_id TEXT NOT NULL,
    metric TEXT NOT NULL,
    value REAL,
    quality TEXT DEFAULT 'good',
    rssi_dbm INTEGER
);
CREATE INDEX IF NOT EXISTS idx_telemetry_ts ON telemetry(ts);
CREATE INDEX IF NOT EXISTS idx_telemetry_asset ON telemetry(asset_id);

CREATE TABLE IF NOT EXISTS ack (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts TEXT NOT NULL,
    asset_id TEXT NOT NULL,
    correlation_id TEXT NOT NULL,
    ok INTEGER NOT NULL,
    message TEXT
);
CREATE INDEX IF NOT EXISTS idx_ack_corr ON ack(correlation_id);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts TEXT NOT NULL,
    asset_id TEXT NOT NULL,
    type TEXT NOT NULL,
    payload_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts);
";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub retention_days: u32,
}

/// One row of the drain scan.
#[derive(Debug, Clone)]
pub struct BacklogRow {
    pub id: i64,
    pub topic: String,
    pub payload_json: String,
    pub qos: u8,
}

/// Full backlog row as shown by the buffer facade.
#[derive(Debug, Clone, Serialize)]
pub struct BacklogEntry {
    pub id: i64,
    pub ts: String,
    pub topic: String,
    pub payload_json: String,
    pub qos: u8,
    pub sent: bool,
    pub acked: bool,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BacklogCounts {
    pub queued: u64,
    pub inflight: u64,
    pub oldest_ts: Option<String>,
}

/// Latest telemetry folded per asset.
#[derive(Debug, Clone, Serialize)]
pub struct AssetTelemetry {
    pub asset_id: String,
    pub ts: DateTime<Utc>,
    pub metrics: BTreeMap<String, f64>,
    pub quality: BTreeMap<String, String>,
    pub rssi_dbm: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AckRecord {
    pub ts: String,
    pub asset_id: String,
    pub correlation_id: String,
    pub ok: bool,
    pub message: Option<String>,
}

/// Handle to the embedded store. Cheap to clone; all clones share the
/// single serialised connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    retention_days: u32,
}

impl Store {
    /// Open (creating if needed) the database and apply the schema.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let retention_days = config.retention_days;
        let path = config.path.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&path)?;
            conn.pragma_update(None, "journal_mode", "wal")?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await??;
        info!("sqlite store opened at {}", config.path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retention_days,
        })
    }

    /// Flush the WAL before shutdown. Dropping the last handle closes the
    /// connection itself.
    pub async fn close(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            Ok(())
        })
        .await?;
        info!("sqlite store closed");
        Ok(())
    }

    /// Append a payload to the outbound queue; returns the new row id.
    pub async fn put_backlog(
        &self,
        ts: DateTime<Utc>,
        topic: &str,
        payload_json: &str,
        qos: u8,
        idempotency_key: Option<&str>,
    ) -> Result<i64> {
        let ts = fmt_ts(&ts);
        let topic = topic.to_string();
        let payload_json = payload_json.to_string();
        let idempotency_key = idempotency_key.map(str::to_string);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO queue_out (ts, topic, payload_json, qos, idempotency_key)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![ts, topic, payload_json, qos, idempotency_key],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Unacked rows in ascending id order, at most `limit`.
    pub async fn fetch_backlog(&self, limit: u32) -> Result<Vec<BacklogRow>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, topic, payload_json, qos FROM queue_out
                 WHERE acked = 0 ORDER BY id ASC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], |row| {
                    Ok(BacklogRow {
                        id: row.get(0)?,
                        topic: row.get(1)?,
                        payload_json: row.get(2)?,
                        qos: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Bulk-update the drain flags for a batch of queue rows.
    pub async fn mark_sent(&self, ids: &[i64], acked: bool) -> Result<()> {
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt =
                    tx.prepare("UPDATE queue_out SET sent = 1, acked = ?1 WHERE id = ?2")?;
                for id in &ids {
                    stmt.execute(params![acked, id])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Delete every confirmed row. Returns the number deleted.
    pub async fn purge_backlog(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM queue_out WHERE acked = 1", [])?;
            Ok(deleted as u64)
        })
        .await
    }

    pub async fn backlog_counts(&self) -> Result<BacklogCounts> {
        self.with_conn(|conn| {
            let queued: u64 =
                conn.query_row("SELECT COUNT(*) FROM queue_out WHERE acked = 0", [], |r| {
                    r.get(0)
                })?;
            let inflight: u64 = conn.query_row(
                "SELECT COUNT(*) FROM queue_out WHERE sent = 1 AND acked = 0",
                [],
                |r| r.get(0),
            )?;
            let oldest_ts: Option<String> =
                conn.query_row("SELECT MIN(ts) FROM queue_out WHERE acked = 0", [], |r| {
                    r.get(0)
                })?;
            Ok(BacklogCounts {
                queued,
                inflight,
                oldest_ts,
            })
        })
        .await
    }

    /// Head of the unacked queue with full columns, for the buffer facade.
    pub async fn backlog_entries(&self, limit: u32) -> Result<Vec<BacklogEntry>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, ts, topic, payload_json, qos, sent, acked, idempotency_key
                 FROM queue_out WHERE acked = 0 ORDER BY id ASC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], |row| {
                    Ok(BacklogEntry {
                        id: row.get(0)?,
                        ts: row.get(1)?,
                        topic: row.get(2)?,
                        payload_json: row.get(3)?,
                        qos: row.get(4)?,
                        sent: row.get(5)?,
                        acked: row.get(6)?,
                        idempotency_key: row.get(7)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Age out telemetry, acks and events past the retention window.
    ///
    /// Queue rows are only deleted once confirmed: an unacked row survives
    /// any retention pass regardless of age.
    pub async fn purge_retention(&self) -> Result<()> {
        let cutoff = fmt_ts(&(Utc::now() - Duration::days(i64::from(self.retention_days))));
        self.with_conn(move |conn| {
            let mut deleted = 0usize;
            deleted += conn.execute("DELETE FROM telemetry WHERE ts < ?1", params![cutoff])?;
            deleted += conn.execute("DELETE FROM ack WHERE ts < ?1", params![cutoff])?;
            deleted += conn.execute("DELETE FROM events WHERE ts < ?1", params![cutoff])?;
            deleted += conn.execute(
                "DELETE FROM queue_out WHERE ts < ?1 AND acked = 1",
                params![cutoff],
            )?;
            debug!("retention purge removed {} rows (cutoff {})", deleted, cutoff);
            Ok(())
        })
        .await
    }

    /// Wide-to-tall telemetry insert: one row per non-null metric.
    pub async fn store_telemetry(
        &self,
        ts: DateTime<Utc>,
        asset_id: &str,
        metrics: &BTreeMap<String, f64>,
        rssi_dbm: Option<i32>,
    ) -> Result<()> {
        if metrics.is_empty() {
            return Ok(());
        }
        let ts = fmt_ts(&ts);
        let asset_id = asset_id.to_string();
        let metrics = metrics.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO telemetry (ts, asset_id, metric, value, quality, rssi_dbm)
                     VALUES (?1, ?2, ?3, ?4, 'good', ?5)",
                )?;
                for (metric, value) in &metrics {
                    stmt.execute(params![ts, asset_id, metric, value, rssi_dbm])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn store_ack(
        &self,
        ts: DateTime<Utc>,
        asset_id: &str,
        correlation_id: &str,
        ok: bool,
        message: Option<&str>,
    ) -> Result<()> {
        let ts = fmt_ts(&ts);
        let asset_id = asset_id.to_string();
        let correlation_id = correlation_id.to_string();
        let message = message.map(str::to_string);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO ack (ts, asset_id, correlation_id, ok, message)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![ts, asset_id, correlation_id, ok, message],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn store_event(
        &self,
        ts: DateTime<Utc>,
        asset_id: &str,
        event_type: &str,
        payload_json: &str,
    ) -> Result<()> {
        let ts = fmt_ts(&ts);
        let asset_id = asset_id.to_string();
        let event_type = event_type.to_string();
        let payload_json = payload_json.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO events (ts, asset_id, type, payload_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![ts, asset_id, event_type, payload_json],
            )?;
            Ok(())
        })
        .await
    }

    /// Most recent telemetry rows folded by asset: newest value per metric,
    /// the asset's `ts` is the maximum seen, `rssi_dbm` the newest non-null.
    pub async fn latest_telemetry(&self, limit: u32) -> Result<Vec<AssetTelemetry>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT ts, asset_id, metric, value, quality, rssi_dbm FROM telemetry
                 ORDER BY datetime(ts) DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<f64>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<i32>>(5)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut merged: BTreeMap<String, AssetTelemetry> = BTreeMap::new();
            // Rows arrive newest first, so the first value seen per metric wins.
            for (ts, asset_id, metric, value, quality, rssi) in rows {
                let ts = match parse_ts(&ts) {
                    Ok(ts) => ts,
                    Err(err) => {
                        warn!("skipping telemetry row with bad timestamp: {}", err);
                        continue;
                    }
                };
                let asset = merged
                    .entry(asset_id.clone())
                    .or_insert_with(|| AssetTelemetry {
                        asset_id,
                        ts,
                        metrics: BTreeMap::new(),
                        quality: BTreeMap::new(),
                        rssi_dbm: None,
                    });
                if asset.ts < ts {
                    asset.ts = ts;
                }
                if let Some(value) = value {
                    asset.metrics.entry(metric.clone()).or_insert(value);
                }
                asset
                    .quality
                    .entry(metric)
                    .or_insert_with(|| quality.unwrap_or_else(|| "good".to_string()));
                if asset.rssi_dbm.is_none() {
                    asset.rssi_dbm = rssi;
                }
            }
            Ok(merged.into_values().collect())
        })
        .await
    }

    pub async fn recent_acks(&self, limit: u32) -> Result<Vec<AckRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT ts, asset_id, correlation_id, ok, message FROM ack
                 ORDER BY datetime(ts) DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], |row| {
                    Ok(AckRecord {
                        ts: row.get(0)?,
                        asset_id: row.get(1)?,
                        correlation_id: row.get(2)?,
                        ok: row.get(3)?,
                        message: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Run `f` with the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().expect("store mutex poisoned");
            f(&mut guard)
        })
        .await?
    }
}

/// Millisecond precision keeps stored timestamps uniform and SQLite's
/// `datetime()` able to parse them.
fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreError::invalid_value(format!("{}: {}", raw, err)))
}
