//! Drains the durable outbound queue to the broker.
//!
//! One task fetches unacked rows in insertion order, publishes each and
//! waits for the broker's confirm, then marks the batch in one bulk update.
//! Any failure stops the batch at that row so ordering is never violated.
//! The drain rate adapts to queue depth: a deep backlog after an outage is
//! trickled out instead of flooding the uplink.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{GatewayError, Result};
use store::{BacklogCounts, Store};

/// How long the drainer waits for one publish confirm before declaring the
/// batch failed.
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle poll interval when the queue is empty.
const IDLE_SLEEP: Duration = Duration::from_secs(1);

/// Completion handle for one publish: resolves when the broker acknowledges
/// the message (immediately for QoS 0).
pub struct PublishToken {
    rx: oneshot::Receiver<()>,
}

impl PublishToken {
    /// A token and the sender that resolves it.
    pub fn pending() -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { rx }, tx)
    }

    /// An already-confirmed token (QoS 0, or stubs in tests).
    pub fn resolved() -> Self {
        let (token, tx) = Self::pending();
        let _ = tx.send(());
        token
    }

    /// Wait for the broker's confirm, bounded by `timeout`.
    pub async fn wait(self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(GatewayError::broker_unavailable(
                "publish abandoned before confirm",
            )),
            Err(_) => Err(GatewayError::broker_unavailable("publish confirm timed out")),
        }
    }
}

/// The one broker capability the drainer needs. Taking a trait object here
/// instead of the whole client breaks the wiring cycle between the queue
/// and the broker.
#[async_trait]
pub trait PublishSink: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: &Value,
        qos: u8,
        retain: bool,
    ) -> Result<PublishToken>;
}

pub struct BacklogManager {
    store: Store,
    sink: Arc<dyn PublishSink>,
    batch_size: u32,
    max_rate: u32,
    adaptive_delay: Arc<StdMutex<Duration>>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BacklogManager {
    pub fn new(store: Store, sink: Arc<dyn PublishSink>, batch_size: u32, max_rate: u32) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let initial = delay_for_rate(max_rate, 0);
        Self {
            store,
            sink,
            batch_size,
            max_rate,
            adaptive_delay: Arc::new(StdMutex::new(initial)),
            stop_tx,
            task: Mutex::new(None),
        }
    }

    /// Append a payload to the durable queue; returns the queue row id.
    pub async fn enqueue(
        &self,
        topic: &str,
        payload: &Value,
        qos: u8,
        idempotency_key: Option<&str>,
    ) -> Result<i64> {
        let payload_json = serde_json::to_string(payload)
            .map_err(|err| GatewayError::invalid_payload(err.to_string()))?;
        let id = self
            .store
            .put_backlog(Utc::now(), topic, &payload_json, qos, idempotency_key)
            .await?;
        debug!("backlog enqueued id={} topic={}", id, topic);
        Ok(id)
    }

    /// Start the drain task. A no-op while one is already running.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let _ = self.stop_tx.send(false);
        let store = self.store.clone();
        let sink = Arc::clone(&self.sink);
        let batch_size = self.batch_size;
        let delay = Arc::clone(&self.adaptive_delay);
        let mut stop_rx = self.stop_tx.subscribe();
        info!("backlog drain started (batch {})", batch_size);
        *task = Some(tokio::spawn(async move {
            drain_loop(store, sink, batch_size, delay, &mut stop_rx).await;
        }));
    }

    /// Stop the drain task and wait for it to finish its current row.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(err) = task.await {
                warn!("backlog drain join failed: {}", err);
            }
        }
        info!("backlog drain stopped");
    }

    /// Queue counters for health and facades. Also where the adaptive rate
    /// reacts to queue pressure.
    pub async fn stats(&self) -> Result<BacklogCounts> {
        let counts = self.store.backlog_counts().await?;
        let delay = delay_for_rate(self.max_rate, counts.queued);
        *self.adaptive_delay.lock().expect("delay mutex poisoned") = delay;
        Ok(counts)
    }
}

/// Inter-publish delay for the current queue depth. Sustained pressure
/// slows the drain so the uplink and broker are not flooded after an
/// outage.
fn delay_for_rate(max_rate: u32, queued: u64) -> Duration {
    let rate = if queued > 100_000 {
        (max_rate / 5).max(1)
    } else if queued > 10_000 {
        (max_rate / 2).max(1)
    } else {
        max_rate.max(1)
    };
    Duration::from_secs_f64(1.0 / f64::from(rate)).max(Duration::from_millis(1))
}

async fn drain_loop(
    store: Store,
    sink: Arc<dyn PublishSink>,
    batch_size: u32,
    delay: Arc<StdMutex<Duration>>,
    stop_rx: &mut watch::Receiver<bool>,
) {
    while !*stop_rx.borrow() {
        let rows = match store.fetch_backlog(batch_size).await {
            Ok(rows) => rows,
            Err(err) => {
                // Store errors are retried on the next iteration.
                error!("backlog fetch failed: {}", err);
                if !sleep_or_stop(IDLE_SLEEP, stop_rx).await {
                    break;
                }
                continue;
            }
        };
        if rows.is_empty() {
            if !sleep_or_stop(IDLE_SLEEP, stop_rx).await {
                break;
            }
            continue;
        }

        let mut confirmed: Vec<i64> = Vec::with_capacity(rows.len());
        for row in rows {
            if *stop_rx.borrow() {
                break;
            }
            match publish_row(&sink, &row.topic, &row.payload_json, row.qos, stop_rx).await {
                Ok(()) => confirmed.push(row.id),
                Err(err) => {
                    // Stop at the first failure so drain order is preserved.
                    warn!("backlog publish failed id={}: {}", row.id, err);
                    break;
                }
            }
        }

        if !confirmed.is_empty() {
            debug!("backlog drained {} rows", confirmed.len());
            if let Err(err) = store.mark_sent(&confirmed, true).await {
                error!("backlog mark_sent failed: {}", err);
            }
        }

        let pause = *delay.lock().expect("delay mutex poisoned");
        if !sleep_or_stop(pause, stop_rx).await {
            break;
        }
    }
    debug!("backlog drain loop terminated");
}

async fn publish_row(
    sink: &Arc<dyn PublishSink>,
    topic: &str,
    payload_json: &str,
    qos: u8,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    let payload: Value = serde_json::from_str(payload_json)
        .map_err(|err| GatewayError::invalid_payload(err.to_string()))?;
    let token = tokio::select! {
        result = sink.publish(topic, &payload, qos, false) => result?,
        _ = wait_for_stop(stop_rx) => {
            return Err(GatewayError::broker_unavailable("drain stopping"));
        }
    };
    tokio::select! {
        result = token.wait(CONFIRM_TIMEOUT) => result,
        _ = wait_for_stop(stop_rx) => Err(GatewayError::broker_unavailable("drain stopping")),
    }
}

async fn wait_for_stop(stop_rx: &mut watch::Receiver<bool>) {
    while stop_rx.changed().await.is_ok() {
        if *stop_rx.borrow() {
            return;
        }
    }
    // Sender gone: treat as stop.
}

/// Sleep, waking early on the stop signal. Returns false when stopped.
async fn sleep_or_stop(period: Duration, stop_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => true,
        _ = wait_for_stop(stop_rx) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_delay_follows_queue_depth() {
        let max_rate = 500;
        assert_eq!(delay_for_rate(max_rate, 0), Duration::from_secs_f64(1.0 / 500.0));
        assert_eq!(delay_for_rate(max_rate, 10_001), Duration::from_secs_f64(1.0 / 250.0));
        assert_eq!(delay_for_rate(max_rate, 100_001), Duration::from_secs_f64(1.0 / 100.0));
    }

    #[test]
    fn adaptive_delay_is_clamped() {
        // Even absurd rates never drop below one millisecond.
        assert_eq!(delay_for_rate(1_000_000, 0), Duration::from_millis(1));
        // A tiny rate divides down to zero and must still drain.
        assert!(delay_for_rate(3, 200_000) <= Duration::from_secs(1));
    }
}
