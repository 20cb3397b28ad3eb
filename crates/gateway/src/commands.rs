//! Downstream command dispatch with correlated acknowledgements.
//!
//! Every in-flight command holds an entry in the pending table keyed by its
//! correlation id. Retries re-send the identical frame under the same id,
//! so a late ack to the original attempt and an ack to a retry are
//! indistinguishable and the first to arrive wins.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use frame::{command_frame, AckPayload, CommandPayload, Timestamp};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use store::Store;

/// The one serial capability the command manager needs.
#[async_trait]
pub trait CommandLink: Send + Sync {
    async fn send_frame(&self, payload: &Value) -> Result<()>;
}

#[async_trait]
impl CommandLink for crate::serial::SerialBridge {
    async fn send_frame(&self, payload: &Value) -> Result<()> {
        self.send(payload).await
    }
}

pub struct CommandManager {
    link: Arc<dyn CommandLink>,
    store: Store,
    timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
    pending: Mutex<HashMap<String, oneshot::Sender<AckPayload>>>,
}

impl CommandManager {
    pub fn new(
        link: Arc<dyn CommandLink>,
        store: Store,
        timeout: Duration,
        max_retries: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            link,
            store,
            timeout,
            max_retries,
            retry_backoff,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Send a command frame and wait for the matching ack.
    ///
    /// A missing correlation id is generated; a correlation id already in
    /// the pending table is rejected synchronously, before anything is
    /// written to the serial link. Total wall time is bounded by
    /// `(max_retries + 1) * timeout + max_retries * backoff`.
    pub async fn send(&self, mut command: CommandPayload) -> Result<AckPayload> {
        let correlation_id = command
            .correlation_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        if command.ts.is_none() {
            command.ts = Some(Timestamp(Utc::now()));
        }
        if command.issued_by.is_none() {
            command.issued_by = Some("edge-gateway".to_string());
        }
        let frame_value = command_frame(&command)
            .map_err(|err| GatewayError::invalid_payload(err.to_string()))?;

        let (ack_tx, mut ack_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.contains_key(&correlation_id) {
                return Err(GatewayError::DuplicateCorrelationId(correlation_id));
            }
            pending.insert(correlation_id.clone(), ack_tx);
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            info!(
                "dispatching command asset={} corr={} attempt={}",
                command.asset_id, correlation_id, attempt
            );
            if let Err(err) = self.link.send_frame(&frame_value).await {
                self.pending.lock().await.remove(&correlation_id);
                return Err(err);
            }
            match tokio::time::timeout(self.timeout, &mut ack_rx).await {
                Ok(Ok(ack)) => return Ok(ack),
                Ok(Err(_)) => {
                    // Waiter dropped without an ack; nothing left to wait on.
                    self.pending.lock().await.remove(&correlation_id);
                    return Err(GatewayError::CommandTimeout {
                        correlation_id,
                        attempts: attempt,
                    });
                }
                Err(_) => {
                    if attempt > self.max_retries {
                        self.pending.lock().await.remove(&correlation_id);
                        return Err(GatewayError::CommandTimeout {
                            correlation_id,
                            attempts: attempt,
                        });
                    }
                    tokio::time::sleep(self.retry_backoff).await;
                }
            }
        }
    }

    /// Route an inbound ack to its waiter and persist it.
    ///
    /// An ack without a correlation id, or one whose id is not pending
    /// (already timed out, or a duplicate from a retry) is logged and
    /// dropped without touching any state.
    pub async fn handle_ack(&self, ack: AckPayload) {
        let Some(correlation_id) = ack.correlation_id.clone() else {
            warn!("ack without correlation id dropped");
            return;
        };
        let waiter = self.pending.lock().await.remove(&correlation_id);
        let Some(waiter) = waiter else {
            warn!("stray ack for {} dropped", correlation_id);
            return;
        };

        let asset_id = ack.asset_id.clone().unwrap_or_else(|| "unknown".to_string());
        let ok = ack.ok;
        let message = ack.message.clone();
        let ts = ack.ts.map(|t| t.0).unwrap_or_else(Utc::now);
        // The waiter may have raced a final timeout and gone away; the ack
        // row is still recorded.
        let _ = waiter.send(ack);

        if let Err(err) = self
            .store
            .store_ack(ts, &asset_id, &correlation_id, ok, message.as_deref())
            .await
        {
            error!("failed to persist ack {}: {}", correlation_id, err);
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
