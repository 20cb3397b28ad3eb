//! Component status snapshots for the health probe and local UI.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct LinkState {
    pub status: String,
    pub detail: Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct HealthMonitor {
    states: Mutex<BTreeMap<String, LinkState>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_state(&self, key: &str, status: &str, detail: Value) {
        debug!("health {} -> {}", key, status);
        self.states.lock().await.insert(
            key.to_string(),
            LinkState {
                status: status.to_string(),
                detail,
                updated_at: Utc::now(),
            },
        );
    }

    pub async fn snapshot(&self) -> BTreeMap<String, LinkState> {
        self.states.lock().await.clone()
    }
}
