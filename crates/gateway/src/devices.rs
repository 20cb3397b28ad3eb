//! Directory of field devices behind the co-processor: MAC to asset
//! identity, plus link quality and firmware as last reported.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub asset_id: String,
    pub mac: String,
    pub rssi_dbm: Option<i32>,
    pub last_seen: DateTime<Utc>,
    pub fw: Option<String>,
}

#[derive(Default)]
pub struct DeviceRouter {
    devices: Mutex<HashMap<String, DeviceInfo>>,
}

impl DeviceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or reconcile a MAC/asset pairing. Telemetry is the only source
    /// of registrations since it carries both identifiers.
    ///
    /// Re-seeing the same pairing just refreshes the firmware string; a MAC
    /// that moved to a different asset (hardware swap) gets a fresh record.
    pub async fn register(&self, mac: &str, asset_id: &str, fw: Option<&str>) {
        let mut devices = self.devices.lock().await;
        if let Some(existing) = devices.get_mut(mac) {
            if existing.asset_id == asset_id {
                if let Some(fw) = fw {
                    existing.fw = Some(fw.to_string());
                }
                debug!("device {} already registered as {}", mac, asset_id);
                return;
            }
        }
        devices.insert(
            mac.to_string(),
            DeviceInfo {
                asset_id: asset_id.to_string(),
                mac: mac.to_string(),
                rssi_dbm: None,
                last_seen: Utc::now(),
                fw: fw.map(str::to_string),
            },
        );
        info!("device registered: {} -> {}", mac, asset_id);
    }

    /// Refresh liveness data for a known MAC. Unknown MACs are logged but
    /// never auto-registered. `last_seen` is monotonic non-decreasing.
    pub async fn touch(&self, mac: &str, rssi_dbm: Option<i32>, fw: Option<&str>) {
        let mut devices = self.devices.lock().await;
        let Some(device) = devices.get_mut(mac) else {
            warn!("touch for unknown device MAC {}", mac);
            return;
        };
        device.last_seen = device.last_seen.max(Utc::now());
        device.rssi_dbm = rssi_dbm;
        if let Some(fw) = fw {
            device.fw = Some(fw.to_string());
        }
    }

    pub async fn resolve_asset(&self, mac: &str) -> Option<String> {
        self.devices
            .lock()
            .await
            .get(mac)
            .map(|d| d.asset_id.clone())
    }

    /// A copy of every entry, safe to serialise outside the lock.
    pub async fn device_snapshot(&self) -> Vec<DeviceInfo> {
        let devices = self.devices.lock().await;
        let mut snapshot: Vec<DeviceInfo> = devices.values().cloned().collect();
        snapshot.sort_by(|a, b| a.mac.cmp(&b.mac));
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_touch() {
        let router = DeviceRouter::new();
        router.register("aa:bb:cc:dd:ee:ff", "A-PP-01", Some("1.2.0")).await;
        router.touch("aa:bb:cc:dd:ee:ff", Some(-61), None).await;

        let snapshot = router.device_snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].asset_id, "A-PP-01");
        assert_eq!(snapshot[0].rssi_dbm, Some(-61));
        assert_eq!(snapshot[0].fw.as_deref(), Some("1.2.0"));
        assert_eq!(
            router.resolve_asset("aa:bb:cc:dd:ee:ff").await.as_deref(),
            Some("A-PP-01")
        );
    }

    #[tokio::test]
    async fn touch_unknown_mac_does_not_register() {
        let router = DeviceRouter::new();
        router.touch("00:00:00:00:00:01", Some(-70), None).await;
        assert!(router.device_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn same_asset_reconciles_fw_only() {
        let router = DeviceRouter::new();
        router.register("aa:aa:aa:aa:aa:aa", "A-PP-01", None).await;
        router.touch("aa:aa:aa:aa:aa:aa", Some(-55), None).await;
        let before = router.device_snapshot().await[0].clone();

        router.register("aa:aa:aa:aa:aa:aa", "A-PP-01", Some("2.0.0")).await;
        let after = router.device_snapshot().await[0].clone();
        assert_eq!(after.fw.as_deref(), Some("2.0.0"));
        assert_eq!(after.rssi_dbm, before.rssi_dbm, "reconcile keeps link data");
    }

    #[tokio::test]
    async fn reassigned_mac_gets_a_fresh_record() {
        let router = DeviceRouter::new();
        router.register("aa:aa:aa:aa:aa:aa", "A-PP-01", Some("1.0")).await;
        router.touch("aa:aa:aa:aa:aa:aa", Some(-55), None).await;

        router.register("aa:aa:aa:aa:aa:aa", "A-PP-02", None).await;
        let snapshot = router.device_snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].asset_id, "A-PP-02");
        assert_eq!(snapshot[0].rssi_dbm, None, "swap drops stale link data");
    }

    #[tokio::test]
    async fn last_seen_is_monotone() {
        let router = DeviceRouter::new();
        router.register("aa:aa:aa:aa:aa:aa", "A-PP-01", None).await;
        let mut previous = router.device_snapshot().await[0].last_seen;
        for _ in 0..5 {
            router.touch("aa:aa:aa:aa:aa:aa", None, None).await;
            let seen = router.device_snapshot().await[0].last_seen;
            assert!(seen >= previous);
            previous = seen;
        }
    }
}
