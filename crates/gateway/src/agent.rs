//! The gateway orchestrator: wires every component together, routes inbound
//! serial frames and broker commands, and owns the start/stop lifecycle.
//!
//! There is no global state; one `Arc<EdgeAgent>` is the context value every
//! task and handler works against.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use frame::{
    isoformat, pair_begin_message, pair_end_message, ping_message, set_mac_message,
    time_sync_message, AckPayload, CommandPayload, CommandStep, SerialMessage, TelemetryPayload,
};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::backlog::{BacklogManager, PublishSink};
use crate::commands::{CommandLink, CommandManager};
use crate::config::GatewayConfig;
use crate::devices::{DeviceInfo, DeviceRouter};
use crate::error::{GatewayError, Result};
use crate::health::{HealthMonitor, LinkState};
use crate::mqtt::{MessageHandler, MqttClient, MqttConfig};
use crate::sched::{JobInfo, Scheduler};
use crate::serial::{FrameHandler, SerialBridge, SerialConfig};
use store::{Store, StoreConfig};

/// Deadline for a direct broker publish before the payload falls back to
/// the durable queue.
const PUBLISH_DEADLINE: Duration = Duration::from_secs(2);

/// Interval of the link health sampling job.
const LINK_HEALTH_PERIOD: Duration = Duration::from_secs(15);

/// Queue depth beyond which the backlog is reported degraded.
const BACKLOG_DEGRADED_THRESHOLD: u64 = 1000;

pub struct EdgeAgent {
    config: GatewayConfig,
    store: Store,
    serial: Arc<SerialBridge>,
    broker: Arc<MqttClient>,
    sink: Arc<dyn PublishSink>,
    backlog: Arc<BacklogManager>,
    commands: Arc<CommandManager>,
    devices: Arc<DeviceRouter>,
    health: Arc<HealthMonitor>,
    scheduler: Arc<Scheduler>,
}

impl EdgeAgent {
    /// Open the store and build every component, fully wired but not yet
    /// running.
    pub async fn bootstrap(config: GatewayConfig) -> Result<Arc<Self>> {
        let store = Store::open(StoreConfig {
            path: config.sqlite_path.clone(),
            retention_days: config.retention_days,
        })
        .await?;

        let serial = SerialBridge::new(SerialConfig {
            device: config.usb_device.clone(),
            baud: config.serial_baud,
            retry: config.serial_retry(),
            codec: config.serial_codec,
        });

        let lwt_topic = config
            .mqtt_lwt_topic
            .clone()
            .unwrap_or_else(|| config.status_topic());
        let lwt_payload = config.mqtt_lwt_payload.clone().unwrap_or_else(|| {
            json!({ "status": "offline", "ts": isoformat(&Utc::now()) }).to_string()
        });
        let broker = MqttClient::new(&MqttConfig {
            uri: config.mqtt_uri.clone(),
            username: config.mqtt_username.clone(),
            password: config.mqtt_password.clone(),
            keepalive: config.mqtt_keepalive,
            use_tls: config.mqtt_use_tls,
            ca_file: config.mqtt_ca_file.clone(),
            cert_file: config.mqtt_cert_file.clone(),
            key_file: config.mqtt_key_file.clone(),
            qos: config.mqtt_qos,
            lwt_topic,
            lwt_payload,
            client_id: format!("edge-agent-{}", config.device_id),
        })?;
        let sink: Arc<dyn PublishSink> = broker.clone();

        let backlog = Arc::new(BacklogManager::new(
            store.clone(),
            Arc::clone(&sink),
            config.backlog_max_batch,
            config.backlog_max_rate,
        ));
        let commands = Arc::new(CommandManager::new(
            serial.clone() as Arc<dyn CommandLink>,
            store.clone(),
            config.cmd_timeout(),
            config.cmd_max_retries,
            config.cmd_retry_backoff(),
        ));

        Ok(Self::wire(
            config,
            store,
            serial,
            broker,
            sink,
            backlog,
            commands,
        ))
    }

    /// Assemble an agent from pre-built components (the bootstrap path and
    /// the tests share this).
    pub(crate) fn wire(
        config: GatewayConfig,
        store: Store,
        serial: Arc<SerialBridge>,
        broker: Arc<MqttClient>,
        sink: Arc<dyn PublishSink>,
        backlog: Arc<BacklogManager>,
        commands: Arc<CommandManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            serial,
            broker,
            sink,
            backlog,
            commands,
            devices: Arc::new(DeviceRouter::new()),
            health: Arc::new(HealthMonitor::new()),
            scheduler: Arc::new(Scheduler::new()),
        })
    }

    /// Full startup sequence: scheduler jobs, command subscription, backlog
    /// drain, broker, serial, online announcement, first health sample.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        info!(
            "starting edge gateway for site {} device {}",
            self.config.site, self.config.device_id
        );

        let agent = Arc::clone(&self);
        self.scheduler
            .add_cron_job("retention-purge", "0 0 3 * * *", move || {
                let agent = Arc::clone(&agent);
                async move {
                    if let Err(err) = agent.store.purge_retention().await {
                        error!("retention purge failed: {}", err);
                    }
                }
            })
            .await?;

        let agent = Arc::clone(&self);
        self.scheduler
            .add_interval_job(
                "time-sync",
                Duration::from_secs(self.config.time_sync_interval_hours * 3600),
                move || {
                    let agent = Arc::clone(&agent);
                    async move {
                        agent.send_time_sync().await;
                    }
                },
            )
            .await;

        let agent = Arc::clone(&self);
        self.scheduler
            .add_interval_job("link-health", LINK_HEALTH_PERIOD, move || {
                let agent = Arc::clone(&agent);
                async move {
                    agent.update_link_health().await;
                }
            })
            .await;

        self.broker
            .subscribe(&self.config.cmd_filter(), self.config.mqtt_qos)
            .await;
        self.backlog.start().await;
        Arc::clone(&self.broker)
            .start(Arc::clone(&self) as Arc<dyn MessageHandler>)
            .await?;
        Arc::clone(&self.serial)
            .start(Arc::clone(&self) as Arc<dyn FrameHandler>)
            .await;

        let online = json!({
            "status": "online",
            "ts": isoformat(&Utc::now()),
            "site": self.config.site,
            "device": self.config.device_id,
        });
        self.publish_or_enqueue(&self.config.status_topic(), &online, self.config.mqtt_qos)
            .await;
        self.update_link_health().await;
        info!("edge gateway started");
        Ok(())
    }

    /// Shutdown: serial, broker, backlog, store, then the scheduler without
    /// waiting for in-flight jobs.
    pub async fn stop(&self) {
        info!("stopping edge gateway");
        self.serial.stop().await;
        self.broker.stop().await;
        self.backlog.stop().await;
        if let Err(err) = self.store.close().await {
            warn!("store close failed: {}", err);
        }
        self.scheduler.shutdown().await;
        info!("edge gateway stopped");
    }

    /// Try the broker with a short deadline; on any failure the payload
    /// goes to the durable queue with its original topic, qos and
    /// idempotency key.
    async fn publish_or_enqueue(&self, topic: &str, payload: &Value, qos: u8) {
        let attempt = tokio::time::timeout(
            PUBLISH_DEADLINE,
            self.sink.publish(topic, payload, qos, false),
        )
        .await;
        let err = match attempt {
            Ok(Ok(_token)) => return, // confirm-or-requeue is the drainer's job
            Ok(Err(err)) => err,
            Err(_) => GatewayError::broker_unavailable("publish deadline exceeded"),
        };
        warn!("publish to {} fell back to backlog: {}", topic, err);
        let idempotency_key = payload.get("idempotency_key").and_then(Value::as_str);
        if let Err(err) = self.backlog.enqueue(topic, payload, qos, idempotency_key).await {
            error!("backlog enqueue for {} failed: {}", topic, err);
        }
    }

    async fn handle_telemetry(&self, telemetry: TelemetryPayload, raw: &Value) {
        let metrics = telemetry.metrics.to_map();
        if let Err(err) = self
            .store
            .store_telemetry(telemetry.ts.0, &telemetry.asset_id, &metrics, telemetry.rssi_dbm)
            .await
        {
            // Storage trouble must not cost us the upstream publish.
            error!("telemetry persist failed for {}: {}", telemetry.asset_id, err);
        }
        if let Some(mac) = &telemetry.mac {
            self.devices
                .register(mac, &telemetry.asset_id, telemetry.fw.as_deref())
                .await;
            self.devices
                .touch(mac, telemetry.rssi_dbm, telemetry.fw.as_deref())
                .await;
        }
        let channel = telemetry.channel.as_deref().unwrap_or("env");
        let topic = self.config.telemetry_topic(channel);
        self.publish_or_enqueue(&topic, raw, self.config.mqtt_qos).await;
    }

    async fn handle_status(&self, status: Option<&str>, raw: &Value) {
        let detail = strip_type(raw);
        self.health
            .set_state("gateway", status.unwrap_or("unknown"), detail)
            .await;
        self.publish_or_enqueue(&self.config.status_topic(), raw, self.config.mqtt_qos)
            .await;
    }

    async fn handle_event(&self, asset_id: Option<&str>, kind: Option<&str>, raw: &Value) {
        if let Err(err) = self
            .store
            .store_event(
                Utc::now(),
                asset_id.unwrap_or("unknown"),
                kind.unwrap_or("generic"),
                &raw.to_string(),
            )
            .await
        {
            error!("event persist failed: {}", err);
        }
        self.publish_or_enqueue(&self.config.status_topic(), raw, self.config.mqtt_qos)
            .await;
    }

    // ------------------------------------------------------------------
    // Facade operations backing the local diagnostic HTTP layer.
    // ------------------------------------------------------------------

    pub async fn status_report(&self) -> Result<Value> {
        let backlog = self.backlog.stats().await?;
        let health = self.health.snapshot().await;
        let pending = self.commands.pending_count().await;
        Ok(json!({
            "site": self.config.site,
            "gateway": self.config.device_id,
            "mqtt_connected": self.broker.is_connected(),
            "serial_connected": self.serial.is_connected(),
            "backlog": backlog,
            "pending_commands": pending,
            "health": health,
        }))
    }

    pub async fn metrics_report(&self) -> Result<Value> {
        let telemetry = self.store.latest_telemetry(100).await?;
        let acks = self.store.recent_acks(50).await?;
        Ok(json!({ "telemetry": telemetry, "acks": acks }))
    }

    pub async fn device_snapshot(&self) -> Vec<DeviceInfo> {
        self.devices.device_snapshot().await
    }

    pub async fn health_snapshot(&self) -> BTreeMap<String, LinkState> {
        self.health.snapshot().await
    }

    pub async fn scheduled_jobs(&self) -> Vec<JobInfo> {
        self.scheduler.jobs().await
    }

    /// Queue stats plus the head of the unacked queue.
    pub async fn buffer_report(&self) -> Result<Value> {
        let stats = self.backlog.stats().await?;
        let head = self.store.backlog_entries(50).await?;
        Ok(json!({ "stats": stats, "head": head }))
    }

    pub async fn send_command(&self, command: CommandPayload) -> Result<AckPayload> {
        self.commands.send(command).await
    }

    pub async fn pending_commands(&self) -> usize {
        self.commands.pending_count().await
    }

    /// Fire a relay from the local UI, optionally as a timed pulse.
    pub async fn test_relay(
        &self,
        asset_id: &str,
        channel: &str,
        state: &str,
        duration_s: Option<u64>,
    ) -> Result<AckPayload> {
        if state != "ON" && state != "OFF" {
            return Err(GatewayError::invalid_payload(format!(
                "relay state must be ON or OFF, got {}",
                state
            )));
        }
        let sequence = duration_s
            .map(|dur_s| {
                vec![CommandStep {
                    act: channel.to_string(),
                    dur_s: Some(dur_s),
                    wait_s: None,
                }]
            })
            .unwrap_or_default();
        let command = CommandPayload {
            asset_id: asset_id.to_string(),
            relay: BTreeMap::from([(channel.to_string(), state.to_string())]),
            setpoints: Map::new(),
            sequence,
            correlation_id: Some(format!("ui-test-{}", Utc::now().timestamp())),
            ts: None,
            issued_by: None,
        };
        self.commands.send(command).await
    }

    pub async fn purge_buffer(&self) -> Result<u64> {
        Ok(self.store.purge_backlog().await?)
    }

    pub async fn replay_backlog(&self) {
        self.backlog.start().await;
    }

    /// Write a ping frame; returns the correlation id used.
    pub async fn ping_device(
        &self,
        asset_id: &str,
        mac: Option<&str>,
        correlation_id: Option<String>,
    ) -> Result<String> {
        let correlation_id =
            correlation_id.unwrap_or_else(|| format!("ping-{}", Utc::now().timestamp()));
        self.serial
            .send(&ping_message(asset_id, mac, &correlation_id))
            .await?;
        Ok(correlation_id)
    }

    /// Open the pairing window on the co-processor.
    pub async fn pair_begin(&self, duration_s: u32) -> Result<()> {
        self.serial.send(&pair_begin_message(duration_s)).await
    }

    pub async fn pair_end(&self) -> Result<()> {
        self.serial.send(&pair_end_message()).await
    }

    /// Broadcast a time sync immediately; returns the timestamp sent.
    pub async fn force_time_sync(&self) -> Result<String> {
        let now = Utc::now();
        self.serial.send(&time_sync_message(now, 0)).await?;
        Ok(isoformat(&now))
    }

    /// Reconfigure the co-processor's station MAC.
    pub async fn set_gateway_mac(&self, mac: &str, persist: bool) -> Result<String> {
        let mac = normalise_mac(mac)?;
        self.serial.send(&set_mac_message(&mac, persist)).await?;
        Ok(mac)
    }

    /// Field recovery tool: bounce the drain task and leave a marker row so
    /// operators can see the reset happened.
    pub async fn reset_backlog(&self) -> Result<()> {
        self.backlog.stop().await;
        let marker = json!({
            "ts": isoformat(&Utc::now()),
            "status": "manual-reset",
            "site": self.config.site,
            "device": self.config.device_id,
        });
        self.backlog
            .enqueue(&self.config.status_topic(), &marker, self.config.mqtt_qos, None)
            .await?;
        self.backlog.start().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Periodic work.
    // ------------------------------------------------------------------

    async fn update_link_health(&self) {
        let mqtt_up = self.broker.is_connected();
        self.health
            .set_state(
                "mqtt",
                if mqtt_up { "up" } else { "down" },
                json!({ "connected": mqtt_up }),
            )
            .await;
        let serial_up = self.serial.is_connected();
        self.health
            .set_state(
                "serial",
                if serial_up { "up" } else { "down" },
                json!({ "connected": serial_up }),
            )
            .await;
        match self.backlog.stats().await {
            Ok(stats) => {
                let status = if stats.queued < BACKLOG_DEGRADED_THRESHOLD {
                    "ok"
                } else {
                    "degraded"
                };
                let detail = serde_json::to_value(&stats).unwrap_or_else(|_| json!({}));
                self.health.set_state("backlog", status, detail).await;
            }
            Err(err) => {
                self.health
                    .set_state("backlog", "unknown", json!({ "error": err.to_string() }))
                    .await;
            }
        }
    }

    async fn send_time_sync(&self) {
        if let Err(err) = self.serial.send(&time_sync_message(Utc::now(), 0)).await {
            warn!("time sync broadcast failed: {}", err);
        }
    }
}

/// Inbound serial frames, dispatched by their `type` tag.
#[async_trait]
impl FrameHandler for EdgeAgent {
    async fn on_frame(&self, payload: Value) {
        let message = match SerialMessage::from_value(&payload) {
            Ok(message) => message,
            Err(err) => {
                warn!("invalid serial payload dropped: {}", err);
                return;
            }
        };
        match message {
            SerialMessage::Telemetry(telemetry) => {
                self.handle_telemetry(telemetry, &payload).await;
            }
            SerialMessage::Ack(ack) => {
                self.commands.handle_ack(ack).await;
                // Acks are mirrored upstream whether or not a command was
                // waiting locally.
                self.publish_or_enqueue(&self.config.ack_topic(), &payload, self.config.mqtt_qos)
                    .await;
            }
            SerialMessage::Status(status) => {
                self.handle_status(status.status.as_deref(), &payload).await;
            }
            SerialMessage::Event(event) => {
                self.handle_event(event.asset_id.as_deref(), event.event.as_deref(), &payload)
                    .await;
            }
            SerialMessage::Unknown(tag) => {
                debug!("unhandled serial message type {:?}", tag);
            }
        }
    }
}

/// Inbound broker traffic: everything we subscribe to is a command.
#[async_trait]
impl MessageHandler for EdgeAgent {
    async fn on_message(&self, topic: &str, payload: Value) {
        let command: CommandPayload = match serde_json::from_value(payload) {
            Ok(command) => command,
            Err(err) => {
                warn!("invalid command on {} dropped: {}", topic, err);
                return;
            }
        };
        let asset_id = command.asset_id.clone();
        match self.commands.send(command).await {
            Ok(ack) => {
                let ack = serde_json::to_value(&ack).unwrap_or_else(|_| json!({}));
                self.publish_or_enqueue(&self.config.ack_topic(), &ack, self.config.mqtt_qos)
                    .await;
            }
            Err(GatewayError::CommandTimeout { correlation_id, attempts }) => {
                error!(
                    "command {} timed out after {} attempts",
                    correlation_id, attempts
                );
                let nack = json!({
                    "asset_id": asset_id,
                    "correlation_id": correlation_id,
                    "ok": false,
                    "message": "timeout",
                    "ts": isoformat(&Utc::now()),
                });
                self.publish_or_enqueue(&self.config.ack_topic(), &nack, self.config.mqtt_qos)
                    .await;
            }
            Err(err) => {
                warn!("command from {} failed: {}", topic, err);
            }
        }
    }
}

/// Everything except the envelope tag, as status detail.
fn strip_type(raw: &Value) -> Value {
    match raw {
        Value::Object(map) => {
            let detail: Map<String, Value> = map
                .iter()
                .filter(|(key, _)| key.as_str() != "type")
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            Value::Object(detail)
        }
        _ => json!({}),
    }
}

fn normalise_mac(mac: &str) -> Result<String> {
    let mac = mac.trim().to_ascii_lowercase();
    let valid = mac.split(':').count() == 6
        && mac
            .split(':')
            .all(|part| part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(GatewayError::invalid_payload(format!(
            "malformed MAC address: {}",
            mac
        )));
    }
    Ok(mac)
}
