//! Broker client: rumqttc wrapper with last-will, resubscribe-on-connect,
//! and per-publish confirm tracking.
//!
//! rumqttc assigns packet ids inside its event loop, so confirms are matched
//! the way the thin-edge bridge does it: publishes are queued as waiters in
//! send order, `Outgoing::Publish(pkid)` pairs the oldest waiter with its
//! packet id, and `Incoming::PubAck(pkid)` resolves it. QoS 0 publishes
//! resolve at the outgoing event since no ack will come.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet,
    QoS, TlsConfiguration, Transport,
};
use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::backlog::{PublishSink, PublishToken};
use crate::error::{GatewayError, Result};

/// Back-off between reconnect attempts after an event loop error.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Callback for inbound broker messages (commands, in practice).
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, topic: &str, payload: Value);
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub uri: String,
    pub username: String,
    pub password: String,
    pub keepalive: u64,
    pub use_tls: bool,
    pub ca_file: Option<std::path::PathBuf>,
    pub cert_file: Option<std::path::PathBuf>,
    pub key_file: Option<std::path::PathBuf>,
    pub qos: u8,
    pub lwt_topic: String,
    pub lwt_payload: String,
    pub client_id: String,
}

pub struct MqttClient {
    client: AsyncClient,
    event_loop: Mutex<Option<EventLoop>>,
    connected_tx: watch::Sender<bool>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    confirms: Arc<StdMutex<ConfirmRegistry>>,
    publish_lock: Mutex<()>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttClient {
    pub fn new(config: &MqttConfig) -> Result<Arc<Self>> {
        let (host, port) = parse_uri(&config.uri)?;
        let mut options = MqttOptions::new(truncate_client_id(&config.client_id), host, port);
        options.set_credentials(config.username.clone(), config.password.clone());
        options.set_keep_alive(Duration::from_secs(config.keepalive));
        // QoS 1 resilience: the broker keeps our session and in-flight
        // messages across reconnects.
        options.set_clean_session(false);
        options.set_last_will(LastWill::new(
            config.lwt_topic.clone(),
            config.lwt_payload.as_bytes().to_vec(),
            to_qos(config.qos),
            true,
        ));
        if config.use_tls {
            options.set_transport(Transport::tls_with_config(tls_config(config)?));
        }

        let (client, event_loop) = AsyncClient::new(options, 64);
        let (connected_tx, _) = watch::channel(false);
        let (stop_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            client,
            event_loop: Mutex::new(Some(event_loop)),
            connected_tx,
            subscriptions: Mutex::new(Vec::new()),
            confirms: Arc::new(StdMutex::new(ConfirmRegistry::default())),
            publish_lock: Mutex::new(()),
            stop_tx,
            task: Mutex::new(None),
        }))
    }

    /// Remember a subscription (replayed on every connect) and issue it now
    /// if we are already connected.
    pub async fn subscribe(&self, topic: &str, qos: u8) {
        let qos = to_qos(qos);
        self.subscriptions
            .lock()
            .await
            .push((topic.to_string(), qos));
        if *self.connected_tx.borrow() {
            if let Err(err) = self.client.subscribe(topic, qos).await {
                warn!("subscribe {} failed: {}", topic, err);
            }
        }
    }

    /// Spawn the event loop task. The handler receives every inbound
    /// publish.
    pub async fn start(self: Arc<Self>, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        let event_loop = self
            .event_loop
            .lock()
            .await
            .take()
            .ok_or_else(|| GatewayError::broker_unavailable("event loop already consumed"))?;
        let _ = self.stop_tx.send(false);
        let client = Arc::clone(&self);
        *task = Some(tokio::spawn(async move {
            client.event_loop_task(event_loop, handler).await;
        }));
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        // Best-effort clean disconnect so the broker does not fire the LWT.
        if let Err(err) = self.client.disconnect().await {
            debug!("mqtt disconnect request failed: {}", err);
        }
        if let Some(task) = self.task.lock().await.take() {
            if let Err(err) = task.await {
                warn!("mqtt event loop join failed: {}", err);
            }
        }
        let _ = self.connected_tx.send(false);
        // Release anyone still waiting on a confirm; their tokens resolve
        // as broker_unavailable.
        self.confirms
            .lock()
            .expect("confirm registry poisoned")
            .clear();
        info!("mqtt client stopped");
    }

    /// Connected means the event loop saw a successful ConnAck and no error
    /// since.
    pub fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    async fn event_loop_task(
        self: Arc<Self>,
        mut event_loop: EventLoop,
        handler: Arc<dyn MessageHandler>,
    ) {
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            if *stop_rx.borrow() {
                break;
            }
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        info!("mqtt connected");
                        self.replay_subscriptions().await;
                        let _ = self.connected_tx.send(true);
                    } else {
                        error!("mqtt connect rejected: {:?}", ack.code);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let payload: Value = if publish.payload.is_empty() {
                        Value::Object(serde_json::Map::new())
                    } else {
                        match serde_json::from_slice(&publish.payload) {
                            Ok(value) => value,
                            Err(err) => {
                                warn!("invalid JSON on {}: {}", publish.topic, err);
                                continue;
                            }
                        }
                    };
                    handler.on_message(&publish.topic, payload).await;
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    self.confirms
                        .lock()
                        .expect("confirm registry poisoned")
                        .complete(ack.pkid);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("mqtt broker disconnected us");
                    let _ = self.connected_tx.send(false);
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    self.confirms
                        .lock()
                        .expect("confirm registry poisoned")
                        .assign(pkid);
                }
                Ok(_) => {}
                Err(err) => {
                    let _ = self.connected_tx.send(false);
                    if *stop_rx.borrow() {
                        break;
                    }
                    warn!(
                        "mqtt connection error, retrying in {:?}: {}",
                        RECONNECT_BACKOFF, err
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                        _ = stop_rx.changed() => {}
                    }
                }
            }
        }
        let _ = self.connected_tx.send(false);
        debug!("mqtt event loop terminated");
    }

    /// The broker may have dropped our session; re-issue every remembered
    /// subscription on each (re)connect.
    async fn replay_subscriptions(&self) {
        let subscriptions = self.subscriptions.lock().await.clone();
        for (topic, qos) in subscriptions {
            if let Err(err) = self.client.subscribe(&topic, qos).await {
                error!("re-subscribe {} failed: {}", topic, err);
            }
        }
    }

    /// Wait until connected (or stopped), honouring callers' deadlines.
    async fn wait_connected(&self) -> Result<()> {
        let mut connected = self.connected_tx.subscribe();
        let mut stop = self.stop_tx.subscribe();
        loop {
            if *stop.borrow() {
                return Err(GatewayError::broker_unavailable("client stopping"));
            }
            if *connected.borrow() {
                return Ok(());
            }
            tokio::select! {
                changed = connected.changed() => {
                    if changed.is_err() {
                        return Err(GatewayError::broker_unavailable("client gone"));
                    }
                }
                _ = stop.changed() => {}
            }
        }
    }
}

#[async_trait]
impl PublishSink for MqttClient {
    /// Serialised by the publish lock; blocks until the connection flag is
    /// set, then returns a token that resolves on the broker's ack.
    async fn publish(
        &self,
        topic: &str,
        payload: &Value,
        qos: u8,
        retain: bool,
    ) -> Result<PublishToken> {
        let data = serde_json::to_vec(payload)
            .map_err(|err| GatewayError::invalid_payload(err.to_string()))?;
        let _guard = self.publish_lock.lock().await;
        self.wait_connected().await?;

        let (token, confirm_tx) = PublishToken::pending();
        self.confirms
            .lock()
            .expect("confirm registry poisoned")
            .push_waiter(confirm_tx);
        if let Err(err) = self.client.publish(topic, to_qos(qos), retain, data).await {
            self.confirms
                .lock()
                .expect("confirm registry poisoned")
                .pop_waiter();
            return Err(GatewayError::broker_unavailable(err));
        }
        Ok(token)
    }
}

/// Pairs publish waiters with packet ids as the event loop reports them.
#[derive(Default)]
struct ConfirmRegistry {
    unassigned: VecDeque<oneshot::Sender<()>>,
    by_pkid: HashMap<u16, oneshot::Sender<()>>,
}

impl ConfirmRegistry {
    fn push_waiter(&mut self, tx: oneshot::Sender<()>) {
        self.unassigned.push_back(tx);
    }

    /// Undo the most recent `push_waiter` after a failed publish call.
    fn pop_waiter(&mut self) {
        self.unassigned.pop_back();
    }

    fn assign(&mut self, pkid: u16) {
        if pkid == 0 {
            // QoS 0: no ack will follow, confirm right away.
            if let Some(tx) = self.unassigned.pop_front() {
                let _ = tx.send(());
            }
            return;
        }
        if self.by_pkid.contains_key(&pkid) {
            // Retransmission of an in-flight message after a reconnect.
            return;
        }
        if let Some(tx) = self.unassigned.pop_front() {
            self.by_pkid.insert(pkid, tx);
        }
    }

    fn complete(&mut self, pkid: u16) {
        if let Some(tx) = self.by_pkid.remove(&pkid) {
            let _ = tx.send(());
        }
    }

    /// Drop every outstanding waiter (shutdown path).
    fn clear(&mut self) {
        self.unassigned.clear();
        self.by_pkid.clear();
    }
}

fn to_qos(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Host and port from the broker URI, with scheme defaults (1883 plain,
/// 8883 for TLS schemes).
fn parse_uri(uri: &str) -> Result<(String, u16)> {
    let parsed = Url::parse(uri)
        .map_err(|err| GatewayError::config(format!("invalid mqtt uri {}: {}", uri, err)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| GatewayError::config(format!("mqtt uri {} has no host", uri)))?
        .to_string();
    let port = parsed.port().unwrap_or_else(|| {
        if parsed.scheme().ends_with('s') {
            8883
        } else {
            1883
        }
    });
    Ok((host, port))
}

fn tls_config(config: &MqttConfig) -> Result<TlsConfiguration> {
    let ca_file = config.ca_file.as_ref().ok_or_else(|| {
        GatewayError::config("mqtt_use_tls requires mqtt_ca_file to be set")
    })?;
    let ca = read_pem(ca_file)?;
    let client_auth = match (&config.cert_file, &config.key_file) {
        (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
        (None, None) => None,
        _ => {
            return Err(GatewayError::config(
                "mqtt_cert_file and mqtt_key_file must be set together",
            ))
        }
    };
    Ok(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    })
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|err| {
        GatewayError::config(format!("cannot read {}: {}", path.display(), err))
    })
}

/// MQTT 3.1 caps client ids at 23 bytes; some brokers still enforce it.
fn truncate_client_id(id: &str) -> String {
    id.chars().take(23).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_defaults_by_scheme() {
        assert_eq!(parse_uri("mqtt://broker.local").unwrap(), ("broker.local".to_string(), 1883));
        assert_eq!(parse_uri("mqtts://broker.local").unwrap(), ("broker.local".to_string(), 8883));
        assert_eq!(
            parse_uri("mqtt://broker.local:11883").unwrap(),
            ("broker.local".to_string(), 11883)
        );
        assert!(parse_uri("not a uri").is_err());
    }

    #[test]
    fn confirm_registry_matches_fifo() {
        let mut registry = ConfirmRegistry::default();
        let (token_a, tx_a) = PublishToken::pending();
        let (token_b, tx_b) = PublishToken::pending();
        registry.push_waiter(tx_a);
        registry.push_waiter(tx_b);

        registry.assign(1);
        registry.assign(2);
        // Acks may arrive out of order.
        registry.complete(2);
        registry.complete(1);

        futures_ready(token_a);
        futures_ready(token_b);
    }

    #[test]
    fn qos0_confirms_at_outgoing() {
        let mut registry = ConfirmRegistry::default();
        let (token, tx) = PublishToken::pending();
        registry.push_waiter(tx);
        registry.assign(0);
        futures_ready(token);
    }

    #[test]
    fn retransmitted_pkid_does_not_steal_waiters() {
        let mut registry = ConfirmRegistry::default();
        let (token_a, tx_a) = PublishToken::pending();
        registry.push_waiter(tx_a);
        registry.assign(1);
        // A reconnect replays pkid 1 before the next fresh publish.
        let (token_b, tx_b) = PublishToken::pending();
        registry.push_waiter(tx_b);
        registry.assign(1);
        registry.assign(2);
        registry.complete(1);
        registry.complete(2);
        futures_ready(token_a);
        futures_ready(token_b);
    }

    /// Assert a token is already resolved.
    fn futures_ready(token: PublishToken) {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
            .block_on(async move {
                token.wait(Duration::from_millis(10)).await.unwrap();
            });
    }
}
