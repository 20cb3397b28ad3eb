//! Gateway configuration: an ini-style `edge-gateway.conf` plus environment
//! overrides.
//!
//! The file uses `key = value` lines with `#`/`;` comments. Section headers
//! (`[mqtt]`, `[serial]`, ...) are allowed for grouping but keys are unique
//! across the whole file. Every key can also be supplied as an uppercase
//! environment variable (`MQTT_URI`, `SERIAL_BAUD`, ...), which wins over
//! the file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use frame::PayloadCodec;
use tracing::warn;

use crate::error::{GatewayError, Result};

/// Telemetry channels with a dedicated publish topic. Frames naming any
/// other channel fall back to `env`.
pub const TELEMETRY_CHANNELS: [&str; 4] = ["env", "power", "water", "incubator"];

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub site: String,
    pub device_id: String,

    pub mqtt_uri: String,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_keepalive: u64,
    pub mqtt_use_tls: bool,
    pub mqtt_ca_file: Option<PathBuf>,
    pub mqtt_cert_file: Option<PathBuf>,
    pub mqtt_key_file: Option<PathBuf>,
    pub mqtt_qos: u8,
    pub mqtt_lwt_topic: Option<String>,
    pub mqtt_lwt_payload: Option<String>,

    pub usb_device: PathBuf,
    pub serial_baud: u32,
    pub serial_retry_seconds: u64,
    pub serial_codec: PayloadCodec,

    pub sqlite_path: PathBuf,
    pub retention_days: u32,
    pub backlog_max_batch: u32,
    pub backlog_max_rate: u32,

    pub cmd_timeout_seconds: f64,
    pub cmd_max_retries: u32,
    pub cmd_retry_backoff_seconds: f64,

    pub time_sync_interval_hours: u64,

    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            site: "KIN-GOLIATH".to_string(),
            device_id: "esp32gw-01".to_string(),
            mqtt_uri: "mqtts://broker.example.com:8883".to_string(),
            mqtt_username: "edge-agent".to_string(),
            mqtt_password: "change-me".to_string(),
            mqtt_keepalive: 30,
            mqtt_use_tls: true,
            mqtt_ca_file: Some(PathBuf::from("/etc/ssl/certs/ca-certificates.crt")),
            mqtt_cert_file: None,
            mqtt_key_file: None,
            mqtt_qos: 1,
            mqtt_lwt_topic: None,
            mqtt_lwt_payload: None,
            usb_device: PathBuf::from("/dev/ttyESP-GW"),
            serial_baud: 921_600,
            serial_retry_seconds: 5,
            serial_codec: PayloadCodec::Msgpack,
            sqlite_path: PathBuf::from("/var/lib/edge-gateway/edge.db"),
            retention_days: 28,
            backlog_max_batch: 500,
            backlog_max_rate: 500,
            cmd_timeout_seconds: 3.0,
            cmd_max_retries: 2,
            cmd_retry_backoff_seconds: 2.0,
            time_sync_interval_hours: 6,
            log_level: "info".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Load from a config file (if it exists), then apply environment
    /// overrides, then validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::default();
        let path = path.as_ref();
        if path.exists() {
            let content = fs::read_to_string(path)?;
            config.apply_all(parse_ini(&content))?;
        } else {
            warn!("config file {} not found, using defaults", path.display());
        }
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a string (for tests and embedded defaults).
    pub fn parse(content: &str) -> Result<Self> {
        let mut config = Self::default();
        config.apply_all(parse_ini(content))?;
        config.validate()?;
        Ok(config)
    }

    fn apply_all(&mut self, entries: HashMap<String, String>) -> Result<()> {
        for (key, value) in entries {
            self.apply(&key, &value)?;
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<()> {
        for key in KNOWN_KEYS {
            if let Ok(value) = std::env::var(key.to_uppercase()) {
                self.apply(key, &value)?;
            }
        }
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "site" => self.site = value.to_string(),
            "device_id" => self.device_id = value.to_string(),
            "mqtt_uri" => self.mqtt_uri = value.to_string(),
            "mqtt_username" => self.mqtt_username = value.to_string(),
            "mqtt_password" => self.mqtt_password = value.to_string(),
            "mqtt_keepalive" => self.mqtt_keepalive = parse_num(key, value)?,
            "mqtt_use_tls" => self.mqtt_use_tls = parse_bool(key, value)?,
            "mqtt_ca_file" => self.mqtt_ca_file = parse_opt_path(value),
            "mqtt_cert_file" => self.mqtt_cert_file = parse_opt_path(value),
            "mqtt_key_file" => self.mqtt_key_file = parse_opt_path(value),
            "mqtt_qos" => self.mqtt_qos = parse_num(key, value)?,
            "mqtt_lwt_topic" => self.mqtt_lwt_topic = non_empty(value),
            "mqtt_lwt_payload" => self.mqtt_lwt_payload = non_empty(value),
            "usb_device" => self.usb_device = PathBuf::from(value),
            "serial_baud" => self.serial_baud = parse_num(key, value)?,
            "serial_retry_seconds" => self.serial_retry_seconds = parse_num(key, value)?,
            "serial_codec" => {
                self.serial_codec = value.parse().map_err(|_| {
                    GatewayError::config(format!("unsupported serial codec: {}", value))
                })?;
            }
            "sqlite_path" => self.sqlite_path = PathBuf::from(value),
            "retention_days" => self.retention_days = parse_num(key, value)?,
            "backlog_max_batch" => self.backlog_max_batch = parse_num(key, value)?,
            "backlog_max_rate" => self.backlog_max_rate = parse_num(key, value)?,
            "cmd_timeout_seconds" => self.cmd_timeout_seconds = parse_num(key, value)?,
            "cmd_max_retries" => self.cmd_max_retries = parse_num(key, value)?,
            "cmd_retry_backoff_seconds" => self.cmd_retry_backoff_seconds = parse_num(key, value)?,
            "time_sync_interval_hours" => self.time_sync_interval_hours = parse_num(key, value)?,
            "log_level" => self.log_level = value.to_string(),
            other => warn!("ignoring unknown config key: {}", other),
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.mqtt_qos > 1 {
            return Err(GatewayError::config(format!(
                "mqtt_qos must be 0 or 1, got {}",
                self.mqtt_qos
            )));
        }
        if self.backlog_max_rate == 0 {
            return Err(GatewayError::config("backlog_max_rate must be positive"));
        }
        if self.backlog_max_batch == 0 {
            return Err(GatewayError::config("backlog_max_batch must be positive"));
        }
        if !self.cmd_timeout_seconds.is_finite() || self.cmd_timeout_seconds <= 0.0 {
            return Err(GatewayError::config("cmd_timeout_seconds must be positive"));
        }
        Ok(())
    }

    pub fn base_topic(&self) -> String {
        format!("v1/farm/{}/{}", self.site, self.device_id)
    }

    /// Topic for a telemetry channel; anything unrecognised lands on `env`.
    pub fn telemetry_topic(&self, channel: &str) -> String {
        let channel = if TELEMETRY_CHANNELS.contains(&channel) {
            channel
        } else {
            "env"
        };
        format!("{}/telemetry/{}", self.base_topic(), channel)
    }

    /// Subscription filter covering every device at this site.
    pub fn cmd_filter(&self) -> String {
        format!("v1/farm/{}/+/cmd", self.site)
    }

    pub fn ack_topic(&self) -> String {
        format!("{}/ack", self.base_topic())
    }

    pub fn status_topic(&self) -> String {
        format!("{}/status", self.base_topic())
    }

    pub fn serial_retry(&self) -> Duration {
        Duration::from_secs(self.serial_retry_seconds)
    }

    pub fn cmd_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.cmd_timeout_seconds)
    }

    pub fn cmd_retry_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.cmd_retry_backoff_seconds)
    }
}

const KNOWN_KEYS: [&str; 26] = [
    "site",
    "device_id",
    "mqtt_uri",
    "mqtt_username",
    "mqtt_password",
    "mqtt_keepalive",
    "mqtt_use_tls",
    "mqtt_ca_file",
    "mqtt_cert_file",
    "mqtt_key_file",
    "mqtt_qos",
    "mqtt_lwt_topic",
    "mqtt_lwt_payload",
    "usb_device",
    "serial_baud",
    "serial_retry_seconds",
    "serial_codec",
    "sqlite_path",
    "retention_days",
    "backlog_max_batch",
    "backlog_max_rate",
    "cmd_timeout_seconds",
    "cmd_max_retries",
    "cmd_retry_backoff_seconds",
    "time_sync_interval_hours",
    "log_level",
];

/// Parse `key = value` lines. Section headers are tolerated for grouping
/// but carry no meaning: keys are unique across the file.
fn parse_ini(content: &str) -> HashMap<String, String> {
    let mut entries = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            continue;
        }
        if let Some(eq) = line.find('=') {
            let key = line[..eq].trim().to_string();
            let value = line[eq + 1..].trim().to_string();
            entries.insert(key, value);
        }
    }
    entries
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(GatewayError::config(format!(
            "invalid boolean for {}: {}",
            key, value
        ))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| GatewayError::config(format!("invalid number for {}: {}", key, value)))
}

fn parse_opt_path(value: &str) -> Option<PathBuf> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
