//! Typed views of the maps travelling over the serial link.
//!
//! Inbound frames are classified by their `type` key into [`SerialMessage`];
//! outbound frames (`cmd`, `ping`, `pair_begin`, `pair_end`, `time_sync`,
//! `cfg`) are built by the free functions at the bottom of this module.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::isoformat;

/// Wire timestamp: serialises as a second-precision RFC 3339 `Z` string and
/// accepts either that shape or epoch seconds/milliseconds on the way in
/// (battery devices without an RTC report epoch numbers until synced).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp(pub DateTime<Utc>);

impl From<DateTime<Utc>> for Timestamp {
    fn from(ts: DateTime<Utc>) -> Self {
        Self(ts)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&isoformat(&self.0))
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(TimestampVisitor)
    }
}

struct TimestampVisitor;

impl<'de> Visitor<'de> for TimestampVisitor {
    type Value = Timestamp;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an RFC 3339 timestamp or epoch seconds")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Timestamp, E> {
        DateTime::parse_from_rfc3339(v)
            .map(|dt| Timestamp(dt.with_timezone(&Utc)))
            .or_else(|_| {
                chrono::NaiveDateTime::parse_from_str(v, "%Y-%m-%dT%H:%M:%S%.f")
                    .map(|naive| Timestamp(Utc.from_utc_datetime(&naive)))
            })
            .map_err(|_| E::custom(format!("unparseable timestamp: {}", v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Timestamp, E> {
        // Heuristic: values beyond the year 33658 in seconds are milliseconds.
        let (secs, millis) = if v.abs() >= 1_000_000_000_000 {
            (v / 1000, (v % 1000) as u32)
        } else {
            (v, 0)
        };
        Utc.timestamp_opt(secs, millis * 1_000_000)
            .single()
            .map(Timestamp)
            .ok_or_else(|| E::custom(format!("epoch out of range: {}", v)))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Timestamp, E> {
        self.visit_i64(v as i64)
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Timestamp, E> {
        Utc.timestamp_opt(v.trunc() as i64, (v.fract() * 1e9) as u32)
            .single()
            .map(Timestamp)
            .ok_or_else(|| E::custom(format!("epoch out of range: {}", v)))
    }
}

/// The metric channels a field device can report. One frame may fill any
/// subset; absent metrics are not stored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryMetrics {
    pub t_c: Option<f64>,
    pub rh: Option<f64>,
    pub mq135_ppm: Option<f64>,
    pub lux: Option<f64>,
    pub voltage_v: Option<f64>,
    pub current_a: Option<f64>,
    pub power_w: Option<f64>,
    pub energy_wh: Option<f64>,
    pub flow_lpm: Option<f64>,
    pub tank_level_pct: Option<f64>,
    pub incubator_temp_c: Option<f64>,
    pub incubator_rh: Option<f64>,
}

impl TelemetryMetrics {
    /// Wide-to-tall expansion: the non-null metrics as `name -> value`.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        let fields = [
            ("t_c", self.t_c),
            ("rh", self.rh),
            ("mq135_ppm", self.mq135_ppm),
            ("lux", self.lux),
            ("voltage_v", self.voltage_v),
            ("current_a", self.current_a),
            ("power_w", self.power_w),
            ("energy_wh", self.energy_wh),
            ("flow_lpm", self.flow_lpm),
            ("tank_level_pct", self.tank_level_pct),
            ("incubator_temp_c", self.incubator_temp_c),
            ("incubator_rh", self.incubator_rh),
        ];
        fields
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| (name.to_string(), v)))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryPayload {
    pub ts: Timestamp,
    pub site: Option<String>,
    pub device: Option<String>,
    pub asset_id: String,
    pub channel: Option<String>,
    pub metrics: TelemetryMetrics,
    pub rssi_dbm: Option<i32>,
    pub fw: Option<String>,
    pub mac: Option<String>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandStep {
    pub act: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dur_s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_s: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    pub asset_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relay: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub setpoints: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sequence: Vec<CommandStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_by: Option<String>,
}

/// Acknowledgement as sent by a device. Deliberately lenient: a malformed
/// ack must still reach the command manager so it can warn about it instead
/// of being dropped as unparseable upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default = "default_true")]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<Timestamp>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusReport {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventReport {
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
}

/// Inbound serial traffic, classified by the map's `type` key.
#[derive(Debug)]
pub enum SerialMessage {
    Telemetry(TelemetryPayload),
    Ack(AckPayload),
    Status(StatusReport),
    Event(EventReport),
    /// Anything with a tag this gateway does not speak (or no tag at all).
    Unknown(Option<String>),
}

impl SerialMessage {
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        match value.get("type").and_then(Value::as_str) {
            Some("telemetry") => serde_json::from_value(value.clone()).map(Self::Telemetry),
            Some("ack") => serde_json::from_value(value.clone()).map(Self::Ack),
            Some("status") => serde_json::from_value(value.clone()).map(Self::Status),
            Some("event") => serde_json::from_value(value.clone()).map(Self::Event),
            tag => Ok(Self::Unknown(tag.map(str::to_string))),
        }
    }
}

/// `{type:"cmd", ...command}` as written to the co-processor.
pub fn command_frame(command: &CommandPayload) -> Result<Value, serde_json::Error> {
    let mut value = serde_json::to_value(command)?;
    if let Value::Object(map) = &mut value {
        map.insert("type".to_string(), Value::String("cmd".to_string()));
    }
    Ok(value)
}

pub fn time_sync_message(now: DateTime<Utc>, offset_ms: i64) -> Value {
    json!({
        "type": "time_sync",
        "ts": isoformat(&now),
        "offset_ms": offset_ms,
        "epoch_ms": now.timestamp_millis(),
    })
}

pub fn ping_message(asset_id: &str, mac: Option<&str>, correlation_id: &str) -> Value {
    let mut payload = json!({
        "type": "ping",
        "asset_id": asset_id,
        "correlation_id": correlation_id,
    });
    if let (Some(mac), Value::Object(map)) = (mac, &mut payload) {
        map.insert("mac".to_string(), Value::String(mac.to_string()));
    }
    payload
}

pub fn pair_begin_message(duration_s: u32) -> Value {
    json!({ "type": "pair_begin", "duration_s": duration_s })
}

pub fn pair_end_message() -> Value {
    json!({ "type": "pair_end" })
}

pub fn set_mac_message(mac: &str, persist: bool) -> Value {
    json!({ "type": "cfg", "op": "set_mac", "mac": mac, "persist": persist })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_telemetry() {
        let value = json!({
            "type": "telemetry",
            "asset_id": "A-PP-01",
            "channel": "env",
            "metrics": {"t_c": 27.5, "rh": 61.0},
            "ts": "2025-09-17T12:03:20Z",
            "mac": "aa:bb:cc:dd:ee:ff",
            "idempotency_key": "k1",
        });
        let SerialMessage::Telemetry(t) = SerialMessage::from_value(&value).unwrap() else {
            panic!("expected telemetry");
        };
        assert_eq!(t.asset_id, "A-PP-01");
        assert_eq!(t.channel.as_deref(), Some("env"));
        let metrics = t.metrics.to_map();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics["t_c"], 27.5);
        assert_eq!(metrics["rh"], 61.0);
        assert_eq!(isoformat(&t.ts.0), "2025-09-17T12:03:20Z");
    }

    #[test]
    fn telemetry_missing_required_fields_fails() {
        let value = json!({
            "type": "telemetry",
            "metrics": {"t_c": 1.0},
            "ts": "2025-09-17T12:03:20Z",
            "idempotency_key": "k1",
        });
        assert!(SerialMessage::from_value(&value).is_err());
    }

    #[test]
    fn ack_is_lenient() {
        let value = json!({"type": "ack", "ok": false});
        let SerialMessage::Ack(ack) = SerialMessage::from_value(&value).unwrap() else {
            panic!("expected ack");
        };
        assert!(ack.correlation_id.is_none());
        assert!(!ack.ok);

        // `ok` defaults to true when the device omits it.
        let value = json!({"type": "ack", "correlation_id": "c1"});
        let SerialMessage::Ack(ack) = SerialMessage::from_value(&value).unwrap() else {
            panic!("expected ack");
        };
        assert!(ack.ok);
    }

    #[test]
    fn unknown_tags_sink() {
        let value = json!({"type": "firmware_chunk", "seq": 3});
        assert!(matches!(
            SerialMessage::from_value(&value).unwrap(),
            SerialMessage::Unknown(Some(tag)) if tag == "firmware_chunk"
        ));
        assert!(matches!(
            SerialMessage::from_value(&json!({"value": 1})).unwrap(),
            SerialMessage::Unknown(None)
        ));
    }

    #[test]
    fn epoch_timestamps_accepted() {
        let value = json!({
            "type": "telemetry",
            "asset_id": "A-PP-02",
            "metrics": {},
            "ts": 1758110600,
            "idempotency_key": "k2",
        });
        let SerialMessage::Telemetry(t) = SerialMessage::from_value(&value).unwrap() else {
            panic!("expected telemetry");
        };
        assert_eq!(t.ts.0.timestamp(), 1758110600);

        let value = json!({
            "type": "telemetry",
            "asset_id": "A-PP-02",
            "metrics": {},
            "ts": 1758110600123i64,
            "idempotency_key": "k3",
        });
        let SerialMessage::Telemetry(t) = SerialMessage::from_value(&value).unwrap() else {
            panic!("expected telemetry");
        };
        assert_eq!(t.ts.0.timestamp_millis(), 1758110600123);
    }

    #[test]
    fn command_frame_is_tagged() {
        let command = CommandPayload {
            asset_id: "A-PP-01".to_string(),
            relay: BTreeMap::from([("lamp".to_string(), "ON".to_string())]),
            setpoints: Map::new(),
            sequence: Vec::new(),
            correlation_id: Some("c1".to_string()),
            ts: None,
            issued_by: Some("edge-gateway".to_string()),
        };
        let frame = command_frame(&command).unwrap();
        assert_eq!(frame["type"], "cmd");
        assert_eq!(frame["asset_id"], "A-PP-01");
        assert_eq!(frame["relay"]["lamp"], "ON");
        assert!(frame.get("setpoints").is_none());
    }
}
