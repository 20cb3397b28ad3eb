//! Payload encoding for the serial link: CBOR or MsgPack, chosen per bridge.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{FrameError, Result};

/// Which payload encoding a bridge speaks.
///
/// Outbound frames always use the configured codec so the co-processor can
/// rely on it. Inbound decoding with [`PayloadCodec::Msgpack`] falls back to
/// CBOR on failure, which keeps a half-upgraded fleet readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadCodec {
    Cbor,
    Msgpack,
}

impl PayloadCodec {
    /// Encode a payload map with exactly this codec.
    pub fn encode(self, payload: &Value) -> Result<Vec<u8>> {
        match self {
            PayloadCodec::Cbor => serde_cbor::to_vec(payload).map_err(FrameError::codec),
            PayloadCodec::Msgpack => rmp_serde::to_vec_named(payload).map_err(FrameError::codec),
        }
    }

    /// Decode an inbound payload. MsgPack bridges fall back to CBOR.
    pub fn decode(self, payload: &[u8]) -> Result<Value> {
        let value = match self {
            PayloadCodec::Cbor => decode_cbor(payload)?,
            PayloadCodec::Msgpack => match rmp_serde::from_slice::<Value>(payload) {
                Ok(value @ Value::Object(_)) => value,
                Ok(other) => {
                    // A CBOR map header misparses as a MsgPack fixstr, so a
                    // non-map reading is suspect: prefer a CBOR reading that
                    // yields a map, otherwise keep what MsgPack produced.
                    match decode_cbor(payload) {
                        Ok(value @ Value::Object(_)) => value,
                        _ => other,
                    }
                }
                Err(err) => {
                    debug!("msgpack decode failed, falling back to CBOR: {}", err);
                    decode_cbor(payload)?
                }
            },
        };
        Ok(normalise(value))
    }
}

impl fmt::Display for PayloadCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadCodec::Cbor => write!(f, "cbor"),
            PayloadCodec::Msgpack => write!(f, "msgpack"),
        }
    }
}

impl FromStr for PayloadCodec {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cbor" => Ok(PayloadCodec::Cbor),
            "msgpack" => Ok(PayloadCodec::Msgpack),
            other => Err(FrameError::codec(format!("unknown codec: {}", other))),
        }
    }
}

fn decode_cbor(payload: &[u8]) -> Result<Value> {
    serde_cbor::from_slice::<Value>(payload).map_err(FrameError::codec)
}

/// Payloads are expected to be maps keyed by `type`. Devices occasionally
/// send bare lists or scalars during bring-up; wrap those instead of
/// rejecting them so the handler sees a uniform shape.
fn normalise(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        Value::Array(items) => json!({ "list": items }),
        other => json!({ "value": other }),
    }
}
