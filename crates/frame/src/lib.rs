//! Serial frame codec for the gateway <-> co-processor link.
//!
//! A frame on the wire is `COBS(payload ‖ CRC16_BE(payload))` followed by a
//! single `0x00` terminator. The payload itself is a map encoded with either
//! CBOR or MsgPack, selected per bridge (never per frame).
//!
//! Public API:
//!   - [`encode_frame`] / [`decode_frame`]
//!   - [`PayloadCodec`] — the per-bridge payload encoding
//!   - [`SerialMessage`] and the typed payload schemas in [`message`]

pub mod cobs;
pub mod codec;
pub mod error;
pub mod message;

use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_16_IBM_3740};
use serde_json::Value;

pub use codec::PayloadCodec;
pub use error::{FrameError, Result};
pub use message::{
    command_frame, pair_begin_message, pair_end_message, ping_message, set_mac_message,
    time_sync_message, AckPayload, CommandPayload, CommandStep, SerialMessage, TelemetryMetrics,
    TelemetryPayload, Timestamp,
};

/// CRC16-CCITT: poly 0x1021, init 0xFFFF, no reflection, no xorout.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Checksum over the payload bytes before byte stuffing.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Encode a payload map into a complete wire frame (terminator included).
pub fn encode_frame(codec: PayloadCodec, payload: &Value) -> Result<Bytes> {
    let body = codec.encode(payload)?;
    let mut buf = BytesMut::with_capacity(body.len() + 2);
    buf.extend_from_slice(&body);
    buf.put_u16(crc16(&body));
    Ok(Bytes::from(cobs::encode(&buf)))
}

/// Decode one wire frame (terminator included) back into a payload map.
///
/// The frame is unstuffed, the trailing big-endian CRC16 is verified against
/// the payload bytes, and the payload is decoded with the configured codec
/// (with the MsgPack -> CBOR fallback for inbound traffic).
pub fn decode_frame(codec: PayloadCodec, frame: &[u8]) -> Result<Value> {
    let unstuffed = cobs::decode(frame)?;
    if unstuffed.len() < 2 {
        return Err(FrameError::truncated(unstuffed.len()));
    }
    let (payload, trailer) = unstuffed.split_at(unstuffed.len() - 2);
    let found = u16::from_be_bytes([trailer[0], trailer[1]]);
    let expected = crc16(payload);
    if found != expected {
        return Err(FrameError::CrcMismatch { expected, found });
    }
    codec.decode(payload)
}

/// Format a UTC timestamp the way the co-processor and cloud expect it:
/// second precision, `Z` suffix.
pub fn isoformat(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn crc16_is_stable() {
        // Reference value for the CCITT-FALSE parameters over "123456789".
        assert_eq!(crc16(b"123456789"), 0x29B1);
        assert_eq!(crc16(b""), 0xFFFF);
        assert_eq!(crc16(b"123456789"), crc16(b"123456789"));
    }

    #[test]
    fn frame_round_trip_both_codecs() {
        let payload = json!({
            "type": "telemetry",
            "asset_id": "A-PP-01",
            "metrics": {"t_c": 27.5, "rh": 61.0},
        });
        for codec in [PayloadCodec::Cbor, PayloadCodec::Msgpack] {
            let frame = encode_frame(codec, &payload).unwrap();
            assert_eq!(*frame.last().unwrap(), 0, "frame must end with terminator");
            assert!(
                !frame[..frame.len() - 1].contains(&0),
                "stuffed frame must contain no interior zero"
            );
            let decoded = decode_frame(codec, &frame).unwrap();
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn altered_payload_is_rejected() {
        let payload = json!({"type": "status", "status": "ok"});
        let frame = encode_frame(PayloadCodec::Cbor, &payload).unwrap();
        let mut corrupted = frame.to_vec();
        // Flip a bit somewhere in the stuffed body, keeping the terminator.
        corrupted[2] ^= 0x20;
        let err = decode_frame(PayloadCodec::Cbor, &corrupted).unwrap_err();
        assert!(matches!(
            err,
            FrameError::CrcMismatch { .. } | FrameError::Cobs(_) | FrameError::Codec(_)
        ));
    }

    #[test]
    fn short_frame_is_truncated() {
        // COBS of a single byte: too short to hold payload + CRC16.
        let frame = cobs::encode(&[0x42]);
        assert!(matches!(
            decode_frame(PayloadCodec::Cbor, &frame),
            Err(FrameError::Truncated(_))
        ));
    }
}
