//! Consistent Overhead Byte Stuffing.
//!
//! Stuffed output contains no `0x00` until the single terminator byte that
//! ends every frame, so the serial reader can split its buffer on zeros.

use crate::error::{FrameError, Result};

/// Code value marking a full group: 254 data bytes with no implied zero.
const MAX_GROUP: u8 = 0xFF;

/// Stuff `data` into a COBS frame, terminator included.
///
/// Empty input encodes as `[0x01, 0x00]`.
pub fn encode(data: &[u8]) -> Vec<u8> {
    // Worst case: one extra code byte per 254 data bytes, plus terminator.
    let mut out = Vec::with_capacity(data.len() + data.len() / 254 + 2);
    let mut code_at = 0usize;
    out.push(0);
    let mut code: u8 = 1;
    for &byte in data {
        if byte == 0 {
            out[code_at] = code;
            code_at = out.len();
            out.push(0);
            code = 1;
        } else {
            out.push(byte);
            code += 1;
            if code == MAX_GROUP {
                out[code_at] = code;
                code_at = out.len();
                out.push(0);
                code = 1;
            }
        }
    }
    out[code_at] = code;
    out.push(0);
    out
}

/// Unstuff one COBS frame. The trailing terminator must be present.
///
/// Rejects a zero length code and any group that would overrun the frame.
pub fn decode(data: &[u8]) -> Result<Vec<u8>> {
    let Some((&terminator, body)) = data.split_last() else {
        return Err(FrameError::cobs("empty frame"));
    };
    if terminator != 0 {
        return Err(FrameError::cobs("missing frame terminator"));
    }
    let mut out = Vec::with_capacity(body.len());
    let mut idx = 0usize;
    while idx < body.len() {
        let code = body[idx] as usize;
        if code == 0 {
            return Err(FrameError::cobs("zero length code inside frame"));
        }
        idx += 1;
        let end = idx + code - 1;
        if end > body.len() {
            return Err(FrameError::cobs("length code overruns frame"));
        }
        out.extend_from_slice(&body[idx..end]);
        idx = end;
        if code < MAX_GROUP as usize && idx < body.len() {
            out.push(0);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};

    #[test]
    fn empty_input() {
        assert_eq!(encode(&[]), vec![0x01, 0x00]);
        assert_eq!(decode(&[0x01, 0x00]).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn known_vectors() {
        assert_eq!(encode(&[0x00]), vec![0x01, 0x01, 0x00]);
        assert_eq!(encode(&[0x11, 0x22, 0x00, 0x33]), vec![0x03, 0x11, 0x22, 0x02, 0x33, 0x00]);
        assert_eq!(encode(&[0x11, 0x00, 0x00, 0x00]), vec![0x02, 0x11, 0x01, 0x01, 0x01, 0x00]);
    }

    #[test]
    fn long_runs_split_at_254() {
        let data = vec![0x42u8; 254];
        let encoded = encode(&data);
        assert_eq!(encoded[0], 0xFF);
        assert_eq!(decode(&encoded).unwrap(), data);

        let data = vec![0x42u8; 255];
        assert_eq!(decode(&encode(&data)).unwrap(), data);
    }

    #[test]
    fn round_trip_random_buffers() {
        let mut rng = StdRng::seed_from_u64(0x5EED);
        for _ in 0..64 {
            let len = rng.gen_range(0..4096);
            let mut data = vec![0u8; len];
            rng.fill_bytes(&mut data);
            assert_eq!(decode(&encode(&data)).unwrap(), data);
        }
        // One large buffer to exercise many group boundaries.
        let mut big = vec![0u8; 1 << 20];
        rng.fill_bytes(&mut big);
        assert_eq!(decode(&encode(&big)).unwrap(), big);
    }

    #[test]
    fn no_interior_zero_ever() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..32 {
            let len = rng.gen_range(0..1024);
            let mut data = vec![0u8; len];
            rng.fill_bytes(&mut data);
            let encoded = encode(&data);
            assert!(!encoded[..encoded.len() - 1].contains(&0));
        }
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[0x02, 0x11]).is_err(), "missing terminator");
        assert!(decode(&[0x00, 0x11, 0x00]).is_err(), "zero code");
        assert!(decode(&[0x05, 0x11, 0x00]).is_err(), "overrun");
    }
}
