//! Default wire codec.
//!
//! Each wire message carries one flushed batch of elements: a fixed 6-byte
//! binary header followed by a JSON array.
//!
//! ```text
//! +-------+-------+-------------------+-----------------------------+
//! | magic | ver   | payload_len (u32) | payload (payload_len bytes) |
//! | 0x53  | 0x01  | big-endian        | UTF-8 JSON array            |
//! +-------+-------+-------------------+-----------------------------+
//!   1 byte  1 byte      4 bytes          variable
//!                  ← fixed 6 bytes →
//! ```

use seclay_domain::{Element, ElementCodec, Result, SeclayError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic byte, 'S' for seclay.  Lets the receiver detect misaligned reads.
pub const MAGIC: u8 = 0x53;

/// Wire format version.  Bump when the fixed header layout changes.
pub const VERSION: u8 = 0x01;

/// Fixed header size in bytes: magic(1) + ver(1) + payload_len(4).
pub const FIXED_HEADER_LEN: usize = 6;

/// Largest payload either side will produce or accept.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

// ---

impl ElementCodec for JsonCodec {
    // ---
    fn encode(&self, elements: &[Element]) -> Result<Vec<u8>> {
        // ---
        let payload = serde_json::to_vec(elements)
            .map_err(|e| SeclayError::Codec(format!("serialize error: {e}")))?;

        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(SeclayError::Codec(format!(
                "batch of {} elements encodes to {} bytes, limit is {MAX_PAYLOAD_LEN}",
                elements.len(),
                payload.len()
            )));
        }
        let payload_len = payload.len() as u32;

        let mut message = Vec::with_capacity(FIXED_HEADER_LEN + payload.len());
        message.push(MAGIC);
        message.push(VERSION);
        message.extend_from_slice(&payload_len.to_be_bytes());
        message.extend_from_slice(&payload);

        Ok(message)
    }

    // ---

    fn decode(&self, message: &[u8]) -> Result<Vec<Element>> {
        // ---
        if message.len() < FIXED_HEADER_LEN {
            return Err(SeclayError::Codec(format!(
                "short message: {} bytes, header needs {FIXED_HEADER_LEN}",
                message.len()
            )));
        }

        if message[0] != MAGIC {
            return Err(SeclayError::Codec(format!(
                "bad magic: expected 0x{MAGIC:02X}, got 0x{:02X}",
                message[0]
            )));
        }

        if message[1] != VERSION {
            return Err(SeclayError::Codec(format!(
                "unsupported version: expected {VERSION}, got {}",
                message[1]
            )));
        }

        let payload_len =
            u32::from_be_bytes([message[2], message[3], message[4], message[5]]) as usize;

        if payload_len > MAX_PAYLOAD_LEN {
            return Err(SeclayError::Codec(format!(
                "payload length {payload_len} exceeds limit {MAX_PAYLOAD_LEN}"
            )));
        }

        let payload = &message[FIXED_HEADER_LEN..];
        if payload.len() != payload_len {
            return Err(SeclayError::Codec(format!(
                "payload length mismatch: header says {payload_len}, got {}",
                payload.len()
            )));
        }

        serde_json::from_slice(payload)
            .map_err(|e| SeclayError::Codec(format!("deserialize error: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
