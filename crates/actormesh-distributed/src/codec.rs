//! C7 — wire codec (spec §4.7): a length-prefixed, optionally HMAC-signed
//! JSON envelope. Framing and signing are independent concerns layered on
//! top of [`crate::value::Value`]'s tagged-JSON encoding.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BytesMut};
use hmac::{Hmac, Mac};
use serde_json::{json, Value as Json};
use sha2::Sha256;

use crate::error::ClusterError;
use crate::node::NodeId;
use crate::value::{canonical_json_bytes, Value};

/// 4-byte big-endian length prefix; payload (excluding the prefix itself)
/// may not exceed this.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
const LENGTH_PREFIX_BYTES: usize = 4;

type HmacSha256 = Hmac<Sha256>;

/// One message on the wire: an origin, a timestamp, an optional HMAC
/// signature over everything but the signature itself, and a payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub version: u8,
    pub from: NodeId,
    pub timestamp_ms: i64,
    pub signature: Option<String>,
    pub payload: Value,
}

impl Envelope {
    pub fn new(from: NodeId, timestamp_ms: i64, payload: Value) -> Self {
        Envelope {
            version: 1,
            from,
            timestamp_ms,
            signature: None,
            payload,
        }
    }

    fn unsigned_json(&self) -> Json {
        json!({
            "version": self.version,
            "from": self.from.as_str(),
            "timestamp": self.timestamp_ms,
            "payload": self.payload.to_json(),
        })
    }

    fn to_json(&self) -> Json {
        let mut obj = self.unsigned_json();
        if let (Some(sig), Json::Object(map)) = (&self.signature, &mut obj) {
            map.insert("signature".to_string(), Json::String(sig.clone()));
        }
        obj
    }

    /// Signs with `secret`, replacing any existing signature.
    pub fn sign(&mut self, secret: &[u8]) {
        self.signature = Some(sign_bytes(secret, &canonical_json_bytes(&self.unsigned_json())));
    }

    /// Verifies the envelope's signature against `secret`. An envelope
    /// with no signature verifies only when `require_signature` is false.
    pub fn verify(&self, secret: &[u8], require_signature: bool) -> bool {
        match &self.signature {
            Some(sig) => {
                let expected = sign_bytes(secret, &canonical_json_bytes(&self.unsigned_json()));
                constant_time_eq(sig.as_bytes(), expected.as_bytes())
            }
            None => !require_signature,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ClusterError> {
        serde_json::to_vec(&self.to_json())
            .map_err(|e| ClusterError::SerializationError(format!("envelope encode: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ClusterError> {
        let json: Json = serde_json::from_slice(bytes)
            .map_err(|e| ClusterError::SerializationError(format!("envelope decode: {e}")))?;
        let obj = json
            .as_object()
            .ok_or_else(|| ClusterError::SerializationError("envelope is not an object".to_string()))?;

        let version = obj
            .get("version")
            .and_then(Json::as_u64)
            .ok_or_else(|| ClusterError::SerializationError("envelope missing version".to_string()))?
            as u8;
        let from = obj
            .get("from")
            .and_then(Json::as_str)
            .ok_or_else(|| ClusterError::SerializationError("envelope missing from".to_string()))?
            .parse::<NodeId>()
            .map_err(|e| ClusterError::SerializationError(format!("envelope from: {e}")))?;
        let timestamp_ms = obj
            .get("timestamp")
            .and_then(Json::as_i64)
            .ok_or_else(|| ClusterError::SerializationError("envelope missing timestamp".to_string()))?;
        let signature = obj.get("signature").and_then(Json::as_str).map(str::to_string);
        let payload = obj
            .get("payload")
            .ok_or_else(|| ClusterError::SerializationError("envelope missing payload".to_string()))?;
        let payload = Value::from_json(payload)
            .map_err(|e| ClusterError::SerializationError(format!("envelope payload: {e}")))?;

        Ok(Envelope {
            version,
            from,
            timestamp_ms,
            signature,
            payload,
        })
    }
}

/// Wall-clock milliseconds since the Unix epoch, for the envelope's
/// `timestamp` field.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

fn sign_bytes(secret: &[u8], message: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts a key of any length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Appends `frame`'s 4-byte big-endian length prefix and body to `out`.
/// Rejects frames over [`MAX_FRAME_BYTES`] rather than writing a
/// corrupt/un-decodable length.
pub fn encode_frame(frame: &[u8], out: &mut Vec<u8>) -> Result<(), ClusterError> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(ClusterError::SerializationError(format!(
            "frame of {} bytes exceeds the {} byte limit",
            frame.len(),
            MAX_FRAME_BYTES
        )));
    }
    out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
    out.extend_from_slice(frame);
    Ok(())
}

/// Drains every complete frame currently sitting in `buf`, leaving any
/// trailing partial frame in place for the next read. A length prefix that
/// claims more than [`MAX_FRAME_BYTES`] is a protocol violation.
pub fn decode_frames(buf: &mut BytesMut) -> Result<Vec<Vec<u8>>, ClusterError> {
    let mut frames = Vec::new();
    loop {
        if buf.len() < LENGTH_PREFIX_BYTES {
            return Ok(frames);
        }
        let len = u32::from_be_bytes(buf[..LENGTH_PREFIX_BYTES].try_into().unwrap()) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(ClusterError::SerializationError(format!(
                "incoming frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte limit"
            )));
        }
        if buf.len() < LENGTH_PREFIX_BYTES + len {
            return Ok(frames);
        }
        buf.advance(LENGTH_PREFIX_BYTES);
        frames.push(buf.split_to(len).to_vec());
    }
}
