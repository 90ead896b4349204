//! Pluggable wire encoding (SPEC_FULL.md §4.1).
//!
//! Both backends decode into the same in-memory representation
//! ([`crate::payload::Payload`], itself a `serde_json::Value`), so the rest
//! of the bus never branches on which backend is active.

use crate::config::SerializerKind;
use crate::error::{DecodeError, EncodeError};
use crate::payload::Payload;

/// Encodes and decodes [`Payload`] values for the wire.
///
/// Implementations are chosen once at bus construction; both ends of a
/// link must agree on the backend.
pub trait Serializer: Send + Sync {
    /// Serialize a payload to bytes.
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, EncodeError>;
    /// Deserialize bytes into a payload.
    fn decode(&self, bytes: &[u8]) -> Result<Payload, DecodeError>;
}

/// Standard JSON encoding, UTF-8, non-ASCII preserved.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, EncodeError> {
        Ok(serde_json::to_vec(payload.as_value())?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payload, DecodeError> {
        let value = serde_json::from_slice(bytes)?;
        Ok(Payload::new(value))
    }
}

/// MessagePack encoding via `rmp-serde`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FastSerializer;

impl Serializer for FastSerializer {
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, EncodeError> {
        Ok(rmp_serde::to_vec(payload.as_value())?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payload, DecodeError> {
        let value = rmp_serde::from_slice(bytes)?;
        Ok(Payload::new(value))
    }
}

/// Construct the serializer backend named by `kind`.
pub fn for_kind(kind: SerializerKind) -> Box<dyn Serializer> {
    match kind {
        SerializerKind::Json => Box::new(JsonSerializer),
        SerializerKind::Fast => Box::new(FastSerializer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn roundtrip(serializer: &dyn Serializer) {
        let payload = Payload::new(json!({
            "topic": "ticks",
            "data": {"symbol": "AAPL", "price": 190.25},
            "ts": 1_700_000_000_u64,
        }));
        let encoded = serializer.encode(&payload).unwrap();
        let decoded = serializer.decode(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn json_roundtrips() {
        roundtrip(&JsonSerializer);
    }

    #[test]
    fn fast_roundtrips() {
        roundtrip(&FastSerializer);
    }

    #[test]
    fn json_decode_error_on_garbage() {
        let err = JsonSerializer.decode(b"not json").unwrap_err();
        assert!(matches!(err, DecodeError::Json(_)));
    }

    #[test]
    fn fast_decode_error_on_garbage() {
        let err = FastSerializer.decode(&[0xc1, 0xc1, 0xc1]).unwrap_err();
        assert!(matches!(err, DecodeError::MessagePack(_)));
    }

    #[test]
    fn for_kind_selects_backend() {
        let json = for_kind(SerializerKind::Json);
        let fast = for_kind(SerializerKind::Fast);
        let payload = Payload::new(json!({"x": 1}));
        assert_eq!(
            json.decode(&json.encode(&payload).unwrap()).unwrap(),
            payload
        );
        assert_eq!(
            fast.decode(&fast.encode(&payload).unwrap()).unwrap(),
            payload
        );
    }
}
