//! Object-serialization collaborator: structured values in, byte buffers out.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CodecError;

/// An application value traveling over a data connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Bytes),
    Text(String),
    Json(Value),
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Bytes(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(value))
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

/// Binary codec capability consumed by data connections in the binary
/// serialization modes.
pub trait Codec: Send + Sync {
    fn encode(&self, payload: &Payload) -> Result<Bytes, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<Payload, CodecError>;
}

/// bincode is not self-describing, so JSON values travel as their text
/// rendering inside the bincode envelope.
#[derive(Serialize, Deserialize)]
enum WireValue<'a> {
    Bytes(&'a [u8]),
    Text(&'a str),
    Json(String),
}

#[derive(Serialize, Deserialize)]
enum OwnedWireValue {
    Bytes(Vec<u8>),
    Text(String),
    Json(String),
}

/// Default codec: serde + bincode.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode(&self, payload: &Payload) -> Result<Bytes, CodecError> {
        let wire = match payload {
            Payload::Bytes(b) => WireValue::Bytes(b),
            Payload::Text(s) => WireValue::Text(s),
            Payload::Json(v) => WireValue::Json(
                serde_json::to_string(v).map_err(|err| CodecError::Encode(err.to_string()))?,
            ),
        };
        bincode::serialize(&wire)
            .map(Bytes::from)
            .map_err(|err| CodecError::Encode(err.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payload, CodecError> {
        let wire: OwnedWireValue =
            bincode::deserialize(bytes).map_err(|err| CodecError::Decode(err.to_string()))?;
        Ok(match wire {
            OwnedWireValue::Bytes(b) => Payload::Bytes(Bytes::from(b)),
            OwnedWireValue::Text(s) => Payload::Text(s),
            OwnedWireValue::Json(s) => Payload::Json(
                serde_json::from_str(&s).map_err(|err| CodecError::Decode(err.to_string()))?,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_variants_round_trip() {
        let codec = BincodeCodec;
        for payload in [
            Payload::Bytes(Bytes::from_static(&[0, 1, 2, 0xFF])),
            Payload::Text("hëllo".into()),
            Payload::Json(json!({"k": [1, 2, 3], "nested": {"ok": true}})),
        ] {
            let encoded = codec.encode(&payload).expect("encode");
            let decoded = codec.decode(&encoded).expect("decode");
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn encoded_output_never_collides_with_chunk_marker() {
        let codec = BincodeCodec;
        let encoded = codec
            .encode(&Payload::Bytes(Bytes::from(vec![0xCD; 64])))
            .expect("encode");
        assert_ne!(encoded[0], crate::connection::chunk::CHUNK_MARKER);
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(BincodeCodec.decode(&[0xFF; 3]).is_err());
    }
}
