//! CBOR serialization helpers for the Veil wire protocol.
//!
//! Wraps [`ciborium`] to provide serialization and deserialization of
//! handshake payloads to/from CBOR (RFC 8949).

use serde::{de::DeserializeOwned, Serialize};

use crate::TransportError;

/// Serialize a value to CBOR bytes.
///
/// # Errors
///
/// Returns [`TransportError::Serialization`] if the value cannot be
/// serialized.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| TransportError::Serialization(format!("CBOR serialization failed: {e}")))?;
    Ok(buf)
}

/// Deserialize a value from CBOR bytes.
///
/// # Errors
///
/// Returns [`TransportError::Deserialization`] if the bytes cannot be
/// deserialized into the target type.
pub fn from_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T, TransportError> {
    ciborium::from_reader(data)
        .map_err(|e| TransportError::Deserialization(format!("CBOR deserialization failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        a: u32,
        b: Vec<u8>,
    }

    #[test]
    fn test_round_trip() {
        let v = Sample {
            a: 7,
            b: vec![1, 2, 3],
        };
        let bytes = to_vec(&v).expect("serialize");
        let parsed: Sample = from_slice(&bytes).expect("parse");
        assert_eq!(v, parsed);
    }

    #[test]
    fn test_garbage_rejected() {
        let r: Result<Sample, _> = from_slice(&[0xff, 0x00, 0x13]);
        assert!(r.is_err());
    }
}
