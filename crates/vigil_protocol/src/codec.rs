//! CBOR encoding helpers.
//!
//! Snapshots are stored as CBOR: compact, schema-less and tolerant of
//! fields added in later versions.

use crate::error::{CodecError, CodecResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a value as CBOR.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if serialization fails.
pub fn to_cbor<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(out)
}

/// Decodes a value from CBOR.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] if the bytes are not valid CBOR for `T`.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
        tags: Vec<String>,
    }

    #[test]
    fn cbor_roundtrip() {
        let sample = Sample {
            name: "vigil".into(),
            count: 3,
            tags: vec!["a".into(), "b".into()],
        };
        let bytes = to_cbor(&sample).unwrap();
        let back: Sample = from_cbor(&bytes).unwrap();
        assert_eq!(back, sample);
    }

    #[test]
    fn garbage_fails_to_decode() {
        let result: CodecResult<Sample> = from_cbor(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn truncated_fails_to_decode() {
        let bytes = to_cbor(&Sample {
            name: "truncated".into(),
            count: 1,
            tags: vec![],
        })
        .unwrap();
        let result: CodecResult<Sample> = from_cbor(&bytes[..bytes.len() - 3]);
        assert!(result.is_err());
    }
}
