//! Length-prefixed encoding for nullable values.
//!
//! The remote schema cannot express a nullable date or decimal, so such
//! values are stored in a bytes field as a big-endian `u32` length followed
//! by that many bytes of CBOR. A zero length means "no value".

use crate::error::{CodecError, CodecResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Encodes an optional value into its length-prefixed form.
pub fn encode_optional<T: Serialize>(value: Option<&T>) -> CodecResult<Vec<u8>> {
    let Some(value) = value else {
        return Ok(vec![0; LENGTH_PREFIX_BYTES]);
    };

    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| CodecError::encoding_failed("payload exceeds u32 length"))?;

    let mut bytes = Vec::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Decodes a value produced by [`encode_optional`].
pub fn decode_optional<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<Option<T>> {
    if bytes.len() < LENGTH_PREFIX_BYTES {
        return Err(CodecError::decoding_failed("missing length prefix"));
    }
    let (prefix, payload) = bytes.split_at(LENGTH_PREFIX_BYTES);
    let declared = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;

    if declared != payload.len() {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }
    if declared == 0 {
        return Ok(None);
    }

    ciborium::from_reader(payload)
        .map(Some)
        .map_err(|e| CodecError::decoding_failed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn none_is_a_bare_zero_prefix() {
        let bytes = encode_optional::<i64>(None).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        assert_eq!(decode_optional::<i64>(&bytes).unwrap(), None);
    }

    #[test]
    fn prefix_counts_payload() {
        let bytes = encode_optional(Some(&1_700_000_000_000i64)).unwrap();
        let declared = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(declared, bytes.len() - LENGTH_PREFIX_BYTES);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut bytes = encode_optional(Some(&"12.50".to_string())).unwrap();
        bytes.pop();
        assert!(matches!(
            decode_optional::<String>(&bytes),
            Err(CodecError::LengthMismatch { .. })
        ));
        assert!(decode_optional::<String>(&[0, 0]).is_err());
    }

    proptest! {
        #[test]
        fn optional_timestamps_survive(value in proptest::option::of(any::<i64>())) {
            let bytes = encode_optional(value.as_ref()).unwrap();
            prop_assert_eq!(decode_optional::<i64>(&bytes).unwrap(), value);
        }
    }
}
