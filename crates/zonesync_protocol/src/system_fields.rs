//! Opaque per-record bookkeeping blob.

use crate::error::{CodecError, CodecResult};
use crate::record::{RecordMetadata, RemoteRecord};
use serde::{Deserialize, Serialize};

/// Current blob layout version.
const FORMAT_VERSION: u8 = 1;

/// The server bookkeeping of a record, archived as bytes.
///
/// Only metadata (identity, type, change tag, timestamps) is archived; field
/// values are never part of the blob. Decoding yields an empty record that
/// can be filled with just the fields that changed locally and sent back
/// with the server's change tag intact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemFields(Vec<u8>);

impl SystemFields {
    /// Archives the bookkeeping of `record`.
    pub fn encode(record: &RemoteRecord) -> CodecResult<Self> {
        let mut bytes = vec![FORMAT_VERSION];
        ciborium::into_writer(record.metadata(), &mut bytes)
            .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Rebuilds an empty record carrying the archived bookkeeping.
    pub fn decode(&self) -> CodecResult<RemoteRecord> {
        let (version, body) = self
            .0
            .split_first()
            .ok_or_else(|| CodecError::decoding_failed("empty system fields"))?;
        if *version != FORMAT_VERSION {
            return Err(CodecError::decoding_failed(format!(
                "unsupported system fields version {version}"
            )));
        }
        let metadata: RecordMetadata = ciborium::from_reader(body)
            .map_err(|e| CodecError::decoding_failed(e.to_string()))?;
        Ok(RemoteRecord::from_metadata(metadata))
    }

    /// Wraps previously archived bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the archived bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the blob, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}
