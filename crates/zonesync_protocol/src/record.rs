//! Remote record model.

use crate::ids::RecordId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A value stored in a remote record field.
///
/// The remote schema has no native nullable date or decimal type; those
/// travel as `Bytes` produced by [`crate::encode_optional`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Explicitly cleared field.
    Null,
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 string.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// A single reference to another record.
    Reference(RecordId),
    /// A list of references to other records.
    ReferenceList(Vec<RecordId>),
    /// A list of strings.
    StringList(Vec<String>),
}

impl FieldValue {
    /// Returns the variant name, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Int(_) => "int",
            FieldValue::Double(_) => "double",
            FieldValue::Text(_) => "text",
            FieldValue::Bytes(_) => "bytes",
            FieldValue::Reference(_) => "reference",
            FieldValue::ReferenceList(_) => "reference list",
            FieldValue::StringList(_) => "string list",
        }
    }
}

/// Server-assigned bookkeeping attached to every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// The record's identity.
    pub record_id: RecordId,
    /// The record type (maps to a local entity).
    pub record_type: String,
    /// Server version tag; `None` until the record is first saved.
    pub change_tag: Option<String>,
    /// Server creation time in milliseconds since the epoch.
    pub created_at_ms: Option<i64>,
    /// Server modification time in milliseconds since the epoch.
    pub modified_at_ms: Option<i64>,
}

/// A typed record exchanged with the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    metadata: RecordMetadata,
    fields: BTreeMap<String, FieldValue>,
}

impl RemoteRecord {
    /// Creates a new, never-saved record.
    pub fn new(record_type: impl Into<String>, record_id: RecordId) -> Self {
        Self {
            metadata: RecordMetadata {
                record_id,
                record_type: record_type.into(),
                change_tag: None,
                created_at_ms: None,
                modified_at_ms: None,
            },
            fields: BTreeMap::new(),
        }
    }

    /// Creates a record with no fields from existing metadata.
    pub fn from_metadata(metadata: RecordMetadata) -> Self {
        Self {
            metadata,
            fields: BTreeMap::new(),
        }
    }

    /// Returns the record ID.
    pub fn record_id(&self) -> &RecordId {
        &self.metadata.record_id
    }

    /// Returns the record type.
    pub fn record_type(&self) -> &str {
        &self.metadata.record_type
    }

    /// Returns the server change tag.
    pub fn change_tag(&self) -> Option<&str> {
        self.metadata.change_tag.as_deref()
    }

    /// Returns the bookkeeping metadata.
    pub fn metadata(&self) -> &RecordMetadata {
        &self.metadata
    }

    /// Returns mutable bookkeeping metadata (used by servers).
    pub fn metadata_mut(&mut self) -> &mut RecordMetadata {
        &mut self.metadata
    }

    /// Gets a field value.
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Sets a field value.
    pub fn set(&mut self, field: impl Into<String>, value: FieldValue) {
        self.fields.insert(field.into(), value);
    }

    /// Removes a field, returning its previous value.
    pub fn remove(&mut self, field: &str) -> Option<FieldValue> {
        self.fields.remove(field)
    }

    /// Iterates over all fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns the names of all set fields.
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.keys().map(String::as_str).collect()
    }

    /// Copies every field of `other` onto this record.
    pub fn merge_fields_from(&mut self, other: &RemoteRecord) {
        for (name, value) in &other.fields {
            self.fields.insert(name.clone(), value.clone());
        }
    }
}
