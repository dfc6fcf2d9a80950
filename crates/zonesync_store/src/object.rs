//! Managed objects and their identifiers.

use crate::value::AttributeValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a managed object.
///
/// Object IDs are 128-bit UUIDs that are:
/// - Unique within a store
/// - Immutable once assigned
/// - Never reused
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId([u8; 16]);

impl ObjectId {
    /// Creates a new random object ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Creates an object ID from raw bytes.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Converts to a UUID.
    #[must_use]
    pub fn to_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.0)
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_uuid())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uuid())
    }
}

/// An object in the store: an entity name, typed attributes and to-many
/// relationships to other objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedObject {
    id: ObjectId,
    entity: String,
    attributes: BTreeMap<String, AttributeValue>,
    relationships: BTreeMap<String, BTreeSet<ObjectId>>,
    version: u64,
}

impl ManagedObject {
    pub(crate) fn new(id: ObjectId, entity: &str) -> Self {
        Self {
            id,
            entity: entity.to_string(),
            attributes: BTreeMap::new(),
            relationships: BTreeMap::new(),
            version: 0,
        }
    }

    /// Returns the object ID.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Returns the entity name.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Returns the committed version; bumped on every commit that changes
    /// the object.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Gets an attribute value.
    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    /// Gets a text attribute.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(AttributeValue::as_text)
    }

    /// Gets a bytes attribute.
    pub fn bytes(&self, key: &str) -> Option<&[u8]> {
        self.get(key).and_then(AttributeValue::as_bytes)
    }

    /// Gets a bool attribute, treating an absent value as `false`.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key)
            .and_then(AttributeValue::as_bool)
            .unwrap_or(false)
    }

    /// Gets the targets of a to-many relationship.
    pub fn related(&self, key: &str) -> Option<&BTreeSet<ObjectId>> {
        self.relationships.get(key)
    }

    /// Iterates over all attributes.
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Sets or clears an attribute. Returns true if the value changed.
    pub(crate) fn set_attribute(&mut self, key: &str, value: Option<AttributeValue>) -> bool {
        match value {
            Some(value) => {
                if self.attributes.get(key) == Some(&value) {
                    return false;
                }
                self.attributes.insert(key.to_string(), value);
                true
            }
            None => self.attributes.remove(key).is_some(),
        }
    }

    /// Replaces a relationship's targets. Returns true if they changed.
    pub(crate) fn set_relationship(&mut self, key: &str, targets: BTreeSet<ObjectId>) -> bool {
        if self.relationships.get(key) == Some(&targets) {
            return false;
        }
        if targets.is_empty() && !self.relationships.contains_key(key) {
            return false;
        }
        self.relationships.insert(key.to_string(), targets);
        true
    }

    /// Copies the given keys from `source`, attribute and relationship alike.
    pub(crate) fn overlay(&mut self, source: &ManagedObject, keys: &BTreeSet<String>) {
        for key in keys {
            match source.attributes.get(key) {
                Some(value) => {
                    self.attributes.insert(key.clone(), value.clone());
                }
                None => {
                    self.attributes.remove(key);
                }
            }
            match source.relationships.get(key) {
                Some(targets) => {
                    self.relationships.insert(key.clone(), targets.clone());
                }
                None => {
                    self.relationships.remove(key);
                }
            }
        }
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}
