//! Identifiers used by the remote record store.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A database scope on the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DatabaseScope {
    /// The user's private database.
    Private,
    /// Records other users shared with this user.
    Shared,
    /// The application's public database.
    Public,
}

impl DatabaseScope {
    /// Returns the stable name used when persisting the scope.
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseScope::Private => "private",
            DatabaseScope::Shared => "shared",
            DatabaseScope::Public => "public",
        }
    }

    /// Parses a persisted scope name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "private" => Some(DatabaseScope::Private),
            "shared" => Some(DatabaseScope::Shared),
            "public" => Some(DatabaseScope::Public),
            _ => None,
        }
    }
}

impl fmt::Display for DatabaseScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a remote zone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZoneId(String);

impl ZoneId {
    /// Creates a zone ID from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the zone name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a remote record: a record name unique within its zone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId {
    /// Zone the record lives in.
    pub zone_id: ZoneId,
    /// Record name within the zone.
    pub record_name: String,
}

impl RecordId {
    /// Creates a record ID from a zone and a record name.
    pub fn new(zone_id: ZoneId, record_name: impl Into<String>) -> Self {
        Self {
            zone_id,
            record_name: record_name.into(),
        }
    }

    /// Mints a fresh, globally unique record ID in the given zone.
    pub fn generate(zone_id: ZoneId) -> Self {
        Self::new(zone_id, Uuid::new_v4().to_string())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.zone_id, self.record_name)
    }
}

/// Opaque cursor marking how far a change feed has been consumed.
///
/// The engine never looks inside a token; it only stores the bytes and
/// hands them back to the server.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeToken(Vec<u8>);

impl ChangeToken {
    /// Wraps raw token bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the token, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeToken(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Identifier of a remote change subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Creates a subscription ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the subscription ID as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a long-lived remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Creates a new random operation ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an operation ID from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn to_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_names_roundtrip() {
        for scope in [
            DatabaseScope::Private,
            DatabaseScope::Shared,
            DatabaseScope::Public,
        ] {
            assert_eq!(DatabaseScope::from_name(scope.as_str()), Some(scope));
        }
        assert_eq!(DatabaseScope::from_name("global"), None);
    }

    #[test]
    fn generated_record_ids_are_unique() {
        let zone = ZoneId::new("Collection");
        let a = RecordId::generate(zone.clone());
        let b = RecordId::generate(zone.clone());
        assert_ne!(a, b);
        assert_eq!(a.zone_id, zone);
    }

    #[test]
    fn record_id_display() {
        let id = RecordId::new(ZoneId::new("Collection"), "book-1");
        assert_eq!(id.to_string(), "Collection/book-1");
    }

    #[test]
    fn change_token_debug_is_hex() {
        let token = ChangeToken::from_bytes(vec![0x01, 0xab]);
        assert_eq!(format!("{token:?}"), "ChangeToken(01ab)");
    }
}
