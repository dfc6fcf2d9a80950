//! Error types for the sync engine.

use thiserror::Error;
use zonesync_protocol::{CodecError, DatabaseScope, RemoteError, ZoneId};
use zonesync_store::{ObjectId, StoreError};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote record store reported an error.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The local object store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A bookkeeping blob or encoded value could not be processed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// More than one sync state row exists for the same scope or zone.
    #[error("duplicate sync state in scope {scope} (zone: {zone_id:?})")]
    DuplicateSyncState {
        /// Scope of the duplicated row.
        scope: DatabaseScope,
        /// Zone of the duplicated row; `None` for the database row.
        zone_id: Option<ZoneId>,
    },

    /// A record could not be converted to or from a local object.
    #[error("cannot translate {record_type} record {record_id}: {message}")]
    Translation {
        /// Record type being translated.
        record_type: String,
        /// Record being translated.
        record_id: String,
        /// What went wrong.
        message: String,
    },

    /// No translator is registered for the record type.
    #[error("no translator registered for record type {0}")]
    UnknownRecordType(String),

    /// An object's remote identity was about to change.
    #[error("remote identity of object {object_id} cannot be reassigned")]
    IdentityReassigned {
        /// The object.
        object_id: ObjectId,
    },

    /// An object would carry system fields without a remote record ID.
    #[error("object {object_id} has system fields but no remote record ID")]
    MissingRemoteIdentity {
        /// The object.
        object_id: ObjectId,
    },

    /// A change feed closed without its terminal event.
    #[error("change feed closed before completion")]
    FeedInterrupted,
}

impl SyncError {
    /// Creates a translation error.
    pub fn translation(
        record_type: impl Into<String>,
        record_id: impl ToString,
        message: impl Into<String>,
    ) -> Self {
        Self::Translation {
            record_type: record_type.into(),
            record_id: record_id.to_string(),
            message: message.into(),
        }
    }

    /// Returns true for corrupt local sync state; never worth retrying.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            SyncError::DuplicateSyncState { .. }
                | SyncError::IdentityReassigned { .. }
                | SyncError::MissingRemoteIdentity { .. }
        )
    }

    /// Returns true if a save lost against a newer server copy.
    pub fn is_conflict(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_conflict(),
            _ => false,
        }
    }

    /// Returns true if the same operation may succeed later unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_retryable(),
            SyncError::FeedInterrupted => true,
            _ => false,
        }
    }

    /// Returns the remote error, if this is one.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            SyncError::Remote(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zonesync_protocol::RemoteErrorCode;

    #[test]
    fn classification() {
        let duplicate = SyncError::DuplicateSyncState {
            scope: DatabaseScope::Private,
            zone_id: Some(ZoneId::new("Collection")),
        };
        assert!(duplicate.is_structural());
        assert!(!duplicate.is_retryable());

        let conflict = SyncError::from(RemoteError::new(
            RemoteErrorCode::ServerRecordChanged,
            "tag mismatch",
        ));
        assert!(conflict.is_conflict());
        assert!(!conflict.is_retryable());
        assert!(!conflict.is_structural());

        let offline = SyncError::from(RemoteError::new(RemoteErrorCode::NetworkUnavailable, ""));
        assert!(offline.is_retryable());
        assert!(SyncError::FeedInterrupted.is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::translation("Book", "Collection/b1", "pages must be int");
        assert_eq!(
            err.to_string(),
            "cannot translate Book record Collection/b1: pages must be int"
        );
        assert_eq!(
            SyncError::UnknownRecordType("Lamp".into()).to_string(),
            "no translator registered for record type Lamp"
        );
    }
}
