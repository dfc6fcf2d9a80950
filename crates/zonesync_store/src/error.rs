//! Error types for the object store.

use crate::object::ObjectId;
use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error while persisting or loading.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The persisted snapshot could not be encoded or decoded.
    #[error("snapshot codec error: {message}")]
    Codec {
        /// Description of the codec failure.
        message: String,
    },

    /// Object not found.
    #[error("object not found: {object_id}")]
    ObjectNotFound {
        /// The missing object.
        object_id: ObjectId,
    },

    /// The object was already deleted in this transaction.
    #[error("object {object_id} was deleted in this transaction")]
    ObjectDeleted {
        /// The deleted object.
        object_id: ObjectId,
    },

    /// Another commit changed the object since this transaction read it.
    #[error("merge conflict on object {object_id}")]
    MergeConflict {
        /// The conflicting object.
        object_id: ObjectId,
    },

    /// Another process holds the store file.
    #[error("store locked: another process has exclusive access")]
    Locked,

    /// A pre-save hook rejected the save.
    #[error("save hook failed: {message}")]
    Hook {
        /// Reason given by the hook.
        message: String,
    },
}

impl StoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a hook error.
    pub fn hook(message: impl Into<String>) -> Self {
        Self::Hook {
            message: message.into(),
        }
    }
}
