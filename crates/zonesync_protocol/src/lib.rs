//! # ZoneSync Protocol
//!
//! Remote record model and message types for ZoneSync.
//!
//! This crate provides:
//! - Identifiers for scopes, zones, records, subscriptions and operations
//! - `RemoteRecord`, the typed field bag exchanged with the record store
//! - `SystemFields`, the opaque per-record bookkeeping blob
//! - Length-prefixed encoding for nullable values the remote schema lacks
//! - Change feed, modify and zone request/response types
//! - The remote error taxonomy
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod encoded;
mod error;
mod feed;
mod ids;
mod modify;
mod record;
mod system_fields;

pub use encoded::{decode_optional, encode_optional, LENGTH_PREFIX_BYTES};
pub use error::{CodecError, CodecResult, RemoteError, RemoteErrorCode, RemoteResult};
pub use feed::{DatabaseChange, DatabaseChangesRequest, ZoneChange, ZoneChangesRequest};
pub use ids::{ChangeToken, DatabaseScope, OperationId, RecordId, SubscriptionId, ZoneId};
pub use modify::{
    ModifyRecordsOutcome, ModifyRecordsRequest, ModifyZonesOutcome, ModifyZonesRequest,
    NotificationPayload, SavePolicy, Subscription,
};
pub use record::{FieldValue, RecordMetadata, RemoteRecord};
pub use system_fields::SystemFields;
