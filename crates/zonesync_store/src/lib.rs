//! # ZoneSync Store
//!
//! Transactional local object store for ZoneSync.
//!
//! This crate provides:
//! - Typed objects with attributes and to-many relationships
//! - Named contexts with merge policies
//! - Optimistic transactions with predicate fetch and batch delete
//! - Pre-save and post-save hooks per context
//! - Change notifications after every commit
//! - Optional file-backed persistence with an exclusive process lock
//!
//! ## Key Invariants
//!
//! - A transaction block is synchronous; nothing is visible until commit
//! - Commits are serialized; each bumps the store sequence by one
//! - Notifications and post-save hooks fire only after a commit succeeds

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod context;
mod error;
mod object;
mod snapshot;
mod store;
mod transaction;
mod value;

pub use context::{Context, MergePolicy, SaveObserver, SaveSummary};
pub use error::{StoreError, StoreResult};
pub use object::{ManagedObject, ObjectId};
pub use snapshot::{ObjectRead, Snapshot};
pub use store::{ObjectStore, StoreChange};
pub use transaction::Transaction;
pub use value::{AttributeValue, Decimal, Timestamp};
