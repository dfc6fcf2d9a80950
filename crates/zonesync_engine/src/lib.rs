//! # ZoneSync Engine
//!
//! Keeps a local object store in sync with a remote zone-partitioned record
//! store.
//!
//! This crate provides:
//! - Two-phase pull (database feed, then zone feeds) with checkpointed tokens
//! - Batched push driven by local saves, split on "batch too large"
//! - Post-push reconciliation of server bookkeeping
//! - Persisted sync state per scope and per zone
//! - Record translators mapping remote records to local entities
//! - Database subscription and notification handling
//!
//! ## Architecture
//!
//! Pulls run on one serial lane. Phase 1 consumes the database feed and
//! marks zones changed or deleted; zone cleanup and the new token commit
//! together at each checkpoint. Phase 2 fetches every dirty zone and applies
//! its records, advancing each zone's token as the feed checkpoints.
//!
//! Pushes are independent tasks. Each one re-creates the target zone,
//! submits a durable modify request and reconciles the saved records.
//!
//! ## Key Invariants
//!
//! - A remote identity, once assigned to an object, never changes
//! - A zone's dirty flag is cleared only after its completion token commits
//! - Deleted records are flushed before the token that covers them
//! - Purged zones lose their local objects and keep no token
//! - A failed local write cancels the in-flight feed

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod entity;
mod error;
mod pull;
mod push;
mod reconcile;
mod registry;
mod state;
mod subscription;
mod transport;
mod translator;

pub use config::{SyncConfig, DEFAULT_SUBSCRIPTION_ID, DEFAULT_ZONE_NAME};
pub use engine::{SyncEngine, SyncStats, RECONCILE_CONTEXT, SYNC_CONTEXT, VIEW_CONTEXT};
pub use entity::{
    assign_identity, check_identity, find_by_record_id, remote_record_id, store_system_fields,
    system_fields, REMOTE_RECORD_ID, REMOTE_ZONE_ID, SYSTEM_FIELDS,
};
pub use error::{SyncError, SyncResult};
pub use pull::{PullEngine, PullSummary};
pub use push::{PushEngine, PushOrigin, PushReport};
pub use reconcile::Reconciler;
pub use registry::TranslatorRegistry;
pub use state::{
    DatabaseState, PurgeSummary, SyncStateStore, ZoneState, DATABASE_SYNC_STATE, ZONE_SYNC_STATE,
};
pub use subscription::{
    MemorySubscriptionFlag, StoreSubscriptionFlag, SubscriptionFlag, SUBSCRIPTION_STATE,
};
pub use translator::{FieldKind, FieldMapping, MappedTranslator, RecordTranslator};
pub use transport::RemoteDatabase;
