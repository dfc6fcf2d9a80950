//! The remote record store, as the engine sees it.

use async_trait::async_trait;
use tokio::sync::mpsc;
use zonesync_protocol::{
    DatabaseChange, DatabaseChangesRequest, ModifyRecordsOutcome, ModifyRecordsRequest,
    ModifyZonesOutcome, ModifyZonesRequest, OperationId, RemoteResult, Subscription, ZoneChange,
    ZoneChangesRequest,
};

/// A remote record store with batched CRUD, change feeds and a registry of
/// long-lived operations.
///
/// Feeds are streamed over a channel and end with one `Completed` event.
/// Dropping the receiver cancels the feed.
#[async_trait]
pub trait RemoteDatabase: Send + Sync {
    /// Opens the database-level change feed.
    async fn fetch_database_changes(
        &self,
        request: DatabaseChangesRequest,
    ) -> mpsc::Receiver<DatabaseChange>;

    /// Opens the record change feed for a set of zones.
    async fn fetch_zone_changes(&self, request: ZoneChangesRequest) -> mpsc::Receiver<ZoneChange>;

    /// Creates or deletes zones. Creating an existing zone succeeds.
    async fn modify_zones(&self, request: ModifyZonesRequest) -> RemoteResult<ModifyZonesOutcome>;

    /// Saves and deletes records in one batch.
    async fn modify_records(
        &self,
        request: ModifyRecordsRequest,
    ) -> RemoteResult<ModifyRecordsOutcome>;

    /// Registers a change subscription.
    async fn save_subscription(&self, subscription: Subscription) -> RemoteResult<Subscription>;

    /// Lists durable operations that have not reported back to this client.
    async fn outstanding_operations(&self) -> RemoteResult<Vec<OperationId>>;

    /// Reattaches to a durable operation and waits for its outcome.
    async fn resume_operation(
        &self,
        operation_id: OperationId,
    ) -> RemoteResult<ModifyRecordsOutcome>;
}
