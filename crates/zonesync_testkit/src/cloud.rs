//! In-memory remote record store.
//!
//! [`MemoryCloud`] implements [`RemoteDatabase`] over plain maps. Tokens are
//! big-endian server sequence numbers, so a token covers every change with
//! a lower sequence. Faults (interrupted feeds, lost responses, batch
//! limits) are switched on through [`CloudOptions`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use zonesync_engine::RemoteDatabase;
use zonesync_protocol::{
    ChangeToken, DatabaseChange, DatabaseChangesRequest, ModifyRecordsOutcome,
    ModifyRecordsRequest, ModifyZonesOutcome, ModifyZonesRequest, OperationId, RecordId,
    RemoteError, RemoteErrorCode, RemoteRecord, RemoteResult, SavePolicy, Subscription,
    SubscriptionId, ZoneChange, ZoneChangesRequest, ZoneId,
};

const FEED_CAPACITY: usize = 1;

/// A request received by the cloud, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Database feed opened.
    DatabaseChanges {
        /// Token the client sent.
        previous_token: Option<ChangeToken>,
    },
    /// Zone feed opened.
    ZoneChanges {
        /// Zones requested.
        zones: Vec<ZoneId>,
    },
    /// Zone create/delete.
    ModifyZones {
        /// Zones to create.
        create: Vec<ZoneId>,
    },
    /// Record save/delete batch.
    ModifyRecords {
        /// Operation ID.
        operation_id: OperationId,
        /// Records to save.
        saves: Vec<RecordId>,
        /// Records to delete.
        deletes: Vec<RecordId>,
    },
    /// Subscription saved.
    SaveSubscription(SubscriptionId),
    /// Durable operation resumed.
    ResumeOperation(OperationId),
}

impl Request {
    /// Returns true for a database feed request.
    pub fn is_database_changes(&self) -> bool {
        matches!(self, Request::DatabaseChanges { .. })
    }

    /// Returns true for a zone feed request.
    pub fn is_zone_changes(&self) -> bool {
        matches!(self, Request::ZoneChanges { .. })
    }

    /// Returns true for a record modify request.
    pub fn is_modify_records(&self) -> bool {
        matches!(self, Request::ModifyRecords { .. })
    }
}

/// Fault injection and paging knobs.
#[derive(Debug, Clone, Default)]
pub struct CloudOptions {
    /// Emit a token checkpoint after this many events per feed or zone.
    pub checkpoint_every: Option<usize>,
    /// Stream at most this many database events per request, setting
    /// `more_coming` when more remain.
    pub database_page_size: Option<usize>,
    /// Close zone feeds without a terminal event after this many events.
    pub interrupt_zone_feed_after: Option<usize>,
    /// End database feeds with this error instead of a token.
    pub database_feed_error: Option<RemoteError>,
    /// Sleep before each streamed event.
    pub feed_delay: Option<Duration>,
    /// Reject modify requests with more items than this.
    pub max_batch: Option<usize>,
    /// Accept modify requests as outstanding operations but fail the
    /// response, as if the connection dropped.
    pub drop_modify_responses: bool,
}

#[derive(Debug, Clone)]
enum RecordEvent {
    Changed(RecordId),
    Deleted {
        record_id: RecordId,
        record_type: String,
    },
}

impl RecordEvent {
    fn record_id(&self) -> &RecordId {
        match self {
            RecordEvent::Changed(record_id) => record_id,
            RecordEvent::Deleted { record_id, .. } => record_id,
        }
    }
}

#[derive(Debug, Default)]
struct ServerZone {
    records: BTreeMap<RecordId, RemoteRecord>,
    log: Vec<(u64, RecordEvent)>,
}

#[derive(Debug, Default)]
struct CloudState {
    sequence: u64,
    zones: BTreeMap<ZoneId, ServerZone>,
    database_log: Vec<(u64, DatabaseChange)>,
    outstanding: BTreeMap<OperationId, ModifyRecordsRequest>,
    subscriptions: Vec<Subscription>,
    requests: Vec<Request>,
    zone_creates: usize,
    options: CloudOptions,
}

fn token(sequence: u64) -> ChangeToken {
    ChangeToken::from_bytes(sequence.to_be_bytes().to_vec())
}

fn sequence_of(token: Option<&ChangeToken>) -> u64 {
    token
        .and_then(|token| <[u8; 8]>::try_from(token.as_bytes()).ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

fn remote_error(code: RemoteErrorCode, message: impl Into<String>) -> RemoteError {
    RemoteError::new(code, message)
}

impl CloudState {
    fn bump(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn log_database(&mut self, change: DatabaseChange) {
        let sequence = self.bump();
        self.database_log.push((sequence, change));
    }

    fn save_record(&mut self, record: &RemoteRecord) -> RemoteRecord {
        let sequence = self.bump();
        let zone = self
            .zones
            .entry(record.record_id().zone_id.clone())
            .or_default();

        let mut stored = zone
            .records
            .get(record.record_id())
            .cloned()
            .unwrap_or_else(|| RemoteRecord::from_metadata(record.metadata().clone()));
        stored.merge_fields_from(record);
        let metadata = stored.metadata_mut();
        metadata.change_tag = Some(format!("t{sequence}"));
        metadata.created_at_ms = metadata.created_at_ms.or(Some(sequence as i64));
        metadata.modified_at_ms = Some(sequence as i64);

        zone.records.insert(record.record_id().clone(), stored.clone());
        zone.log
            .push((sequence, RecordEvent::Changed(record.record_id().clone())));
        stored
    }

    fn delete_record(&mut self, record_id: &RecordId) -> bool {
        let sequence = self.bump();
        let Some(zone) = self.zones.get_mut(&record_id.zone_id) else {
            return false;
        };
        let Some(removed) = zone.records.remove(record_id) else {
            return false;
        };
        zone.log.push((
            sequence,
            RecordEvent::Deleted {
                record_id: record_id.clone(),
                record_type: removed.record_type().to_string(),
            },
        ));
        true
    }

    fn validate(&self, request: &ModifyRecordsRequest) -> RemoteResult<()> {
        for record in &request.records_to_save {
            let record_id = record.record_id();
            let Some(zone) = self.zones.get(&record_id.zone_id) else {
                return Err(remote_error(
                    RemoteErrorCode::ZoneNotFound,
                    format!("zone {} does not exist", record_id.zone_id),
                ));
            };
            if request.save_policy != SavePolicy::IfServerRecordUnchanged {
                continue;
            }
            match zone.records.get(record_id) {
                Some(existing) if existing.change_tag() != record.change_tag() => {
                    return Err(remote_error(
                        RemoteErrorCode::ServerRecordChanged,
                        format!("record {record_id} changed on the server"),
                    ));
                }
                None if record.change_tag().is_some() => {
                    return Err(remote_error(
                        RemoteErrorCode::UnknownItem,
                        format!("record {record_id} no longer exists"),
                    ));
                }
                _ => {}
            }
        }
        for record_id in &request.record_ids_to_delete {
            if !self.zones.contains_key(&record_id.zone_id) {
                return Err(remote_error(
                    RemoteErrorCode::ZoneNotFound,
                    format!("zone {} does not exist", record_id.zone_id),
                ));
            }
        }
        Ok(())
    }

    fn execute(&mut self, request: &ModifyRecordsRequest) -> RemoteResult<ModifyRecordsOutcome> {
        self.validate(request)?;

        let mut touched = BTreeSet::new();
        let mut outcome = ModifyRecordsOutcome::default();
        for record in &request.records_to_save {
            touched.insert(record.record_id().zone_id.clone());
            outcome.saved.push(self.save_record(record));
        }
        for record_id in &request.record_ids_to_delete {
            touched.insert(record_id.zone_id.clone());
            self.delete_record(record_id);
            outcome.deleted.push(record_id.clone());
        }
        for zone_id in touched {
            self.log_database(DatabaseChange::ZoneChanged(zone_id));
        }
        Ok(outcome)
    }

    fn checkpoint_due(&self, emitted: usize) -> bool {
        self.options
            .checkpoint_every
            .filter(|every| *every > 0)
            .is_some_and(|every| emitted % every == 0)
    }

    fn database_events(&self, request: &DatabaseChangesRequest) -> Vec<DatabaseChange> {
        let since = sequence_of(request.previous_token.as_ref());
        let pending: Vec<&(u64, DatabaseChange)> = self
            .database_log
            .iter()
            .filter(|(sequence, _)| *sequence > since)
            .collect();
        let page_size = self.options.database_page_size.unwrap_or(usize::MAX);
        let more_coming = pending.len() > page_size;

        let mut events = Vec::new();
        let mut last = since;
        for (emitted, (sequence, change)) in pending.into_iter().take(page_size).enumerate() {
            events.push(change.clone());
            last = *sequence;
            if self.checkpoint_due(emitted + 1) {
                events.push(DatabaseChange::TokenUpdated(token(*sequence)));
            }
        }

        let completed = match &self.options.database_feed_error {
            Some(error) => DatabaseChange::Completed {
                token: None,
                more_coming: false,
                error: Some(error.clone()),
            },
            None => DatabaseChange::Completed {
                token: Some(token(if more_coming { last } else { self.sequence })),
                more_coming,
                error: None,
            },
        };
        events.push(completed);
        events
    }

    fn zone_events(&self, request: &ZoneChangesRequest) -> Vec<ZoneChange> {
        let mut events = Vec::new();
        for (zone_id, previous) in &request.zones {
            let Some(zone) = self.zones.get(zone_id) else {
                events.push(ZoneChange::ZoneCompleted {
                    zone_id: zone_id.clone(),
                    token: None,
                    error: Some(remote_error(
                        RemoteErrorCode::UserDeletedZone,
                        format!("zone {zone_id} was deleted"),
                    )),
                });
                continue;
            };

            let since = sequence_of(previous.as_ref());
            let mut latest = BTreeMap::new();
            for (sequence, event) in zone.log.iter().filter(|(sequence, _)| *sequence > since) {
                latest.insert(event.record_id().clone(), (*sequence, event.clone()));
            }
            let mut changes: Vec<(u64, RecordEvent)> = latest.into_values().collect();
            changes.sort_by_key(|(sequence, _)| *sequence);

            for (emitted, (sequence, event)) in changes.into_iter().enumerate() {
                match event {
                    RecordEvent::Changed(record_id) => {
                        if let Some(record) = zone.records.get(&record_id) {
                            events.push(ZoneChange::RecordChanged(record.clone()));
                        }
                    }
                    RecordEvent::Deleted {
                        record_id,
                        record_type,
                    } => events.push(ZoneChange::RecordDeleted {
                        record_id,
                        record_type,
                    }),
                }
                if self.checkpoint_due(emitted + 1) {
                    events.push(ZoneChange::TokenUpdated {
                        zone_id: zone_id.clone(),
                        token: token(sequence),
                    });
                }
            }
            events.push(ZoneChange::ZoneCompleted {
                zone_id: zone_id.clone(),
                token: Some(token(self.sequence)),
                error: None,
            });
        }
        events.push(ZoneChange::Completed { error: None });
        events
    }
}

#[derive(Debug, Default)]
struct FeedMonitor {
    cancelled: AtomicUsize,
    notify: Notify,
}

/// An in-memory remote record store.
#[derive(Debug, Default)]
pub struct MemoryCloud {
    state: Mutex<CloudState>,
    monitor: Arc<FeedMonitor>,
}

impl MemoryCloud {
    /// Creates an empty cloud.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Changes fault and paging options.
    pub fn configure(&self, update: impl FnOnce(&mut CloudOptions)) {
        update(&mut self.state.lock().options);
    }

    /// Creates a zone directly on the server.
    pub fn create_zone(&self, zone_id: &ZoneId) {
        self.state.lock().zones.entry(zone_id.clone()).or_default();
    }

    /// Saves a record as another device would, ignoring change tags.
    pub fn server_save(&self, record: RemoteRecord) -> RemoteRecord {
        let mut state = self.state.lock();
        let saved = state.save_record(&record);
        state.log_database(DatabaseChange::ZoneChanged(record.record_id().zone_id.clone()));
        saved
    }

    /// Deletes a record as another device would.
    pub fn server_delete(&self, record_id: &RecordId) -> bool {
        let mut state = self.state.lock();
        let deleted = state.delete_record(record_id);
        if deleted {
            state.log_database(DatabaseChange::ZoneChanged(record_id.zone_id.clone()));
        }
        deleted
    }

    /// Deletes a zone and its records.
    pub fn delete_zone(&self, zone_id: &ZoneId) {
        let mut state = self.state.lock();
        state.zones.remove(zone_id);
        state.log_database(DatabaseChange::ZoneDeleted(zone_id.clone()));
    }

    /// Purges a zone and its records.
    pub fn purge_zone(&self, zone_id: &ZoneId) {
        let mut state = self.state.lock();
        state.zones.remove(zone_id);
        state.log_database(DatabaseChange::ZonePurged(zone_id.clone()));
    }

    /// Removes a zone without a database event, as if the deletion had not
    /// yet reached the database feed.
    pub fn forget_zone(&self, zone_id: &ZoneId) {
        self.state.lock().zones.remove(zone_id);
    }

    /// Returns the server copy of a record.
    pub fn record(&self, record_id: &RecordId) -> Option<RemoteRecord> {
        self.state
            .lock()
            .zones
            .get(&record_id.zone_id)
            .and_then(|zone| zone.records.get(record_id).cloned())
    }

    /// Returns every record in a zone.
    pub fn records_in(&self, zone_id: &ZoneId) -> Vec<RemoteRecord> {
        self.state
            .lock()
            .zones
            .get(zone_id)
            .map(|zone| zone.records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns true if the zone exists.
    pub fn zone_exists(&self, zone_id: &ZoneId) -> bool {
        self.state.lock().zones.contains_key(zone_id)
    }

    /// Returns every request received so far.
    pub fn requests(&self) -> Vec<Request> {
        self.state.lock().requests.clone()
    }

    /// Forgets the request log.
    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }

    /// Number of zone-create requests received.
    pub fn zone_create_count(&self) -> usize {
        self.state.lock().zone_creates
    }

    /// Subscriptions saved so far.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.state.lock().subscriptions.clone()
    }

    /// Number of durable operations awaiting resume.
    pub fn outstanding_count(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    /// Number of feeds whose receiver went away before the feed ended.
    pub fn cancelled_feeds(&self) -> usize {
        self.monitor.cancelled.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` feeds were cancelled.
    pub async fn wait_for_cancelled_feeds(&self, count: usize) {
        loop {
            let notified = self.monitor.notify.notified();
            if self.cancelled_feeds() >= count {
                return;
            }
            notified.await;
        }
    }

    fn stream<T: Send + 'static>(&self, events: Vec<T>, close_after: Option<usize>) -> mpsc::Receiver<T> {
        let (sender, receiver) = mpsc::channel(FEED_CAPACITY);
        let delay = self.state.lock().options.feed_delay;
        let monitor = Arc::clone(&self.monitor);

        tokio::spawn(async move {
            for (sent, event) in events.into_iter().enumerate() {
                if close_after.is_some_and(|limit| sent >= limit) {
                    tracing::debug!(sent, "interrupting feed");
                    return;
                }
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if sender.send(event).await.is_err() {
                    tracing::debug!(sent, "feed cancelled by receiver");
                    monitor.cancelled.fetch_add(1, Ordering::SeqCst);
                    monitor.notify.notify_waiters();
                    return;
                }
            }
        });
        receiver
    }
}

#[async_trait]
impl RemoteDatabase for MemoryCloud {
    async fn fetch_database_changes(
        &self,
        request: DatabaseChangesRequest,
    ) -> mpsc::Receiver<DatabaseChange> {
        let events = {
            let mut state = self.state.lock();
            state.requests.push(Request::DatabaseChanges {
                previous_token: request.previous_token.clone(),
            });
            state.database_events(&request)
        };
        self.stream(events, None)
    }

    async fn fetch_zone_changes(&self, request: ZoneChangesRequest) -> mpsc::Receiver<ZoneChange> {
        let (events, close_after) = {
            let mut state = self.state.lock();
            state.requests.push(Request::ZoneChanges {
                zones: request.zones.keys().cloned().collect(),
            });
            (
                state.zone_events(&request),
                state.options.interrupt_zone_feed_after,
            )
        };
        self.stream(events, close_after)
    }

    async fn modify_zones(&self, request: ModifyZonesRequest) -> RemoteResult<ModifyZonesOutcome> {
        let mut state = self.state.lock();
        state.requests.push(Request::ModifyZones {
            create: request.zones_to_save.clone(),
        });
        if !request.zones_to_save.is_empty() {
            state.zone_creates += 1;
        }
        for zone_id in &request.zones_to_save {
            state.zones.entry(zone_id.clone()).or_default();
        }
        for zone_id in &request.zone_ids_to_delete {
            state.zones.remove(zone_id);
            state.log_database(DatabaseChange::ZoneDeleted(zone_id.clone()));
        }
        Ok(ModifyZonesOutcome {
            saved: request.zones_to_save,
            deleted: request.zone_ids_to_delete,
        })
    }

    async fn modify_records(
        &self,
        request: ModifyRecordsRequest,
    ) -> RemoteResult<ModifyRecordsOutcome> {
        let mut state = self.state.lock();
        state.requests.push(Request::ModifyRecords {
            operation_id: request.operation_id,
            saves: request
                .records_to_save
                .iter()
                .map(|record| record.record_id().clone())
                .collect(),
            deletes: request.record_ids_to_delete.clone(),
        });

        if let Some(max) = state.options.max_batch {
            if request.len() > max {
                return Err(remote_error(
                    RemoteErrorCode::LimitExceeded,
                    format!("{} items exceed the limit of {max}", request.len()),
                ));
            }
        }
        if state.options.drop_modify_responses && request.durable {
            state.outstanding.insert(request.operation_id, request);
            return Err(remote_error(
                RemoteErrorCode::NetworkFailure,
                "connection lost before the response arrived",
            ));
        }
        state.execute(&request)
    }

    async fn save_subscription(&self, subscription: Subscription) -> RemoteResult<Subscription> {
        let mut state = self.state.lock();
        state
            .requests
            .push(Request::SaveSubscription(subscription.id.clone()));
        state.subscriptions.push(subscription.clone());
        Ok(subscription)
    }

    async fn outstanding_operations(&self) -> RemoteResult<Vec<OperationId>> {
        Ok(self.state.lock().outstanding.keys().copied().collect())
    }

    async fn resume_operation(
        &self,
        operation_id: OperationId,
    ) -> RemoteResult<ModifyRecordsOutcome> {
        let mut state = self.state.lock();
        state.requests.push(Request::ResumeOperation(operation_id));
        let Some(request) = state.outstanding.remove(&operation_id) else {
            return Err(remote_error(
                RemoteErrorCode::UnknownItem,
                format!("no outstanding operation {operation_id}"),
            ));
        };
        state.execute(&request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zonesync_protocol::{DatabaseScope, FieldValue};

    fn zone() -> ZoneId {
        ZoneId::new("Collection")
    }

    fn book(name: &str, title: &str) -> RemoteRecord {
        let mut record = RemoteRecord::new("Book", RecordId::new(zone(), name));
        record.set("title", FieldValue::Text(title.into()));
        record
    }

    async fn drain<T>(mut feed: mpsc::Receiver<T>) -> Vec<T> {
        let mut events = Vec::new();
        while let Some(event) = feed.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn database_feed_pages_with_more_coming() {
        let cloud = MemoryCloud::new();
        cloud.configure(|options| options.database_page_size = Some(1));
        cloud.server_save(book("b1", "Dune"));
        cloud.server_save(book("b2", "Emma"));

        let events = drain(
            cloud
                .fetch_database_changes(DatabaseChangesRequest {
                    scope: DatabaseScope::Private,
                    previous_token: None,
                    fetch_all_changes: true,
                })
                .await,
        )
        .await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], DatabaseChange::ZoneChanged(zone()));
        assert!(matches!(
            events[1],
            DatabaseChange::Completed {
                more_coming: true,
                error: None,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn zone_feed_collapses_to_latest_event() {
        let cloud = MemoryCloud::new();
        let saved = cloud.server_save(book("b1", "Dune"));
        cloud.server_save(book("b2", "Emma"));
        cloud.server_delete(saved.record_id());

        let events = drain(
            cloud
                .fetch_zone_changes(ZoneChangesRequest {
                    scope: DatabaseScope::Private,
                    zones: BTreeMap::from([(zone(), None)]),
                })
                .await,
        )
        .await;

        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], ZoneChange::RecordChanged(record) if record.record_id().record_name == "b2"));
        assert!(matches!(&events[1], ZoneChange::RecordDeleted { record_type, .. } if record_type == "Book"));
        assert!(matches!(&events[2], ZoneChange::ZoneCompleted { error: None, .. }));
        assert_eq!(events[3], ZoneChange::Completed { error: None });
    }

    #[tokio::test]
    async fn conflicting_change_tag_is_rejected() {
        let cloud = MemoryCloud::new();
        cloud.server_save(book("b1", "Dune"));

        let mut stale = book("b1", "Dune Messiah");
        stale.metadata_mut().change_tag = Some("t0".into());
        let result = cloud
            .modify_records(ModifyRecordsRequest {
                operation_id: OperationId::new(),
                scope: DatabaseScope::Private,
                records_to_save: vec![stale],
                record_ids_to_delete: Vec::new(),
                save_policy: SavePolicy::IfServerRecordUnchanged,
                durable: true,
            })
            .await;

        assert!(result.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn dropped_response_runs_on_resume() {
        let cloud = MemoryCloud::new();
        cloud.create_zone(&zone());
        cloud.configure(|options| options.drop_modify_responses = true);

        let operation_id = OperationId::new();
        let result = cloud
            .modify_records(ModifyRecordsRequest {
                operation_id,
                scope: DatabaseScope::Private,
                records_to_save: vec![book("b1", "Dune")],
                record_ids_to_delete: Vec::new(),
                save_policy: SavePolicy::IfServerRecordUnchanged,
                durable: true,
            })
            .await;
        assert!(result.unwrap_err().is_retryable());
        assert!(cloud.records_in(&zone()).is_empty());

        assert_eq!(cloud.outstanding_operations().await.unwrap(), vec![operation_id]);
        let outcome = cloud.resume_operation(operation_id).await.unwrap();
        assert_eq!(outcome.saved.len(), 1);
        assert_eq!(cloud.outstanding_count(), 0);
        assert_eq!(cloud.records_in(&zone()).len(), 1);
    }
}
