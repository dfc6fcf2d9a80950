//! Pushing local saves to the remote store.
//!
//! A save observer on the view context gives inserted objects their remote
//! identity before commit and remembers which keys of updated objects
//! changed. After commit it turns the save into one batch of records to
//! save and record IDs to delete, which a worker task submits as a durable
//! modify request. Batches the server finds too large are halved until they
//! fit. Every outcome, including those of operations resumed after a
//! restart, is reconciled and then published as a [`PushReport`].

use crate::config::SyncConfig;
use crate::engine::SyncStats;
use crate::entity;
use crate::error::{SyncError, SyncResult};
use crate::reconcile::Reconciler;
use crate::registry::TranslatorRegistry;
use crate::transport::RemoteDatabase;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use zonesync_protocol::{
    DatabaseScope, ModifyRecordsOutcome, ModifyRecordsRequest, ModifyZonesRequest, OperationId,
    RecordId, RemoteRecord, SavePolicy, ZoneId,
};
use zonesync_store::{
    Context, ObjectId, ObjectRead, ObjectStore, SaveObserver, SaveSummary, StoreError, StoreResult,
    Transaction,
};

const REPORT_CHANNEL_CAPACITY: usize = 256;

/// How a pushed batch came to be submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOrigin {
    /// Submitted right after a local save.
    Fresh,
    /// Half of a batch the server rejected as too large.
    Split,
    /// An outstanding durable operation resumed on start.
    Resumed,
}

/// Terminal result of one submitted modify request.
#[derive(Debug, Clone)]
pub struct PushReport {
    /// Operation the report belongs to.
    pub operation_id: OperationId,
    /// How the batch was submitted.
    pub origin: PushOrigin,
    /// Number of halvings that produced this batch.
    pub depth: u32,
    /// Saved records; on failure, the records that were attempted.
    pub saved: Vec<RecordId>,
    /// Deleted records; on failure, the deletions that were attempted.
    pub deleted: Vec<RecordId>,
    /// Why the push failed.
    pub error: Option<Arc<SyncError>>,
}

impl PushReport {
    /// Returns true if the batch was saved and reconciled.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Records to save and record IDs to delete, submitted together.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PushBatch {
    pub(crate) saves: Vec<RemoteRecord>,
    pub(crate) deletes: Vec<RecordId>,
}

impl PushBatch {
    pub(crate) fn len(&self) -> usize {
        self.saves.len() + self.deletes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Splits both lists in half by position. Each half of a batch with two
    /// or more items is non-empty and smaller than the whole.
    pub(crate) fn split_in_half(mut self) -> (PushBatch, PushBatch) {
        let saves_tail = self.saves.split_off(self.saves.len() / 2);
        let deletes_tail = self.deletes.split_off(self.deletes.len().div_ceil(2));
        (
            PushBatch {
                saves: self.saves,
                deletes: self.deletes,
            },
            PushBatch {
                saves: saves_tail,
                deletes: deletes_tail,
            },
        )
    }
}

/// Work handed from the save observer to the push worker.
#[derive(Debug)]
pub(crate) enum Outgoing {
    /// Records to submit.
    Batch(PushBatch),
    /// An object whose record could not be built; reported as failed
    /// without being submitted.
    Rejected {
        record_id: RecordId,
        error: SyncError,
    },
}

/// Save observer turning view saves into push batches.
struct ChangeCapture {
    store: ObjectStore,
    registry: Arc<TranslatorRegistry>,
    zone_id: ZoneId,
    pending: Mutex<BTreeMap<ObjectId, BTreeSet<String>>>,
    outbox: mpsc::UnboundedSender<Outgoing>,
}

impl ChangeCapture {
    fn prepare(&self, tx: &mut Transaction) -> SyncResult<()> {
        for id in tx.inserted_ids() {
            let Some(object) = tx.object(id) else {
                continue;
            };
            let Some(translator) = self.registry.for_entity(object.entity()) else {
                continue;
            };
            if entity::remote_record_id(&object).is_some() {
                continue;
            }
            let record_id = RecordId::generate(self.zone_id.clone());
            entity::assign_identity(tx, id, &record_id)?;
            let record = RemoteRecord::new(translator.record_type(), record_id);
            entity::store_system_fields(tx, id, &record)?;
        }

        let mut captured = Vec::new();
        for (id, changed) in tx.updated_changes() {
            let Some(object) = tx.object(id) else {
                continue;
            };
            if self.registry.for_entity(object.entity()).is_none() {
                continue;
            }
            entity::check_identity_unchanged(tx, id)?;
            let keys: BTreeSet<String> = changed
                .into_iter()
                .filter(|key| !entity::is_reserved(key))
                .collect();
            if !keys.is_empty() {
                captured.push((id, keys));
            }
        }

        let mut pending = self.pending.lock();
        for (id, keys) in captured {
            pending.entry(id).or_default().extend(keys);
        }
        Ok(())
    }

    /// Builds the batch for a committed save. Objects whose record cannot
    /// be built are left out of the batch and returned with their error.
    fn collect(&self, summary: &SaveSummary) -> (PushBatch, Vec<(RecordId, SyncError)>) {
        let snapshot = self.store.snapshot();
        let mut pending = self.pending.lock();
        let mut batch = PushBatch::default();
        let mut rejected = Vec::new();

        let inserted = summary.inserted.iter().map(|id| (*id, None::<BTreeSet<String>>));
        let updated: Vec<_> = summary
            .updated
            .iter()
            .filter_map(|id| pending.remove(id).map(|keys| (*id, Some(keys))))
            .collect();

        for (id, keys) in inserted.chain(updated) {
            let Some(object) = snapshot.object(id) else {
                continue;
            };
            let Some(translator) = self.registry.for_entity(object.entity()) else {
                continue;
            };
            match translator.build_record(&snapshot, &object, keys.as_ref()) {
                Ok(Some(record)) => batch.saves.push(record),
                Ok(None) => {}
                Err(e) => match entity::remote_record_id(&object) {
                    Some(record_id) => rejected.push((record_id, e)),
                    None => tracing::warn!(object_id = %id, error = %e, "unpushable object"),
                },
            }
        }

        for object in &summary.deleted {
            pending.remove(&object.id());
            if self.registry.for_entity(object.entity()).is_none() {
                continue;
            }
            if let Some(record_id) = entity::remote_record_id(object) {
                batch.deletes.push(record_id);
            }
        }

        (batch, rejected)
    }

    fn send(&self, sequence: u64, outgoing: Outgoing) {
        if self.outbox.send(outgoing).is_err() {
            tracing::warn!(sequence, "push outbox closed; dropping push");
        }
    }
}

impl SaveObserver for ChangeCapture {
    fn will_save(&self, tx: &mut Transaction) -> StoreResult<()> {
        self.prepare(tx).map_err(|e| StoreError::hook(e.to_string()))
    }

    fn did_save(&self, summary: &SaveSummary) {
        let (batch, rejected) = self.collect(summary);
        for (record_id, error) in rejected {
            tracing::warn!(sequence = summary.sequence, %record_id, error = %error, "could not build record");
            self.send(summary.sequence, Outgoing::Rejected { record_id, error });
        }
        if !batch.is_empty() {
            tracing::debug!(
                sequence = summary.sequence,
                saves = batch.saves.len(),
                deletes = batch.deletes.len(),
                "queued push"
            );
            self.send(summary.sequence, Outgoing::Batch(batch));
        }
    }
}

struct PushShared {
    remote: Arc<dyn RemoteDatabase>,
    reconciler: Reconciler,
    scope: DatabaseScope,
    zone_id: ZoneId,
    reports: broadcast::Sender<PushReport>,
    stats: Arc<RwLock<SyncStats>>,
}

impl PushShared {
    async fn resume(&self, operation_id: OperationId) {
        let result = self
            .remote
            .resume_operation(operation_id)
            .await
            .map_err(SyncError::from);
        self.finish(
            operation_id,
            PushOrigin::Resumed,
            0,
            &PushBatch::default(),
            result,
        );
    }

    fn reject(&self, record_id: RecordId, error: SyncError) {
        self.publish(PushReport {
            operation_id: OperationId::new(),
            origin: PushOrigin::Fresh,
            depth: 0,
            saved: vec![record_id],
            deleted: Vec::new(),
            error: Some(Arc::new(error)),
        });
    }

    fn finish(
        &self,
        operation_id: OperationId,
        origin: PushOrigin,
        depth: u32,
        attempted: &PushBatch,
        result: SyncResult<ModifyRecordsOutcome>,
    ) {
        let result = result.and_then(|outcome| {
            self.reconciler.reconcile(&outcome)?;
            Ok(outcome)
        });

        let report = match result {
            Ok(outcome) => {
                tracing::info!(
                    operation = %operation_id,
                    ?origin,
                    saved = outcome.saved.len(),
                    deleted = outcome.deleted.len(),
                    "push complete"
                );
                PushReport {
                    operation_id,
                    origin,
                    depth,
                    saved: outcome
                        .saved
                        .iter()
                        .map(|record| record.record_id().clone())
                        .collect(),
                    deleted: outcome.deleted,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(
                    operation = %operation_id,
                    ?origin,
                    error = %e,
                    "push failed"
                );
                PushReport {
                    operation_id,
                    origin,
                    depth,
                    saved: attempted
                        .saves
                        .iter()
                        .map(|record| record.record_id().clone())
                        .collect(),
                    deleted: attempted.deletes.clone(),
                    error: Some(Arc::new(e)),
                }
            }
        };
        self.publish(report);
    }

    fn publish(&self, report: PushReport) {
        {
            let mut stats = self.stats.write();
            if report.is_success() {
                stats.pushes_completed += 1;
                stats.records_pushed += (report.saved.len() + report.deleted.len()) as u64;
            } else {
                stats.pushes_failed += 1;
                stats.last_error = report.error.as_ref().map(|e| e.to_string());
            }
        }
        // No subscribers is fine.
        let _ = self.reports.send(report);
    }
}

/// Submits a batch, halving it recursively while the server reports it too
/// large.
fn submit(
    shared: Arc<PushShared>,
    batch: PushBatch,
    origin: PushOrigin,
    depth: u32,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        if let Err(e) = shared
            .remote
            .modify_zones(ModifyZonesRequest::create(shared.zone_id.clone()))
            .await
        {
            tracing::warn!(zone = %shared.zone_id, error = %e, "zone create failed");
        }

        let operation_id = OperationId::new();
        let request = ModifyRecordsRequest {
            operation_id,
            scope: shared.scope,
            records_to_save: batch.saves.clone(),
            record_ids_to_delete: batch.deletes.clone(),
            save_policy: SavePolicy::IfServerRecordUnchanged,
            durable: true,
        };

        match shared.remote.modify_records(request).await {
            Err(e) if e.is_limit_exceeded() && batch.len() > 1 => {
                tracing::debug!(items = batch.len(), depth, "batch too large; splitting");
                let (first, second) = batch.split_in_half();
                tokio::join!(
                    submit(Arc::clone(&shared), first, PushOrigin::Split, depth + 1),
                    submit(shared, second, PushOrigin::Split, depth + 1),
                );
            }
            result => {
                shared.finish(
                    operation_id,
                    origin,
                    depth,
                    &batch,
                    result.map_err(SyncError::from),
                );
            }
        }
    })
}

/// Observes local saves and pushes them.
pub struct PushEngine {
    shared: Arc<PushShared>,
    outbox: Mutex<Option<mpsc::UnboundedReceiver<Outgoing>>>,
}

impl PushEngine {
    /// Creates a push engine and registers its save observer on `view`.
    ///
    /// Saves made before [`PushEngine::start`] are queued.
    pub fn new(
        remote: Arc<dyn RemoteDatabase>,
        view: &Context,
        reconciler: Reconciler,
        registry: Arc<TranslatorRegistry>,
        config: &SyncConfig,
        stats: Arc<RwLock<SyncStats>>,
    ) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);

        view.add_observer(Arc::new(ChangeCapture {
            store: view.store().clone(),
            registry,
            zone_id: config.zone_id.clone(),
            pending: Mutex::new(BTreeMap::new()),
            outbox: outbox_tx,
        }));

        Self {
            shared: Arc::new(PushShared {
                remote,
                reconciler,
                scope: config.scope,
                zone_id: config.zone_id.clone(),
                reports,
                stats,
            }),
            outbox: Mutex::new(Some(outbox_rx)),
        }
    }

    /// Starts the worker that submits queued batches. Returns false if it
    /// was already started.
    pub fn start(&self) -> bool {
        let Some(mut outbox) = self.outbox.lock().take() else {
            return false;
        };
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            while let Some(outgoing) = outbox.recv().await {
                match outgoing {
                    Outgoing::Batch(batch) => {
                        tokio::spawn(submit(Arc::clone(&shared), batch, PushOrigin::Fresh, 0));
                    }
                    Outgoing::Rejected { record_id, error } => shared.reject(record_id, error),
                }
            }
            tracing::debug!("push outbox closed");
        });
        true
    }

    /// Subscribes to push reports.
    pub fn subscribe(&self) -> broadcast::Receiver<PushReport> {
        self.shared.reports.subscribe()
    }

    /// Resumes every outstanding durable operation and waits until each has
    /// been reconciled and reported. Returns how many were resumed.
    pub async fn resume_outstanding(&self) -> SyncResult<usize> {
        let operations = self.shared.remote.outstanding_operations().await?;
        let count = operations.len();

        let mut tasks = JoinSet::new();
        for operation_id in operations {
            let shared = Arc::clone(&self.shared);
            tasks.spawn(async move { shared.resume(operation_id).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "resume task failed");
            }
        }

        if count > 0 {
            tracing::info!(count, "resumed outstanding pushes");
        }
        Ok(count)
    }
}

impl std::fmt::Debug for PushEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushEngine")
            .field("scope", &self.shared.scope)
            .field("zone_id", &self.shared.zone_id)
            .field("started", &self.outbox.lock().is_none())
            .finish()
    }
}
