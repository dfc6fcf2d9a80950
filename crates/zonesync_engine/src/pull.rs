//! Two-phase incremental pull.
//!
//! Phase 1 reads the database change feed and turns it into zone flags.
//! Phase 2 reads the record feeds of every dirty zone and applies them.
//! Each checkpoint commits the local changes it covers together with the
//! token that covers them, so an interrupted pull resumes where the last
//! commit left off.

use crate::error::{SyncError, SyncResult};
use crate::registry::TranslatorRegistry;
use crate::state::{PurgeSummary, SyncStateStore};
use crate::transport::RemoteDatabase;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use zonesync_protocol::{
    ChangeToken, DatabaseChange, DatabaseChangesRequest, RecordId, ZoneChange, ZoneChangesRequest,
    ZoneId,
};
use zonesync_store::Context;

/// What one pull did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullSummary {
    /// Zones flagged dirty by phase 1.
    pub zones_changed: usize,
    /// Zones flagged deleted by phase 1.
    pub zones_deleted: usize,
    /// Zones flagged purged by phase 1.
    pub zones_purged: usize,
    /// Local objects removed by zone cleanup.
    pub objects_purged: usize,
    /// Changed records applied by phase 2.
    pub records_changed: usize,
    /// Deleted records flushed by phase 2.
    pub records_deleted: usize,
    /// Zones fully fetched by phase 2.
    pub zones_completed: Vec<ZoneId>,
    /// Zones phase 2 found deleted on the server.
    pub zones_gone: Vec<ZoneId>,
}

/// Deleted record IDs grouped by record type, waiting for a checkpoint.
#[derive(Debug, Default)]
pub(crate) struct DeletedRecordsBatch {
    by_type: BTreeMap<String, Vec<RecordId>>,
    len: usize,
}

impl DeletedRecordsBatch {
    pub(crate) fn push(&mut self, record_type: String, record_id: RecordId) {
        self.by_type.entry(record_type).or_default().push(record_id);
        self.len += 1;
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn take(&mut self) -> BTreeMap<String, Vec<RecordId>> {
        self.len = 0;
        std::mem::take(&mut self.by_type)
    }
}

enum ZoneTransition {
    Changed(ZoneId),
    Deleted(ZoneId),
    Purged(ZoneId),
}

/// Fetches remote changes into the local store.
pub struct PullEngine {
    remote: Arc<dyn RemoteDatabase>,
    context: Context,
    registry: Arc<TranslatorRegistry>,
    states: SyncStateStore,
    fetch_all_changes: bool,
    lane: Mutex<()>,
}

impl PullEngine {
    /// Creates a pull engine writing through `context`.
    pub fn new(
        remote: Arc<dyn RemoteDatabase>,
        context: Context,
        registry: Arc<TranslatorRegistry>,
        states: SyncStateStore,
        fetch_all_changes: bool,
    ) -> Self {
        Self {
            remote,
            context,
            registry,
            states,
            fetch_all_changes,
            lane: Mutex::new(()),
        }
    }

    /// Runs both phases.
    ///
    /// Calls are serialized: an overlapping call waits until the one in
    /// flight has finished both phases.
    pub async fn fetch_changes(&self) -> SyncResult<PullSummary> {
        let _lane = self.lane.lock().await;
        let mut summary = PullSummary::default();

        if let Err(e) = self.fetch_database_changes(&mut summary).await {
            tracing::warn!(scope = %self.states.scope(), error = %e, "database changes failed");
            return Err(e);
        }
        if let Err(e) = self.fetch_zone_changes(&mut summary).await {
            tracing::warn!(scope = %self.states.scope(), error = %e, "zone changes failed");
            return Err(e);
        }

        tracing::info!(
            scope = %self.states.scope(),
            zones = summary.zones_completed.len(),
            changed = summary.records_changed,
            deleted = summary.records_deleted,
            "pull complete"
        );
        Ok(summary)
    }

    async fn fetch_database_changes(&self, summary: &mut PullSummary) -> SyncResult<()> {
        loop {
            let previous_token = self
                .context
                .perform(|tx| self.states.database_state(tx))?
                .change_token;
            let mut feed = self
                .remote
                .fetch_database_changes(DatabaseChangesRequest {
                    scope: self.states.scope(),
                    previous_token,
                    fetch_all_changes: self.fetch_all_changes,
                })
                .await;

            let mut transitions = Vec::new();
            let more_coming = loop {
                let Some(event) = feed.recv().await else {
                    return Err(SyncError::FeedInterrupted);
                };
                match event {
                    DatabaseChange::ZoneChanged(zone_id) => {
                        transitions.push(ZoneTransition::Changed(zone_id))
                    }
                    DatabaseChange::ZoneDeleted(zone_id) => {
                        transitions.push(ZoneTransition::Deleted(zone_id))
                    }
                    DatabaseChange::ZonePurged(zone_id) => {
                        transitions.push(ZoneTransition::Purged(zone_id))
                    }
                    DatabaseChange::TokenUpdated(token) => {
                        let pending = std::mem::take(&mut transitions);
                        self.checkpoint_database(pending, Some(&token), summary)?;
                    }
                    DatabaseChange::Completed {
                        token,
                        more_coming,
                        error,
                    } => {
                        if let Some(error) = error {
                            return Err(error.into());
                        }
                        let pending = std::mem::take(&mut transitions);
                        self.checkpoint_database(pending, token.as_ref(), summary)?;
                        break more_coming;
                    }
                }
            };

            if !more_coming {
                return Ok(());
            }
            tracing::debug!(scope = %self.states.scope(), "more database changes coming");
        }
    }

    /// Applies zone transitions, cleans up deleted zones, then stores the
    /// token, all in one commit.
    fn checkpoint_database(
        &self,
        transitions: Vec<ZoneTransition>,
        token: Option<&ChangeToken>,
        summary: &mut PullSummary,
    ) -> SyncResult<()> {
        let purge = self.context.perform(|tx| -> SyncResult<PurgeSummary> {
            for transition in &transitions {
                match transition {
                    ZoneTransition::Changed(zone_id) => self.states.mark_zone_changed(tx, zone_id)?,
                    ZoneTransition::Deleted(zone_id) => {
                        self.states.mark_zone_deleted(tx, zone_id, false)?
                    }
                    ZoneTransition::Purged(zone_id) => {
                        self.states.mark_zone_deleted(tx, zone_id, true)?
                    }
                }
            }
            let purge = self.states.purge_deleted_zones(tx, &self.registry)?;
            if let Some(token) = token {
                self.states.set_database_token(tx, token)?;
            }
            Ok(purge)
        })?;

        for transition in &transitions {
            match transition {
                ZoneTransition::Changed(_) => summary.zones_changed += 1,
                ZoneTransition::Deleted(_) => summary.zones_deleted += 1,
                ZoneTransition::Purged(_) => summary.zones_purged += 1,
            }
        }
        summary.objects_purged += purge.objects_deleted;
        tracing::debug!(
            scope = %self.states.scope(),
            transitions = transitions.len(),
            has_token = token.is_some(),
            "database checkpoint"
        );
        Ok(())
    }

    async fn fetch_zone_changes(&self, summary: &mut PullSummary) -> SyncResult<()> {
        let dirty = self.context.perform(|tx| -> SyncResult<_> {
            self.states.database_state(tx)?;
            self.states.dirty_zones(&*tx)
        })?;
        if dirty.is_empty() {
            tracing::debug!(scope = %self.states.scope(), "no dirty zones");
            return Ok(());
        }

        let zones = dirty
            .into_iter()
            .map(|zone| (zone.zone_id, zone.change_token))
            .collect();
        let mut feed = self
            .remote
            .fetch_zone_changes(ZoneChangesRequest {
                scope: self.states.scope(),
                zones,
            })
            .await;

        let mut deleted = DeletedRecordsBatch::default();
        loop {
            let Some(event) = feed.recv().await else {
                return Err(SyncError::FeedInterrupted);
            };
            match event {
                ZoneChange::RecordChanged(record) => {
                    self.context
                        .perform(|tx| self.registry.apply_from_remote(tx, &record, true))?;
                    summary.records_changed += 1;
                }
                ZoneChange::RecordDeleted {
                    record_id,
                    record_type,
                } => deleted.push(record_type, record_id),
                ZoneChange::TokenUpdated { zone_id, token } => {
                    self.checkpoint_zone(&mut deleted, &zone_id, Some(&token), false, summary)?;
                }
                ZoneChange::ZoneCompleted {
                    zone_id,
                    token,
                    error: None,
                } => {
                    self.checkpoint_zone(&mut deleted, &zone_id, token.as_ref(), true, summary)?;
                }
                ZoneChange::ZoneCompleted {
                    zone_id,
                    error: Some(error),
                    ..
                } if error.is_zone_deleted() => {
                    self.zone_gone(&mut deleted, &zone_id, summary)?;
                }
                ZoneChange::ZoneCompleted {
                    error: Some(error), ..
                }
                | ZoneChange::Completed { error: Some(error) } => return Err(error.into()),
                ZoneChange::Completed { error: None } => {
                    if !deleted.is_empty() {
                        let batch = deleted.take();
                        self.context
                            .perform(|tx| self.registry.delete_for_record_ids(tx, &batch))?;
                        summary.records_deleted += batch.values().map(Vec::len).sum::<usize>();
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Flushes pending deletions, advances the zone token and, on
    /// completion, clears the dirty flag, all in one commit.
    fn checkpoint_zone(
        &self,
        deleted: &mut DeletedRecordsBatch,
        zone_id: &ZoneId,
        token: Option<&ChangeToken>,
        completed: bool,
        summary: &mut PullSummary,
    ) -> SyncResult<()> {
        let flushed = deleted.len();
        let batch = deleted.take();
        self.context.perform(|tx| -> SyncResult<()> {
            self.registry.delete_for_record_ids(tx, &batch)?;
            if let Some(token) = token {
                self.states.set_zone_token(tx, zone_id, token)?;
            }
            if completed {
                self.states.clear_zone_dirty(tx, zone_id)?;
            }
            Ok(())
        })?;

        summary.records_deleted += flushed;
        if completed {
            summary.zones_completed.push(zone_id.clone());
        }
        tracing::debug!(zone = %zone_id, flushed, completed, "zone checkpoint");
        Ok(())
    }

    fn zone_gone(
        &self,
        deleted: &mut DeletedRecordsBatch,
        zone_id: &ZoneId,
        summary: &mut PullSummary,
    ) -> SyncResult<()> {
        let flushed = deleted.len();
        let batch = deleted.take();
        self.context.perform(|tx| -> SyncResult<()> {
            self.registry.delete_for_record_ids(tx, &batch)?;
            self.states.mark_zone_deleted(tx, zone_id, false)?;
            self.states.clear_zone_dirty(tx, zone_id)
        })?;

        summary.records_deleted += flushed;
        summary.zones_gone.push(zone_id.clone());
        tracing::warn!(zone = %zone_id, "zone deleted on server; scheduled for cleanup");
        Ok(())
    }
}

impl std::fmt::Debug for PullEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullEngine")
            .field("scope", &self.states.scope())
            .field("context", &self.context)
            .finish()
    }
}
