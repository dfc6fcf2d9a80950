//! Applying push outcomes back to the local store.

use crate::error::SyncResult;
use crate::registry::TranslatorRegistry;
use std::sync::Arc;
use zonesync_protocol::ModifyRecordsOutcome;
use zonesync_store::Context;

/// Stores the server's bookkeeping for pushed records.
///
/// Runs in its own context, which should use
/// [`zonesync_store::MergePolicy::ObjectTrumps`] so that edits made while a
/// push was in flight survive and only the archived system fields change.
#[derive(Debug, Clone)]
pub struct Reconciler {
    context: Context,
    registry: Arc<TranslatorRegistry>,
}

impl Reconciler {
    /// Creates a reconciler writing through `context`.
    pub fn new(context: Context, registry: Arc<TranslatorRegistry>) -> Self {
        Self { context, registry }
    }

    /// Returns the reconciliation context.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Archives the bookkeeping of every saved record onto its local
    /// object. Returns how many objects were updated.
    pub fn reconcile(&self, outcome: &ModifyRecordsOutcome) -> SyncResult<usize> {
        let updated = self.context.perform(|tx| -> SyncResult<usize> {
            let mut updated = 0;
            for record in &outcome.saved {
                if self.registry.apply_from_remote(tx, record, false)?.is_some() {
                    updated += 1;
                }
            }
            Ok(updated)
        })?;

        tracing::debug!(
            saved = outcome.saved.len(),
            deleted = outcome.deleted.len(),
            updated,
            "reconciled push outcome"
        );
        Ok(updated)
    }
}
