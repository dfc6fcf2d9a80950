//! Dispatch from record types to translators.

use crate::error::{SyncError, SyncResult};
use crate::translator::RecordTranslator;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use zonesync_protocol::{RecordId, RemoteRecord, ZoneId};
use zonesync_store::{ObjectId, Transaction};

/// Record translators keyed by record type and by local entity.
#[derive(Clone, Default)]
pub struct TranslatorRegistry {
    by_type: BTreeMap<String, Arc<dyn RecordTranslator>>,
    by_entity: BTreeMap<String, Arc<dyn RecordTranslator>>,
}

impl TranslatorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a translator, replacing any previous one for the same
    /// record type or entity.
    pub fn register(&mut self, translator: Arc<dyn RecordTranslator>) {
        self.by_type
            .insert(translator.record_type().to_string(), Arc::clone(&translator));
        self.by_entity
            .insert(translator.entity().to_string(), translator);
    }

    /// Registers a translator, builder style.
    pub fn with(mut self, translator: impl RecordTranslator + 'static) -> Self {
        self.register(Arc::new(translator));
        self
    }

    /// Returns the translator for a record type.
    pub fn class_for_type(&self, record_type: &str) -> SyncResult<&Arc<dyn RecordTranslator>> {
        self.by_type
            .get(record_type)
            .ok_or_else(|| SyncError::UnknownRecordType(record_type.to_string()))
    }

    /// Returns the translator for a local entity, if it takes part in sync.
    pub fn for_entity(&self, entity: &str) -> Option<&Arc<dyn RecordTranslator>> {
        self.by_entity.get(entity)
    }

    /// Returns the registered record types.
    pub fn record_types(&self) -> impl Iterator<Item = &str> {
        self.by_type.keys().map(String::as_str)
    }

    /// Applies a remote record through its type's translator.
    pub fn apply_from_remote(
        &self,
        tx: &mut Transaction,
        record: &RemoteRecord,
        update_values: bool,
    ) -> SyncResult<Option<ObjectId>> {
        self.class_for_type(record.record_type())?
            .apply_from_record(tx, record, update_values)
    }

    /// Deletes local objects for a batch of deleted records, grouped by
    /// record type.
    pub fn delete_for_record_ids(
        &self,
        tx: &mut Transaction,
        deleted: &BTreeMap<String, Vec<RecordId>>,
    ) -> SyncResult<Vec<ObjectId>> {
        let mut objects = Vec::new();
        for (record_type, record_ids) in deleted {
            let translator = self.class_for_type(record_type)?;
            objects.extend(translator.delete_for_record_ids(tx, record_ids)?);
        }
        Ok(objects)
    }

    /// Deletes every synced local object in the given zones.
    pub fn delete_for_zone_ids(
        &self,
        tx: &mut Transaction,
        zone_ids: &BTreeSet<ZoneId>,
    ) -> SyncResult<Vec<ObjectId>> {
        let mut objects = Vec::new();
        for translator in self.by_type.values() {
            objects.extend(translator.delete_for_zone_ids(tx, zone_ids)?);
        }
        Ok(objects)
    }
}

impl fmt::Debug for TranslatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslatorRegistry")
            .field("record_types", &self.by_type.keys().collect::<Vec<_>>())
            .finish()
    }
}
