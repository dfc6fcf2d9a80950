//! Transactions over the object store.

use crate::error::{StoreError, StoreResult};
use crate::object::{ManagedObject, ObjectId};
use crate::snapshot::{ObjectRead, Snapshot};
use crate::value::AttributeValue;
use std::collections::{BTreeMap, BTreeSet};

/// A buffered write.
#[derive(Debug, Clone)]
pub(crate) enum PendingWrite {
    /// Object created in this transaction.
    Insert(ManagedObject),
    /// Existing object modified in this transaction.
    Update {
        object: ManagedObject,
        changed: BTreeSet<String>,
    },
    /// Existing object deleted; holds its last committed state.
    Delete(ManagedObject),
}

/// A unit of work against one snapshot of the store.
///
/// Reads see the snapshot plus this transaction's own writes. Nothing is
/// visible to other readers until the owning [`crate::Context`] commits.
#[derive(Debug)]
pub struct Transaction {
    base: Snapshot,
    writes: BTreeMap<ObjectId, PendingWrite>,
}

impl Transaction {
    pub(crate) fn new(base: Snapshot) -> Self {
        Self {
            base,
            writes: BTreeMap::new(),
        }
    }

    pub(crate) fn into_parts(self) -> (Snapshot, BTreeMap<ObjectId, PendingWrite>) {
        (self.base, self.writes)
    }

    /// Inserts a new, empty object.
    pub fn insert(&mut self, entity: &str) -> ObjectId {
        let id = ObjectId::new();
        self.writes
            .insert(id, PendingWrite::Insert(ManagedObject::new(id, entity)));
        id
    }

    /// Sets an attribute.
    pub fn set(
        &mut self,
        id: ObjectId,
        key: &str,
        value: impl Into<AttributeValue>,
    ) -> StoreResult<()> {
        let value = value.into();
        self.modify(id, key, |object| object.set_attribute(key, Some(value)))
    }

    /// Clears an attribute.
    pub fn clear(&mut self, id: ObjectId, key: &str) -> StoreResult<()> {
        self.modify(id, key, |object| object.set_attribute(key, None))
    }

    /// Sets or clears an attribute.
    pub fn set_optional(
        &mut self,
        id: ObjectId,
        key: &str,
        value: Option<AttributeValue>,
    ) -> StoreResult<()> {
        self.modify(id, key, |object| object.set_attribute(key, value))
    }

    /// Replaces the targets of a to-many relationship.
    pub fn set_related(
        &mut self,
        id: ObjectId,
        key: &str,
        targets: BTreeSet<ObjectId>,
    ) -> StoreResult<()> {
        self.modify(id, key, |object| object.set_relationship(key, targets))
    }

    /// Adds one target to a to-many relationship.
    pub fn add_related(&mut self, id: ObjectId, key: &str, target: ObjectId) -> StoreResult<()> {
        let mut targets = self
            .object(id)
            .ok_or(StoreError::ObjectNotFound { object_id: id })?
            .related(key)
            .cloned()
            .unwrap_or_default();
        targets.insert(target);
        self.set_related(id, key, targets)
    }

    /// Deletes an object.
    pub fn delete(&mut self, id: ObjectId) -> StoreResult<()> {
        match self.writes.remove(&id) {
            Some(PendingWrite::Insert(_)) => Ok(()),
            Some(PendingWrite::Delete(object)) => {
                self.writes.insert(id, PendingWrite::Delete(object));
                Ok(())
            }
            Some(PendingWrite::Update { .. }) | None => {
                let committed = self
                    .base
                    .get(&id)
                    .cloned()
                    .ok_or(StoreError::ObjectNotFound { object_id: id })?;
                self.writes.insert(id, PendingWrite::Delete(committed));
                Ok(())
            }
        }
    }

    /// Deletes every object of `entity` matching `predicate`, returning the
    /// deleted IDs.
    pub fn delete_where(
        &mut self,
        entity: &str,
        predicate: &dyn Fn(&ManagedObject) -> bool,
    ) -> StoreResult<Vec<ObjectId>> {
        let ids: Vec<ObjectId> = self
            .fetch(entity, predicate)
            .iter()
            .map(ManagedObject::id)
            .collect();
        for id in &ids {
            self.delete(*id)?;
        }
        Ok(ids)
    }

    /// IDs of objects inserted in this transaction.
    pub fn inserted_ids(&self) -> Vec<ObjectId> {
        self.writes
            .iter()
            .filter_map(|(id, write)| matches!(write, PendingWrite::Insert(_)).then_some(*id))
            .collect()
    }

    /// Updated objects with the keys changed so far.
    pub fn updated_changes(&self) -> Vec<(ObjectId, BTreeSet<String>)> {
        self.writes
            .iter()
            .filter_map(|(id, write)| match write {
                PendingWrite::Update { changed, .. } if !changed.is_empty() => {
                    Some((*id, changed.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Last committed state of objects deleted in this transaction.
    pub fn deleted_objects(&self) -> Vec<ManagedObject> {
        self.writes
            .values()
            .filter_map(|write| match write {
                PendingWrite::Delete(object) => Some(object.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns an object as it was when this transaction began.
    pub fn committed(&self, id: ObjectId) -> Option<&ManagedObject> {
        self.base.get(&id)
    }

    /// Returns true if committing would change anything.
    pub fn has_changes(&self) -> bool {
        self.writes.values().any(|write| match write {
            PendingWrite::Update { changed, .. } => !changed.is_empty(),
            _ => true,
        })
    }

    fn modify(
        &mut self,
        id: ObjectId,
        key: &str,
        change: impl FnOnce(&mut ManagedObject) -> bool,
    ) -> StoreResult<()> {
        if !self.writes.contains_key(&id) {
            let object = self
                .base
                .get(&id)
                .cloned()
                .ok_or(StoreError::ObjectNotFound { object_id: id })?;
            self.writes.insert(
                id,
                PendingWrite::Update {
                    object,
                    changed: BTreeSet::new(),
                },
            );
        }

        match self.writes.get_mut(&id) {
            Some(PendingWrite::Insert(object)) => {
                change(object);
                Ok(())
            }
            Some(PendingWrite::Update { object, changed }) => {
                if change(object) {
                    changed.insert(key.to_string());
                }
                Ok(())
            }
            Some(PendingWrite::Delete(_)) => Err(StoreError::ObjectDeleted { object_id: id }),
            None => Err(StoreError::ObjectNotFound { object_id: id }),
        }
    }
}

impl ObjectRead for Transaction {
    fn object(&self, id: ObjectId) -> Option<ManagedObject> {
        match self.writes.get(&id) {
            Some(PendingWrite::Insert(object)) | Some(PendingWrite::Update { object, .. }) => {
                Some(object.clone())
            }
            Some(PendingWrite::Delete(_)) => None,
            None => self.base.get(&id).cloned(),
        }
    }

    fn fetch(
        &self,
        entity: &str,
        predicate: &dyn Fn(&ManagedObject) -> bool,
    ) -> Vec<ManagedObject> {
        let committed = self
            .base
            .objects()
            .iter()
            .filter(|(id, _)| !self.writes.contains_key(id))
            .map(|(_, object)| object);
        let written = self.writes.values().filter_map(|write| match write {
            PendingWrite::Insert(object) | PendingWrite::Update { object, .. } => Some(object),
            PendingWrite::Delete(_) => None,
        });

        let mut matches: Vec<ManagedObject> = committed
            .chain(written)
            .filter(|object| object.entity() == entity && predicate(object))
            .cloned()
            .collect();
        matches.sort_by_key(ManagedObject::id);
        matches
    }
}
