//! Read-only views of committed state.

use crate::object::{ManagedObject, ObjectId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Read access shared by snapshots and open transactions.
pub trait ObjectRead {
    /// Looks up an object by ID.
    fn object(&self, id: ObjectId) -> Option<ManagedObject>;

    /// Returns every object of `entity` matching `predicate`, in ID order.
    fn fetch(&self, entity: &str, predicate: &dyn Fn(&ManagedObject) -> bool)
        -> Vec<ManagedObject>;

    /// Counts the objects of an entity.
    fn count(&self, entity: &str) -> usize {
        self.fetch(entity, &|_| true).len()
    }
}

/// An immutable view of the store as of one commit.
///
/// Cloning a snapshot is cheap; it shares the committed object map.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    objects: Arc<BTreeMap<ObjectId, ManagedObject>>,
    sequence: u64,
}

impl Snapshot {
    pub(crate) fn new(objects: BTreeMap<ObjectId, ManagedObject>, sequence: u64) -> Self {
        Self {
            objects: Arc::new(objects),
            sequence,
        }
    }

    /// Returns the commit sequence this snapshot reflects.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the number of objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if the store holds no objects.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub(crate) fn get(&self, id: &ObjectId) -> Option<&ManagedObject> {
        self.objects.get(id)
    }

    pub(crate) fn version_of(&self, id: &ObjectId) -> Option<u64> {
        self.objects.get(id).map(ManagedObject::version)
    }

    pub(crate) fn objects(&self) -> &BTreeMap<ObjectId, ManagedObject> {
        &self.objects
    }
}

impl ObjectRead for Snapshot {
    fn object(&self, id: ObjectId) -> Option<ManagedObject> {
        self.objects.get(&id).cloned()
    }

    fn fetch(
        &self,
        entity: &str,
        predicate: &dyn Fn(&ManagedObject) -> bool,
    ) -> Vec<ManagedObject> {
        self.objects
            .values()
            .filter(|object| object.entity() == entity && predicate(object))
            .cloned()
            .collect()
    }
}
