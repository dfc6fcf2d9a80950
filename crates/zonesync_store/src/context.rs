//! Contexts: named views of the store that run transactional blocks.

use crate::error::StoreError;
use crate::object::{ManagedObject, ObjectId};
use crate::snapshot::Snapshot;
use crate::store::ObjectStore;
use crate::transaction::Transaction;
use parking_lot::RwLock;
use std::sync::Arc;

/// How a commit treats objects another commit changed in the meantime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Fail the commit.
    #[default]
    Error,
    /// Keep the keys this transaction changed; take every other key from
    /// the store.
    ObjectTrumps,
}

/// What a commit did, handed to post-save hooks.
#[derive(Debug, Clone)]
pub struct SaveSummary {
    /// Commit sequence number.
    pub sequence: u64,
    /// Name of the context that committed.
    pub origin: String,
    /// Inserted objects.
    pub inserted: Vec<ObjectId>,
    /// Updated objects.
    pub updated: Vec<ObjectId>,
    /// Deleted objects, as last committed.
    pub deleted: Vec<ManagedObject>,
}

/// Hooks around a context's saves.
pub trait SaveObserver: Send + Sync {
    /// Runs before commit with the transaction still open; may add writes.
    fn will_save(&self, _tx: &mut Transaction) -> Result<(), StoreError> {
        Ok(())
    }

    /// Runs after a successful commit.
    fn did_save(&self, _summary: &SaveSummary) {}
}

/// A named handle for running transactions with a fixed merge policy and
/// its own save hooks.
#[derive(Clone)]
pub struct Context {
    store: ObjectStore,
    name: Arc<str>,
    policy: MergePolicy,
    observers: Arc<RwLock<Vec<Arc<dyn SaveObserver>>>>,
}

impl Context {
    pub(crate) fn new(store: ObjectStore, name: &str, policy: MergePolicy) -> Self {
        Self {
            store,
            name: Arc::from(name),
            policy,
            observers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Returns the context name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the merge policy.
    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    /// Returns the owning store.
    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// Registers save hooks for this context.
    pub fn add_observer(&self, observer: Arc<dyn SaveObserver>) {
        self.observers.write().push(observer);
    }

    /// Returns the latest committed state.
    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    /// Runs `block` in a fresh transaction and commits it.
    ///
    /// If the block fails nothing is committed. If the block made changes,
    /// `will_save` hooks run, the transaction commits under this context's
    /// merge policy, then `did_save` hooks run.
    pub fn perform<R, E>(&self, block: impl FnOnce(&mut Transaction) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let mut tx = Transaction::new(self.store.snapshot());
        let result = block(&mut tx)?;
        if !tx.has_changes() {
            return Ok(result);
        }

        let observers = self.observers.read().clone();
        for observer in &observers {
            observer.will_save(&mut tx)?;
        }

        let summary = self.store.commit(tx, self.policy, &self.name)?;
        for observer in &observers {
            observer.did_save(&summary);
        }
        Ok(result)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish()
    }
}
