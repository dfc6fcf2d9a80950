//! Persisted marker for the remote change subscription.

use crate::error::SyncResult;
use std::sync::atomic::{AtomicBool, Ordering};
use zonesync_protocol::SubscriptionId;
use zonesync_store::{Context, ObjectRead};

/// Entity holding subscription markers.
pub const SUBSCRIPTION_STATE: &str = "SubscriptionState";

const SUBSCRIPTION_ID: &str = "subscriptionID";
const IS_SAVED: &str = "isSaved";

/// Records whether the engine's subscription was saved remotely.
pub trait SubscriptionFlag: Send + Sync {
    /// Returns true once the subscription has been saved.
    fn is_saved(&self) -> SyncResult<bool>;

    /// Marks the subscription as saved.
    fn mark_saved(&self) -> SyncResult<()>;
}

/// In-memory flag, forgotten on restart.
#[derive(Debug, Default)]
pub struct MemorySubscriptionFlag(AtomicBool);

impl MemorySubscriptionFlag {
    /// Creates an unset flag.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubscriptionFlag for MemorySubscriptionFlag {
    fn is_saved(&self) -> SyncResult<bool> {
        Ok(self.0.load(Ordering::SeqCst))
    }

    fn mark_saved(&self) -> SyncResult<()> {
        self.0.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Flag stored as a row in the local object store.
#[derive(Debug, Clone)]
pub struct StoreSubscriptionFlag {
    context: Context,
    subscription_id: SubscriptionId,
}

impl StoreSubscriptionFlag {
    /// Creates a flag for `subscription_id`, written through `context`.
    pub fn new(context: Context, subscription_id: SubscriptionId) -> Self {
        Self {
            context,
            subscription_id,
        }
    }
}

impl SubscriptionFlag for StoreSubscriptionFlag {
    fn is_saved(&self) -> SyncResult<bool> {
        let id = self.subscription_id.as_str();
        let rows = self
            .context
            .snapshot()
            .fetch(SUBSCRIPTION_STATE, &|object| object.text(SUBSCRIPTION_ID) == Some(id));
        Ok(rows.iter().any(|row| row.flag(IS_SAVED)))
    }

    fn mark_saved(&self) -> SyncResult<()> {
        let id = self.subscription_id.as_str();
        self.context.perform(|tx| -> SyncResult<()> {
            let rows = tx.fetch(SUBSCRIPTION_STATE, &|object| {
                object.text(SUBSCRIPTION_ID) == Some(id)
            });
            let object_id = match rows.first() {
                Some(row) => row.id(),
                None => {
                    let object_id = tx.insert(SUBSCRIPTION_STATE);
                    tx.set(object_id, SUBSCRIPTION_ID, id)?;
                    object_id
                }
            };
            tx.set(object_id, IS_SAVED, true)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zonesync_store::{MergePolicy, ObjectStore};

    #[test]
    fn memory_flag() {
        let flag = MemorySubscriptionFlag::new();
        assert!(!flag.is_saved().unwrap());
        flag.mark_saved().unwrap();
        assert!(flag.is_saved().unwrap());
    }

    #[test]
    fn store_flag_is_per_subscription_and_idempotent() {
        let store = ObjectStore::in_memory();
        let context = store.context("sync", MergePolicy::ObjectTrumps);
        let flag = StoreSubscriptionFlag::new(context.clone(), SubscriptionId::new("a"));
        let other = StoreSubscriptionFlag::new(context, SubscriptionId::new("b"));

        assert!(!flag.is_saved().unwrap());
        flag.mark_saved().unwrap();
        flag.mark_saved().unwrap();

        assert!(flag.is_saved().unwrap());
        assert!(!other.is_saved().unwrap());
        assert_eq!(store.snapshot().count(SUBSCRIPTION_STATE), 1);
    }

    #[test]
    fn store_flag_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ObjectStore::open(dir.path()).unwrap();
            let flag = StoreSubscriptionFlag::new(
                store.context("sync", MergePolicy::ObjectTrumps),
                SubscriptionId::new("a"),
            );
            flag.mark_saved().unwrap();
        }
        let store = ObjectStore::open(dir.path()).unwrap();
        let flag = StoreSubscriptionFlag::new(
            store.context("sync", MergePolicy::ObjectTrumps),
            SubscriptionId::new("a"),
        );
        assert!(flag.is_saved().unwrap());
    }
}
