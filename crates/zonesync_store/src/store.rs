//! The object store: committed state, persistence and change notifications.

use crate::context::{Context, MergePolicy, SaveSummary};
use crate::error::{StoreError, StoreResult};
use crate::object::{ManagedObject, ObjectId};
use crate::snapshot::Snapshot;
use crate::transaction::{PendingWrite, Transaction};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

const LOCK_FILE: &str = "LOCK";
const STATE_FILE: &str = "STATE";
const STATE_TEMP: &str = "STATE.tmp";
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Notification sent to subscribers after every commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    /// Commit sequence number.
    pub sequence: u64,
    /// Name of the context that committed.
    pub origin: String,
    /// Inserted objects.
    pub inserted: Vec<ObjectId>,
    /// Updated objects.
    pub updated: Vec<ObjectId>,
    /// Deleted objects.
    pub deleted: Vec<ObjectId>,
}

#[derive(Serialize, Deserialize)]
struct PersistedState {
    sequence: u64,
    objects: Vec<ManagedObject>,
}

struct FilePersistence {
    path: PathBuf,
    _lock_file: File,
}

impl FilePersistence {
    fn open(path: &Path) -> StoreResult<Self> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    fn load(&self) -> StoreResult<Option<PersistedState>> {
        let state_path = self.path.join(STATE_FILE);
        if !state_path.exists() {
            return Ok(None);
        }

        let mut data = Vec::new();
        File::open(&state_path)?.read_to_end(&mut data)?;
        if data.is_empty() {
            return Ok(None);
        }

        ciborium::from_reader(data.as_slice())
            .map(Some)
            .map_err(|e| StoreError::codec(e.to_string()))
    }

    /// Write-then-rename so a crash leaves either the old or the new state.
    fn save(&self, state: &PersistedState) -> StoreResult<()> {
        let mut data = Vec::new();
        ciborium::into_writer(state, &mut data).map_err(|e| StoreError::codec(e.to_string()))?;

        let temp_path = self.path.join(STATE_TEMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.path.join(STATE_FILE))?;
        Ok(())
    }
}

struct StoreInner {
    state: RwLock<Snapshot>,
    writer: Mutex<()>,
    persistence: Option<FilePersistence>,
    changes: broadcast::Sender<StoreChange>,
}

/// A transactional object store.
///
/// Cloning the handle is cheap; all clones share one committed state.
#[derive(Clone)]
pub struct ObjectStore {
    inner: Arc<StoreInner>,
}

impl ObjectStore {
    /// Creates an empty store that lives only in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_state(Snapshot::default(), None)
    }

    /// Opens or creates a file-backed store in the directory at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Locked`] if another process has the store open,
    /// or an I/O or codec error if the persisted state cannot be read.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let persistence = FilePersistence::open(path)?;
        let snapshot = match persistence.load()? {
            Some(state) => {
                let objects = state
                    .objects
                    .into_iter()
                    .map(|object| (object.id(), object))
                    .collect();
                Snapshot::new(objects, state.sequence)
            }
            None => Snapshot::default(),
        };
        tracing::debug!(
            path = %path.display(),
            objects = snapshot.len(),
            sequence = snapshot.sequence(),
            "opened object store"
        );
        Ok(Self::with_state(snapshot, Some(persistence)))
    }

    fn with_state(snapshot: Snapshot, persistence: Option<FilePersistence>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                state: RwLock::new(snapshot),
                writer: Mutex::new(()),
                persistence,
                changes,
            }),
        }
    }

    /// Creates a named context with its own merge policy and hooks.
    pub fn context(&self, name: &str, policy: MergePolicy) -> Context {
        Context::new(self.clone(), name, policy)
    }

    /// Returns the latest committed state.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.state.read().clone()
    }

    /// Subscribes to commit notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.inner.changes.subscribe()
    }

    pub(crate) fn commit(
        &self,
        tx: Transaction,
        policy: MergePolicy,
        origin: &str,
    ) -> StoreResult<SaveSummary> {
        let _writer = self.inner.writer.lock();
        let current = self.snapshot();
        let (base, writes) = tx.into_parts();

        let sequence = current.sequence() + 1;
        let mut objects = current.objects().clone();
        let mut summary = SaveSummary {
            sequence,
            origin: origin.to_string(),
            inserted: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        };

        for (id, write) in writes {
            match write {
                PendingWrite::Insert(mut object) => {
                    object.set_version(sequence);
                    objects.insert(id, object);
                    summary.inserted.push(id);
                }
                PendingWrite::Update { object, changed } => {
                    if changed.is_empty() {
                        continue;
                    }
                    let read_version = base.version_of(&id);
                    let Some(stored) = objects.get_mut(&id) else {
                        match policy {
                            MergePolicy::Error => {
                                return Err(StoreError::MergeConflict { object_id: id })
                            }
                            MergePolicy::ObjectTrumps => {
                                tracing::debug!(object_id = %id, "skipping update to deleted object");
                                continue;
                            }
                        }
                    };
                    if Some(stored.version()) == read_version {
                        *stored = object;
                    } else {
                        match policy {
                            MergePolicy::Error => {
                                return Err(StoreError::MergeConflict { object_id: id })
                            }
                            MergePolicy::ObjectTrumps => stored.overlay(&object, &changed),
                        }
                    }
                    stored.set_version(sequence);
                    summary.updated.push(id);
                }
                PendingWrite::Delete(object) => {
                    let Some(stored) = objects.remove(&id) else {
                        continue;
                    };
                    if policy == MergePolicy::Error && stored.version() != object.version() {
                        return Err(StoreError::MergeConflict { object_id: id });
                    }
                    summary.deleted.push(stored);
                }
            }
        }

        if let Some(persistence) = &self.inner.persistence {
            persistence.save(&PersistedState {
                sequence,
                objects: objects.values().cloned().collect(),
            })?;
        }
        *self.inner.state.write() = Snapshot::new(objects, sequence);

        tracing::trace!(
            sequence,
            origin,
            inserted = summary.inserted.len(),
            updated = summary.updated.len(),
            deleted = summary.deleted.len(),
            "committed"
        );

        // No receivers is fine.
        let _ = self.inner.changes.send(StoreChange {
            sequence,
            origin: origin.to_string(),
            inserted: summary.inserted.clone(),
            updated: summary.updated.clone(),
            deleted: summary.deleted.iter().map(ManagedObject::id).collect(),
        });

        Ok(summary)
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("ObjectStore")
            .field("objects", &snapshot.len())
            .field("sequence", &snapshot.sequence())
            .field("persistent", &self.inner.persistence.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ObjectRead;
    use tempfile::tempdir;

    fn insert_book(context: &Context, title: &str) -> ObjectId {
        context
            .perform(|tx| -> StoreResult<ObjectId> {
                let id = tx.insert("Book");
                tx.set(id, "title", title)?;
                Ok(id)
            })
            .unwrap()
    }

    #[test]
    fn commit_bumps_sequence_and_notifies() {
        let store = ObjectStore::in_memory();
        let mut changes = store.subscribe();
        let context = store.context("view", MergePolicy::Error);

        let id = insert_book(&context, "Dune");

        assert_eq!(store.snapshot().sequence(), 1);
        let change = changes.try_recv().unwrap();
        assert_eq!(change.sequence, 1);
        assert_eq!(change.origin, "view");
        assert_eq!(change.inserted, vec![id]);
    }

    #[test]
    fn error_policy_rejects_stale_update() {
        let store = ObjectStore::in_memory();
        let view = store.context("view", MergePolicy::Error);
        let id = insert_book(&view, "Dune");

        let stale = store.snapshot();
        view.perform(|tx| tx.set(id, "title", "Dune Messiah"))
            .unwrap();

        let mut tx = Transaction::new(stale);
        tx.set(id, "author", "Herbert").unwrap();
        let result = store.commit(tx, MergePolicy::Error, "view");
        assert!(matches!(result, Err(StoreError::MergeConflict { .. })));
    }

    #[test]
    fn object_trumps_keeps_other_keys_from_store() {
        let store = ObjectStore::in_memory();
        let view = store.context("view", MergePolicy::Error);
        let id = insert_book(&view, "Dune");

        let stale = store.snapshot();
        view.perform(|tx| tx.set(id, "title", "Dune Messiah"))
            .unwrap();

        let mut tx = Transaction::new(stale);
        tx.set(id, "author", "Herbert").unwrap();
        store
            .commit(tx, MergePolicy::ObjectTrumps, "sync")
            .unwrap();

        let object = store.snapshot().object(id).unwrap();
        assert_eq!(object.text("title"), Some("Dune Messiah"));
        assert_eq!(object.text("author"), Some("Herbert"));
    }

    #[test]
    fn object_trumps_skips_update_to_deleted_object() {
        let store = ObjectStore::in_memory();
        let view = store.context("view", MergePolicy::Error);
        let id = insert_book(&view, "Dune");

        let stale = store.snapshot();
        view.perform(|tx| tx.delete(id)).unwrap();

        let mut tx = Transaction::new(stale);
        tx.set(id, "author", "Herbert").unwrap();
        let summary = store
            .commit(tx, MergePolicy::ObjectTrumps, "sync")
            .unwrap();

        assert!(summary.updated.is_empty());
        assert!(store.snapshot().object(id).is_none());
    }

    #[test]
    fn persisted_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let id = {
            let store = ObjectStore::open(dir.path()).unwrap();
            insert_book(&store.context("view", MergePolicy::Error), "Dune")
        };

        let store = ObjectStore::open(dir.path()).unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.sequence(), 1);
        assert_eq!(snapshot.object(id).unwrap().text("title"), Some("Dune"));
    }

    #[test]
    fn second_open_is_locked() {
        let dir = tempdir().unwrap();
        let _store = ObjectStore::open(dir.path()).unwrap();
        assert!(matches!(
            ObjectStore::open(dir.path()),
            Err(StoreError::Locked)
        ));
    }
}
