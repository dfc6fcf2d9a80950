//! Persisted sync cursors.
//!
//! One `DatabaseSyncState` row per scope holds the database feed token. One
//! `ZoneSyncState` row per zone holds the zone feed token and the flags
//! phase 1 raises for phase 2 and for cleanup. Rows live in the local store
//! next to the synced objects, so cursor updates commit atomically with the
//! changes they cover.

use crate::error::{SyncError, SyncResult};
use crate::registry::TranslatorRegistry;
use std::collections::BTreeSet;
use zonesync_protocol::{ChangeToken, DatabaseScope, ZoneId};
use zonesync_store::{ManagedObject, ObjectId, ObjectRead, Transaction};

/// Entity of the per-scope state row.
pub const DATABASE_SYNC_STATE: &str = "DatabaseSyncState";

/// Entity of the per-zone state row.
pub const ZONE_SYNC_STATE: &str = "ZoneSyncState";

const SCOPE: &str = "scope";
const ZONE_ID: &str = "zoneID";
const CHANGE_TOKEN: &str = "changeToken";
const IS_DIRTY: &str = "isDirty";
const SHOULD_DELETE: &str = "shouldDelete";
const IS_PURGED: &str = "isPurged";
const DATABASE: &str = "database";

/// Cursor of the database change feed for one scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseState {
    /// Backing row.
    pub object_id: ObjectId,
    /// Scope.
    pub scope: DatabaseScope,
    /// Token of the last committed checkpoint.
    pub change_token: Option<ChangeToken>,
}

/// Cursor and flags of one zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneState {
    /// Backing row.
    pub object_id: ObjectId,
    /// Zone.
    pub zone_id: ZoneId,
    /// Token of the last committed checkpoint.
    pub change_token: Option<ChangeToken>,
    /// The zone has changes not yet fetched.
    pub is_dirty: bool,
    /// The zone's local records must be removed.
    pub should_delete: bool,
    /// The zone was purged; the row stays as a known-absent marker.
    pub is_purged: bool,
}

impl ZoneState {
    fn from_object(object: &ManagedObject) -> Option<Self> {
        Some(Self {
            object_id: object.id(),
            zone_id: ZoneId::new(object.text(ZONE_ID)?),
            change_token: token_of(object),
            is_dirty: object.flag(IS_DIRTY),
            should_delete: object.flag(SHOULD_DELETE),
            is_purged: object.flag(IS_PURGED),
        })
    }
}

fn token_of(object: &ManagedObject) -> Option<ChangeToken> {
    object.bytes(CHANGE_TOKEN).map(ChangeToken::from_bytes)
}

/// What a cleanup pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    /// Local synced objects deleted.
    pub objects_deleted: usize,
    /// Zones whose state row was deleted.
    pub zones_removed: Vec<ZoneId>,
    /// Purged zones whose state row was kept and reset.
    pub zones_purged: Vec<ZoneId>,
}

/// Reads and writes the sync state rows of one scope.
///
/// Every operation runs inside the caller's transaction.
#[derive(Debug, Clone)]
pub struct SyncStateStore {
    scope: DatabaseScope,
}

impl SyncStateStore {
    /// Creates a state store for `scope`.
    pub fn new(scope: DatabaseScope) -> Self {
        Self { scope }
    }

    /// Returns the scope.
    pub fn scope(&self) -> DatabaseScope {
        self.scope
    }

    /// Loads the database state, if it exists.
    pub fn load_database_state(&self, reader: &dyn ObjectRead) -> SyncResult<Option<DatabaseState>> {
        let scope = self.scope.as_str();
        let rows = reader.fetch(DATABASE_SYNC_STATE, &|object| object.text(SCOPE) == Some(scope));
        match rows.as_slice() {
            [] => Ok(None),
            [row] => Ok(Some(DatabaseState {
                object_id: row.id(),
                scope: self.scope,
                change_token: token_of(row),
            })),
            _ => Err(SyncError::DuplicateSyncState {
                scope: self.scope,
                zone_id: None,
            }),
        }
    }

    /// Fetches the database state, creating it on first use.
    pub fn database_state(&self, tx: &mut Transaction) -> SyncResult<DatabaseState> {
        if let Some(state) = self.load_database_state(&*tx)? {
            return Ok(state);
        }
        let object_id = tx.insert(DATABASE_SYNC_STATE);
        tx.set(object_id, SCOPE, self.scope.as_str())?;
        tracing::debug!(scope = %self.scope, "created database sync state");
        Ok(DatabaseState {
            object_id,
            scope: self.scope,
            change_token: None,
        })
    }

    /// Stores a new database feed token.
    pub fn set_database_token(&self, tx: &mut Transaction, token: &ChangeToken) -> SyncResult<()> {
        let state = self.database_state(tx)?;
        tx.set(state.object_id, CHANGE_TOKEN, token.as_bytes().to_vec())?;
        Ok(())
    }

    /// Loads every zone state of this scope, ordered by zone.
    pub fn zone_states(&self, reader: &dyn ObjectRead) -> SyncResult<Vec<ZoneState>> {
        let scope = self.scope.as_str();
        let rows = reader.fetch(ZONE_SYNC_STATE, &|object| object.text(SCOPE) == Some(scope));

        let mut seen = BTreeSet::new();
        let mut states = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(state) = ZoneState::from_object(row) else {
                tracing::warn!(object_id = %row.id(), "zone sync state without zone ID");
                continue;
            };
            if !seen.insert(state.zone_id.clone()) {
                return Err(SyncError::DuplicateSyncState {
                    scope: self.scope,
                    zone_id: Some(state.zone_id),
                });
            }
            states.push(state);
        }
        states.sort_by(|a, b| a.zone_id.cmp(&b.zone_id));
        Ok(states)
    }

    /// Loads one zone state, if it exists.
    pub fn load_zone_state(
        &self,
        reader: &dyn ObjectRead,
        zone_id: &ZoneId,
    ) -> SyncResult<Option<ZoneState>> {
        let scope = self.scope.as_str();
        let rows = reader.fetch(ZONE_SYNC_STATE, &|object| {
            object.text(SCOPE) == Some(scope) && object.text(ZONE_ID) == Some(zone_id.name())
        });
        match rows.as_slice() {
            [] => Ok(None),
            [row] => Ok(ZoneState::from_object(row)),
            _ => Err(SyncError::DuplicateSyncState {
                scope: self.scope,
                zone_id: Some(zone_id.clone()),
            }),
        }
    }

    /// Fetches a zone state, creating it (and the database state) on first
    /// use.
    pub fn zone_state(&self, tx: &mut Transaction, zone_id: &ZoneId) -> SyncResult<ZoneState> {
        if let Some(state) = self.load_zone_state(&*tx, zone_id)? {
            return Ok(state);
        }
        let database = self.database_state(tx)?;
        let object_id = tx.insert(ZONE_SYNC_STATE);
        tx.set(object_id, SCOPE, self.scope.as_str())?;
        tx.set(object_id, ZONE_ID, zone_id.name())?;
        tx.set(object_id, IS_DIRTY, false)?;
        tx.set(object_id, SHOULD_DELETE, false)?;
        tx.set(object_id, IS_PURGED, false)?;
        tx.add_related(object_id, DATABASE, database.object_id)?;
        tracing::debug!(scope = %self.scope, zone = %zone_id, "created zone sync state");
        Ok(ZoneState {
            object_id,
            zone_id: zone_id.clone(),
            change_token: None,
            is_dirty: false,
            should_delete: false,
            is_purged: false,
        })
    }

    /// Marks a zone as having changes to fetch.
    pub fn mark_zone_changed(&self, tx: &mut Transaction, zone_id: &ZoneId) -> SyncResult<()> {
        let state = self.zone_state(tx, zone_id)?;
        tx.set(state.object_id, IS_DIRTY, true)?;
        Ok(())
    }

    /// Marks a zone's local records for removal. A purged zone's row is
    /// kept after cleanup.
    pub fn mark_zone_deleted(
        &self,
        tx: &mut Transaction,
        zone_id: &ZoneId,
        purged: bool,
    ) -> SyncResult<()> {
        let state = self.zone_state(tx, zone_id)?;
        tx.set(state.object_id, SHOULD_DELETE, true)?;
        if purged {
            tx.set(state.object_id, IS_PURGED, true)?;
        }
        Ok(())
    }

    /// Stores a new zone feed token.
    pub fn set_zone_token(
        &self,
        tx: &mut Transaction,
        zone_id: &ZoneId,
        token: &ChangeToken,
    ) -> SyncResult<()> {
        let state = self.zone_state(tx, zone_id)?;
        tx.set(state.object_id, CHANGE_TOKEN, token.as_bytes().to_vec())?;
        Ok(())
    }

    /// Clears a zone's dirty flag.
    pub fn clear_zone_dirty(&self, tx: &mut Transaction, zone_id: &ZoneId) -> SyncResult<()> {
        let state = self.zone_state(tx, zone_id)?;
        tx.set(state.object_id, IS_DIRTY, false)?;
        Ok(())
    }

    /// Zones with changes to fetch.
    pub fn dirty_zones(&self, reader: &dyn ObjectRead) -> SyncResult<Vec<ZoneState>> {
        Ok(self
            .zone_states(reader)?
            .into_iter()
            .filter(|zone| zone.is_dirty)
            .collect())
    }

    /// Zones whose local records must be removed.
    pub fn zones_pending_deletion(&self, reader: &dyn ObjectRead) -> SyncResult<Vec<ZoneState>> {
        Ok(self
            .zone_states(reader)?
            .into_iter()
            .filter(|zone| zone.should_delete)
            .collect())
    }

    /// Removes the local records of every zone pending deletion, then
    /// resets purged zones' rows and deletes the others.
    pub fn purge_deleted_zones(
        &self,
        tx: &mut Transaction,
        registry: &TranslatorRegistry,
    ) -> SyncResult<PurgeSummary> {
        let pending = self.zones_pending_deletion(&*tx)?;
        if pending.is_empty() {
            return Ok(PurgeSummary::default());
        }

        let zone_ids: BTreeSet<ZoneId> = pending.iter().map(|zone| zone.zone_id.clone()).collect();
        let deleted = registry.delete_for_zone_ids(tx, &zone_ids)?;

        let mut summary = PurgeSummary {
            objects_deleted: deleted.len(),
            ..PurgeSummary::default()
        };
        for zone in pending {
            if zone.is_purged {
                tx.clear(zone.object_id, CHANGE_TOKEN)?;
                tx.set(zone.object_id, SHOULD_DELETE, false)?;
                tx.set(zone.object_id, IS_DIRTY, false)?;
                summary.zones_purged.push(zone.zone_id);
            } else {
                tx.delete(zone.object_id)?;
                summary.zones_removed.push(zone.zone_id);
            }
        }

        tracing::info!(
            scope = %self.scope,
            objects = summary.objects_deleted,
            removed = summary.zones_removed.len(),
            purged = summary.zones_purged.len(),
            "cleaned up deleted zones"
        );
        Ok(summary)
    }
}
