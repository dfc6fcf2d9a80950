//! Remote identity carried by synced local objects.
//!
//! Every object that mirrors a remote record stores three reserved
//! attributes next to its own: the record name, the zone name and the
//! archived system fields. Once set, the record name and zone never change,
//! and system fields are only ever stored on an object that has both.

use crate::error::{SyncError, SyncResult};
use zonesync_protocol::{RecordId, RemoteRecord, SystemFields, ZoneId};
use zonesync_store::{ManagedObject, ObjectId, ObjectRead, Transaction};

/// Attribute holding the remote record name.
pub const REMOTE_RECORD_ID: &str = "remoteRecordID";

/// Attribute holding the remote zone name.
pub const REMOTE_ZONE_ID: &str = "remoteZoneID";

/// Attribute holding the archived system fields.
pub const SYSTEM_FIELDS: &str = "systemFields";

/// Returns true for attributes managed by the engine rather than mapped to
/// record fields.
pub fn is_reserved(key: &str) -> bool {
    matches!(key, REMOTE_RECORD_ID | REMOTE_ZONE_ID | SYSTEM_FIELDS)
}

/// Returns the remote record ID of an object, if it has one.
pub fn remote_record_id(object: &ManagedObject) -> Option<RecordId> {
    let record_name = object.text(REMOTE_RECORD_ID)?;
    let zone_name = object.text(REMOTE_ZONE_ID)?;
    Some(RecordId::new(ZoneId::new(zone_name), record_name))
}

/// Returns the archived system fields of an object, if any.
pub fn system_fields(object: &ManagedObject) -> Option<SystemFields> {
    object.bytes(SYSTEM_FIELDS).map(SystemFields::from_bytes)
}

/// Checks that an object carrying system fields also has a remote ID.
pub fn check_identity(object: &ManagedObject) -> SyncResult<()> {
    if object.get(SYSTEM_FIELDS).is_some() && remote_record_id(object).is_none() {
        return Err(SyncError::MissingRemoteIdentity {
            object_id: object.id(),
        });
    }
    Ok(())
}

/// Returns true if `object` mirrors the given remote record.
pub fn matches_record_id(object: &ManagedObject, record_id: &RecordId) -> bool {
    object.text(REMOTE_RECORD_ID) == Some(record_id.record_name.as_str())
        && object.text(REMOTE_ZONE_ID) == Some(record_id.zone_id.name())
}

/// Finds the local object of `entity` mirroring `record_id`.
pub fn find_by_record_id(
    reader: &dyn ObjectRead,
    entity: &str,
    record_id: &RecordId,
) -> Option<ManagedObject> {
    reader
        .fetch(entity, &|object| matches_record_id(object, record_id))
        .into_iter()
        .next()
}

/// Assigns a remote identity to an object.
///
/// Assigning the identity an object already has is a no-op; assigning a
/// different one fails.
pub fn assign_identity(tx: &mut Transaction, id: ObjectId, record_id: &RecordId) -> SyncResult<()> {
    let object = tx
        .object(id)
        .ok_or(zonesync_store::StoreError::ObjectNotFound { object_id: id })?;
    match remote_record_id(&object) {
        Some(existing) if &existing == record_id => Ok(()),
        Some(_) => Err(SyncError::IdentityReassigned { object_id: id }),
        None => {
            tx.set(id, REMOTE_RECORD_ID, record_id.record_name.as_str())?;
            tx.set(id, REMOTE_ZONE_ID, record_id.zone_id.name())?;
            Ok(())
        }
    }
}

/// Archives the bookkeeping of `record` onto the object mirroring it.
pub fn store_system_fields(
    tx: &mut Transaction,
    id: ObjectId,
    record: &RemoteRecord,
) -> SyncResult<()> {
    let object = tx
        .object(id)
        .ok_or(zonesync_store::StoreError::ObjectNotFound { object_id: id })?;
    match remote_record_id(&object) {
        Some(existing) if &existing == record.record_id() => {}
        Some(_) => return Err(SyncError::IdentityReassigned { object_id: id }),
        None => return Err(SyncError::MissingRemoteIdentity { object_id: id }),
    }
    let blob = SystemFields::encode(record)?;
    tx.set(id, SYSTEM_FIELDS, blob.into_bytes())?;
    Ok(())
}

/// Fails if a pending write changed an identity the object already had.
pub fn check_identity_unchanged(tx: &Transaction, id: ObjectId) -> SyncResult<()> {
    let Some(before) = tx.committed(id).and_then(remote_record_id) else {
        return Ok(());
    };
    let after = tx.object(id).as_ref().and_then(remote_record_id);
    if after.as_ref() != Some(&before) {
        return Err(SyncError::IdentityReassigned { object_id: id });
    }
    Ok(())
}
