//! Modify, zone and subscription requests.

use crate::ids::{DatabaseScope, OperationId, RecordId, SubscriptionId, ZoneId};
use crate::record::RemoteRecord;

/// How the server treats a save whose record already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavePolicy {
    /// Reject the save if the server copy's change tag differs.
    IfServerRecordUnchanged,
    /// Overwrite only the fields sent, ignoring the change tag.
    ChangedKeys,
    /// Replace the whole server record, ignoring the change tag.
    AllKeys,
}

/// A batched save/delete request.
#[derive(Debug, Clone, PartialEq)]
pub struct ModifyRecordsRequest {
    /// Client-assigned identity, used to resume a durable request.
    pub operation_id: OperationId,
    /// Scope to write.
    pub scope: DatabaseScope,
    /// Records to create or update.
    pub records_to_save: Vec<RemoteRecord>,
    /// Records to delete.
    pub record_ids_to_delete: Vec<RecordId>,
    /// Conflict policy for saves.
    pub save_policy: SavePolicy,
    /// Keep the operation alive across client restarts.
    pub durable: bool,
}

impl ModifyRecordsRequest {
    /// Total number of items in the request.
    pub fn len(&self) -> usize {
        self.records_to_save.len() + self.record_ids_to_delete.len()
    }

    /// Returns true if the request carries no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of a successful modify request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModifyRecordsOutcome {
    /// Saved records as the server now stores them.
    pub saved: Vec<RemoteRecord>,
    /// Deleted record IDs.
    pub deleted: Vec<RecordId>,
}

/// A zone create/delete request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModifyZonesRequest {
    /// Zones to create. Creating an existing zone is a no-op.
    pub zones_to_save: Vec<ZoneId>,
    /// Zones to delete.
    pub zone_ids_to_delete: Vec<ZoneId>,
}

impl ModifyZonesRequest {
    /// A request that only creates `zone_id`.
    pub fn create(zone_id: ZoneId) -> Self {
        Self {
            zones_to_save: vec![zone_id],
            zone_ids_to_delete: Vec::new(),
        }
    }
}

/// Result of a zone request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModifyZonesOutcome {
    /// Zones that now exist.
    pub saved: Vec<ZoneId>,
    /// Zones that were deleted.
    pub deleted: Vec<ZoneId>,
}

/// A database-wide change subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    /// Subscription identity, echoed back in notifications.
    pub id: SubscriptionId,
    /// Scope to watch.
    pub scope: DatabaseScope,
}

/// A push notification delivered to the device.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NotificationPayload {
    /// Subscription that triggered the notification, if any.
    pub subscription_id: Option<SubscriptionId>,
}

impl NotificationPayload {
    /// A notification for the given subscription.
    pub fn for_subscription(id: SubscriptionId) -> Self {
        Self {
            subscription_id: Some(id),
        }
    }
}
