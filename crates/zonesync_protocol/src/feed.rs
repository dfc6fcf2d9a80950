//! Change feed requests and streamed events.
//!
//! Both feeds stream events in order and end with exactly one terminal
//! `Completed` event. Events between two token checkpoints are only safe to
//! consider consumed once the checkpoint has been persisted.

use crate::error::RemoteError;
use crate::ids::{ChangeToken, DatabaseScope, RecordId, ZoneId};
use crate::record::RemoteRecord;
use std::collections::BTreeMap;

/// Request for database-level changes (which zones changed).
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseChangesRequest {
    /// Scope to read.
    pub scope: DatabaseScope,
    /// Token from the previous fetch; `None` fetches everything.
    pub previous_token: Option<ChangeToken>,
    /// Ask the server to stream every pending change in one operation.
    pub fetch_all_changes: bool,
}

/// An event on the database-level change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseChange {
    /// A zone has new record changes.
    ZoneChanged(ZoneId),
    /// A zone was deleted.
    ZoneDeleted(ZoneId),
    /// A zone was purged; its absence must be remembered.
    ZonePurged(ZoneId),
    /// Mid-feed checkpoint.
    TokenUpdated(ChangeToken),
    /// Terminal event.
    Completed {
        /// Token covering everything streamed so far.
        token: Option<ChangeToken>,
        /// The server has more changes than it streamed.
        more_coming: bool,
        /// Set when the feed failed.
        error: Option<RemoteError>,
    },
}

/// Request for record changes in a set of zones.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneChangesRequest {
    /// Scope to read.
    pub scope: DatabaseScope,
    /// Zones to read, each seeded with its own previous token.
    pub zones: BTreeMap<ZoneId, Option<ChangeToken>>,
}

/// An event on the zone-level change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum ZoneChange {
    /// A record was created or modified.
    RecordChanged(RemoteRecord),
    /// A record was deleted.
    RecordDeleted {
        /// The deleted record.
        record_id: RecordId,
        /// Its record type.
        record_type: String,
    },
    /// Per-zone mid-feed checkpoint.
    TokenUpdated {
        /// Zone the token belongs to.
        zone_id: ZoneId,
        /// Token covering the zone's changes streamed so far.
        token: ChangeToken,
    },
    /// All changes of one zone were streamed (or the zone failed).
    ZoneCompleted {
        /// The zone.
        zone_id: ZoneId,
        /// Final token for the zone.
        token: Option<ChangeToken>,
        /// Set when the zone could not be read.
        error: Option<RemoteError>,
    },
    /// Terminal event for the whole request.
    Completed {
        /// Set when the request as a whole failed.
        error: Option<RemoteError>,
    },
}

impl ZoneChange {
    /// Returns the zone a per-zone event belongs to.
    pub fn zone_id(&self) -> Option<&ZoneId> {
        match self {
            ZoneChange::RecordChanged(record) => Some(&record.record_id().zone_id),
            ZoneChange::RecordDeleted { record_id, .. } => Some(&record_id.zone_id),
            ZoneChange::TokenUpdated { zone_id, .. } => Some(zone_id),
            ZoneChange::ZoneCompleted { zone_id, .. } => Some(zone_id),
            ZoneChange::Completed { .. } => None,
        }
    }
}
