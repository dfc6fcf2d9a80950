//! Configuration for the sync engine.

use zonesync_protocol::{DatabaseScope, SubscriptionId, ZoneId};

/// Default zone that new local objects are assigned to.
pub const DEFAULT_ZONE_NAME: &str = "Collection";

/// Default ID of the database change subscription.
pub const DEFAULT_SUBSCRIPTION_ID: &str = "private-changes";

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Remote database scope to sync.
    pub scope: DatabaseScope,
    /// Zone new local objects are pushed to.
    pub zone_id: ZoneId,
    /// ID of the database change subscription.
    pub subscription_id: SubscriptionId,
    /// Ask the database feed to stream all pending changes at once.
    pub fetch_all_changes: bool,
    /// Resume outstanding durable pushes when the engine starts.
    pub resume_on_start: bool,
}

impl SyncConfig {
    /// Creates a configuration for the given scope with default zone and
    /// subscription.
    pub fn new(scope: DatabaseScope) -> Self {
        Self {
            scope,
            zone_id: ZoneId::new(DEFAULT_ZONE_NAME),
            subscription_id: SubscriptionId::new(DEFAULT_SUBSCRIPTION_ID),
            fetch_all_changes: true,
            resume_on_start: true,
        }
    }

    /// Sets the zone new objects are pushed to.
    pub fn with_zone_id(mut self, zone_id: ZoneId) -> Self {
        self.zone_id = zone_id;
        self
    }

    /// Sets the subscription ID.
    pub fn with_subscription_id(mut self, subscription_id: SubscriptionId) -> Self {
        self.subscription_id = subscription_id;
        self
    }

    /// Sets whether the database feed streams all pending changes at once.
    pub fn with_fetch_all_changes(mut self, fetch_all: bool) -> Self {
        self.fetch_all_changes = fetch_all;
        self
    }

    /// Sets whether outstanding pushes are resumed on start.
    pub fn with_resume_on_start(mut self, resume: bool) -> Self {
        self.resume_on_start = resume;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(DatabaseScope::Private)
    }
}
