//! Engine facade tying pull, push and subscription together.

use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::pull::{PullEngine, PullSummary};
use crate::push::{PushEngine, PushReport};
use crate::reconcile::Reconciler;
use crate::registry::TranslatorRegistry;
use crate::state::SyncStateStore;
use crate::subscription::{StoreSubscriptionFlag, SubscriptionFlag};
use crate::transport::RemoteDatabase;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use zonesync_protocol::{NotificationPayload, Subscription};
use zonesync_store::{Context, MergePolicy, ObjectStore};

/// Name of the context the application edits through.
pub const VIEW_CONTEXT: &str = "view";

/// Name of the context pulled changes are applied in.
pub const SYNC_CONTEXT: &str = "sync";

/// Name of the context push outcomes are reconciled in.
pub const RECONCILE_CONTEXT: &str = "reconcile";

/// Sync statistics.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Pulls that ran both phases to completion.
    pub pulls_completed: u64,
    /// Changed and deleted records applied by pulls.
    pub records_pulled: u64,
    /// Modify requests saved and reconciled.
    pub pushes_completed: u64,
    /// Modify requests that failed.
    pub pushes_failed: u64,
    /// Records saved or deleted by successful pushes.
    pub records_pushed: u64,
    /// Last completed pull.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Keeps a local object store in sync with one remote database scope.
///
/// Local edits go through [`SyncEngine::view_context`] and are pushed as
/// they are saved. Remote changes are pulled by
/// [`SyncEngine::fetch_changes`], directly or in response to a
/// notification.
pub struct SyncEngine {
    config: SyncConfig,
    store: ObjectStore,
    view: Context,
    remote: Arc<dyn RemoteDatabase>,
    pull: PullEngine,
    push: PushEngine,
    subscription: Arc<dyn SubscriptionFlag>,
    stats: Arc<RwLock<SyncStats>>,
}

impl SyncEngine {
    /// Creates an engine over `store`.
    ///
    /// The push observer is registered immediately; saves made before
    /// [`SyncEngine::start`] are queued and submitted once it runs.
    pub fn new(
        config: SyncConfig,
        store: ObjectStore,
        remote: Arc<dyn RemoteDatabase>,
        registry: TranslatorRegistry,
    ) -> Self {
        let registry = Arc::new(registry);
        let stats = Arc::new(RwLock::new(SyncStats::default()));

        let view = store.context(VIEW_CONTEXT, MergePolicy::Error);
        let sync = store.context(SYNC_CONTEXT, MergePolicy::ObjectTrumps);
        let reconciler = Reconciler::new(
            store.context(RECONCILE_CONTEXT, MergePolicy::ObjectTrumps),
            Arc::clone(&registry),
        );

        let pull = PullEngine::new(
            Arc::clone(&remote),
            sync.clone(),
            Arc::clone(&registry),
            SyncStateStore::new(config.scope),
            config.fetch_all_changes,
        );
        let push = PushEngine::new(
            Arc::clone(&remote),
            &view,
            reconciler,
            registry,
            &config,
            Arc::clone(&stats),
        );
        let subscription = Arc::new(StoreSubscriptionFlag::new(
            sync,
            config.subscription_id.clone(),
        ));

        Self {
            config,
            store,
            view,
            remote,
            pull,
            push,
            subscription,
            stats,
        }
    }

    /// Replaces the subscription flag.
    pub fn with_subscription_flag(mut self, flag: Arc<dyn SubscriptionFlag>) -> Self {
        self.subscription = flag;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the local store.
    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// Returns the context whose saves are pushed.
    pub fn view_context(&self) -> &Context {
        &self.view
    }

    /// Starts pushing and, if configured, resumes outstanding durable
    /// pushes. Returns how many were resumed.
    pub async fn start(&self) -> SyncResult<usize> {
        if !self.push.start() {
            tracing::debug!("push worker already running");
        }
        if !self.config.resume_on_start {
            return Ok(0);
        }
        self.push.resume_outstanding().await
    }

    /// Pulls remote changes. Pulls never overlap.
    pub async fn fetch_changes(&self) -> SyncResult<PullSummary> {
        let result = self.pull.fetch_changes().await;

        let mut stats = self.stats.write();
        match &result {
            Ok(summary) => {
                stats.pulls_completed += 1;
                stats.records_pulled += (summary.records_changed + summary.records_deleted) as u64;
                stats.last_sync_time = Some(Instant::now());
            }
            Err(e) => stats.last_error = Some(e.to_string()),
        }
        result
    }

    /// Pulls if the notification belongs to this engine's subscription.
    pub async fn handle_notification(
        &self,
        payload: &NotificationPayload,
    ) -> SyncResult<Option<PullSummary>> {
        if payload.subscription_id.as_ref() != Some(&self.config.subscription_id) {
            tracing::debug!(subscription = ?payload.subscription_id, "ignoring notification");
            return Ok(None);
        }
        self.fetch_changes().await.map(Some)
    }

    /// Saves the database subscription unless it was saved before. Returns
    /// true if it was saved by this call.
    pub async fn ensure_subscription(&self) -> SyncResult<bool> {
        if self.subscription.is_saved()? {
            return Ok(false);
        }

        let saved = self
            .remote
            .save_subscription(Subscription {
                id: self.config.subscription_id.clone(),
                scope: self.config.scope,
            })
            .await?;
        self.subscription.mark_saved()?;

        tracing::info!(subscription = %saved.id, scope = %saved.scope, "saved subscription");
        Ok(true)
    }

    /// Subscribes to push reports.
    pub fn push_reports(&self) -> broadcast::Receiver<PushReport> {
        self.push.subscribe()
    }

    /// Returns a copy of the current statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("pull", &self.pull)
            .field("push", &self.push)
            .finish_non_exhaustive()
    }
}
