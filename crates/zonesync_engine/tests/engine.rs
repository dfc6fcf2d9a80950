//! Engine facade tests: subscription, notifications and two-device sync.

use std::collections::BTreeSet;
use std::sync::Arc;
use zonesync_engine::{
    remote_record_id, MemorySubscriptionFlag, SubscriptionFlag, SyncConfig, DEFAULT_SUBSCRIPTION_ID,
};
use zonesync_protocol::{NotificationPayload, SubscriptionId};
use zonesync_store::{ObjectId, ObjectRead, ObjectStore, StoreResult};
use zonesync_testkit::prelude::*;

#[tokio::test]
async fn subscription_is_saved_once() {
    init_tracing();
    let cloud = MemoryCloud::new();
    let engine = catalog_engine(&cloud);

    assert!(engine.ensure_subscription().await.unwrap());
    assert!(!engine.ensure_subscription().await.unwrap());

    let subscriptions = cloud.subscriptions();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].id.as_str(), DEFAULT_SUBSCRIPTION_ID);
}

#[tokio::test]
async fn subscription_flag_is_persisted_with_the_store() {
    init_tracing();
    let cloud = MemoryCloud::new();
    let store = ObjectStore::in_memory();

    let first = engine_with(&cloud, store.clone(), SyncConfig::default());
    assert!(first.ensure_subscription().await.unwrap());
    drop(first);

    let second = engine_with(&cloud, store, SyncConfig::default());
    assert!(!second.ensure_subscription().await.unwrap());
    assert_eq!(cloud.subscriptions().len(), 1);
}

#[tokio::test]
async fn injected_subscription_flag_is_used() {
    init_tracing();
    let cloud = MemoryCloud::new();
    let flag = Arc::new(MemorySubscriptionFlag::new());
    flag.mark_saved().unwrap();

    let engine = catalog_engine(&cloud).with_subscription_flag(flag);
    assert!(!engine.ensure_subscription().await.unwrap());
    assert!(cloud.subscriptions().is_empty());
}

#[tokio::test]
async fn notifications_for_other_subscriptions_are_ignored() {
    init_tracing();
    let cloud = MemoryCloud::new();
    cloud.server_save(book_record(&collection(), "b1", "Dune"));
    let engine = catalog_engine(&cloud);

    let foreign = NotificationPayload::for_subscription(SubscriptionId::new("shared-changes"));
    assert!(engine.handle_notification(&foreign).await.unwrap().is_none());
    assert!(engine
        .handle_notification(&NotificationPayload::default())
        .await
        .unwrap()
        .is_none());
    assert!(cloud.requests().is_empty());

    let own = NotificationPayload::for_subscription(engine.config().subscription_id.clone());
    let summary = engine.handle_notification(&own).await.unwrap().unwrap();
    assert_eq!(summary.records_changed, 1);

    let stats = engine.stats();
    assert_eq!(stats.pulls_completed, 1);
    assert_eq!(stats.records_pulled, 1);
    assert!(stats.last_sync_time.is_some());
}

#[tokio::test]
async fn second_device_receives_relationships_and_tags() {
    init_tracing();
    let cloud = MemoryCloud::new();
    let device_a = catalog_engine(&cloud);
    let device_b = catalog_engine(&cloud);
    let mut reports = device_a.push_reports();
    device_a.start().await.unwrap();

    let shelf = device_a
        .view_context()
        .perform(|tx| -> StoreResult<ObjectId> {
            let shelf = tx.insert(SHELF);
            tx.set(shelf, "name", "Fiction")?;
            Ok(shelf)
        })
        .unwrap();
    assert!(next_report(&mut reports).await.is_success());

    device_a
        .view_context()
        .perform(|tx| -> StoreResult<()> {
            let tag = tx.insert(TAG);
            tx.set(tag, "title", "classic")?;
            let book = tx.insert(BOOK);
            tx.set(book, "title", "Dune")?;
            tx.set(book, "isRead", true)?;
            tx.add_related(book, "shelves", shelf)?;
            tx.add_related(book, "tags", tag)?;
            Ok(())
        })
        .unwrap();
    assert!(next_report(&mut reports).await.is_success());

    device_b.fetch_changes().await.unwrap();
    let snapshot = device_b.store().snapshot();
    let book = book_titled(&snapshot, "Dune").unwrap();
    assert!(book.flag("isRead"));

    let shelves: Vec<_> = book
        .related("shelves")
        .unwrap()
        .iter()
        .filter_map(|id| snapshot.object(*id))
        .collect();
    assert_eq!(shelves.len(), 1);
    assert_eq!(shelves[0].text("name"), Some("Fiction"));
    let shelf_a = device_a.store().snapshot().object(shelf).unwrap();
    assert_eq!(remote_record_id(&shelves[0]), remote_record_id(&shelf_a));

    let tags: BTreeSet<String> = book
        .related("tags")
        .unwrap()
        .iter()
        .filter_map(|id| snapshot.object(*id))
        .filter_map(|tag| tag.text("title").map(str::to_string))
        .collect();
    assert_eq!(tags, BTreeSet::from(["classic".to_string()]));
}

#[tokio::test]
async fn own_pushes_round_trip_without_duplicates() {
    init_tracing();
    let cloud = MemoryCloud::new();
    let engine = catalog_engine(&cloud);
    let mut reports = engine.push_reports();
    engine.start().await.unwrap();

    engine
        .view_context()
        .perform(|tx| -> StoreResult<()> {
            let book = tx.insert(BOOK);
            tx.set(book, "title", "Dune")
        })
        .unwrap();
    next_report(&mut reports).await;

    let summary = engine.fetch_changes().await.unwrap();
    assert_eq!(summary.records_changed, 1);
    assert_eq!(engine.store().snapshot().count(BOOK), 1);
}
