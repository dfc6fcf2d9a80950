//! Pull integration tests against the in-memory cloud.

use std::time::Duration;
use zonesync_engine::{SyncConfig, SyncError, SyncStateStore, ZoneState};
use zonesync_protocol::{
    DatabaseScope, FieldValue, RemoteError, RemoteErrorCode, RemoteRecord, RecordId, ZoneId,
};
use zonesync_store::{ObjectRead, ObjectStore};
use zonesync_testkit::prelude::*;

fn zone(name: &str) -> ZoneId {
    ZoneId::new(name)
}

fn states() -> SyncStateStore {
    SyncStateStore::new(DatabaseScope::Private)
}

fn zone_state(engine: &zonesync_engine::SyncEngine, zone_id: &ZoneId) -> Option<ZoneState> {
    states()
        .load_zone_state(&engine.store().snapshot(), zone_id)
        .unwrap()
}

#[tokio::test]
async fn two_zone_scenario_leaves_both_zones_clean() {
    init_tracing();
    let cloud = MemoryCloud::new();
    let (z1, z2) = (zone("Z1"), zone("Z2"));
    cloud.server_save(book_record(&z1, "b1", "Dune"));
    cloud.server_save(book_record(&z1, "b2", "Emma"));
    cloud.server_save(book_record(&z2, "b3", "Ulysses"));
    cloud.server_save(book_record(&z2, "b4", "Beloved"));

    let engine = catalog_engine(&cloud);
    let first = engine.fetch_changes().await.unwrap();
    assert_eq!(first.records_changed, 4);
    assert_eq!(engine.store().snapshot().count(BOOK), 4);

    cloud.server_save(book_record(&z1, "b1", "Dune Messiah"));
    cloud.server_save(book_record(&z1, "b2", "Persuasion"));
    cloud.server_save(book_record(&z2, "b5", "Hamlet"));
    cloud.server_delete(&RecordId::new(z2.clone(), "b3"));

    let summary = engine.fetch_changes().await.unwrap();
    assert_eq!(summary.records_changed, 3);
    assert_eq!(summary.records_deleted, 1);
    assert_eq!(summary.zones_completed, vec![z1.clone(), z2.clone()]);

    let snapshot = engine.store().snapshot();
    assert_eq!(snapshot.count(BOOK), 4);
    assert!(book_titled(&snapshot, "Dune Messiah").is_some());
    assert!(book_titled(&snapshot, "Ulysses").is_none());

    for zone_id in [&z1, &z2] {
        let state = zone_state(&engine, zone_id).unwrap();
        assert!(!state.is_dirty, "{zone_id} still dirty");
        assert!(state.change_token.is_some());
    }
}

#[tokio::test]
async fn interrupted_zone_feed_keeps_zone_dirty() {
    init_tracing();
    let cloud = MemoryCloud::new();
    let z1 = zone("Z1");
    for (name, title) in [("b1", "Dune"), ("b2", "Emma"), ("b3", "Hamlet")] {
        cloud.server_save(book_record(&z1, name, title));
    }
    // b1, checkpoint, b2, then the feed closes.
    cloud.configure(|options| {
        options.checkpoint_every = Some(1);
        options.interrupt_zone_feed_after = Some(3);
    });

    let engine = catalog_engine(&cloud);
    let result = engine.fetch_changes().await;
    assert!(matches!(result, Err(SyncError::FeedInterrupted)));

    let state = zone_state(&engine, &z1).unwrap();
    assert!(state.is_dirty);
    let checkpoint = state.change_token.clone().unwrap();
    assert_eq!(engine.store().snapshot().count(BOOK), 2);

    cloud.configure(|options| options.interrupt_zone_feed_after = None);
    cloud.clear_requests();
    let summary = engine.fetch_changes().await.unwrap();
    assert_eq!(summary.zones_completed, vec![z1.clone()]);
    assert!(!zone_state(&engine, &z1).unwrap().is_dirty);
    assert_eq!(engine.store().snapshot().count(BOOK), 3);

    let requests = cloud.requests();
    assert!(requests.iter().any(|request| matches!(
        request,
        Request::ZoneChanges { zones } if zones == &vec![z1.clone()]
    )));
    let resumed_from = states()
        .load_zone_state(&engine.store().snapshot(), &z1)
        .unwrap()
        .unwrap()
        .change_token;
    assert_ne!(resumed_from, Some(checkpoint));
}

#[tokio::test]
async fn purged_zone_keeps_its_row_deleted_zone_does_not() {
    init_tracing();
    let cloud = MemoryCloud::new();
    let (deleted, purged) = (zone("Deleted"), zone("Purged"));
    cloud.server_save(book_record(&deleted, "b1", "Dune"));
    cloud.server_save(book_record(&purged, "b2", "Emma"));
    cloud.server_save(shelf_record(&purged, "s1", "Fiction"));

    let engine = catalog_engine(&cloud);
    engine.fetch_changes().await.unwrap();
    assert_eq!(engine.store().snapshot().count(BOOK), 2);

    cloud.delete_zone(&deleted);
    cloud.purge_zone(&purged);
    let summary = engine.fetch_changes().await.unwrap();
    assert_eq!(summary.zones_deleted, 1);
    assert_eq!(summary.zones_purged, 1);
    assert_eq!(summary.objects_purged, 3);

    let snapshot = engine.store().snapshot();
    assert_eq!(snapshot.count(BOOK), 0);
    assert_eq!(snapshot.count(SHELF), 0);
    assert!(zone_state(&engine, &deleted).is_none());

    let kept = zone_state(&engine, &purged).unwrap();
    assert!(kept.is_purged);
    assert!(!kept.should_delete);
    assert!(!kept.is_dirty);
    assert!(kept.change_token.is_none());
}

#[tokio::test]
async fn purged_zone_refetches_only_current_server_records() {
    init_tracing();
    let cloud = MemoryCloud::new();
    let z1 = zone("Z1");
    cloud.server_save(book_record(&z1, "b1", "Dune"));
    cloud.server_save(book_record(&z1, "b2", "Emma"));

    let engine = catalog_engine(&cloud);
    engine.fetch_changes().await.unwrap();
    assert!(zone_state(&engine, &z1).unwrap().change_token.is_some());

    cloud.purge_zone(&z1);
    engine.fetch_changes().await.unwrap();
    assert_eq!(engine.store().snapshot().count(BOOK), 0);

    // Nothing new on the server: the purged records stay gone.
    let summary = engine.fetch_changes().await.unwrap();
    assert_eq!(summary.records_changed, 0);
    assert_eq!(engine.store().snapshot().count(BOOK), 0);

    cloud.server_save(book_record(&z1, "b3", "Hamlet"));
    let state = zone_state(&engine, &z1).unwrap();
    assert!(state.is_purged);
    assert!(state.change_token.is_none());

    let summary = engine.fetch_changes().await.unwrap();
    assert_eq!(summary.zones_completed, vec![z1.clone()]);
    assert_eq!(summary.records_changed, 1);

    let snapshot = engine.store().snapshot();
    assert_eq!(snapshot.count(BOOK), 1);
    assert!(book_titled(&snapshot, "Hamlet").is_some());
    assert!(book_titled(&snapshot, "Dune").is_none());
    assert!(book_titled(&snapshot, "Emma").is_none());
    let state = zone_state(&engine, &z1).unwrap();
    assert!(!state.is_dirty);
    assert!(state.change_token.is_some());
}

#[tokio::test]
async fn reference_to_a_later_record_in_the_feed_is_kept() {
    init_tracing();
    let cloud = MemoryCloud::new();
    let mut book = book_record(&collection(), "b1", "Dune");
    book.set(
        "shelves",
        FieldValue::ReferenceList(vec![RecordId::new(collection(), "s1")]),
    );
    cloud.server_save(book);
    cloud.server_save(shelf_record(&collection(), "s1", "Fiction"));

    let engine = catalog_engine(&cloud);
    let summary = engine.fetch_changes().await.unwrap();
    assert_eq!(summary.records_changed, 2);

    let check = |engine: &zonesync_engine::SyncEngine| {
        let snapshot = engine.store().snapshot();
        assert_eq!(snapshot.count(SHELF), 1);
        let book = book_titled(&snapshot, "Dune").unwrap();
        let shelves: Vec<_> = book
            .related("shelves")
            .unwrap()
            .iter()
            .filter_map(|id| snapshot.object(*id))
            .collect();
        assert_eq!(shelves.len(), 1);
        assert_eq!(shelves[0].text("name"), Some("Fiction"));
    };
    check(&engine);

    let summary = engine.fetch_changes().await.unwrap();
    assert_eq!(summary.records_changed, 0);
    check(&engine);
}

#[tokio::test]
async fn overlapping_pulls_run_one_after_another() {
    init_tracing();
    let cloud = MemoryCloud::new();
    cloud.server_save(book_record(&collection(), "b1", "Dune"));
    cloud.server_save(book_record(&collection(), "b2", "Emma"));
    cloud.configure(|options| options.feed_delay = Some(Duration::from_millis(5)));

    let engine = catalog_engine(&cloud);
    let (first, second) = tokio::join!(engine.fetch_changes(), engine.fetch_changes());
    assert_eq!(first.unwrap().records_changed, 2);
    assert_eq!(second.unwrap().records_changed, 0);

    let requests = cloud.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[0].is_database_changes());
    assert!(requests[1].is_zone_changes());
    assert!(requests[2].is_database_changes());
}

#[tokio::test]
async fn translation_failure_cancels_the_feed() {
    init_tracing();
    let cloud = MemoryCloud::new();
    cloud.server_save(book_record(&collection(), "b1", "Dune"));
    cloud.server_save(RemoteRecord::new("Lamp", RecordId::new(collection(), "l1")));

    let engine = catalog_engine(&cloud);
    let result = engine.fetch_changes().await;
    assert!(matches!(result, Err(SyncError::UnknownRecordType(ref t)) if t == "Lamp"));

    tokio::time::timeout(Duration::from_secs(5), cloud.wait_for_cancelled_feeds(1))
        .await
        .unwrap();
    assert!(zone_state(&engine, &collection()).unwrap().is_dirty);
    assert_eq!(engine.store().snapshot().count(BOOK), 1);
    assert!(engine.stats().last_error.is_some());
}

#[tokio::test]
async fn zone_deleted_during_fetch_is_cleaned_up_next_pull() {
    init_tracing();
    let cloud = MemoryCloud::new();
    let z1 = zone("Z1");
    cloud.server_save(book_record(&z1, "b1", "Dune"));

    let engine = catalog_engine(&cloud);
    engine.fetch_changes().await.unwrap();

    cloud.server_save(book_record(&z1, "b2", "Emma"));
    cloud.forget_zone(&z1);
    let summary = engine.fetch_changes().await.unwrap();
    assert_eq!(summary.zones_gone, vec![z1.clone()]);
    let state = zone_state(&engine, &z1).unwrap();
    assert!(state.should_delete);
    assert!(!state.is_dirty);
    assert_eq!(engine.store().snapshot().count(BOOK), 1);

    let summary = engine.fetch_changes().await.unwrap();
    assert_eq!(summary.objects_purged, 1);
    assert!(zone_state(&engine, &z1).is_none());
    assert_eq!(engine.store().snapshot().count(BOOK), 0);
}

#[tokio::test]
async fn database_feed_follows_more_coming() {
    init_tracing();
    let cloud = MemoryCloud::new();
    for name in ["Z1", "Z2", "Z3"] {
        cloud.server_save(book_record(&zone(name), "b1", name));
    }
    cloud.configure(|options| options.database_page_size = Some(1));

    let engine = catalog_engine(&cloud);
    let summary = engine.fetch_changes().await.unwrap();
    assert_eq!(summary.zones_changed, 3);
    assert_eq!(summary.zones_completed.len(), 3);
    assert_eq!(engine.store().snapshot().count(BOOK), 3);

    let requests = cloud.requests();
    let database_requests = requests
        .iter()
        .filter(|request| request.is_database_changes())
        .count();
    assert_eq!(database_requests, 3);
    assert!(matches!(requests.last(), Some(Request::ZoneChanges { zones }) if zones.len() == 3));
}

#[tokio::test]
async fn database_feed_error_keeps_only_checkpointed_transitions() {
    init_tracing();
    let cloud = MemoryCloud::new();
    for name in ["Z1", "Z2", "Z3"] {
        cloud.server_save(book_record(&zone(name), "b1", name));
    }
    cloud.configure(|options| {
        options.checkpoint_every = Some(2);
        options.database_feed_error = Some(RemoteError::new(
            RemoteErrorCode::ServiceUnavailable,
            "try later",
        ));
    });

    let engine = catalog_engine(&cloud);
    let error = engine.fetch_changes().await.unwrap_err();
    assert!(error.is_retryable());

    assert!(zone_state(&engine, &zone("Z1")).unwrap().is_dirty);
    assert!(zone_state(&engine, &zone("Z2")).unwrap().is_dirty);
    assert!(zone_state(&engine, &zone("Z3")).is_none());
    assert_eq!(engine.store().snapshot().count(BOOK), 0);

    cloud.configure(|options| options.database_feed_error = None);
    engine.fetch_changes().await.unwrap();
    assert_eq!(engine.store().snapshot().count(BOOK), 3);
}

#[tokio::test]
async fn tokens_survive_reopening_the_store() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let cloud = MemoryCloud::new();
    cloud.server_save(book_record(&collection(), "b1", "Dune"));

    {
        let store = ObjectStore::open(dir.path()).unwrap();
        let engine = engine_with(&cloud, store, SyncConfig::default());
        engine.fetch_changes().await.unwrap();
    }

    cloud.clear_requests();
    let store = ObjectStore::open(dir.path()).unwrap();
    assert_eq!(store.snapshot().count(BOOK), 1);
    let engine = engine_with(&cloud, store, SyncConfig::default());
    let summary = engine.fetch_changes().await.unwrap();
    assert_eq!(summary.records_changed, 0);
    assert!(matches!(
        cloud.requests().first(),
        Some(Request::DatabaseChanges { previous_token: Some(_) })
    ));
}
