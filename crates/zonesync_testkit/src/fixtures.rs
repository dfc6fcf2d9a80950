//! Catalog fixtures and engine helpers.
//!
//! The catalog has books on shelves, tagged by title. Books and shelves
//! sync; tags are local objects matched by their title.

use crate::cloud::MemoryCloud;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use zonesync_engine::{
    FieldMapping, MappedTranslator, PushReport, RemoteDatabase, SyncConfig, SyncEngine,
    TranslatorRegistry,
};
use zonesync_protocol::{FieldValue, RecordId, RemoteRecord, ZoneId};
use zonesync_store::{ManagedObject, ObjectRead, ObjectStore};

/// Book entity and record type.
pub const BOOK: &str = "Book";
/// Shelf entity and record type.
pub const SHELF: &str = "Shelf";
/// Local-only tag entity.
pub const TAG: &str = "Tag";

const REPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Translator for books.
pub fn book_translator() -> MappedTranslator {
    MappedTranslator::new(BOOK, BOOK)
        .with_field(FieldMapping::text("title"))
        .with_field(FieldMapping::text("author"))
        .with_field(FieldMapping::integer("pages"))
        .with_field(FieldMapping::flag("isRead"))
        .with_field(FieldMapping::date("publishedAt"))
        .with_field(FieldMapping::decimal("price"))
        .with_field(FieldMapping::references("shelves", SHELF))
        .with_field(FieldMapping::titles("tags", TAG, "title"))
}

/// Translator for shelves.
pub fn shelf_translator() -> MappedTranslator {
    MappedTranslator::new(SHELF, SHELF).with_field(FieldMapping::text("name"))
}

/// Registry with the book and shelf translators.
pub fn catalog_registry() -> TranslatorRegistry {
    TranslatorRegistry::new()
        .with(book_translator())
        .with(shelf_translator())
}

/// Installs a test log subscriber honoring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Default zone.
pub fn collection() -> ZoneId {
    ZoneId::new(zonesync_engine::DEFAULT_ZONE_NAME)
}

/// A book record with a title.
pub fn book_record(zone_id: &ZoneId, name: &str, title: &str) -> RemoteRecord {
    let mut record = RemoteRecord::new(BOOK, RecordId::new(zone_id.clone(), name));
    record.set("title", FieldValue::Text(title.into()));
    record
}

/// A shelf record with a name.
pub fn shelf_record(zone_id: &ZoneId, name: &str, shelf_name: &str) -> RemoteRecord {
    let mut record = RemoteRecord::new(SHELF, RecordId::new(zone_id.clone(), name));
    record.set("name", FieldValue::Text(shelf_name.into()));
    record
}

/// An engine over `store` talking to `cloud`, with the catalog registry.
pub fn engine_with(cloud: &Arc<MemoryCloud>, store: ObjectStore, config: SyncConfig) -> SyncEngine {
    let remote: Arc<dyn RemoteDatabase> = cloud.clone();
    SyncEngine::new(config, store, remote, catalog_registry())
}

/// An engine over a fresh in-memory store with the default configuration.
pub fn catalog_engine(cloud: &Arc<MemoryCloud>) -> SyncEngine {
    engine_with(cloud, ObjectStore::in_memory(), SyncConfig::default())
}

/// Finds the book with the given title.
pub fn book_titled(reader: &dyn ObjectRead, title: &str) -> Option<ManagedObject> {
    reader
        .fetch(BOOK, &|object| object.text("title") == Some(title))
        .into_iter()
        .next()
}

/// Waits for the next push report.
///
/// # Panics
///
/// Panics if no report arrives in time.
pub async fn next_report(reports: &mut broadcast::Receiver<PushReport>) -> PushReport {
    tokio::time::timeout(REPORT_TIMEOUT, reports.recv())
        .await
        .expect("timed out waiting for a push report")
        .expect("push report channel closed")
}

/// Waits for `count` push reports.
pub async fn collect_reports(
    reports: &mut broadcast::Receiver<PushReport>,
    count: usize,
) -> Vec<PushReport> {
    let mut collected = Vec::with_capacity(count);
    for _ in 0..count {
        collected.push(next_report(reports).await);
    }
    collected
}
