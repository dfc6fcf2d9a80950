//! Conversion between local objects and remote records.

use crate::entity::{self, REMOTE_ZONE_ID};
use crate::error::{SyncError, SyncResult};
use std::collections::BTreeSet;
use zonesync_protocol::{
    decode_optional, encode_optional, FieldValue, RecordId, RemoteRecord, ZoneId,
};
use zonesync_store::{
    AttributeValue, Decimal, ManagedObject, ObjectId, ObjectRead, Timestamp, Transaction,
};

/// Converts one record type to and from one local entity.
///
/// Implementors supply the field mapping ([`apply_fields`] and
/// [`write_fields`]); identity, bookkeeping and batch deletion come from the
/// provided methods.
///
/// [`apply_fields`]: RecordTranslator::apply_fields
/// [`write_fields`]: RecordTranslator::write_fields
pub trait RecordTranslator: Send + Sync {
    /// Remote record type handled by this translator.
    fn record_type(&self) -> &str;

    /// Local entity handled by this translator.
    fn entity(&self) -> &str;

    /// Copies the record's field values onto the local object.
    fn apply_fields(
        &self,
        tx: &mut Transaction,
        object_id: ObjectId,
        record: &RemoteRecord,
    ) -> SyncResult<()>;

    /// Writes the object's values for `keys` (all mapped keys if `None`)
    /// into `record`.
    fn write_fields(
        &self,
        reader: &dyn ObjectRead,
        object: &ManagedObject,
        record: &mut RemoteRecord,
        keys: Option<&BTreeSet<String>>,
    ) -> SyncResult<()>;

    /// Applies a remote record to the local store.
    ///
    /// Finds the object mirroring the record, creating it with only its
    /// remote identity if missing. Field values are applied only when
    /// `update_values` is set; the record's bookkeeping is always archived.
    /// Without `update_values` a missing object is left missing and `None`
    /// is returned.
    fn apply_from_record(
        &self,
        tx: &mut Transaction,
        record: &RemoteRecord,
        update_values: bool,
    ) -> SyncResult<Option<ObjectId>> {
        let existing = entity::find_by_record_id(&*tx, self.entity(), record.record_id());
        let object_id = match existing {
            Some(object) => object.id(),
            None if !update_values => {
                tracing::debug!(
                    record_id = %record.record_id(),
                    "no local object for record; skipping"
                );
                return Ok(None);
            }
            None => {
                let object_id = tx.insert(self.entity());
                entity::assign_identity(tx, object_id, record.record_id())?;
                object_id
            }
        };

        if update_values {
            self.apply_fields(tx, object_id, record)?;
        }
        entity::store_system_fields(tx, object_id, record)?;
        Ok(Some(object_id))
    }

    /// Rebuilds the remote record for an object from its archived
    /// bookkeeping plus the requested keys.
    ///
    /// Returns `None` if the object has no usable bookkeeping.
    fn build_record(
        &self,
        reader: &dyn ObjectRead,
        object: &ManagedObject,
        keys: Option<&BTreeSet<String>>,
    ) -> SyncResult<Option<RemoteRecord>> {
        let Some(blob) = entity::system_fields(object) else {
            return Ok(None);
        };
        let mut record = match blob.decode() {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!(object_id = %object.id(), error = %e, "undecodable system fields");
                return Ok(None);
            }
        };
        self.write_fields(reader, object, &mut record, keys)?;
        Ok(Some(record))
    }

    /// Deletes the local objects mirroring `record_ids`.
    fn delete_for_record_ids(
        &self,
        tx: &mut Transaction,
        record_ids: &[RecordId],
    ) -> SyncResult<Vec<ObjectId>> {
        let wanted: BTreeSet<&RecordId> = record_ids.iter().collect();
        let deleted = tx.delete_where(self.entity(), &|object| {
            entity::remote_record_id(object).is_some_and(|id| wanted.contains(&id))
        })?;
        Ok(deleted)
    }

    /// Deletes every local object that belongs to one of `zone_ids`.
    fn delete_for_zone_ids(
        &self,
        tx: &mut Transaction,
        zone_ids: &BTreeSet<ZoneId>,
    ) -> SyncResult<Vec<ObjectId>> {
        let deleted = tx.delete_where(self.entity(), &|object| {
            object
                .text(REMOTE_ZONE_ID)
                .is_some_and(|zone| zone_ids.contains(&ZoneId::new(zone)))
        })?;
        Ok(deleted)
    }
}

/// How a local key is represented in a record field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// Text attribute as a text field.
    Text,
    /// Integer attribute as an int field.
    Integer,
    /// Double attribute as a double field.
    Double,
    /// Bool attribute as an int field (0 or 1).
    Flag,
    /// Bytes attribute as a bytes field.
    Bytes,
    /// Nullable date, length-prefix encoded into a bytes field.
    Date,
    /// Nullable decimal, length-prefix encoded into a bytes field.
    Decimal,
    /// To-many relationship as a list of record references.
    References {
        /// Target entity.
        entity: String,
    },
    /// To-many relationship to local-only objects, as a list of their
    /// titles.
    Titles {
        /// Target entity.
        entity: String,
        /// Target attribute holding the title.
        title_key: String,
    },
}

/// Maps one local key to one record field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    key: String,
    field: String,
    kind: FieldKind,
}

impl FieldMapping {
    /// Creates a mapping; the record field has the same name as the key.
    pub fn new(key: impl Into<String>, kind: FieldKind) -> Self {
        let key = key.into();
        Self {
            field: key.clone(),
            key,
            kind,
        }
    }

    /// Text mapping.
    pub fn text(key: impl Into<String>) -> Self {
        Self::new(key, FieldKind::Text)
    }

    /// Integer mapping.
    pub fn integer(key: impl Into<String>) -> Self {
        Self::new(key, FieldKind::Integer)
    }

    /// Double mapping.
    pub fn double(key: impl Into<String>) -> Self {
        Self::new(key, FieldKind::Double)
    }

    /// Bool mapping.
    pub fn flag(key: impl Into<String>) -> Self {
        Self::new(key, FieldKind::Flag)
    }

    /// Bytes mapping.
    pub fn bytes(key: impl Into<String>) -> Self {
        Self::new(key, FieldKind::Bytes)
    }

    /// Nullable date mapping.
    pub fn date(key: impl Into<String>) -> Self {
        Self::new(key, FieldKind::Date)
    }

    /// Nullable decimal mapping.
    pub fn decimal(key: impl Into<String>) -> Self {
        Self::new(key, FieldKind::Decimal)
    }

    /// Reference list mapping to objects of `entity`.
    pub fn references(key: impl Into<String>, entity: impl Into<String>) -> Self {
        Self::new(
            key,
            FieldKind::References {
                entity: entity.into(),
            },
        )
    }

    /// Title list mapping to local-only objects of `entity`.
    pub fn titles(
        key: impl Into<String>,
        entity: impl Into<String>,
        title_key: impl Into<String>,
    ) -> Self {
        Self::new(
            key,
            FieldKind::Titles {
                entity: entity.into(),
                title_key: title_key.into(),
            },
        )
    }

    /// Uses a different record field name.
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }

    /// Returns the local key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the record field name.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Returns the representation.
    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }
}

/// A translator driven by a table of [`FieldMapping`]s.
#[derive(Debug, Clone)]
pub struct MappedTranslator {
    record_type: String,
    entity: String,
    mappings: Vec<FieldMapping>,
}

impl MappedTranslator {
    /// Creates a translator with no mapped fields.
    pub fn new(record_type: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            entity: entity.into(),
            mappings: Vec::new(),
        }
    }

    /// Adds a field mapping.
    pub fn with_field(mut self, mapping: FieldMapping) -> Self {
        self.mappings.push(mapping);
        self
    }

    /// Returns the field mappings.
    pub fn mappings(&self) -> &[FieldMapping] {
        &self.mappings
    }

    fn mismatch(&self, record: &RemoteRecord, mapping: &FieldMapping, found: &str) -> SyncError {
        SyncError::translation(
            &self.record_type,
            record.record_id(),
            format!("field {} is {found}, expected {:?}", mapping.field, mapping.kind),
        )
    }

    fn apply_mapping(
        &self,
        tx: &mut Transaction,
        object_id: ObjectId,
        record: &RemoteRecord,
        mapping: &FieldMapping,
    ) -> SyncResult<()> {
        let value = record
            .get(&mapping.field)
            .filter(|value| **value != FieldValue::Null);
        let key = mapping.key.as_str();

        let attribute = match (&mapping.kind, value) {
            (FieldKind::References { .. } | FieldKind::Titles { .. }, _) => {
                let targets = self.resolve_targets(tx, record, mapping, value)?;
                tx.set_related(object_id, key, targets)?;
                return Ok(());
            }
            (_, None) => None,
            (FieldKind::Text, Some(FieldValue::Text(text))) => {
                Some(AttributeValue::Text(text.clone()))
            }
            (FieldKind::Integer, Some(FieldValue::Int(value))) => {
                Some(AttributeValue::Integer(*value))
            }
            (FieldKind::Double, Some(FieldValue::Double(value))) => {
                Some(AttributeValue::Double(*value))
            }
            (FieldKind::Flag, Some(FieldValue::Int(value))) => Some(AttributeValue::Bool(*value != 0)),
            (FieldKind::Bytes, Some(FieldValue::Bytes(bytes))) => {
                Some(AttributeValue::Bytes(bytes.clone()))
            }
            (FieldKind::Date, Some(FieldValue::Bytes(bytes))) => decode_optional::<Timestamp>(bytes)
                .map_err(|e| self.mismatch(record, mapping, &e.to_string()))?
                .map(AttributeValue::Date),
            (FieldKind::Decimal, Some(FieldValue::Bytes(bytes))) => {
                decode_optional::<Decimal>(bytes)
                    .map_err(|e| self.mismatch(record, mapping, &e.to_string()))?
                    .map(AttributeValue::Decimal)
            }
            (_, Some(other)) => return Err(self.mismatch(record, mapping, other.kind())),
        };
        tx.set_optional(object_id, key, attribute)?;
        Ok(())
    }

    fn resolve_targets(
        &self,
        tx: &mut Transaction,
        record: &RemoteRecord,
        mapping: &FieldMapping,
        value: Option<&FieldValue>,
    ) -> SyncResult<BTreeSet<ObjectId>> {
        let mut targets = BTreeSet::new();
        match (&mapping.kind, value) {
            (_, None) => {}
            (FieldKind::References { entity }, Some(FieldValue::ReferenceList(ids))) => {
                for record_id in ids {
                    targets.insert(resolve_reference(tx, entity, record_id)?);
                }
            }
            (FieldKind::References { entity }, Some(FieldValue::Reference(record_id))) => {
                targets.insert(resolve_reference(tx, entity, record_id)?);
            }
            (FieldKind::Titles { entity, title_key }, Some(FieldValue::StringList(titles))) => {
                for title in titles {
                    let existing = tx
                        .fetch(entity, &|object| object.text(title_key) == Some(title.as_str()))
                        .into_iter()
                        .next();
                    let target = match existing {
                        Some(object) => object.id(),
                        None => {
                            let target = tx.insert(entity);
                            tx.set(target, title_key, title.as_str())?;
                            target
                        }
                    };
                    targets.insert(target);
                }
            }
            (_, Some(other)) => return Err(self.mismatch(record, mapping, other.kind())),
        }
        Ok(targets)
    }

    fn write_mapping(
        &self,
        reader: &dyn ObjectRead,
        object: &ManagedObject,
        record: &mut RemoteRecord,
        mapping: &FieldMapping,
    ) -> SyncResult<()> {
        let key = mapping.key.as_str();
        let attribute = object.get(key);
        let value = match (&mapping.kind, attribute) {
            (FieldKind::Flag, _) => FieldValue::Int(i64::from(object.flag(key))),
            (FieldKind::Date, _) => {
                let date = attribute.and_then(AttributeValue::as_date);
                FieldValue::Bytes(encode_optional(date.as_ref())?)
            }
            (FieldKind::Decimal, _) => {
                let decimal = attribute.and_then(AttributeValue::as_decimal);
                FieldValue::Bytes(encode_optional(decimal.as_ref())?)
            }
            (FieldKind::References { .. }, _) => FieldValue::ReferenceList(
                related_objects(reader, object, key)
                    .iter()
                    .filter_map(entity::remote_record_id)
                    .collect(),
            ),
            (FieldKind::Titles { title_key, .. }, _) => FieldValue::StringList(
                related_objects(reader, object, key)
                    .iter()
                    .filter_map(|target| target.text(title_key).map(str::to_string))
                    .collect(),
            ),
            (_, None) => FieldValue::Null,
            (FieldKind::Text, Some(AttributeValue::Text(text))) => FieldValue::Text(text.clone()),
            (FieldKind::Integer, Some(AttributeValue::Integer(value))) => FieldValue::Int(*value),
            (FieldKind::Double, Some(AttributeValue::Double(value))) => FieldValue::Double(*value),
            (FieldKind::Bytes, Some(AttributeValue::Bytes(bytes))) => FieldValue::Bytes(bytes.clone()),
            (_, Some(other)) => {
                return Err(SyncError::translation(
                    &self.record_type,
                    record.record_id(),
                    format!("attribute {key} is {}, expected {:?}", other.kind(), mapping.kind),
                ))
            }
        };
        record.set(mapping.field.as_str(), value);
        Ok(())
    }
}

/// Finds the object mirroring `record_id`, creating it with only its remote
/// identity if the target record has not been applied yet. The target's own
/// record fills in its fields when it arrives.
fn resolve_reference(
    tx: &mut Transaction,
    entity: &str,
    record_id: &RecordId,
) -> SyncResult<ObjectId> {
    if let Some(target) = entity::find_by_record_id(&*tx, entity, record_id) {
        return Ok(target.id());
    }
    let target = tx.insert(entity);
    entity::assign_identity(tx, target, record_id)?;
    tracing::debug!(%record_id, entity, "created placeholder for forward reference");
    Ok(target)
}

fn related_objects(reader: &dyn ObjectRead, object: &ManagedObject, key: &str) -> Vec<ManagedObject> {
    object
        .related(key)
        .map(|targets| targets.iter().filter_map(|id| reader.object(*id)).collect())
        .unwrap_or_default()
}

impl RecordTranslator for MappedTranslator {
    fn record_type(&self) -> &str {
        &self.record_type
    }

    fn entity(&self) -> &str {
        &self.entity
    }

    fn apply_fields(
        &self,
        tx: &mut Transaction,
        object_id: ObjectId,
        record: &RemoteRecord,
    ) -> SyncResult<()> {
        for mapping in &self.mappings {
            self.apply_mapping(tx, object_id, record, mapping)?;
        }
        Ok(())
    }

    fn write_fields(
        &self,
        reader: &dyn ObjectRead,
        object: &ManagedObject,
        record: &mut RemoteRecord,
        keys: Option<&BTreeSet<String>>,
    ) -> SyncResult<()> {
        for mapping in &self.mappings {
            if keys.is_some_and(|keys| !keys.contains(&mapping.key)) {
                continue;
            }
            self.write_mapping(reader, object, record, mapping)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zonesync_protocol::SystemFields;
    use zonesync_store::{Context, MergePolicy, ObjectStore};

    fn shelf_translator() -> MappedTranslator {
        MappedTranslator::new("Shelf", "Shelf").with_field(FieldMapping::text("name"))
    }

    fn book_translator() -> MappedTranslator {
        MappedTranslator::new("Book", "Book")
            .with_field(FieldMapping::text("title"))
            .with_field(FieldMapping::integer("pages"))
            .with_field(FieldMapping::flag("isRead"))
            .with_field(FieldMapping::date("publishedAt"))
            .with_field(FieldMapping::decimal("price"))
            .with_field(FieldMapping::references("shelves", "Shelf"))
            .with_field(FieldMapping::titles("tags", "Tag", "title"))
    }

    fn record_id(name: &str) -> RecordId {
        RecordId::new(ZoneId::new("Collection"), name)
    }

    fn context() -> (ObjectStore, Context) {
        let store = ObjectStore::in_memory();
        let context = store.context("sync", MergePolicy::Error);
        (store, context)
    }

    fn book_record() -> RemoteRecord {
        let mut record = RemoteRecord::new("Book", record_id("b1"));
        record.metadata_mut().change_tag = Some("t1".into());
        record.set("title", FieldValue::Text("Dune".into()));
        record.set("pages", FieldValue::Int(412));
        record.set("isRead", FieldValue::Int(1));
        record.set(
            "publishedAt",
            FieldValue::Bytes(encode_optional(Some(&Timestamp::from_millis(-138_000_000))).unwrap()),
        );
        record.set("price", FieldValue::Bytes(encode_optional::<Decimal>(None).unwrap()));
        record.set("shelves", FieldValue::ReferenceList(vec![record_id("s1"), record_id("s9")]));
        record.set("tags", FieldValue::StringList(vec!["classic".into(), "sf".into()]));
        record
    }

    #[test]
    fn apply_creates_object_with_fields_and_bookkeeping() {
        let (store, context) = context();
        let shelves = shelf_translator();
        let books = book_translator();

        let mut shelf = RemoteRecord::new("Shelf", record_id("s1"));
        shelf.set("name", FieldValue::Text("Favourites".into()));

        let book_id = context
            .perform(|tx| -> SyncResult<ObjectId> {
                shelves.apply_from_record(tx, &shelf, true)?;
                Ok(books.apply_from_record(tx, &book_record(), true)?.unwrap())
            })
            .unwrap();

        let snapshot = store.snapshot();
        let book = snapshot.object(book_id).unwrap();
        assert_eq!(book.text("title"), Some("Dune"));
        assert_eq!(book.get("pages"), Some(&AttributeValue::Integer(412)));
        assert!(book.flag("isRead"));
        assert_eq!(
            book.get("publishedAt"),
            Some(&AttributeValue::Date(Timestamp::from_millis(-138_000_000)))
        );
        assert!(book.get("price").is_none());
        assert_eq!(book.related("shelves").unwrap().len(), 2);
        assert_eq!(snapshot.count("Shelf"), 2);
        assert_eq!(book.related("tags").unwrap().len(), 2);
        assert_eq!(snapshot.count("Tag"), 2);

        let archived = entity::system_fields(&book).unwrap().decode().unwrap();
        assert_eq!(archived.change_tag(), Some("t1"));
        assert!(archived.field_names().is_empty());
    }

    #[test]
    fn forward_reference_is_filled_in_when_target_arrives() {
        let (store, context) = context();
        let shelves = shelf_translator();
        let books = book_translator();

        let mut shelf = RemoteRecord::new("Shelf", record_id("s1"));
        shelf.set("name", FieldValue::Text("Favourites".into()));

        let book_id = context
            .perform(|tx| books.apply_from_record(tx, &book_record(), true))
            .unwrap()
            .unwrap();
        context
            .perform(|tx| shelves.apply_from_record(tx, &shelf, true))
            .unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.count("Shelf"), 2);
        let book = snapshot.object(book_id).unwrap();
        let names: BTreeSet<Option<String>> = book
            .related("shelves")
            .unwrap()
            .iter()
            .filter_map(|id| snapshot.object(*id))
            .map(|shelf| shelf.text("name").map(str::to_string))
            .collect();
        assert_eq!(names, BTreeSet::from([Some("Favourites".to_string()), None]));
    }

    #[test]
    fn applying_twice_reuses_object_and_tags() {
        let (store, context) = context();
        let books = book_translator();

        for _ in 0..2 {
            context
                .perform(|tx| books.apply_from_record(tx, &book_record(), true))
                .unwrap();
        }

        let snapshot = store.snapshot();
        assert_eq!(snapshot.count("Book"), 1);
        assert_eq!(snapshot.count("Tag"), 2);
    }

    #[test]
    fn bookkeeping_only_apply_skips_fields_and_missing_objects() {
        let (store, context) = context();
        let books = book_translator();

        let missing = context
            .perform(|tx| books.apply_from_record(tx, &book_record(), false))
            .unwrap();
        assert!(missing.is_none());
        assert!(store.snapshot().is_empty());

        let id = context
            .perform(|tx| -> SyncResult<ObjectId> {
                let id = tx.insert("Book");
                entity::assign_identity(tx, id, &record_id("b1"))?;
                tx.set(id, "title", "Local title")?;
                Ok(id)
            })
            .unwrap();
        context
            .perform(|tx| books.apply_from_record(tx, &book_record(), false))
            .unwrap();

        let book = store.snapshot().object(id).unwrap();
        assert_eq!(book.text("title"), Some("Local title"));
        assert!(entity::system_fields(&book).is_some());
    }

    #[test]
    fn build_record_writes_only_requested_keys() {
        let (store, context) = context();
        let books = book_translator();
        let id = context
            .perform(|tx| books.apply_from_record(tx, &book_record(), true))
            .unwrap()
            .unwrap();

        let snapshot = store.snapshot();
        let book = snapshot.object(id).unwrap();
        let keys = BTreeSet::from(["title".to_string()]);
        let record = books.build_record(&snapshot, &book, Some(&keys)).unwrap().unwrap();

        assert_eq!(record.field_names(), vec!["title"]);
        assert_eq!(record.change_tag(), Some("t1"));

        let full = books.build_record(&snapshot, &book, None).unwrap().unwrap();
        assert_eq!(full.field_names().len(), 7);
        let Some(FieldValue::StringList(mut tags)) = full.get("tags").cloned() else {
            panic!("tags should be a string list");
        };
        tags.sort();
        assert_eq!(tags, vec!["classic".to_string(), "sf".to_string()]);
        assert_eq!(
            full.get("price"),
            Some(&FieldValue::Bytes(vec![0, 0, 0, 0]))
        );
    }

    #[test]
    fn build_record_without_bookkeeping_is_none() {
        let (store, context) = context();
        let books = book_translator();
        let id = context
            .perform(|tx| -> SyncResult<ObjectId> {
                let id = tx.insert("Book");
                tx.set(id, "title", "Draft")?;
                tx.set(id, entity::SYSTEM_FIELDS, vec![9u8, 9, 9])?;
                Ok(id)
            })
            .unwrap();

        let snapshot = store.snapshot();
        let book = snapshot.object(id).unwrap();
        assert!(books.build_record(&snapshot, &book, None).unwrap().is_none());

        let untracked = context
            .perform(|tx| -> SyncResult<ObjectId> { Ok(tx.insert("Book")) })
            .unwrap();
        let untracked = store.snapshot().object(untracked).unwrap();
        assert!(books.build_record(&snapshot, &untracked, None).unwrap().is_none());
        assert!(SystemFields::from_bytes(vec![9u8, 9, 9]).decode().is_err());
    }

    #[test]
    fn type_mismatch_is_a_translation_error() {
        let (_store, context) = context();
        let books = book_translator();
        let mut record = book_record();
        record.set("pages", FieldValue::Text("many".into()));

        let result = context.perform(|tx| books.apply_from_record(tx, &record, true));
        assert!(matches!(result, Err(SyncError::Translation { .. })));
    }

    #[test]
    fn deletes_by_record_and_zone() {
        let (store, context) = context();
        let books = book_translator();
        let mut other_zone = book_record();
        other_zone.metadata_mut().record_id = RecordId::new(ZoneId::new("Archive"), "b2");

        context
            .perform(|tx| -> SyncResult<()> {
                books.apply_from_record(tx, &book_record(), true)?;
                books.apply_from_record(tx, &other_zone, true)?;
                Ok(())
            })
            .unwrap();

        let deleted = context
            .perform(|tx| books.delete_for_record_ids(tx, &[record_id("b1")]))
            .unwrap();
        assert_eq!(deleted.len(), 1);

        let zones = BTreeSet::from([ZoneId::new("Archive")]);
        let deleted = context
            .perform(|tx| books.delete_for_zone_ids(tx, &zones))
            .unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(store.snapshot().count("Book"), 0);
    }
}
