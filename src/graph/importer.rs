use crate::codec::Format;
use crate::error::{Error, Result};
use crate::graph::types::{Extracted, ExtractedRecord};
use crate::schema::{FieldType, RelationDef, RelationKind, SchemaInspector, ID_FIELD};
use crate::store::{DataObject, ObjectId, Scalar, Store};
use tracing::debug;

/// Rebuilds object graphs from extracted records
///
/// Each record is resolved by identity (update in place) or created fresh.
/// To-one targets are imported first so their identity can be stored in the
/// foreign key; to-many members and belongs-to targets are imported before
/// the owner but only linked after the owner has been written.
pub struct GraphImporter<'a, S: Store + ?Sized> {
    inspector: &'a SchemaInspector,
    store: &'a mut S,
    format: Format,
    max_depth: usize,
}

impl<'a, S: Store + ?Sized> GraphImporter<'a, S> {
    pub fn new(
        inspector: &'a SchemaInspector,
        store: &'a mut S,
        format: Format,
        max_depth: usize,
    ) -> Self {
        GraphImporter {
            inspector,
            store,
            format,
            max_depth,
        }
    }

    /// Import one root record and its relation subtree
    pub fn import_record(&mut self, record: &ExtractedRecord) -> Result<DataObject> {
        self.import_at(record, 0)
    }

    fn import_at(&mut self, record: &ExtractedRecord, depth: usize) -> Result<DataObject> {
        let type_name = record.type_name.as_deref().ok_or(Error::MissingTypeTag)?;
        if !self.inspector.is_known(type_name) {
            return Err(Error::UnknownType(type_name.to_string()));
        }
        let descriptor = self.inspector.all_fields(type_name);

        let mut object = match self.resolve(type_name, record)? {
            Some(existing) => existing,
            None => self
                .inspector
                .factory(type_name)
                .ok_or_else(|| Error::UnknownType(type_name.to_string()))?,
        };

        for field in &descriptor.local {
            if matches!(field.field_type, FieldType::Id | FieldType::Version) {
                continue;
            }
            if let Some(value) = record.get(&field.name) {
                object.set(field.name.clone(), coerce(field.field_type, &field.name, value)?);
            }
        }

        let mut pending: Vec<(RelationDef, DataObject)> = Vec::new();
        if depth < self.max_depth {
            for relation in descriptor.related.iter() {
                let Some(raw) = record.get(&relation.name) else {
                    continue;
                };
                let value = self.decode_relation(relation, raw)?;

                match (relation.kind, value) {
                    (RelationKind::HasOne, Extracted::Null) => {
                        if let Some(key) = relation.foreign_key() {
                            object.set(key, None);
                        }
                    }
                    (RelationKind::HasOne, Extracted::Node(nested)) => {
                        self.check_target(type_name, relation, &nested)?;
                        let target = self.import_at(&nested, depth + 1)?;
                        if let (Some(key), Some(id)) = (relation.foreign_key(), target.persisted_id()) {
                            object.set(key, Some(Scalar::Int(id.0 as i64)));
                        }
                    }
                    (RelationKind::BelongsTo, Extracted::Null) => {}
                    (RelationKind::BelongsTo, Extracted::Node(nested)) => {
                        self.check_target(type_name, relation, &nested)?;
                        let target = self.import_at(&nested, depth + 1)?;
                        pending.push((relation.clone(), target));
                    }
                    (RelationKind::HasMany | RelationKind::ManyMany, Extracted::Null) => {}
                    (RelationKind::HasMany | RelationKind::ManyMany, Extracted::List(members)) => {
                        for member in &members {
                            self.check_target(type_name, relation, member)?;
                            let imported = self.import_at(member, depth + 1)?;
                            pending.push((relation.clone(), imported));
                        }
                    }
                    (_, other) => {
                        return Err(Error::malformed(format!(
                            "relation '{}.{}' cannot take {}",
                            type_name,
                            relation.name,
                            describe(&other)
                        )))
                    }
                }
            }
        }

        self.store.write(&mut object)?;
        if descriptor.staged {
            self.store.publish(&object)?;
        }

        for (relation, mut member) in pending {
            self.store.attach(&object, &relation, &mut member)?;
            if self.inspector.all_fields(&member.type_name).staged {
                self.store.publish(&member)?;
            }
        }

        debug!(type_name, id = ?object.id, depth, "imported record");
        Ok(object)
    }

    /// Existing draft object matching the record's identity, if any
    fn resolve(&self, type_name: &str, record: &ExtractedRecord) -> Result<Option<DataObject>> {
        let id = match record.get(ID_FIELD) {
            Some(Extracted::Scalar(scalar)) => scalar.as_i64(),
            _ => None,
        };
        match id.filter(|id| *id > 0) {
            Some(id) => self.store.find(type_name, ObjectId(id as u64)),
            None => Ok(None),
        }
    }

    /// Nested records must be the relation's target type or a subtype of it
    fn check_target(&self, owner: &str, relation: &RelationDef, nested: &ExtractedRecord) -> Result<()> {
        match nested.type_name.as_deref() {
            Some(nested_type) if !self.inspector.is_known(nested_type) => {
                Err(Error::UnknownType(nested_type.to_string()))
            }
            Some(nested_type) if !self.inspector.is_a(nested_type, &relation.target) => {
                Err(Error::malformed(format!(
                    "relation '{}.{}' expects {}, got {}",
                    owner, relation.name, relation.target, nested_type
                )))
            }
            _ => Ok(()),
        }
    }

    /// Row formats carry relation payloads as JSON text in one cell
    fn decode_relation(&self, relation: &RelationDef, raw: &Extracted) -> Result<Extracted> {
        match raw {
            Extracted::Scalar(Scalar::Text(text)) if self.format.is_row() => {
                if text.trim().is_empty() {
                    return Ok(Extracted::Null);
                }
                let value: serde_json::Value = serde_json::from_str(text).map_err(|e| {
                    Error::malformed(format!("relation '{}' is not valid JSON: {}", relation.name, e))
                })?;
                Extracted::from_json(value)
            }
            other => Ok(other.clone()),
        }
    }
}

/// Convert an incoming value to the column's storage type
///
/// Empty text means "reset to null".
fn coerce(field_type: FieldType, name: &str, value: &Extracted) -> Result<Option<Scalar>> {
    let scalar = match value {
        Extracted::Null => return Ok(None),
        Extracted::Scalar(Scalar::Text(text)) if text.is_empty() => return Ok(None),
        Extracted::Scalar(scalar) => scalar,
        other => {
            return Err(Error::malformed(format!(
                "column '{}' cannot take {}",
                name,
                describe(other)
            )))
        }
    };

    let invalid = || Error::malformed(format!("column '{}' cannot take '{}'", name, scalar.to_cell()));

    let coerced = match (field_type, scalar) {
        (FieldType::Text, scalar) => Scalar::Text(scalar.to_cell()),
        (FieldType::Int | FieldType::ForeignKey | FieldType::Id | FieldType::Version, Scalar::Float(f))
            if f.fract() == 0.0 =>
        {
            Scalar::Int(*f as i64)
        }
        (FieldType::Int | FieldType::ForeignKey | FieldType::Id | FieldType::Version, scalar) => {
            Scalar::Int(scalar.as_i64().ok_or_else(invalid)?)
        }
        (FieldType::Float, Scalar::Int(n)) => Scalar::Float(*n as f64),
        (FieldType::Float, Scalar::Float(f)) => Scalar::Float(*f),
        (FieldType::Float, Scalar::Text(s)) => {
            Scalar::Float(s.trim().parse().map_err(|_| invalid())?)
        }
        (FieldType::Bool, Scalar::Bool(b)) => Scalar::Bool(*b),
        (FieldType::Bool, Scalar::Int(n)) => Scalar::Bool(*n != 0),
        (FieldType::Bool, Scalar::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Scalar::Bool(true),
            "0" | "false" | "no" => Scalar::Bool(false),
            _ => return Err(invalid()),
        },
        _ => return Err(invalid()),
    };
    Ok(Some(coerced))
}

fn describe(value: &Extracted) -> &'static str {
    match value {
        Extracted::Null => "null",
        Extracted::Scalar(_) => "a scalar",
        Extracted::Node(_) => "a nested record",
        Extracted::List(_) => "a list",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphExtractor;
    use crate::schema::{TypeDef, TypeRegistry};
    use crate::store::{MemoryStore, Query, Stage};
    use serde_json::json;
    use std::sync::Arc;

    fn setup() -> (SchemaInspector, MemoryStore) {
        let registry: Arc<TypeRegistry> = Arc::new(
            TypeRegistry::new()
                .with(
                    TypeDef::new("Article")
                        .field("title", FieldType::Text)
                        .field("rating", FieldType::Int)
                        .field("featured", FieldType::Bool)
                        .has_one("Author", "Member")
                        .has_many("comments", "Comment", "Article")
                        .many_many("tags", "Tag")
                        .staged(),
                )
                .with(TypeDef::new("Comment").field("text", FieldType::Text).has_one("Article", "Article"))
                .with(TypeDef::new("Member").field("name", FieldType::Text))
                .with(TypeDef::new("Tag").field("label", FieldType::Text)),
        );
        (SchemaInspector::new(registry.clone()), MemoryStore::new(registry))
    }

    fn record(value: serde_json::Value) -> ExtractedRecord {
        ExtractedRecord::from_json(value).unwrap()
    }

    #[test]
    fn test_creates_graph_with_fresh_identities() {
        let (inspector, mut store) = setup();
        let input = record(json!({
            "ClassName": "Article",
            "ID": 900,
            "Version": 17,
            "title": "Hello",
            "rating": "4",
            "featured": "1",
            "Author": {"ClassName": "Member", "ID": 901, "name": "Ann"},
            "comments": [
                {"ClassName": "Comment", "text": "a"},
                {"ClassName": "Comment", "text": "b"}
            ],
            "tags": [{"ClassName": "Tag", "label": "rust"}]
        }));

        let article = GraphImporter::new(&inspector, &mut store, Format::Json, 1)
            .import_record(&input)
            .unwrap();

        // related records are written before their owner
        assert_eq!(article.id, Some(ObjectId(5)));
        assert_eq!(article.get("AuthorID"), Some(&Scalar::Int(1)));
        assert_eq!(article.get("rating"), Some(&Scalar::Int(4)));
        assert_eq!(article.get("featured"), Some(&Scalar::Bool(true)));
        assert_eq!(article.get("Version"), Some(&Scalar::Int(1)));

        assert_eq!(store.count(&Query::new("Comment")).unwrap(), 2);
        assert_eq!(store.count(&Query::new("Article").stage(Stage::Live)).unwrap(), 1);
        assert_eq!(store.joins().len(), 1);

        let extracted = GraphExtractor::new(&inspector, &store, 1).extract(&article).unwrap();
        let Some(Extracted::List(comments)) = extracted.get("comments") else {
            panic!("expected comments");
        };
        assert_eq!(comments.len(), 2);
    }

    #[test]
    fn test_matching_identity_updates_in_place() {
        let (inspector, mut store) = setup();
        let mut existing = DataObject::new("Article").with_field("title", "old").with_field("rating", 3i64);
        store.write(&mut existing).unwrap();

        let input = record(json!({"ClassName": "Article", "ID": 1, "title": "new", "rating": ""}));
        let updated = GraphImporter::new(&inspector, &mut store, Format::Json, 0)
            .import_record(&input)
            .unwrap();

        assert_eq!(updated.id, Some(ObjectId(1)));
        assert_eq!(store.count(&Query::new("Article")).unwrap(), 1);
        let stored = store.get(Stage::Draft, ObjectId(1)).unwrap();
        assert_eq!(stored.get("title"), Some(&Scalar::from("new")));
        assert_eq!(stored.fields.get("rating"), Some(&None));
        assert_eq!(stored.get("Version"), Some(&Scalar::Int(2)));
    }

    #[test]
    fn test_row_format_decodes_relation_cells() {
        let (inspector, mut store) = setup();
        let input = ExtractedRecord::new("Article")
            .with("title", Extracted::Scalar(Scalar::from("t")))
            .with(
                "comments",
                Extracted::Scalar(Scalar::from(r#"[{"ClassName":"Comment","text":"x"}]"#)),
            )
            .with("Author", Extracted::Scalar(Scalar::from("null")));

        GraphImporter::new(&inspector, &mut store, Format::Csv, 1)
            .import_record(&input)
            .unwrap();

        let comments = store.fetch(&Query::new("Comment"), 0, 10).unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].get("ArticleID"), Some(&Scalar::Int(2)));
    }

    #[test]
    fn test_relations_beyond_depth_are_ignored() {
        let (inspector, mut store) = setup();
        let input = record(json!({
            "ClassName": "Article",
            "comments": [{"ClassName": "Comment", "text": "a"}]
        }));
        GraphImporter::new(&inspector, &mut store, Format::Json, 0)
            .import_record(&input)
            .unwrap();
        assert_eq!(store.count(&Query::new("Comment")).unwrap(), 0);
    }

    #[test]
    fn test_missing_type_tag_is_an_error() {
        let (inspector, mut store) = setup();
        let input = record(json!({"title": "orphan"}));
        let result = GraphImporter::new(&inspector, &mut store, Format::Json, 0).import_record(&input);
        assert!(matches!(result, Err(Error::MissingTypeTag)));

        let nested = record(json!({"ClassName": "Article", "comments": [{"text": "x"}]}));
        let result = GraphImporter::new(&inspector, &mut store, Format::Json, 1).import_record(&nested);
        assert!(matches!(result, Err(Error::MissingTypeTag)));
    }

    #[test]
    fn test_bad_values_are_malformed() {
        let (inspector, mut store) = setup();
        let input = record(json!({"ClassName": "Article", "rating": "lots"}));
        let result = GraphImporter::new(&inspector, &mut store, Format::Json, 0).import_record(&input);
        assert!(matches!(result, Err(Error::Malformed(_))));

        let input = record(json!({"ClassName": "Article", "comments": {"ClassName": "Comment"}}));
        let result = GraphImporter::new(&inspector, &mut store, Format::Json, 1).import_record(&input);
        assert!(matches!(result, Err(Error::Malformed(_))));
    }

    #[test]
    fn test_nested_record_must_match_relation_target() {
        let (inspector, mut store) = setup();
        let input = record(json!({
            "ClassName": "Article",
            "title": "t",
            "Author": {"ClassName": "Tag", "label": "not a member"}
        }));
        let result = GraphImporter::new(&inspector, &mut store, Format::Json, 1).import_record(&input);
        assert!(matches!(result, Err(Error::Malformed(_))));
        assert_eq!(store.count(&Query::new("Tag")).unwrap(), 0);
        assert_eq!(store.count(&Query::new("Article")).unwrap(), 0);

        let input = record(json!({
            "ClassName": "Article",
            "comments": [{"ClassName": "Member", "name": "Ann"}]
        }));
        let result = GraphImporter::new(&inspector, &mut store, Format::Json, 1).import_record(&input);
        assert!(matches!(result, Err(Error::Malformed(_))));
    }
}
