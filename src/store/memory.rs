//! In-memory store with draft/live stages
//!
//! Objects live in one table per stage keyed by identity, so listings are
//! naturally ordered by creation. Many-many links are kept as join rows. An
//! identity map caches objects looked up by id until [`Store::flush_cache`]
//! is called, which the job runner does after every chunk.

use crate::error::{Error, Result};
use crate::schema::{ancestry, RelationDef, RelationKind, SchemaProvider, VERSION_FIELD};
use crate::store::filter::Filter;
use crate::store::{DataObject, ObjectId, Query, Related, Scalar, Stage, Store};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// One many-many link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRow {
    pub owner: ObjectId,
    pub relation: String,
    pub member: ObjectId,
}

/// Serializable contents of a [`MemoryStore`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub next_id: u64,
    pub draft: BTreeMap<u64, DataObject>,
    pub live: BTreeMap<u64, DataObject>,
    pub joins: Vec<JoinRow>,
}

pub struct MemoryStore {
    schema: Arc<dyn SchemaProvider>,
    data: Snapshot,
    /// Rows that surface in listings without an identity
    detached: Vec<(Stage, DataObject)>,
    identity_map: RefCell<HashMap<ObjectId, DataObject>>,
}

impl MemoryStore {
    pub fn new(schema: Arc<dyn SchemaProvider>) -> Self {
        Self::from_snapshot(schema, Snapshot::default())
    }

    pub fn from_snapshot(schema: Arc<dyn SchemaProvider>, snapshot: Snapshot) -> Self {
        MemoryStore {
            schema,
            data: snapshot,
            detached: Vec::new(),
            identity_map: RefCell::new(HashMap::new()),
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.data
    }

    /// Add a row that has no identity, such as a half-written record
    pub fn insert_detached(&mut self, stage: Stage, object: DataObject) {
        self.detached.push((stage, object));
    }

    /// Number of objects currently held by the identity map
    pub fn cached_objects(&self) -> usize {
        self.identity_map.borrow().len()
    }

    /// Stored object by identity, regardless of type
    pub fn get(&self, stage: Stage, id: ObjectId) -> Option<&DataObject> {
        self.table(stage).get(&id.0)
    }

    /// All objects in a stage, in identity order
    pub fn objects(&self, stage: Stage) -> impl Iterator<Item = &DataObject> {
        self.table(stage).values()
    }

    pub fn joins(&self) -> &[JoinRow] {
        &self.data.joins
    }

    fn table(&self, stage: Stage) -> &BTreeMap<u64, DataObject> {
        match stage {
            Stage::Draft => &self.data.draft,
            Stage::Live => &self.data.live,
        }
    }

    fn table_mut(&mut self, stage: Stage) -> &mut BTreeMap<u64, DataObject> {
        match stage {
            Stage::Draft => &mut self.data.draft,
            Stage::Live => &mut self.data.live,
        }
    }

    fn is_a(&self, object: &DataObject, type_name: &str) -> bool {
        ancestry(self.schema.as_ref(), &object.type_name)
            .iter()
            .any(|name| name == type_name)
    }

    fn is_staged(&self, type_name: &str) -> bool {
        ancestry(self.schema.as_ref(), type_name)
            .iter()
            .any(|name| self.schema.is_staged(name))
    }

    fn listing(&self, query: &Query) -> Result<Vec<&DataObject>> {
        let filter = query.filter.as_deref().map(Filter::parse).transpose()?;
        let keep = |object: &&DataObject| {
            self.is_a(object, &query.type_name)
                && filter.as_ref().map_or(true, |f| f.matches(object))
        };

        let stored = self.table(query.stage).values().filter(keep);
        let detached = self
            .detached
            .iter()
            .filter(|(stage, _)| *stage == query.stage)
            .map(|(_, object)| object)
            .filter(keep);

        Ok(stored.chain(detached).collect())
    }

    /// Draft objects of `type_name` whose `key` column points at `owner`
    fn referencing(&self, type_name: &str, key: &str, owner: ObjectId) -> Vec<DataObject> {
        self.data
            .draft
            .values()
            .filter(|object| self.is_a(object, type_name))
            .filter(|object| object.get(key).and_then(Scalar::as_i64) == Some(owner.0 as i64))
            .cloned()
            .collect()
    }

    /// Unsaved stand-in for a reference whose target is missing
    fn placeholder(&self, type_name: &str) -> DataObject {
        self.schema
            .factory(type_name)
            .unwrap_or_else(|| DataObject::new(type_name))
    }
}

impl Store for MemoryStore {
    fn count(&self, query: &Query) -> Result<usize> {
        Ok(self.listing(query)?.len())
    }

    fn fetch(&self, query: &Query, offset: usize, limit: usize) -> Result<Vec<DataObject>> {
        Ok(self
            .listing(query)?
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    fn find(&self, type_name: &str, id: ObjectId) -> Result<Option<DataObject>> {
        if let Some(object) = self.identity_map.borrow().get(&id) {
            return Ok(self.is_a(object, type_name).then(|| object.clone()));
        }

        let found = self
            .data
            .draft
            .get(&id.0)
            .filter(|object| self.is_a(object, type_name))
            .cloned();
        if let Some(object) = &found {
            self.identity_map.borrow_mut().insert(id, object.clone());
        }
        Ok(found)
    }

    fn related(&self, object: &DataObject, relation: &RelationDef) -> Result<Related> {
        let key = relation.foreign_key();

        match relation.kind {
            RelationKind::HasOne => {
                let target_id = key
                    .as_deref()
                    .and_then(|key| object.get(key))
                    .and_then(Scalar::as_i64)
                    .filter(|id| *id > 0);
                let Some(target_id) = target_id else {
                    return Ok(Related::One(None));
                };
                let found = self.find(&relation.target, ObjectId(target_id as u64))?;
                Ok(Related::One(Some(
                    found.unwrap_or_else(|| self.placeholder(&relation.target)),
                )))
            }
            RelationKind::BelongsTo => {
                let (Some(owner), Some(key)) = (object.persisted_id(), key) else {
                    return Ok(Related::One(None));
                };
                Ok(Related::One(
                    self.referencing(&relation.target, &key, owner).into_iter().next(),
                ))
            }
            RelationKind::HasMany => {
                let (Some(owner), Some(key)) = (object.persisted_id(), key) else {
                    return Ok(Related::Many(Vec::new()));
                };
                Ok(Related::Many(self.referencing(&relation.target, &key, owner)))
            }
            RelationKind::ManyMany => {
                let Some(owner) = object.persisted_id() else {
                    return Ok(Related::Many(Vec::new()));
                };
                let members = self
                    .data
                    .joins
                    .iter()
                    .filter(|row| row.owner == owner && row.relation == relation.name)
                    .map(|row| {
                        self.data
                            .draft
                            .get(&row.member.0)
                            .cloned()
                            .unwrap_or_else(|| self.placeholder(&relation.target))
                    })
                    .collect();
                Ok(Related::Many(members))
            }
        }
    }

    fn write(&mut self, object: &mut DataObject) -> Result<ObjectId> {
        if !self.schema.is_known(&object.type_name) {
            return Err(Error::UnknownType(object.type_name.clone()));
        }

        let id = match object.persisted_id() {
            Some(id) => id,
            None => {
                self.data.next_id += 1;
                ObjectId(self.data.next_id)
            }
        };
        object.id = Some(id);

        if self.is_staged(&object.type_name) {
            let previous = self
                .data
                .draft
                .get(&id.0)
                .and_then(|existing| existing.get(VERSION_FIELD))
                .and_then(Scalar::as_i64)
                .unwrap_or(0);
            object.set(VERSION_FIELD, Some(Scalar::Int(previous + 1)));
        }

        self.data.draft.insert(id.0, object.clone());
        self.identity_map.borrow_mut().remove(&id);
        Ok(id)
    }

    fn publish(&mut self, object: &DataObject) -> Result<()> {
        let id = object
            .persisted_id()
            .ok_or_else(|| Error::storage("cannot publish an unsaved object"))?;
        let draft = self
            .data
            .draft
            .get(&id.0)
            .cloned()
            .ok_or_else(|| Error::storage(format!("no draft of object {} to publish", id)))?;
        self.data.live.insert(id.0, draft);
        Ok(())
    }

    fn attach(
        &mut self,
        owner: &DataObject,
        relation: &RelationDef,
        member: &mut DataObject,
    ) -> Result<()> {
        let owner_id = owner
            .persisted_id()
            .ok_or_else(|| Error::storage("cannot link to an unsaved owner"))?;

        match relation.kind {
            RelationKind::HasOne => Err(Error::storage(format!(
                "has-one '{}' is linked through its foreign key",
                relation.name
            ))),
            RelationKind::BelongsTo | RelationKind::HasMany => {
                let key = relation.foreign_key().ok_or_else(|| {
                    Error::storage(format!("relation '{}' has no remote key", relation.name))
                })?;
                member.set(key, Some(Scalar::Int(owner_id.0 as i64)));
                self.write(member)?;
                Ok(())
            }
            RelationKind::ManyMany => {
                let member_id = match member.persisted_id() {
                    Some(id) => id,
                    None => self.write(member)?,
                };
                let row = JoinRow {
                    owner: owner_id,
                    relation: relation.name.clone(),
                    member: member_id,
                };
                if !self.data.joins.contains(&row) {
                    self.data.joins.push(row);
                }
                Ok(())
            }
        }
    }

    fn delete(&mut self, object: &DataObject, stage: Stage) -> Result<()> {
        let id = object
            .persisted_id()
            .ok_or_else(|| Error::storage("cannot delete an object without identity"))?;
        self.table_mut(stage).remove(&id.0);
        if stage == Stage::Draft {
            self.data.joins.retain(|row| row.owner != id);
        }
        self.identity_map.borrow_mut().remove(&id);
        Ok(())
    }

    fn flush_cache(&mut self) {
        self.identity_map.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldType, TypeDef, TypeRegistry};

    fn store() -> MemoryStore {
        let registry = TypeRegistry::new()
            .with(
                TypeDef::new("Article")
                    .field("Title", FieldType::Text)
                    .has_one("Author", "Member")
                    .has_many("Comments", "Comment", "Article")
                    .many_many("Tags", "Tag")
                    .staged(),
            )
            .with(TypeDef::new("News").extends("Article"))
            .with(TypeDef::new("Comment").field("Text", FieldType::Text).has_one("Article", "Article"))
            .with(TypeDef::new("Member").field("Name", FieldType::Text))
            .with(TypeDef::new("Tag").field("Label", FieldType::Text));
        MemoryStore::new(Arc::new(registry))
    }

    fn relation(store: &MemoryStore, name: &str) -> RelationDef {
        store
            .schema
            .relations("Article")
            .into_iter()
            .find(|r| r.name == name)
            .unwrap()
    }

    #[test]
    fn test_write_assigns_ids_and_versions() {
        let mut store = store();
        let mut article = DataObject::new("Article").with_field("Title", "one");
        let id = store.write(&mut article).unwrap();
        assert_eq!(id, ObjectId(1));
        assert_eq!(article.get(VERSION_FIELD), Some(&Scalar::Int(1)));

        store.write(&mut article).unwrap();
        assert_eq!(article.get(VERSION_FIELD), Some(&Scalar::Int(2)));
        assert_eq!(store.count(&Query::new("Article")).unwrap(), 1);
    }

    #[test]
    fn test_write_rejects_unknown_type() {
        let mut store = store();
        let mut ghost = DataObject::new("Ghost");
        assert!(matches!(store.write(&mut ghost), Err(Error::UnknownType(_))));
    }

    #[test]
    fn test_queries_include_subtypes_and_filter() {
        let mut store = store();
        store.write(&mut DataObject::new("Article").with_field("Title", "a")).unwrap();
        store.write(&mut DataObject::new("News").with_field("Title", "b")).unwrap();

        assert_eq!(store.count(&Query::new("Article")).unwrap(), 2);
        assert_eq!(store.count(&Query::new("News")).unwrap(), 1);
        let query = Query::new("Article").filter(Some("Title = 'b'"));
        let found = store.fetch(&query, 0, 10).unwrap();
        assert_eq!(found[0].type_name, "News");
    }

    #[test]
    fn test_fetch_slices_in_identity_order() {
        let mut store = store();
        for title in ["a", "b", "c"] {
            store.write(&mut DataObject::new("Tag").with_field("Label", title)).unwrap();
        }
        let page = store.fetch(&Query::new("Tag"), 1, 5).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].get("Label"), Some(&Scalar::from("b")));
    }

    #[test]
    fn test_publish_copies_draft_to_live() {
        let mut store = store();
        let mut article = DataObject::new("Article").with_field("Title", "a");
        store.write(&mut article).unwrap();
        assert_eq!(store.count(&Query::new("Article").stage(Stage::Live)).unwrap(), 0);

        store.publish(&article).unwrap();
        assert_eq!(store.count(&Query::new("Article").stage(Stage::Live)).unwrap(), 1);
    }

    #[test]
    fn test_relations_navigate_keys_and_joins() {
        let mut store = store();
        let mut article = DataObject::new("Article");
        store.write(&mut article).unwrap();

        let mut comment = DataObject::new("Comment").with_field("Text", "hi");
        store.attach(&article, &relation(&store, "Comments"), &mut comment).unwrap();
        let mut tag = DataObject::new("Tag").with_field("Label", "rust");
        store.attach(&article, &relation(&store, "Tags"), &mut tag).unwrap();

        let Related::Many(comments) = store.related(&article, &relation(&store, "Comments")).unwrap() else {
            panic!("expected many");
        };
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].get("ArticleID"), Some(&Scalar::Int(1)));

        let Related::Many(tags) = store.related(&article, &relation(&store, "Tags")).unwrap() else {
            panic!("expected many");
        };
        assert_eq!(tags[0].get("Label"), Some(&Scalar::from("rust")));
    }

    #[test]
    fn test_dangling_has_one_surfaces_as_placeholder() {
        let mut store = store();
        let mut article = DataObject::new("Article").with_field("AuthorID", 99i64);
        store.write(&mut article).unwrap();

        let Related::One(Some(author)) = store.related(&article, &relation(&store, "Author")).unwrap() else {
            panic!("expected a placeholder");
        };
        assert_eq!(author.persisted_id(), None);
    }

    #[test]
    fn test_identity_map_flushes() {
        let mut store = store();
        let mut tag = DataObject::new("Tag");
        let id = store.write(&mut tag).unwrap();

        assert!(store.find("Tag", id).unwrap().is_some());
        assert_eq!(store.cached_objects(), 1);
        store.flush_cache();
        assert_eq!(store.cached_objects(), 0);
    }

    #[test]
    fn test_snapshot_round_trips_through_json() {
        let mut store = store();
        store.write(&mut DataObject::new("Tag").with_field("Label", "x")).unwrap();
        let json = serde_json::to_string(store.snapshot()).unwrap();
        let snapshot: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snapshot.draft.len(), 1);
        assert_eq!(snapshot.next_id, 1);
    }
}
