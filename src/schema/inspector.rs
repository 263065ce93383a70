//! Merged, memoized field plans per type
//!
//! A [`SchemaDescriptor`] is the pre-computed traversal plan for one type:
//! which columns are copied as scalars and which relations are followed.
//! Descriptors are computed on first use and cached by type name for the
//! lifetime of the inspector.

use crate::schema::registry::{ancestry, FieldDef, FieldType, RelationDef, RelationKind, SchemaProvider};
use crate::store::DataObject;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

/// Identity column every type carries
pub const ID_FIELD: &str = "ID";

/// Revision column of staged types
pub const VERSION_FIELD: &str = "Version";

/// Relation fields of a type, bucketed by storage kind
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelatedFields {
    /// has-one, key held locally
    pub to_one: Vec<RelationDef>,
    /// belongs-to, key held by the target
    pub to_one_owning: Vec<RelationDef>,
    /// has-many, key held by each member
    pub to_many_keyed: Vec<RelationDef>,
    /// many-many through a join table
    pub to_many_joined: Vec<RelationDef>,
}

impl RelatedFields {
    /// All relations in header order
    pub fn iter(&self) -> impl Iterator<Item = &RelationDef> {
        self.to_one
            .iter()
            .chain(self.to_one_owning.iter())
            .chain(self.to_many_keyed.iter())
            .chain(self.to_many_joined.iter())
    }

    pub fn len(&self) -> usize {
        self.to_one.len()
            + self.to_one_owning.len()
            + self.to_many_keyed.len()
            + self.to_many_joined.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&mut self, relation: RelationDef) {
        let bucket = match relation.kind {
            RelationKind::HasOne => &mut self.to_one,
            RelationKind::BelongsTo => &mut self.to_one_owning,
            RelationKind::HasMany => &mut self.to_many_keyed,
            RelationKind::ManyMany => &mut self.to_many_joined,
        };
        bucket.push(relation);
    }
}

/// Fully merged field set of one type
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaDescriptor {
    pub type_name: String,
    /// Columns in header order
    pub local: Vec<FieldDef>,
    pub related: RelatedFields,
    /// Draft/live lifecycle, inherited from any ancestor
    pub staged: bool,
    /// Other registered types extend this one, so listings can hold subtypes
    pub polymorphic: bool,
}

impl SchemaDescriptor {
    /// Unknown types have no fields at all
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.related.is_empty()
    }

    pub fn local_field(&self, name: &str) -> Option<&FieldDef> {
        self.local.iter().find(|f| f.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.related.iter().find(|r| r.name == name)
    }
}

/// Computes and caches [`SchemaDescriptor`]s
pub struct SchemaInspector {
    provider: Arc<dyn SchemaProvider>,
    cache: RefCell<HashMap<String, Rc<SchemaDescriptor>>>,
}

impl SchemaInspector {
    pub fn new(provider: Arc<dyn SchemaProvider>) -> Self {
        SchemaInspector {
            provider,
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn SchemaProvider> {
        &self.provider
    }

    pub fn is_known(&self, type_name: &str) -> bool {
        self.provider.is_known(type_name)
    }

    /// New unsaved instance of `type_name`
    pub fn factory(&self, type_name: &str) -> Option<DataObject> {
        self.provider.factory(type_name)
    }

    /// Merged descriptor for `type_name`, computed at most once
    pub fn all_fields(&self, type_name: &str) -> Rc<SchemaDescriptor> {
        if let Some(descriptor) = self.cache.borrow().get(type_name) {
            return Rc::clone(descriptor);
        }

        let descriptor = Rc::new(self.build(type_name));
        self.cache
            .borrow_mut()
            .insert(type_name.to_string(), Rc::clone(&descriptor));
        descriptor
    }

    pub fn local_fields(&self, type_name: &str) -> Vec<FieldDef> {
        self.all_fields(type_name).local.clone()
    }

    pub fn related_fields(&self, type_name: &str) -> RelatedFields {
        self.all_fields(type_name).related.clone()
    }

    /// True if `type_name` is `ancestor` or inherits from it
    pub fn is_a(&self, type_name: &str, ancestor: &str) -> bool {
        ancestry(self.provider.as_ref(), type_name)
            .iter()
            .any(|name| name == ancestor)
    }

    pub fn cached_types(&self) -> usize {
        self.cache.borrow().len()
    }

    fn build(&self, type_name: &str) -> SchemaDescriptor {
        let chain = ancestry(self.provider.as_ref(), type_name);
        if chain.is_empty() {
            return SchemaDescriptor {
                type_name: type_name.to_string(),
                ..SchemaDescriptor::default()
            };
        }

        let staged = chain.iter().any(|name| self.provider.is_staged(name));
        let polymorphic = self.provider.known_types().iter().any(|other| {
            other != type_name
                && ancestry(self.provider.as_ref(), other)
                    .iter()
                    .any(|name| name == type_name)
        });

        // Root ancestor first so declaration order reads top-down; a subclass
        // redefining a name replaces the inherited definition in place.
        let mut declared: Vec<FieldDef> = Vec::new();
        let mut relations: Vec<RelationDef> = Vec::new();
        for name in chain.iter().rev() {
            for field in self.provider.local_fields(name) {
                match declared.iter_mut().find(|f| f.name == field.name) {
                    Some(existing) => *existing = field,
                    None => declared.push(field),
                }
            }
            for relation in self.provider.relations(name) {
                match relations.iter_mut().find(|r| r.name == relation.name) {
                    Some(existing) => *existing = relation,
                    None => relations.push(relation),
                }
            }
        }

        let mut local = vec![FieldDef::new(ID_FIELD, FieldType::Id)];
        if staged {
            local.push(FieldDef::new(VERSION_FIELD, FieldType::Version));
        }
        local.extend(
            declared
                .into_iter()
                .filter(|f| f.name != ID_FIELD && f.name != VERSION_FIELD),
        );
        for relation in relations.iter().filter(|r| r.kind == RelationKind::HasOne) {
            if let Some(key) = relation.foreign_key() {
                if !local.iter().any(|f| f.name == key) {
                    local.push(FieldDef::new(key, FieldType::ForeignKey));
                }
            }
        }

        let mut related = RelatedFields::default();
        for relation in relations {
            related.push(relation);
        }

        SchemaDescriptor {
            type_name: type_name.to_string(),
            local,
            related,
            staged,
            polymorphic,
        }
    }
}
