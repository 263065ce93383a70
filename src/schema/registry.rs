//! Static type registry
//!
//! Types are registered once at startup (or loaded from `schema.json`) and
//! never change afterwards. The registry only knows what each type declares
//! itself; merging along the inheritance chain is the inspector's job.

use crate::error::{Error, Result};
use crate::store::DataObject;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Storage type of a local column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Primary identity column
    Id,
    Int,
    Float,
    Bool,
    Text,
    /// `<Relation>ID` column backing a has-one relation
    ForeignKey,
    /// Revision counter maintained by the store for staged types
    Version,
}

/// How a relation is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// To-one, foreign key `<name>ID` on this object
    HasOne,
    /// To-one, foreign key `<remote>ID` on the target object
    BelongsTo,
    /// To-many, foreign key `<remote>ID` on each target object
    HasMany,
    /// To-many through a join table
    ManyMany,
}

impl RelationKind {
    pub fn is_to_many(self) -> bool {
        matches!(self, RelationKind::HasMany | RelationKind::ManyMany)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        FieldDef {
            name: name.into(),
            field_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDef {
    pub name: String,
    pub kind: RelationKind,
    pub target: String,
    /// Name of the has-one on the target that points back here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
}

impl RelationDef {
    /// Column holding the foreign key for this relation, if it has one
    ///
    /// For `HasOne` the column lives on the owner; for `BelongsTo` and
    /// `HasMany` it lives on the target.
    pub fn foreign_key(&self) -> Option<String> {
        match self.kind {
            RelationKind::HasOne => Some(format!("{}ID", self.name)),
            RelationKind::BelongsTo | RelationKind::HasMany => {
                self.remote.as_ref().map(|remote| format!("{}ID", remote))
            }
            RelationKind::ManyMany => None,
        }
    }
}

/// Everything one type declares about itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub relations: Vec<RelationDef>,
    /// Draft/live lifecycle
    #[serde(default)]
    pub staged: bool,
}

impl TypeDef {
    pub fn new(name: impl Into<String>) -> Self {
        TypeDef {
            name: name.into(),
            parent: None,
            fields: Vec::new(),
            relations: Vec::new(),
            staged: false,
        }
    }

    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDef::new(name, field_type));
        self
    }

    pub fn has_one(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.relation(name, RelationKind::HasOne, target, None)
    }

    pub fn belongs_to(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        remote: impl Into<String>,
    ) -> Self {
        self.relation(name, RelationKind::BelongsTo, target, Some(remote.into()))
    }

    pub fn has_many(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        remote: impl Into<String>,
    ) -> Self {
        self.relation(name, RelationKind::HasMany, target, Some(remote.into()))
    }

    pub fn many_many(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.relation(name, RelationKind::ManyMany, target, None)
    }

    pub fn staged(mut self) -> Self {
        self.staged = true;
        self
    }

    fn relation(
        mut self,
        name: impl Into<String>,
        kind: RelationKind,
        target: impl Into<String>,
        remote: Option<String>,
    ) -> Self {
        self.relations.push(RelationDef {
            name: name.into(),
            kind,
            target: target.into(),
            remote,
        });
        self
    }
}

/// Capability interface standing in for runtime reflection
pub trait SchemaProvider {
    fn is_known(&self, type_name: &str) -> bool;

    /// Direct parent type; `None` for root types and unknown names
    fn parent(&self, type_name: &str) -> Option<String>;

    /// Columns declared by this type alone
    fn local_fields(&self, type_name: &str) -> Vec<FieldDef>;

    /// Relations declared by this type alone
    fn relations(&self, type_name: &str) -> Vec<RelationDef>;

    /// Whether this type itself declares a draft/live lifecycle
    fn is_staged(&self, type_name: &str) -> bool;

    /// New, unsaved instance of a known type
    fn factory(&self, type_name: &str) -> Option<DataObject>;

    /// Every known type name
    fn known_types(&self) -> Vec<String>;
}

/// The type itself followed by its ancestors, nearest first
pub fn ancestry(provider: &dyn SchemaProvider, type_name: &str) -> Vec<String> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = Some(type_name.to_string());

    while let Some(name) = current {
        if !provider.is_known(&name) || !seen.insert(name.clone()) {
            break;
        }
        current = provider.parent(&name);
        chain.push(name);
    }

    chain
}

/// Registry of statically declared types
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeRegistry {
    types: BTreeMap<String, TypeDef>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry::default()
    }

    pub fn register(&mut self, def: TypeDef) -> &mut Self {
        self.types.insert(def.name.clone(), def);
        self
    }

    pub fn with(mut self, def: TypeDef) -> Self {
        self.register(def);
        self
    }

    pub fn get(&self, type_name: &str) -> Option<&TypeDef> {
        self.types.get(type_name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Check that every parent and relation target is registered
    pub fn validate(&self) -> Result<()> {
        for def in self.types.values() {
            if let Some(parent) = &def.parent {
                if !self.types.contains_key(parent) {
                    return Err(Error::Config(format!(
                        "type '{}' extends unknown type '{}'",
                        def.name, parent
                    )));
                }
            }
            for relation in &def.relations {
                if !self.types.contains_key(&relation.target) {
                    return Err(Error::Config(format!(
                        "relation '{}.{}' targets unknown type '{}'",
                        def.name, relation.name, relation.target
                    )));
                }
                if matches!(relation.kind, RelationKind::BelongsTo | RelationKind::HasMany)
                    && relation.remote.is_none()
                {
                    return Err(Error::Config(format!(
                        "relation '{}.{}' needs the name of the remote has-one",
                        def.name, relation.name
                    )));
                }
            }
        }
        Ok(())
    }
}

impl SchemaProvider for TypeRegistry {
    fn is_known(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    fn parent(&self, type_name: &str) -> Option<String> {
        self.types.get(type_name).and_then(|def| def.parent.clone())
    }

    fn local_fields(&self, type_name: &str) -> Vec<FieldDef> {
        self.types
            .get(type_name)
            .map(|def| def.fields.clone())
            .unwrap_or_default()
    }

    fn relations(&self, type_name: &str) -> Vec<RelationDef> {
        self.types
            .get(type_name)
            .map(|def| def.relations.clone())
            .unwrap_or_default()
    }

    fn is_staged(&self, type_name: &str) -> bool {
        self.types.get(type_name).is_some_and(|def| def.staged)
    }

    fn factory(&self, type_name: &str) -> Option<DataObject> {
        self.types
            .contains_key(type_name)
            .then(|| DataObject::new(type_name))
    }

    fn known_types(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }
}
