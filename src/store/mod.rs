//! Storage abstraction
//!
//! The engine never talks to a database directly. It sees objects through
//! the [`Store`] trait: ordered, filterable, offset-bounded listings, relation
//! navigation, writes, staged publishing and deletes. [`MemoryStore`] is the
//! in-process implementation used by the CLI workspace and the tests.

pub mod filter;
pub mod memory;

pub use filter::Filter;
pub use memory::{MemoryStore, Snapshot};

use crate::error::Result;
use crate::schema::RelationDef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Persisted identity of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Only positive ids are persisted identities
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    /// Text form used for row cells and filter comparisons
    pub fn to_cell(&self) -> String {
        match self {
            Scalar::Bool(true) => "1".to_string(),
            Scalar::Bool(false) => "0".to_string(),
            Scalar::Int(n) => n.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Text(s) => s.clone(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(n) => Some(*n),
            Scalar::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Text(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Text(s)
    }
}

impl From<i64> for Scalar {
    fn from(n: i64) -> Self {
        Scalar::Int(n)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

impl From<f64> for Scalar {
    fn from(f: f64) -> Self {
        Scalar::Float(f)
    }
}

/// A typed object as the store hands it out
///
/// `id` is `None` until the object has been written. Column values live in
/// `fields`; a column that is present with `None` is an explicit null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataObject {
    pub type_name: String,
    pub id: Option<ObjectId>,
    pub fields: BTreeMap<String, Option<Scalar>>,
}

impl DataObject {
    pub fn new(type_name: impl Into<String>) -> Self {
        DataObject {
            type_name: type_name.into(),
            id: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.fields.insert(name.into(), Some(value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.fields.get(name).and_then(|v| v.as_ref())
    }

    pub fn set(&mut self, name: impl Into<String>, value: Option<Scalar>) {
        self.fields.insert(name.into(), value);
    }

    /// The identity, if this object has been persisted
    pub fn persisted_id(&self) -> Option<ObjectId> {
        self.id.filter(|id| id.is_valid())
    }
}

/// Publication stage of a multi-stage type
///
/// Single-stage types only ever live in `Draft`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Draft,
    Live,
}

impl Stage {
    pub const ALL: [Stage; 2] = [Stage::Draft, Stage::Live];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Draft => write!(f, "draft"),
            Stage::Live => write!(f, "live"),
        }
    }
}

/// A filtered listing of one type (subtypes included), ordered by identity
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub type_name: String,
    pub filter: Option<String>,
    pub stage: Stage,
}

impl Query {
    pub fn new(type_name: impl Into<String>) -> Self {
        Query {
            type_name: type_name.into(),
            filter: None,
            stage: Stage::Draft,
        }
    }

    pub fn filter(mut self, filter: Option<&str>) -> Self {
        self.filter = filter.map(str::to_string).filter(|f| !f.trim().is_empty());
        self
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }
}

/// Result of navigating a relation
#[derive(Debug, Clone)]
pub enum Related {
    One(Option<DataObject>),
    Many(Vec<DataObject>),
}

/// Query and mutation interface of the backing store
pub trait Store {
    /// Number of objects matching the query
    fn count(&self, query: &Query) -> Result<usize>;

    /// Ordered slice `[offset, offset + limit)` of the query result
    fn fetch(&self, query: &Query, offset: usize, limit: usize) -> Result<Vec<DataObject>>;

    /// Look up a draft-stage object of `type_name` (or a subtype) by identity
    fn find(&self, type_name: &str, id: ObjectId) -> Result<Option<DataObject>>;

    /// Navigate a relation of `object`
    ///
    /// Related objects the store cannot fully materialize come back without
    /// an identity; callers must skip them.
    fn related(&self, object: &DataObject, relation: &RelationDef) -> Result<Related>;

    /// Persist `object` to the draft stage, assigning an identity if needed
    fn write(&mut self, object: &mut DataObject) -> Result<ObjectId>;

    /// Copy the draft version of `object` to the live stage
    fn publish(&mut self, object: &DataObject) -> Result<()>;

    /// Link `member` into `owner`'s relation (foreign key or join row)
    fn attach(
        &mut self,
        owner: &DataObject,
        relation: &RelationDef,
        member: &mut DataObject,
    ) -> Result<()>;

    /// Remove `object` from one stage
    fn delete(&mut self, object: &DataObject, stage: Stage) -> Result<()>;

    /// Drop any cached object state
    fn flush_cache(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_cells() {
        assert_eq!(Scalar::Bool(true).to_cell(), "1");
        assert_eq!(Scalar::Int(-4).to_cell(), "-4");
        assert_eq!(Scalar::from("x").to_cell(), "x");
        assert_eq!(Scalar::from(" 12 ").as_i64(), Some(12));
    }

    #[test]
    fn test_persisted_id_requires_positive() {
        let mut object = DataObject::new("Article");
        assert_eq!(object.persisted_id(), None);
        object.id = Some(ObjectId(0));
        assert_eq!(object.persisted_id(), None);
        object.id = Some(ObjectId(3));
        assert_eq!(object.persisted_id(), Some(ObjectId(3)));
    }

    #[test]
    fn test_query_ignores_blank_filter() {
        let query = Query::new("Article").filter(Some("   "));
        assert_eq!(query.filter, None);
    }
}
