//! # Crucible - Record Export, Import and Purge
//!
//! A schema-driven engine that walks object graphs described by a type
//! registry, flattens them into CSV rows or nested JSON documents, parses
//! such artifacts back into objects, and deletes matching objects in bulk.
//! Work is queued as jobs and processed in memory-bounded chunks.
//!
//! ## Modules
//!
//! - **schema**: type registry and the memoizing schema inspector
//! - **store**: storage abstraction and the in-memory store
//! - **graph**: depth-bounded extraction and identity-resolving import
//! - **codec**: CSV / JSON / text artifacts and zip bundles
//! - **jobs**: job records, chunked runner, scheduler and downloads
//!
//! ## Quick Start
//!
//! ```rust
//! use crucible::codec::Format;
//! use crucible::schema::{FieldType, SchemaInspector, TypeDef, TypeRegistry};
//! use crucible::store::{DataObject, MemoryStore, Store};
//! use std::sync::Arc;
//!
//! # fn main() -> crucible::Result<()> {
//! let registry = Arc::new(
//!     TypeRegistry::new()
//!         .with(
//!             TypeDef::new("Article")
//!                 .field("title", FieldType::Text)
//!                 .has_many("comments", "Comment", "Article"),
//!         )
//!         .with(
//!             TypeDef::new("Comment")
//!                 .field("text", FieldType::Text)
//!                 .has_one("Article", "Article"),
//!         ),
//! );
//! let inspector = SchemaInspector::new(registry.clone());
//! let mut store = MemoryStore::new(registry);
//! store.write(&mut DataObject::new("Article").with_field("title", "Hello"))?;
//!
//! let csv = crucible::export_to_bytes(&inspector, &store, "Article", None, Format::Csv, 1)?;
//! assert_eq!(String::from_utf8_lossy(&csv), "ID,title,comments\n1,Hello,[]\n");
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod gauge;
pub mod graph;
pub mod jobs;
pub mod schema;
pub mod store;

// Re-export commonly used types for convenience
pub use codec::Format;
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use graph::{Extracted, ExtractedRecord, GraphExtractor, GraphImporter};
pub use jobs::{Job, JobContext, JobId, JobKind, JobKindTag, JobRequest, Scheduler, Status};
pub use schema::{SchemaInspector, TypeDef, TypeRegistry};
pub use store::{DataObject, MemoryStore, Query, Store};

/// Serialize every matching object of a type into one artifact, unchunked
pub fn export_to_bytes<S: Store + ?Sized>(
    inspector: &SchemaInspector,
    store: &S,
    type_name: &str,
    filter: Option<&str>,
    format: Format,
    depth: usize,
) -> Result<Vec<u8>> {
    if !inspector.is_known(type_name) {
        return Err(Error::UnknownType(type_name.to_string()));
    }
    let query = Query::new(type_name).filter(filter);
    let objects = store.fetch(&query, 0, store.count(&query)?)?;

    let extractor = GraphExtractor::new(inspector, store, depth);
    let records = objects
        .iter()
        .map(|object| extractor.extract(object))
        .collect::<Result<Vec<_>>>()?;

    codec::serialize(&records, format, depth, &inspector.all_fields(type_name))
}

/// Import every record of one artifact, unchunked
pub fn import_from_bytes<S: Store + ?Sized>(
    inspector: &SchemaInspector,
    store: &mut S,
    bytes: &[u8],
    root_type: &str,
    format: Format,
    depth: usize,
) -> Result<Vec<DataObject>> {
    let records = codec::read_records(format, bytes, root_type)?;
    let mut importer = GraphImporter::new(inspector, store, format, depth);
    records
        .iter()
        .map(|record| importer.import_record(record))
        .collect()
}
