//! Object graph traversal
//!
//! [`GraphExtractor`] walks stored objects into a depth-bounded
//! [`ExtractedRecord`] tree; [`GraphImporter`] walks such a tree back into
//! the store.

pub mod extractor;
pub mod importer;
pub mod types;

pub use extractor::GraphExtractor;
pub use importer::GraphImporter;
pub use types::{Extracted, ExtractedRecord, TYPE_TAG};
