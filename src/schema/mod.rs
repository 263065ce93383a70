//! Schema introspection
//!
//! Types are declared up front in a [`TypeRegistry`]; the
//! [`SchemaInspector`] merges each type's declarations along its inheritance
//! chain and memoizes the result.

pub mod inspector;
pub mod registry;

pub use inspector::{RelatedFields, SchemaDescriptor, SchemaInspector, ID_FIELD, VERSION_FIELD};
pub use registry::{
    ancestry, FieldDef, FieldType, RelationDef, RelationKind, SchemaProvider, TypeDef,
    TypeRegistry,
};
