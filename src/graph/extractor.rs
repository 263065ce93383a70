use crate::error::Result;
use crate::graph::types::{Extracted, ExtractedRecord};
use crate::schema::{FieldType, SchemaInspector};
use crate::store::{DataObject, Related, Scalar, Store};
use tracing::debug;

/// Walks an object graph into an [`ExtractedRecord`] tree
///
/// Local columns are always copied. Relations are only followed while the
/// current depth is below `max_depth`; related objects without a persisted
/// identity are dropped (to-one becomes null, to-many members are skipped).
///
/// There is no cycle detection: an object reachable from itself within
/// `max_depth` hops is emitted again as a nested copy.
pub struct GraphExtractor<'a, S: Store + ?Sized> {
    inspector: &'a SchemaInspector,
    store: &'a S,
    max_depth: usize,
}

impl<'a, S: Store + ?Sized> GraphExtractor<'a, S> {
    pub fn new(inspector: &'a SchemaInspector, store: &'a S, max_depth: usize) -> Self {
        GraphExtractor {
            inspector,
            store,
            max_depth,
        }
    }

    /// Extract a root object
    pub fn extract(&self, object: &DataObject) -> Result<ExtractedRecord> {
        self.extract_at(object, 0)
    }

    fn extract_at(&self, object: &DataObject, depth: usize) -> Result<ExtractedRecord> {
        let descriptor = self.inspector.all_fields(&object.type_name);
        let mut record = ExtractedRecord::new(object.type_name.clone());

        for field in &descriptor.local {
            let value = if field.field_type == FieldType::Id {
                object.persisted_id().map(|id| Scalar::Int(id.0 as i64))
            } else {
                object.get(&field.name).cloned()
            };
            record.push(
                field.name.clone(),
                value.map_or(Extracted::Null, Extracted::Scalar),
            );
        }

        if self.max_depth <= depth {
            return Ok(record);
        }

        for relation in descriptor.related.iter() {
            let value = match self.store.related(object, relation)? {
                Related::One(Some(target)) if target.persisted_id().is_some() => {
                    Extracted::Node(self.extract_at(&target, depth + 1)?)
                }
                Related::One(_) => Extracted::Null,
                Related::Many(members) => {
                    let mut records = Vec::with_capacity(members.len());
                    for member in &members {
                        if member.persisted_id().is_none() {
                            debug!(
                                relation = %relation.name,
                                "skipping related {} without identity", member.type_name
                            );
                            continue;
                        }
                        records.push(self.extract_at(member, depth + 1)?);
                    }
                    Extracted::List(records)
                }
            };
            record.push(relation.name.clone(), value);
        }

        Ok(record)
    }
}
