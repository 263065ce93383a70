use crate::error::Result;
use crate::jobs::runner::ChunkedTask;
use crate::schema::SchemaInspector;
use crate::store::{DataObject, Query, Stage, Store};
use tracing::{debug, info};

/// Deletes every matching object of a type, stage by stage
///
/// Deleted objects drop out of the listing, so every chunk is read from the
/// start of the remaining set. Only rows that had to be skipped push the
/// read offset forward.
pub struct PurgeTask<'a, S: Store + ?Sized> {
    store: &'a mut S,
    stages: Vec<Stage>,
    stage: usize,
    query: Query,
    filter: Option<String>,
    offset: usize,
    deleted: u64,
    total: u64,
}

impl<'a, S: Store + ?Sized> PurgeTask<'a, S> {
    pub fn new(
        inspector: &SchemaInspector,
        store: &'a mut S,
        target_type: &str,
        filter: Option<&str>,
    ) -> Result<Self> {
        let stages = if inspector.all_fields(target_type).staged {
            Stage::ALL.to_vec()
        } else {
            vec![Stage::Draft]
        };

        let mut total = 0;
        for stage in &stages {
            total += store.count(&Query::new(target_type).filter(filter).stage(*stage))? as u64;
        }

        Ok(PurgeTask {
            query: Query::new(target_type).filter(filter).stage(stages[0]),
            store,
            stages,
            stage: 0,
            filter: filter.map(str::to_string),
            offset: 0,
            deleted: 0,
            total,
        })
    }

    pub fn deleted(&self) -> u64 {
        self.deleted
    }

    fn current_stage(&self) -> Stage {
        self.stages[self.stage]
    }
}

impl<'a, S: Store + ?Sized> ChunkedTask for PurgeTask<'a, S> {
    type Item = DataObject;

    fn total(&self) -> Result<u64> {
        Ok(self.total)
    }

    fn next_chunk(&mut self, _index: usize, size: usize) -> Result<Vec<DataObject>> {
        loop {
            let chunk = self.store.fetch(&self.query, self.offset, size)?;
            if !chunk.is_empty() || self.stage + 1 >= self.stages.len() {
                return Ok(chunk);
            }
            self.stage += 1;
            self.offset = 0;
            self.query = Query::new(self.query.type_name.clone())
                .filter(self.filter.as_deref())
                .stage(self.current_stage());
            debug!(stage = %self.current_stage(), "purging next stage");
        }
    }

    fn process(&mut self, object: DataObject) -> Result<()> {
        if object.persisted_id().is_none() {
            debug!(type_name = %object.type_name, "skipping row without identity");
            self.offset += 1;
            return Ok(());
        }
        self.store.delete(&object, self.current_stage())?;
        self.deleted += 1;
        Ok(())
    }

    fn finish_chunk(&mut self, index: usize) -> Result<()> {
        info!(chunk = index, stage = %self.current_stage(), deleted = self.deleted, "purge chunk done");
        Ok(())
    }

    fn release(&mut self) {
        self.store.flush_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gauge::FixedGauge;
    use crate::jobs::runner::{ChunkRunner, NoProgress};
    use crate::jobs::Progress;
    use crate::schema::{FieldType, TypeDef, TypeRegistry};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn setup() -> (SchemaInspector, MemoryStore) {
        let registry = Arc::new(
            TypeRegistry::new()
                .with(TypeDef::new("Note").field("title", FieldType::Text))
                .with(TypeDef::new("Page").field("title", FieldType::Text).staged()),
        );
        (SchemaInspector::new(registry.clone()), MemoryStore::new(registry))
    }

    fn run(task: &mut PurgeTask<'_, MemoryStore>, chunk_size: usize) -> Progress {
        let mut progress = Progress::default();
        ChunkRunner::new(chunk_size, 1, &FixedGauge(0))
            .run(task, &mut progress, &mut NoProgress)
            .unwrap();
        progress
    }

    #[test]
    fn test_single_stage_purge_with_small_chunks() {
        let (inspector, mut store) = setup();
        for i in 0..5 {
            store.write(&mut DataObject::new("Note").with_field("title", format!("n{}", i))).unwrap();
        }

        let mut task = PurgeTask::new(&inspector, &mut store, "Note", None).unwrap();
        let progress = run(&mut task, 2);
        assert_eq!(task.deleted(), 5);
        assert_eq!(progress.total, 5);
        assert_eq!(store.count(&Query::new("Note")).unwrap(), 0);
    }

    #[test]
    fn test_rows_without_identity_are_skipped() {
        let (inspector, mut store) = setup();
        store.insert_detached(Stage::Draft, DataObject::new("Note").with_field("title", "ghost"));
        for title in ["a", "b", "c"] {
            store.write(&mut DataObject::new("Note").with_field("title", title)).unwrap();
        }

        let mut task = PurgeTask::new(&inspector, &mut store, "Note", None).unwrap();
        let progress = run(&mut task, 2);
        assert_eq!(task.deleted(), 3);
        assert_eq!(progress.completed, 4);
        // only the detached row is left
        assert_eq!(store.count(&Query::new("Note")).unwrap(), 1);
    }

    #[test]
    fn test_staged_purge_totals_both_stages() {
        let (inspector, mut store) = setup();
        for title in ["keep", "draft-x"] {
            let mut page = DataObject::new("Page").with_field("title", title);
            store.write(&mut page).unwrap();
            store.publish(&page).unwrap();
        }
        store.write(&mut DataObject::new("Page").with_field("title", "draft-unpublished")).unwrap();

        let mut task =
            PurgeTask::new(&inspector, &mut store, "Page", Some("title LIKE 'draft-%'")).unwrap();
        assert_eq!(task.total().unwrap(), 3);
        run(&mut task, 10);
        assert_eq!(task.deleted(), 3);

        assert_eq!(store.count(&Query::new("Page")).unwrap(), 1);
        assert_eq!(store.count(&Query::new("Page").stage(Stage::Live)).unwrap(), 1);
    }
}
