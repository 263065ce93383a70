//! Export, import and purge jobs
//!
//! A [`Job`] is a persisted request to process every object of one type.
//! It starts `New`, is picked up by the [`Scheduler`], runs through the
//! [`ChunkRunner`] and ends `Processed` with a success flag and an info
//! message. Engine errors never escape [`Job::process`]; the job record is
//! where they end up.

pub mod download;
pub mod export;
pub mod import;
pub mod purge;
pub mod repository;
pub mod runner;
pub mod scheduler;

pub use download::{resolve_download, AccessPolicy, Download, OwnerOnly};
pub use repository::{JobRepository, JsonJobRepository, MemoryJobRepository};
pub use runner::{ChunkRunner, ChunkedTask, ProgressSink};
pub use scheduler::{JobOutcome, Scheduler};

use crate::codec::Format;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::gauge::MemoryGauge;
use crate::schema::SchemaInspector;
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(JobId)
            .map_err(|_| Error::NotFound(format!("job {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    New,
    Processing,
    Processed,
}

/// What a job does, with the state specific to that kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobKind {
    /// Artifact files written so far, one per chunk
    Export { outputs: Vec<PathBuf> },
    /// Uploaded file or bundle to read
    Import { source: PathBuf },
    Purge,
}

impl JobKind {
    pub fn tag(&self) -> JobKindTag {
        match self {
            JobKind::Export { .. } => JobKindTag::Export,
            JobKind::Import { .. } => JobKindTag::Import,
            JobKind::Purge => JobKindTag::Purge,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKindTag {
    Export,
    Import,
    Purge,
}

impl JobKindTag {
    pub const ALL: [JobKindTag; 3] = [JobKindTag::Export, JobKindTag::Import, JobKindTag::Purge];
}

impl fmt::Display for JobKindTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobKindTag::Export => "Export",
            JobKindTag::Import => "Import",
            JobKindTag::Purge => "Purge",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: u64,
    pub completed: u64,
    /// Peak resident memory observed while running, in bytes
    pub peak_memory: u64,
}

/// Finalized job configuration, checked by [`Job::create`]
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub kind: JobKindTag,
    pub target_type: String,
    pub format: Format,
    pub depth: usize,
    pub filter: Option<String>,
    pub source: Option<PathBuf>,
    pub owner: Option<String>,
}

impl JobRequest {
    pub fn new(kind: JobKindTag, target_type: impl Into<String>, format: Format) -> Self {
        JobRequest {
            kind,
            target_type: target_type.into(),
            format,
            depth: 0,
            filter: None,
            source: None,
            owner: None,
        }
    }

    pub fn depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(flatten)]
    pub kind: JobKind,
    pub target_type: String,
    pub filter: Option<String>,
    pub depth: usize,
    pub format: Format,
    pub status: Status,
    pub success: bool,
    pub info: Option<String>,
    pub progress: Progress,
    /// Principal that created the job
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Everything a job needs from its environment while it runs
pub struct JobContext<'a, S: Store + ?Sized> {
    pub inspector: &'a SchemaInspector,
    pub store: &'a mut S,
    pub config: &'a EngineConfig,
    pub gauge: &'a dyn MemoryGauge,
}

impl Job {
    /// Build a `New` job, rejecting configuration that could never run
    pub fn create(request: JobRequest, inspector: &SchemaInspector, config: &EngineConfig) -> Result<Job> {
        let kind = match request.kind {
            JobKindTag::Export => JobKind::Export { outputs: Vec::new() },
            JobKindTag::Import => JobKind::Import {
                source: request
                    .source
                    .ok_or_else(|| Error::Config("import job needs a source file".into()))?,
            },
            JobKindTag::Purge => JobKind::Purge,
        };

        let job = Job {
            id: JobId::new(),
            kind,
            target_type: request.target_type,
            filter: request.filter.filter(|f| !f.trim().is_empty()),
            depth: request.depth,
            format: request.format,
            status: Status::New,
            success: false,
            info: None,
            progress: Progress::default(),
            owner: request.owner,
            created_at: Utc::now(),
        };
        job.validate(inspector, config)?;
        Ok(job)
    }

    pub fn kind_tag(&self) -> JobKindTag {
        self.kind.tag()
    }

    pub fn validate(&self, inspector: &SchemaInspector, config: &EngineConfig) -> Result<()> {
        if self.target_type.is_empty() {
            return Err(Error::Config("job has no target type".into()));
        }
        if !inspector.is_known(&self.target_type) {
            return Err(Error::UnknownType(self.target_type.clone()));
        }
        if self.depth > config.max_depth {
            return Err(Error::Config(format!(
                "depth {} exceeds the maximum of {}",
                self.depth, config.max_depth
            )));
        }
        if let JobKind::Import { source } = &self.kind {
            if source.as_os_str().is_empty() {
                return Err(Error::Config("import job needs a source file".into()));
            }
        }
        Ok(())
    }

    /// Human readable state for listings
    pub fn status_message(&self) -> String {
        let kind = self.kind_tag();
        match self.status {
            Status::New => "Scheduled - should begin processing soon".to_string(),
            Status::Processing => format!("{} in progress", kind),
            Status::Processed if self.success => format!("{} Complete", kind),
            Status::Processed => format!("{} Failed", kind),
        }
    }

    /// Run the job if it is still `New`
    ///
    /// Engine failures are recorded on the job; the returned error only
    /// reports that the job record itself could not be persisted.
    pub fn process<S: Store + ?Sized>(
        &mut self,
        context: &mut JobContext<'_, S>,
        repository: &mut dyn JobRepository,
    ) -> Result<()> {
        if self.status != Status::New {
            debug!(job = %self.id, status = ?self.status, "job already picked up");
            return Ok(());
        }

        self.status = Status::Processing;
        repository.save(self)?;
        info!(job = %self.id, kind = %self.kind_tag(), target = %self.target_type, "job started");

        let mut progress = self.progress.clone();
        let outcome = {
            let mut sink = RepositoryProgress {
                repository: &mut *repository,
                job: self.id,
            };
            self.execute(context, &mut progress, &mut sink)
        };
        self.progress = progress;
        self.status = Status::Processed;

        match outcome {
            Ok(summary) => {
                self.success = true;
                self.info = Some(summary);
                info!(job = %self.id, completed = self.progress.completed, "job complete");
            }
            Err(e) => {
                self.success = false;
                self.info = Some(e.to_string());
                warn!(job = %self.id, error = %e, "job failed");
            }
        }
        repository.save(self)
    }

    fn execute<S: Store + ?Sized>(
        &mut self,
        context: &mut JobContext<'_, S>,
        progress: &mut Progress,
        sink: &mut dyn ProgressSink,
    ) -> Result<String> {
        self.validate(context.inspector, context.config)?;
        let runner = ChunkRunner::new(
            context.config.chunk_size(self.depth),
            context.config.progress_interval,
            context.gauge,
        );

        match &mut self.kind {
            JobKind::Export { outputs } => {
                let mut task = export::ExportTask::new(
                    self.id,
                    context.inspector,
                    &mut *context.store,
                    context.config,
                    &self.target_type,
                    self.filter.as_deref(),
                    self.format,
                    self.depth,
                );
                let result = runner.run(&mut task, progress, sink);
                *outputs = task.into_outputs();
                result?;
                Ok(format!(
                    "exported {} record(s) to {} file(s)",
                    progress.completed,
                    outputs.len()
                ))
            }
            JobKind::Import { source } => {
                let mut task = import::ImportTask::open(
                    context.inspector,
                    &mut *context.store,
                    source,
                    &self.target_type,
                    self.format,
                    self.depth,
                )?;
                runner.run(&mut task, progress, sink)?;
                Ok(format!("imported {} record(s)", progress.completed))
            }
            JobKind::Purge => {
                let mut task = purge::PurgeTask::new(
                    context.inspector,
                    &mut *context.store,
                    &self.target_type,
                    self.filter.as_deref(),
                )?;
                runner.run(&mut task, progress, sink)?;
                Ok(format!("deleted {} record(s)", task.deleted()))
            }
        }
    }
}

/// Persists progress snapshots on the job record
struct RepositoryProgress<'r> {
    repository: &'r mut dyn JobRepository,
    job: JobId,
}

impl ProgressSink for RepositoryProgress<'_> {
    fn report(&mut self, progress: &Progress) -> Result<()> {
        self.repository.update_progress(self.job, progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gauge::FixedGauge;
    use crate::schema::{FieldType, RelationDef, TypeDef, TypeRegistry};
    use crate::store::{DataObject, MemoryStore, ObjectId, Query, Related, Stage};
    use std::sync::Arc;

    fn registry() -> Arc<TypeRegistry> {
        Arc::new(
            TypeRegistry::new()
                .with(
                    TypeDef::new("Article")
                        .field("title", FieldType::Text)
                        .field("body", FieldType::Text)
                        .has_many("comments", "Comment", "Article")
                        .staged(),
                )
                .with(
                    TypeDef::new("Comment")
                        .field("text", FieldType::Text)
                        .has_one("Article", "Article"),
                ),
        )
    }

    fn context<'a>(
        inspector: &'a SchemaInspector,
        store: &'a mut MemoryStore,
        config: &'a EngineConfig,
    ) -> JobContext<'a, MemoryStore> {
        JobContext {
            inspector,
            store,
            config,
            gauge: &FixedGauge(4096),
        }
    }

    /// Memory store whose listings fail past a given offset
    struct BrokenAfter {
        inner: MemoryStore,
        offset: usize,
    }

    impl Store for BrokenAfter {
        fn count(&self, query: &Query) -> Result<usize> {
            self.inner.count(query)
        }

        fn fetch(&self, query: &Query, offset: usize, limit: usize) -> Result<Vec<DataObject>> {
            if offset >= self.offset {
                return Err(Error::storage("connection lost"));
            }
            self.inner.fetch(query, offset, limit)
        }

        fn find(&self, type_name: &str, id: ObjectId) -> Result<Option<DataObject>> {
            self.inner.find(type_name, id)
        }

        fn related(&self, object: &DataObject, relation: &RelationDef) -> Result<Related> {
            self.inner.related(object, relation)
        }

        fn write(&mut self, object: &mut DataObject) -> Result<ObjectId> {
            self.inner.write(object)
        }

        fn publish(&mut self, object: &DataObject) -> Result<()> {
            self.inner.publish(object)
        }

        fn attach(&mut self, owner: &DataObject, relation: &RelationDef, member: &mut DataObject) -> Result<()> {
            self.inner.attach(owner, relation, member)
        }

        fn delete(&mut self, object: &DataObject, stage: Stage) -> Result<()> {
            self.inner.delete(object, stage)
        }

        fn flush_cache(&mut self) {
            self.inner.flush_cache()
        }
    }

    #[test]
    fn test_create_rejects_bad_configuration() {
        let inspector = SchemaInspector::new(registry());
        let config = EngineConfig::default();

        let unknown = JobRequest::new(JobKindTag::Export, "Nope", Format::Csv);
        assert!(matches!(
            Job::create(unknown, &inspector, &config),
            Err(Error::UnknownType(_))
        ));

        let too_deep = JobRequest::new(JobKindTag::Export, "Article", Format::Csv).depth(10);
        assert!(matches!(Job::create(too_deep, &inspector, &config), Err(Error::Config(_))));

        let no_source = JobRequest::new(JobKindTag::Import, "Article", Format::Csv);
        assert!(matches!(Job::create(no_source, &inspector, &config), Err(Error::Config(_))));
    }

    #[test]
    fn test_process_skips_jobs_that_are_not_new() {
        let registry = registry();
        let inspector = SchemaInspector::new(registry.clone());
        let mut store = MemoryStore::new(registry);
        store.write(&mut DataObject::new("Article").with_field("title", "kept")).unwrap();
        let config = EngineConfig::default();
        let mut repository = MemoryJobRepository::new();

        let mut job = Job::create(
            JobRequest::new(JobKindTag::Purge, "Article", Format::Csv),
            &inspector,
            &config,
        )
        .unwrap();
        job.status = Status::Processing;
        repository.insert(job.clone()).unwrap();

        job.process(&mut context(&inspector, &mut store, &config), &mut repository)
            .unwrap();

        assert_eq!(job.status, Status::Processing);
        assert_eq!(store.count(&Query::new("Article")).unwrap(), 1);
        assert_eq!(repository.get(job.id).unwrap(), Some(job));
    }

    #[test]
    fn test_unknown_type_at_process_time_fails_job() {
        let registry = registry();
        let inspector = SchemaInspector::new(registry.clone());
        let mut store = MemoryStore::new(registry);
        let config = EngineConfig::default();
        let mut repository = MemoryJobRepository::new();

        let mut job = Job::create(
            JobRequest::new(JobKindTag::Purge, "Article", Format::Csv),
            &inspector,
            &config,
        )
        .unwrap();
        job.target_type = "Removed".into();
        repository.insert(job.clone()).unwrap();

        job.process(&mut context(&inspector, &mut store, &config), &mut repository)
            .unwrap();

        assert_eq!(job.status, Status::Processed);
        assert!(!job.success);
        assert_eq!(job.info.as_deref(), Some("unknown type 'Removed'"));
        assert_eq!(job.status_message(), "Purge Failed");
        let stored = repository.get(job.id).unwrap().unwrap();
        assert_eq!(stored.status, Status::Processed);
    }

    #[test]
    fn test_purge_of_staged_type_clears_both_stages() {
        let registry = registry();
        let inspector = SchemaInspector::new(registry.clone());
        let mut store = MemoryStore::new(registry);
        for title in ["draft-one", "draft-two", "final"] {
            let mut article = DataObject::new("Article").with_field("title", title);
            store.write(&mut article).unwrap();
            store.publish(&article).unwrap();
        }
        let config = EngineConfig::default();
        let mut repository = MemoryJobRepository::new();

        let mut job = Job::create(
            JobRequest::new(JobKindTag::Purge, "Article", Format::Csv).filter("title LIKE 'draft-%'"),
            &inspector,
            &config,
        )
        .unwrap();
        repository.insert(job.clone()).unwrap();
        job.process(&mut context(&inspector, &mut store, &config), &mut repository)
            .unwrap();

        assert!(job.success, "{:?}", job.info);
        assert_eq!(job.progress.total, 4);
        assert_eq!(job.progress.completed, 4);
        assert_eq!(job.progress.peak_memory, 4096);
        for stage in Stage::ALL {
            let left = store.fetch(&Query::new("Article").stage(stage), 0, 10).unwrap();
            assert_eq!(left.len(), 1);
            assert_eq!(left[0].get("title"), Some(&"final".into()));
        }
        assert_eq!(job.status_message(), "Purge Complete");
    }

    #[test]
    fn test_status_messages() {
        let inspector = SchemaInspector::new(registry());
        let config = EngineConfig::default();
        let mut job = Job::create(
            JobRequest::new(JobKindTag::Export, "Article", Format::Json),
            &inspector,
            &config,
        )
        .unwrap();

        assert_eq!(job.status_message(), "Scheduled - should begin processing soon");
        job.status = Status::Processing;
        assert_eq!(job.status_message(), "Export in progress");
        job.status = Status::Processed;
        job.success = true;
        assert_eq!(job.status_message(), "Export Complete");
    }

    #[test]
    fn test_job_record_round_trips_through_json() {
        let inspector = SchemaInspector::new(registry());
        let config = EngineConfig::default();
        let job = Job::create(
            JobRequest::new(JobKindTag::Import, "Article", Format::Txt)
                .source("/tmp/upload.txt")
                .owner("admin"),
            &inspector,
            &config,
        )
        .unwrap();

        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["kind"], "import");
        assert_eq!(json["source"], "/tmp/upload.txt");
        assert_eq!(json["status"], "new");
        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn test_failed_export_keeps_written_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let inspector = SchemaInspector::new(registry.clone());
        let mut inner = MemoryStore::new(registry);
        for title in ["one", "two", "three"] {
            inner.write(&mut DataObject::new("Article").with_field("title", title)).unwrap();
        }
        let mut store = BrokenAfter { inner, offset: 1 };
        let mut config = EngineConfig::with_base_dir(dir.path());
        config.memory_budget_bytes = config.record_cost_bytes;
        assert_eq!(config.chunk_size(0), 1);
        let mut repository = MemoryJobRepository::new();

        let mut job = Job::create(
            JobRequest::new(JobKindTag::Export, "Article", Format::Csv),
            &inspector,
            &config,
        )
        .unwrap();
        repository.insert(job.clone()).unwrap();
        let mut context = JobContext {
            inspector: &inspector,
            store: &mut store,
            config: &config,
            gauge: &FixedGauge(0),
        };
        job.process(&mut context, &mut repository).unwrap();

        assert_eq!(job.status, Status::Processed);
        assert!(!job.success);
        assert_eq!(job.info.as_deref(), Some("storage error: connection lost"));
        assert_eq!(job.status_message(), "Export Failed");
        assert_eq!(job.progress.completed, 1);

        let JobKind::Export { outputs } = &job.kind else {
            panic!("expected an export job");
        };
        assert_eq!(outputs.len(), 1);
        let content = std::fs::read_to_string(&outputs[0]).unwrap();
        assert_eq!(content, "ID,Version,title,body\n1,1,one,\n");
        assert_eq!(repository.get(job.id).unwrap(), Some(job));
    }
}
