use crate::codec::{ArtifactWriter, Columns, Format};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::graph::GraphExtractor;
use crate::jobs::runner::ChunkedTask;
use crate::jobs::JobId;
use crate::schema::SchemaInspector;
use crate::store::{DataObject, Query, Store};
use std::fs::{self, File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Writes every matching object of a type to one artifact per chunk
///
/// Files are named `{job}-{chunk}.{ext}` inside the export directory. The
/// row header is taken from the first record of the job and reused by every
/// later chunk.
pub struct ExportTask<'a, S: Store + ?Sized> {
    job: JobId,
    inspector: &'a SchemaInspector,
    store: &'a mut S,
    directory: PathBuf,
    query: Query,
    format: Format,
    depth: usize,
    chunk: usize,
    columns: Option<Columns>,
    writer: Option<ArtifactWriter<BufWriter<File>>>,
    outputs: Vec<PathBuf>,
}

impl<'a, S: Store + ?Sized> ExportTask<'a, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job: JobId,
        inspector: &'a SchemaInspector,
        store: &'a mut S,
        config: &EngineConfig,
        target_type: &str,
        filter: Option<&str>,
        format: Format,
        depth: usize,
    ) -> Self {
        ExportTask {
            job,
            inspector,
            store,
            directory: config.export_path(),
            query: Query::new(target_type).filter(filter),
            format,
            depth,
            chunk: 0,
            columns: None,
            writer: None,
            outputs: Vec::new(),
        }
    }

    /// Artifact paths opened so far, including a chunk that failed midway
    pub fn into_outputs(self) -> Vec<PathBuf> {
        self.outputs
    }

    fn open(&mut self, columns: Option<Columns>) -> Result<ArtifactWriter<BufWriter<File>>> {
        create_private_dir(&self.directory)?;
        let path = self.directory.join(format!(
            "{}-{}.{}",
            self.job,
            self.chunk,
            self.format.extension()
        ));
        let file = create_private_file(&path)?;
        debug!(path = %path.display(), "opened export artifact");
        self.outputs.push(path);

        let writer = ArtifactWriter::new(BufWriter::new(file), self.format);
        Ok(match columns {
            Some(columns) => writer.with_columns(columns),
            None => writer,
        })
    }
}

impl<'a, S: Store + ?Sized> ChunkedTask for ExportTask<'a, S> {
    type Item = DataObject;

    fn total(&self) -> Result<u64> {
        Ok(self.store.count(&self.query)? as u64)
    }

    fn next_chunk(&mut self, index: usize, size: usize) -> Result<Vec<DataObject>> {
        self.chunk = index;
        self.store.fetch(&self.query, index * size, size)
    }

    fn process(&mut self, object: DataObject) -> Result<()> {
        let record = GraphExtractor::new(self.inspector, &*self.store, self.depth).extract(&object)?;

        if self.format.is_row() && self.columns.is_none() {
            let descriptor = self.inspector.all_fields(&self.query.type_name);
            self.columns = Some(Columns::from_record(&record, self.depth, &descriptor));
        }
        let mut writer = match self.writer.take() {
            Some(writer) => writer,
            None => self.open(self.columns.clone())?,
        };
        let written = writer.append(&record, self.depth);
        self.writer = Some(writer);
        written
    }

    fn finish_chunk(&mut self, index: usize) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            let records = writer.records_written();
            writer.finish()?;
            info!(job = %self.job, chunk = index, records, "export chunk written");
        }
        Ok(())
    }

    fn release(&mut self) {
        self.store.flush_cache();
    }

    fn finish(&mut self, chunks: usize) -> Result<()> {
        if chunks > 0 {
            return Ok(());
        }
        // nothing matched: still leave one artifact behind
        self.chunk = 0;
        let descriptor = self.inspector.all_fields(&self.query.type_name);
        let columns = Columns::from_descriptor(&descriptor, self.depth);
        self.open(Some(columns))?.finish()?;
        info!(job = %self.job, "export matched no records");
        Ok(())
    }
}

/// Create the export directory, readable by the owner only
pub fn create_private_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Create (or truncate) an artifact file, readable by the owner only
pub fn create_private_file(path: &Path) -> Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    Ok(options.open(path)?)
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
                .with(
                    TypeDef::new("Article")
                        .field("title", FieldType::Text)
                        .field("body", FieldType::Text)
                        .has_many("comments", "Comment", "Article"),
                )
                .with(
                    TypeDef::new("Comment")
                        .field("text", FieldType::Text)
                        .has_one("Article", "Article"),
                ),
        );
        (SchemaInspector::new(registry.clone()), MemoryStore::new(registry))
    }

    fn seed_articles(inspector: &SchemaInspector, store: &mut MemoryStore) {
        let comments = inspector.all_fields("Article").relation("comments").cloned().unwrap();
        let mut first = DataObject::new("Article").with_field("title", "one").with_field("body", "b1");
        store.write(&mut first).unwrap();
        for text in ["nice", "meh"] {
            let mut comment = DataObject::new("Comment").with_field("text", text);
            store.attach(&first, &comments, &mut comment).unwrap();
        }
        let mut second = DataObject::new("Article").with_field("title", "two").with_field("body", "b2");
        store.write(&mut second).unwrap();
    }

    fn run_export(
        inspector: &SchemaInspector,
        store: &mut MemoryStore,
        config: &EngineConfig,
        format: Format,
        depth: usize,
        chunk_size: usize,
    ) -> Vec<PathBuf> {
        let mut task = ExportTask::new(JobId::new(), inspector, store, config, "Article", None, format, depth);
        ChunkRunner::new(chunk_size, 1, &FixedGauge(0))
            .run(&mut task, &mut Progress::default(), &mut NoProgress)
            .unwrap();
        task.into_outputs()
    }

    #[test]
    fn test_csv_export_flattens_comments() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::with_base_dir(dir.path());
        let (inspector, mut store) = setup();
        seed_articles(&inspector, &mut store);

        let outputs = run_export(&inspector, &mut store, &config, Format::Csv, 1, 10);
        assert_eq!(outputs.len(), 1);

        let mut reader = csv::Reader::from_path(&outputs[0]).unwrap();
        let header: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(header, vec!["ID", "title", "body", "comments"]);

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        let comments: serde_json::Value = serde_json::from_str(&rows[0][3]).unwrap();
        assert_eq!(comments.as_array().map(Vec::len), Some(2));
        assert_eq!(comments[0]["text"], "nice");
        assert_eq!(&rows[1][3], "[]");
    }

    #[test]
    fn test_every_chunk_file_reuses_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::with_base_dir(dir.path());
        let (inspector, mut store) = setup();
        seed_articles(&inspector, &mut store);

        let outputs = run_export(&inspector, &mut store, &config, Format::Csv, 0, 1);
        assert_eq!(outputs.len(), 2);
        for (index, path) in outputs.iter().enumerate() {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.ends_with(&format!("-{}.csv", index)), "{}", name);
            let content = fs::read_to_string(path).unwrap();
            assert_eq!(content.lines().next(), Some("ID,title,body"));
            assert_eq!(content.lines().count(), 2);
        }
    }

    #[test]
    fn test_empty_result_still_writes_an_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::with_base_dir(dir.path());
        let (inspector, mut store) = setup();

        let csv = run_export(&inspector, &mut store, &config, Format::Csv, 1, 10);
        assert_eq!(fs::read_to_string(&csv[0]).unwrap(), "ID,title,body,comments\n");

        let json = run_export(&inspector, &mut store, &config, Format::Json, 1, 10);
        assert_eq!(fs::read_to_string(&json[0]).unwrap(), "[]\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_artifacts_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::with_base_dir(dir.path());
        let (inspector, mut store) = setup();
        seed_articles(&inspector, &mut store);

        let outputs = run_export(&inspector, &mut store, &config, Format::Txt, 0, 10);
        let file_mode = fs::metadata(&outputs[0]).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);
        let dir_mode = fs::metadata(config.export_path()).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }
}
