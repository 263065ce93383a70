use crate::codec::{is_package, read_package, read_records, Format, PackageEntry};
use crate::error::Result;
use crate::graph::{ExtractedRecord, GraphImporter};
use crate::jobs::runner::ChunkedTask;
use crate::schema::SchemaInspector;
use crate::store::Store;
use std::collections::VecDeque;
use std::path::Path;
use tracing::{debug, info};

enum Pending {
    /// A single file, split into chunks by size
    Records(VecDeque<ExtractedRecord>),
    /// A bundle: every file is one chunk, parsed when it is reached
    Entries(VecDeque<PackageEntry>),
}

/// Imports the records of an uploaded file or bundle
pub struct ImportTask<'a, S: Store + ?Sized> {
    inspector: &'a SchemaInspector,
    store: &'a mut S,
    format: Format,
    depth: usize,
    root_type: String,
    pending: Pending,
    total: u64,
}

impl<'a, S: Store + ?Sized> ImportTask<'a, S> {
    /// Read the source file; a zip bundle is split into its entries
    pub fn open(
        inspector: &'a SchemaInspector,
        store: &'a mut S,
        source: &Path,
        root_type: &str,
        format: Format,
        depth: usize,
    ) -> Result<Self> {
        let bytes = std::fs::read(source)?;
        if is_package(&bytes) {
            let name = source.display().to_string();
            let entries = read_package(&name, bytes)?;
            Ok(Self::from_entries(inspector, store, entries, root_type, format, depth))
        } else {
            Self::from_bytes(inspector, store, &bytes, root_type, format, depth)
        }
    }

    /// A single artifact, parsed up front
    pub fn from_bytes(
        inspector: &'a SchemaInspector,
        store: &'a mut S,
        bytes: &[u8],
        root_type: &str,
        format: Format,
        depth: usize,
    ) -> Result<Self> {
        let records = read_records(format, bytes, root_type)?;
        let total = records.len() as u64;
        Ok(Self::with_pending(
            inspector,
            store,
            Pending::Records(records.into()),
            total,
            root_type,
            format,
            depth,
        ))
    }

    /// Bundle entries, parsed one chunk at a time
    pub fn from_entries(
        inspector: &'a SchemaInspector,
        store: &'a mut S,
        entries: Vec<PackageEntry>,
        root_type: &str,
        format: Format,
        depth: usize,
    ) -> Self {
        Self::with_pending(
            inspector,
            store,
            Pending::Entries(entries.into()),
            0,
            root_type,
            format,
            depth,
        )
    }

    fn with_pending(
        inspector: &'a SchemaInspector,
        store: &'a mut S,
        pending: Pending,
        total: u64,
        root_type: &str,
        format: Format,
        depth: usize,
    ) -> Self {
        ImportTask {
            inspector,
            store,
            format,
            depth,
            root_type: root_type.to_string(),
            pending,
            total,
        }
    }
}

impl<'a, S: Store + ?Sized> ChunkedTask for ImportTask<'a, S> {
    type Item = ExtractedRecord;

    fn total(&self) -> Result<u64> {
        Ok(self.total)
    }

    fn next_chunk(&mut self, index: usize, size: usize) -> Result<Vec<ExtractedRecord>> {
        match &mut self.pending {
            Pending::Records(records) => {
                let take = size.min(records.len());
                Ok(records.drain(..take).collect())
            }
            Pending::Entries(entries) => {
                while let Some(entry) = entries.pop_front() {
                    let records = read_records(self.format, &entry.bytes, &self.root_type)?;
                    if records.is_empty() {
                        debug!(entry = %entry.name, "bundle entry has no records");
                        continue;
                    }
                    self.total += records.len() as u64;
                    info!(chunk = index, entry = %entry.name, records = records.len(), "importing bundle entry");
                    return Ok(records);
                }
                Ok(Vec::new())
            }
        }
    }

    fn process(&mut self, record: ExtractedRecord) -> Result<()> {
        GraphImporter::new(self.inspector, &mut *self.store, self.format, self.depth)
            .import_record(&record)?;
        Ok(())
    }

    fn release(&mut self) {
        self.store.flush_cache();
    }
}
