use crate::codec::Format;
use crate::error::{Error, Result};
use crate::graph::{Extracted, ExtractedRecord, TYPE_TAG};
use crate::schema::{SchemaDescriptor, ID_FIELD};
use std::io::Write;

/// Header of a row-format artifact
///
/// Computed once per job and reused for every chunk file, so a later record
/// with a different shape is still written under the first record's columns.
/// When the root type has subtypes, the type tag is written right after
/// the identity column so subtype rows come back as their own type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Columns {
    names: Vec<String>,
    relations: Vec<bool>,
}

impl Columns {
    /// Columns of the first record; at depth 0 relation values are never
    /// part of the header
    ///
    /// `descriptor` describes the root type. It decides the type tag column
    /// and tells relation columns apart from locals when the first record
    /// holds a null relation.
    pub fn from_record(record: &ExtractedRecord, depth: usize, descriptor: &SchemaDescriptor) -> Self {
        let mut columns = Columns::start(descriptor);
        for (name, value) in &record.fields {
            let relation = matches!(value, Extracted::Node(_) | Extracted::List(_))
                || descriptor.relation(name).is_some();
            if relation && depth == 0 {
                continue;
            }
            columns.push(name, relation);
        }
        columns
    }

    /// Columns a record of this type would produce, for empty results
    pub fn from_descriptor(descriptor: &SchemaDescriptor, depth: usize) -> Self {
        let mut columns = Columns::start(descriptor);
        for field in &descriptor.local {
            columns.push(&field.name, false);
        }
        if depth > 0 {
            for relation in descriptor.related.iter() {
                columns.push(&relation.name, true);
            }
        }
        columns
    }

    fn start(descriptor: &SchemaDescriptor) -> Self {
        let mut columns = Columns {
            names: Vec::new(),
            relations: Vec::new(),
        };
        if descriptor.polymorphic {
            columns.names.push(TYPE_TAG.to_string());
            columns.relations.push(false);
        }
        columns
    }

    fn push(&mut self, name: &str, relation: bool) {
        if name == TYPE_TAG {
            return;
        }
        if name == ID_FIELD {
            // identity first, then the type tag
            self.names.insert(0, name.to_string());
            self.relations.insert(0, false);
        } else {
            self.names.push(name.to_string());
            self.relations.push(relation);
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Flatten a record into cells in header order
    ///
    /// Locals become direct cell values and missing or null locals are
    /// empty. Relation values are re-encoded as JSON text, `null` included.
    pub fn row(&self, record: &ExtractedRecord) -> Result<Vec<String>> {
        self.names
            .iter()
            .zip(&self.relations)
            .map(|(name, relation)| {
                if name == TYPE_TAG {
                    return Ok(record.type_name.clone().unwrap_or_default());
                }
                match (record.get(name), *relation) {
                    (None, _) => Ok(String::new()),
                    (Some(Extracted::Null), false) => Ok(String::new()),
                    (Some(Extracted::Scalar(scalar)), false) => Ok(scalar.to_cell()),
                    (Some(value), _) => Ok(serde_json::to_string(&value.to_json())?),
                }
            })
            .collect()
    }
}

enum Sink<W: Write> {
    Csv(csv::Writer<W>),
    Json(W),
    Txt(W),
}

/// Writes one artifact file in the job's format
///
/// An artifact is never zero bytes: a row artifact with no records still
/// carries its header, document artifacts get an empty-sequence marker.
pub struct ArtifactWriter<W: Write> {
    sink: Sink<W>,
    columns: Option<Columns>,
    header_written: bool,
    records: usize,
}

impl<W: Write> ArtifactWriter<W> {
    pub fn new(writer: W, format: Format) -> Self {
        let sink = match format {
            Format::Csv => Sink::Csv(csv::Writer::from_writer(writer)),
            Format::Json => Sink::Json(writer),
            Format::Txt => Sink::Txt(writer),
        };
        ArtifactWriter {
            sink,
            columns: None,
            header_written: false,
            records: 0,
        }
    }

    /// Use a header computed elsewhere instead of deriving one
    pub fn with_columns(mut self, columns: Columns) -> Self {
        self.columns = Some(columns);
        self
    }

    pub fn columns(&self) -> Option<&Columns> {
        self.columns.as_ref()
    }

    pub fn records_written(&self) -> usize {
        self.records
    }

    /// Append one root record
    ///
    /// `depth` only matters for the first record of a row artifact without a
    /// preset header; such a header has no type tag and only knows relations
    /// by their values.
    pub fn append(&mut self, record: &ExtractedRecord, depth: usize) -> Result<()> {
        match &mut self.sink {
            Sink::Csv(writer) => {
                let columns = self
                    .columns
                    .get_or_insert_with(|| Columns::from_record(record, depth, &SchemaDescriptor::default()));
                if !self.header_written {
                    writer.write_record(columns.names())?;
                    self.header_written = true;
                }
                writer.write_record(columns.row(record)?)?;
            }
            Sink::Json(writer) => {
                writer.write_all(if self.records == 0 { b"[\n" } else { b",\n" })?;
                serde_json::to_writer(&mut *writer, &record.to_json())?;
            }
            Sink::Txt(writer) => {
                serde_json::to_writer(&mut *writer, &record.to_json())?;
                writer.write_all(b"\n")?;
            }
        }
        self.records += 1;
        Ok(())
    }

    /// Close the artifact and hand back the underlying writer
    pub fn finish(self) -> Result<W> {
        let empty = self.records == 0;
        let mut writer = match self.sink {
            Sink::Csv(mut writer) => {
                if !self.header_written {
                    let columns = self.columns.ok_or_else(|| {
                        Error::malformed("row artifact has neither records nor a header")
                    })?;
                    writer.write_record(columns.names())?;
                }
                writer.flush()?;
                writer
                    .into_inner()
                    .map_err(|e| Error::Io(e.into_error()))?
            }
            Sink::Json(mut writer) => {
                writer.write_all(if empty { b"[]\n" } else { b"\n]\n" })?;
                writer
            }
            Sink::Txt(mut writer) => {
                if empty {
                    writer.write_all(b"[]\n")?;
                }
                writer
            }
        };
        writer.flush()?;
        Ok(writer)
    }
}

/// Serialize a batch of root records into one artifact
///
/// `descriptor` describes the root type. It supplies the header when there
/// are no records and marks relation columns otherwise.
pub fn serialize(
    records: &[ExtractedRecord],
    format: Format,
    depth: usize,
    descriptor: &SchemaDescriptor,
) -> Result<Vec<u8>> {
    let columns = match records.first() {
        Some(first) => Columns::from_record(first, depth, descriptor),
        None => Columns::from_descriptor(descriptor, depth),
    };
    let mut writer = ArtifactWriter::new(Vec::new(), format).with_columns(columns);
    for record in records {
        writer.append(record, depth)?;
    }
    writer.finish()
}
