use crate::codec::Format;
use crate::error::{Error, Result};
use crate::graph::{Extracted, ExtractedRecord, TYPE_TAG};
use crate::store::Scalar;
use serde_json::Value;
use std::io::{Cursor, Read};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// One file inside an import source
#[derive(Debug, Clone)]
pub struct PackageEntry {
    pub name: String,
    pub bytes: Vec<u8>,
}

pub fn is_package(bytes: &[u8]) -> bool {
    bytes.starts_with(ZIP_MAGIC)
}

/// Split an import source into its files, in archive order
///
/// A plain file comes back as a single entry named `name`.
pub fn read_package(name: &str, bytes: Vec<u8>) -> Result<Vec<PackageEntry>> {
    if !is_package(&bytes) {
        return Ok(vec![PackageEntry {
            name: name.to_string(),
            bytes,
        }]);
    }

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        if file.is_dir() {
            continue;
        }
        let mut content = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut content)?;
        entries.push(PackageEntry {
            name: file.name().to_string(),
            bytes: content,
        });
    }
    Ok(entries)
}

/// Parse one artifact into root records
///
/// Rows take their type from the `ClassName` column; hand-written files
/// without one, or with an empty cell, get `root_type`. Document records
/// must carry their tag.
pub fn read_records(format: Format, bytes: &[u8], root_type: &str) -> Result<Vec<ExtractedRecord>> {
    match format {
        Format::Csv => read_rows(bytes, root_type),
        Format::Json | Format::Txt => read_documents(bytes),
    }
}

fn read_rows(bytes: &[u8], root_type: &str) -> Result<Vec<ExtractedRecord>> {
    let mut reader = csv::Reader::from_reader(bytes);
    let headers = reader.headers()?.clone();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let mut record = ExtractedRecord::new(root_type);
        for (name, cell) in headers.iter().zip(row.iter()) {
            if name == TYPE_TAG {
                if !cell.is_empty() {
                    record.type_name = Some(cell.to_string());
                }
                continue;
            }
            record.push(name, Extracted::Scalar(Scalar::from(cell)));
        }
        records.push(record);
    }
    Ok(records)
}

fn read_documents(bytes: &[u8]) -> Result<Vec<ExtractedRecord>> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    // simd-json parses in place, keep the original for the line fallback
    let mut scratch = bytes.to_vec();
    match simd_json::serde::from_slice::<Value>(&mut scratch) {
        Ok(value) => records_from_value(value),
        Err(_) => {
            let text = std::str::from_utf8(bytes)
                .map_err(|e| Error::malformed(format!("document is not UTF-8: {}", e)))?;
            let mut records = Vec::new();
            for (number, line) in text.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let value: Value = serde_json::from_str(line).map_err(|e| {
                    Error::malformed(format!("line {}: {}", number + 1, e))
                })?;
                records.extend(records_from_value(value)?);
            }
            Ok(records)
        }
    }
}

fn records_from_value(value: Value) -> Result<Vec<ExtractedRecord>> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter(|item| !item.is_null())
            .map(ExtractedRecord::from_json)
            .collect(),
        Value::Object(_) => Ok(vec![ExtractedRecord::from_json(value)?]),
        other => Err(Error::malformed(format!("expected records, got {}", other))),
    }
}
