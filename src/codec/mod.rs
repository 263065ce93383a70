//! Artifact formats
//!
//! Row formats flatten each root record into one line under a header;
//! document formats keep the nested tree.

pub mod reader;
pub mod writer;

pub use reader::{is_package, read_package, read_records, PackageEntry};
pub use writer::{serialize, ArtifactWriter, Columns};

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Delimiter-quoted rows with a header
    Csv,
    /// One JSON array of documents
    Json,
    /// Native text serialization: one JSON document per line
    Txt,
}

impl Format {
    pub fn is_row(self) -> bool {
        matches!(self, Format::Csv)
    }

    pub fn extension(self) -> &'static str {
        match self {
            Format::Csv => "csv",
            Format::Json => "json",
            Format::Txt => "txt",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Format::Csv => "text/csv",
            Format::Json => "application/json",
            Format::Txt => "text/plain",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Format::Csv => "CSV",
            Format::Json => "JSON",
            Format::Txt => "TXT",
        })
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(Format::Csv),
            "json" => Ok(Format::Json),
            "txt" | "text" => Ok(Format::Txt),
            other => Err(Error::Config(format!("unknown format '{}'", other))),
        }
    }
}
