//! Error types for crucible
//!
//! Every engine failure funnels into [`Error`]. Jobs catch it at the
//! `process()` boundary and record its message in the job's info field;
//! nothing past that point sees it.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A job or record names a type the schema does not know
    #[error("unknown type '{0}'")]
    UnknownType(String),

    /// Invalid job or engine configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// An imported record has no type tag and no default type applies
    #[error("record has no type tag")]
    MissingTypeTag,

    /// Input that cannot be mapped onto the schema
    #[error("malformed input: {0}")]
    Malformed(String),

    /// Filter expression the query layer cannot evaluate
    #[error("invalid filter '{expression}': {reason}")]
    Filter { expression: String, reason: String },

    /// Backing store refused an operation
    #[error("storage error: {0}")]
    Storage(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The job exists but has no artifact to serve yet
    #[error("job {0} has not produced an artifact")]
    NotReady(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl Error {
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::Malformed(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Error::Storage(message.into())
    }
}
