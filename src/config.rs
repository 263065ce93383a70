//! Engine configuration
//!
//! Chunk sizing follows a simple cost model: every root record is assumed to
//! pin `record_cost_bytes` of memory per level of traversal depth, so
//! `chunk = memory_budget / record_cost / (1 + depth)`.

use crate::error::{Error, Result};
use crate::jobs::runner::chunk_size;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const MIB: u64 = 1024 * 1024;

/// Configuration shared by every job the engine runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Memory the engine may spend on one chunk
    pub memory_budget_bytes: u64,

    /// Estimated memory held per root record at depth 0
    pub record_cost_bytes: u64,

    /// Root directory for artifacts
    pub base_dir: PathBuf,

    /// Directory (relative to `base_dir`) that holds export artifacts
    pub export_dir: String,

    /// Units of work between progress writes (1 = after every unit)
    pub progress_interval: u64,

    /// Deepest traversal a job may request
    pub max_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            memory_budget_bytes: 512 * MIB,
            record_cost_bytes: 10 * MIB,
            base_dir: PathBuf::from("."),
            export_dir: String::from("data-exports"),
            progress_interval: 1,
            max_depth: 9,
        }
    }
}

impl EngineConfig {
    /// Start from defaults with a different base directory
    pub fn with_base_dir(base_dir: impl AsRef<Path>) -> Self {
        EngineConfig {
            base_dir: base_dir.as_ref().to_path_buf(),
            ..EngineConfig::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.record_cost_bytes == 0 {
            return Err(Error::Config("record_cost_bytes must be positive".into()));
        }
        if self.progress_interval == 0 {
            return Err(Error::Config("progress_interval must be positive".into()));
        }
        if self.export_dir.is_empty() {
            return Err(Error::Config("export_dir must not be empty".into()));
        }
        Ok(())
    }

    /// Number of root records processed per chunk at the given depth
    pub fn chunk_size(&self, depth: usize) -> usize {
        chunk_size(self.memory_budget_bytes, self.record_cost_bytes, depth)
    }

    /// Absolute location of the export directory
    pub fn export_path(&self) -> PathBuf {
        self.base_dir.join(&self.export_dir)
    }
}
