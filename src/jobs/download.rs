//! Serving export artifacts
//!
//! A download is resolved to a single file on disk. Exports that produced
//! several chunk files are bundled into one zip archive on first request;
//! the archive is kept next to the chunks and reused afterwards.

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::jobs::export::{create_private_dir, create_private_file};
use crate::jobs::{Job, JobId, JobKind, JobRepository, Status};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Host-supplied check on who may fetch a job's artifact
pub trait AccessPolicy {
    fn can_download(&self, principal: Option<&str>, job: &Job) -> bool;
}

impl<F> AccessPolicy for F
where
    F: Fn(Option<&str>, &Job) -> bool,
{
    fn can_download(&self, principal: Option<&str>, job: &Job) -> bool {
        self(principal, job)
    }
}

/// Only the principal that created a job may download it; jobs without an
/// owner are open to any authenticated principal
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerOnly;

impl AccessPolicy for OwnerOnly {
    fn can_download(&self, principal: Option<&str>, job: &Job) -> bool {
        match (principal, job.owner.as_deref()) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(principal), Some(owner)) => principal == owner,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub path: PathBuf,
    pub file_name: String,
    pub content_type: &'static str,
}

/// Find the artifact to serve for an export job
pub fn resolve_download(
    repository: &dyn JobRepository,
    config: &EngineConfig,
    id: JobId,
    principal: Option<&str>,
    policy: &dyn AccessPolicy,
) -> Result<Download> {
    let job = repository
        .get(id)?
        .ok_or_else(|| Error::NotFound(format!("job {}", id)))?;
    if !policy.can_download(principal, &job) {
        return Err(Error::PermissionDenied(format!(
            "{} may not download job {}",
            principal.unwrap_or("anonymous"),
            id
        )));
    }

    let JobKind::Export { outputs } = &job.kind else {
        return Err(Error::NotFound(format!("export job {}", id)));
    };
    if job.status != Status::Processed || !job.success || outputs.is_empty() {
        return Err(Error::NotReady(id.to_string()));
    }
    if let Some(missing) = outputs.iter().find(|path| !path.is_file()) {
        return Err(Error::NotFound(missing.display().to_string()));
    }

    if let [single] = outputs.as_slice() {
        return Ok(Download {
            path: single.clone(),
            file_name: file_name(single),
            content_type: job.format.content_type(),
        });
    }

    let archive = config.export_path().join(format!("{}.zip", id));
    if !archive.is_file() {
        create_private_dir(&config.export_path())?;
        bundle(outputs, &archive)?;
        info!(job = %id, files = outputs.len(), path = %archive.display(), "bundled export chunks");
    }
    Ok(Download {
        file_name: file_name(&archive),
        path: archive,
        content_type: "application/zip",
    })
}

/// Write `files` into a zip at `target`, publishing it only once complete
fn bundle(files: &[PathBuf], target: &Path) -> Result<()> {
    let staging = target.with_extension("zip.partial");
    let result = write_bundle(files, &staging).and_then(|_| Ok(fs::rename(&staging, target)?));
    if result.is_err() {
        let _ = fs::remove_file(&staging);
    }
    result
}

fn write_bundle(files: &[PathBuf], path: &Path) -> Result<()> {
    let mut zip = ZipWriter::new(create_private_file(path)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for file in files {
        zip.start_file(file_name(file), options)?;
        io::copy(&mut File::open(file)?, &mut zip)?;
    }
    zip.finish()?;
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
