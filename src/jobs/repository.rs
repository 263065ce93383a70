//! Job persistence

use crate::error::{Error, Result};
use crate::jobs::{Job, JobId, JobKindTag, Progress, Status};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Where job records live between runs
pub trait JobRepository {
    fn insert(&mut self, job: Job) -> Result<()>;

    fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Replace the stored record with `job`
    fn save(&mut self, job: &Job) -> Result<()>;

    fn update_progress(&mut self, id: JobId, progress: &Progress) -> Result<()>;

    /// `New` jobs of a kind, oldest first
    fn pending(&self, kind: JobKindTag) -> Result<Vec<Job>>;

    /// Every job, oldest first
    fn all(&self) -> Result<Vec<Job>>;
}

#[derive(Debug, Default)]
pub struct MemoryJobRepository {
    jobs: BTreeMap<JobId, Job>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(&self, keep: impl Fn(&Job) -> bool) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.values().filter(|job| keep(job)).cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }
}

impl JobRepository for MemoryJobRepository {
    fn insert(&mut self, job: Job) -> Result<()> {
        if self.jobs.contains_key(&job.id) {
            return Err(Error::storage(format!("job {} already exists", job.id)));
        }
        self.jobs.insert(job.id, job);
        Ok(())
    }

    fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.get(&id).cloned())
    }

    fn save(&mut self, job: &Job) -> Result<()> {
        match self.jobs.get_mut(&job.id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("job {}", job.id))),
        }
    }

    fn update_progress(&mut self, id: JobId, progress: &Progress) -> Result<()> {
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("job {}", id)))?;
        job.progress = progress.clone();
        Ok(())
    }

    fn pending(&self, kind: JobKindTag) -> Result<Vec<Job>> {
        Ok(self.sorted(|job| job.status == Status::New && job.kind_tag() == kind))
    }

    fn all(&self) -> Result<Vec<Job>> {
        Ok(self.sorted(|_| true))
    }
}

/// Job records kept in one JSON file, rewritten on every change
pub struct JsonJobRepository {
    path: PathBuf,
    inner: MemoryJobRepository,
}

impl JsonJobRepository {
    /// Load `path`, starting empty if it does not exist yet
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut inner = MemoryJobRepository::new();
        if path.exists() {
            let content = fs::read(&path)?;
            let jobs: Vec<Job> = serde_json::from_slice(&content)?;
            for job in jobs {
                inner.jobs.insert(job.id, job);
            }
        }
        Ok(JsonJobRepository { path, inner })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<()> {
        let jobs = self.inner.all()?;
        let content = serde_json::to_vec_pretty(&jobs)?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, content)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

impl JobRepository for JsonJobRepository {
    fn insert(&mut self, job: Job) -> Result<()> {
        self.inner.insert(job)?;
        self.persist()
    }

    fn get(&self, id: JobId) -> Result<Option<Job>> {
        self.inner.get(id)
    }

    fn save(&mut self, job: &Job) -> Result<()> {
        self.inner.save(job)?;
        self.persist()
    }

    fn update_progress(&mut self, id: JobId, progress: &Progress) -> Result<()> {
        self.inner.update_progress(id, progress)?;
        self.persist()
    }

    fn pending(&self, kind: JobKindTag) -> Result<Vec<Job>> {
        self.inner.pending(kind)
    }

    fn all(&self) -> Result<Vec<Job>> {
        self.inner.all()
    }
}
