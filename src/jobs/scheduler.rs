//! Batch processing of queued jobs
//!
//! Each pass takes every `New` job of a kind, oldest first, and runs it to
//! completion before the next. A pass never fails: per-job outcomes are
//! logged and returned, and callers inspect job records for details.

use crate::jobs::{Job, JobContext, JobId, JobKindTag, JobRepository, Status};
use crate::store::Store;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub id: JobId,
    pub kind: JobKindTag,
    pub success: bool,
    pub message: String,
}

impl JobOutcome {
    fn from_job(job: &Job) -> Self {
        JobOutcome {
            id: job.id,
            kind: job.kind_tag(),
            success: job.status == Status::Processed && job.success,
            message: job.info.clone().unwrap_or_else(|| job.status_message()),
        }
    }
}

pub struct Scheduler<'a, S: Store + ?Sized> {
    context: JobContext<'a, S>,
    repository: &'a mut dyn JobRepository,
}

impl<'a, S: Store + ?Sized> Scheduler<'a, S> {
    pub fn new(context: JobContext<'a, S>, repository: &'a mut dyn JobRepository) -> Self {
        Scheduler {
            context,
            repository,
        }
    }

    /// Process every new job of one kind
    pub fn run_pending(&mut self, kind: JobKindTag) -> Vec<JobOutcome> {
        let jobs = match self.repository.pending(kind) {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(kind = %kind, error = %e, "could not list pending jobs");
                return Vec::new();
            }
        };
        if jobs.is_empty() {
            return Vec::new();
        }
        info!(kind = %kind, count = jobs.len(), "processing pending jobs");

        let mut outcomes = Vec::with_capacity(jobs.len());
        for mut job in jobs {
            if let Err(e) = job.process(&mut self.context, &mut *self.repository) {
                error!(job = %job.id, error = %e, "could not persist job record");
            }
            let outcome = JobOutcome::from_job(&job);
            if outcome.success {
                info!(job = %outcome.id, kind = %kind, "{}", outcome.message);
            } else {
                warn!(job = %outcome.id, kind = %kind, "{}", outcome.message);
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Process every new job, exports first, then imports, then purges
    pub fn run_all(&mut self) -> Vec<JobOutcome> {
        JobKindTag::ALL
            .iter()
            .flat_map(|kind| self.run_pending(*kind))
            .collect()
    }
}
