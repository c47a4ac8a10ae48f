//! Per-job single-flight enforcement.
//!
//! Overlapping writes to one job under eventual consistency can lose
//! updates, so at most one store operation may be outstanding per job.
//! A second attempt is refused immediately rather than queued.

use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::error;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOp {
    Assign,
    Save,
    Get,
    ListTaskGroups,
    SaveTaskGroups,
}

impl fmt::Display for JobOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOp::Assign => write!(f, "assign"),
            JobOp::Save => write!(f, "save"),
            JobOp::Get => write!(f, "get"),
            JobOp::ListTaskGroups => write!(f, "list task groups"),
            JobOp::SaveTaskGroups => write!(f, "save task groups"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    op: JobOp,
    since: Instant,
}

/// The set of jobs with an operation in flight.
#[derive(Debug, Clone, Default)]
pub struct JobLocks {
    outstanding: Arc<DashMap<String, Outstanding>>,
}

impl JobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the job for `op`. The claim lasts until the lease is dropped.
    pub fn acquire(&self, job_id: &str, op: JobOp) -> Result<JobLease, StoreError> {
        match self.outstanding.entry(job_id.to_string()) {
            Entry::Occupied(entry) => {
                let held = *entry.get();
                error!(
                    job_id,
                    requested = %op,
                    outstanding = %held.op,
                    held_for_ms = held.since.elapsed().as_millis() as u64,
                    "store operation already outstanding for job"
                );
                Err(StoreError::OperationOutstanding {
                    job_id: job_id.to_string(),
                    requested: op,
                    outstanding: held.op,
                })
            }
            Entry::Vacant(entry) => {
                entry.insert(Outstanding {
                    op,
                    since: Instant::now(),
                });
                Ok(JobLease {
                    outstanding: Arc::clone(&self.outstanding),
                    job_id: job_id.to_string(),
                })
            }
        }
    }

    /// Claim several jobs at once, all or nothing.
    pub fn acquire_all<'a>(
        &self,
        job_ids: impl IntoIterator<Item = &'a str>,
        op: JobOp,
    ) -> Result<Vec<JobLease>, StoreError> {
        let mut ids: Vec<&str> = job_ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();

        // Leases taken so far are released on the error path when `leases`
        // drops.
        let mut leases = Vec::with_capacity(ids.len());
        for id in ids {
            leases.push(self.acquire(id, op)?);
        }
        Ok(leases)
    }

    /// The operation currently outstanding for `job_id`, if any.
    pub fn outstanding(&self, job_id: &str) -> Option<JobOp> {
        self.outstanding.get(job_id).map(|o| o.op)
    }
}

/// Proof of an outstanding operation. Releases the job when dropped.
#[derive(Debug)]
pub struct JobLease {
    outstanding: Arc<DashMap<String, Outstanding>>,
    job_id: String,
}

impl Drop for JobLease {
    fn drop(&mut self) {
        self.outstanding.remove(&self.job_id);
    }
}
