//! Client for the eventually-consistent metadata store that holds job and
//! task group records.
//!
//! Coordinators never talk to the store directly. Every read and write goes
//! through a [`Store`], which validates records before they leave the
//! process, throttles polling, and allows at most one operation in flight
//! per job.

use std::collections::HashMap;

use async_trait::async_trait;
use common::{Job, TaskGroup};

pub mod config;
pub mod error;
pub mod feed;
pub mod guard;
pub mod http;
pub mod lease;
pub mod mock;
pub mod server;

pub use config::{Backend, StoreConfig, StoreHandle};
pub use error::{Result, StoreError};
pub use feed::Feed;
pub use guard::{PollGuard, PollGuards, PollState};
pub use http::HttpStore;
pub use lease::{JobLease, JobLocks, JobOp};
pub use mock::MockStore;

/// Object key -> nodes holding a copy of it.
pub type Locations = HashMap<String, Vec<String>>;

/// Header that turns a record PUT into an atomic assignment.
pub const EXPECT_UNASSIGNED_HEADER: &str = "x-mrl-expect-unassigned";

pub(crate) const FIND_RESOURCE: &str = "jobs:unassigned";

pub(crate) fn watch_resource(job_id: &str) -> String {
    format!("taskgroups:{}", job_id)
}

/// Operations a coordinator performs against the metadata store.
///
/// Polling operations (`find_unassigned_jobs`, `watch_task_groups`) return
/// at once. They start a background request only if the resource is idle,
/// deliver what they find through the supplied [`Feed`], and swallow
/// errors; the next poll tries again. Every other operation reports its
/// error to the caller.
#[async_trait]
pub trait Store: Send + Sync {
    /// Suggest a search for jobs no worker has claimed.
    fn find_unassigned_jobs(&self, feed: &Feed<Job>);

    /// Atomically record `job` (which names this worker) as the owner.
    /// Fails with [`StoreError::Conflict`] if another worker won.
    async fn assign_job(&self, job: &Job) -> Result<()>;

    /// Overwrite the stored job record.
    async fn save_job(&self, job: &Job) -> Result<()>;

    /// Read the current job record.
    async fn get_job(&self, job_id: &str) -> Result<Job>;

    /// Every task group of a job, in no particular order.
    async fn list_task_groups(&self, job_id: &str) -> Result<Vec<TaskGroup>>;

    /// Write a batch of task groups in a single request.
    async fn save_task_groups(&self, groups: &[TaskGroup]) -> Result<()>;

    /// Suggest a poll for the task groups of one phase of a job.
    fn watch_task_groups(&self, job_id: &str, phase_num: u32, feed: &Feed<Vec<TaskGroup>>);

    /// Stop tracking poll state for a job whose watching is over.
    fn unwatch_task_groups(&self, job_id: &str);

    /// Resolve object keys to the storage nodes holding them. Keys that
    /// can't be found are absent from the result.
    async fn locate(&self, keys: &[String]) -> Result<Locations>;
}
