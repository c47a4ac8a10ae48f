use common::ValidationError;
use thiserror::Error;

use crate::lease::JobOp;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The record failed schema validation; nothing was written.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The atomic assignment lost: another worker owns the job.
    #[error("job {job_id} is already owned by {owner}")]
    Conflict { job_id: String, owner: String },

    /// The write would undo or alter something the stored job record has
    /// already settled.
    #[error("refusing to write job {job_id}: {reason}")]
    Settled { job_id: String, reason: String },

    #[error("{bucket}/{key} not found")]
    NotFound { bucket: String, key: String },

    /// The remote store refused the request outright.
    #[error("store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Network or store failure. Worth retrying.
    #[error("store request failed: {0}")]
    Transient(String),

    /// A second operation was started against a job that already has one
    /// in flight. This is a coordination bug in the caller.
    #[error("{requested} for job {job_id} attempted while {outstanding} is outstanding")]
    OperationOutstanding {
        job_id: String,
        requested: JobOp,
        outstanding: JobOp,
    },

    #[error("malformed record {bucket}/{key}: {source}")]
    Decode {
        bucket: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        StoreError::Transient(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
