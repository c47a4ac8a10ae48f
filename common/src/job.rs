use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{self, RecordKind, ValidationError};

/// State of a job. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Submitted, not yet claimed by a worker.
    Queued,

    /// Claimed; phases are being dispatched.
    Running,

    /// Reached the end of the pipeline (or was cancelled and drained).
    Done,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Done => write!(f, "done"),
        }
    }
}

/// How a phase fans out its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseType {
    /// One task per key, placed anywhere.
    Generic,

    /// One task per key, placed on a node holding the key.
    #[default]
    StorageMap,

    /// A fixed number of tasks, each consuming the upstream output stream.
    Reduce,
}

impl PhaseType {
    /// Whether this phase dispatches one task per input key.
    pub fn is_per_key(self) -> bool {
        !matches!(self, PhaseType::Reduce)
    }
}

impl fmt::Display for PhaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseType::Generic => write!(f, "generic"),
            PhaseType::StorageMap => write!(f, "storage-map"),
            PhaseType::Reduce => write!(f, "reduce"),
        }
    }
}

/// One stage of a job's pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    #[serde(rename = "type", default)]
    pub kind: PhaseType,

    /// Asset paths made available to the command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assets: Vec<String>,

    /// The user command.
    pub exec: String,

    /// Opaque user argument, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uarg: Option<Value>,

    /// Number of reducers. Only meaningful for reduce phases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

impl Phase {
    pub fn new(kind: PhaseType, exec: impl Into<String>) -> Self {
        Self {
            kind,
            assets: vec![],
            exec: exec.into(),
            uarg: None,
            count: None,
        }
    }

    pub fn map(exec: impl Into<String>) -> Self {
        Self::new(PhaseType::StorageMap, exec)
    }

    pub fn reduce(exec: impl Into<String>, count: u32) -> Self {
        Self {
            count: Some(count),
            ..Self::new(PhaseType::Reduce, exec)
        }
    }

    /// Number of reduce tasks this phase runs. Always at least one.
    pub fn reducer_count(&self) -> u32 {
        self.count.unwrap_or(1).max(1)
    }
}

/// Counters maintained by the coordinator while it drives a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub n_assigns: u64,
    pub n_inputs_read: u64,
    pub n_job_outputs: u64,
    pub n_tasks_dispatched: u64,
    pub n_tasks_committed_ok: u64,
    pub n_tasks_committed_fail: u64,
    pub n_errors: u64,
}

impl JobStats {
    /// Tasks dispatched but not yet committed either way.
    pub fn tasks_outstanding(&self) -> u64 {
        self.n_tasks_dispatched
            .saturating_sub(self.n_tasks_committed_ok + self.n_tasks_committed_fail)
    }
}

/// A job record as stored in the jobs bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub job_name: String,

    /// Ordered pipeline. Immutable once the job is created.
    pub phases: Vec<Phase>,
    pub input_keys: Vec<String>,

    /// Input keys arrive over time; see `time_input_done`.
    #[serde(default, skip_serializing_if = "crate::is_false")]
    pub input_streaming: bool,
    pub create_time: DateTime<Utc>,
    pub state: JobState,

    #[serde(default)]
    pub done_keys: Vec<String>,
    #[serde(default)]
    pub output_keys: Vec<String>,
    #[serde(default)]
    pub discarded_keys: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_input_done: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_cancelled: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<DateTime<Utc>>,

    /// The owning worker. Unset while queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,

    #[serde(default)]
    pub stats: JobStats,
}

impl Job {
    /// A freshly submitted job with a generated id.
    pub fn new(job_name: impl Into<String>, phases: Vec<Phase>, input_keys: Vec<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), job_name, phases, input_keys)
    }

    pub fn with_id(
        job_id: impl Into<String>,
        job_name: impl Into<String>,
        phases: Vec<Phase>,
        input_keys: Vec<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            job_name: job_name.into(),
            phases,
            input_keys,
            input_streaming: false,
            create_time: Utc::now(),
            state: JobState::Queued,
            done_keys: vec![],
            output_keys: vec![],
            discarded_keys: vec![],
            time_input_done: None,
            time_cancelled: None,
            finish_time: None,
            worker: None,
            stats: JobStats::default(),
        }
    }

    /// Mark the job as receiving its input keys over time.
    pub fn streaming(mut self) -> Self {
        self.input_streaming = true;
        self
    }

    /// No worker has claimed this job.
    pub fn is_unassigned(&self) -> bool {
        self.worker.as_deref().map_or(true, str::is_empty)
    }

    /// Whether every input key is known.
    pub fn input_complete(&self) -> bool {
        !self.input_streaming || self.time_input_done.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.time_cancelled.is_some()
    }

    /// Take ownership of the job on behalf of `worker`.
    ///
    /// The result is what gets handed to the store's atomic assignment.
    pub fn claim(&mut self, worker: &str) {
        self.worker = Some(worker.to_string());
        if self.state < JobState::Running {
            self.state = JobState::Running;
        }
        self.stats.n_assigns += 1;
    }

    /// Pick up input-related fields written by the submission side.
    ///
    /// Everything the coordinator owns (state, stats, output lists) is kept.
    pub fn absorb_input(&mut self, latest: &Job) {
        self.input_keys = latest.input_keys.clone();
        if self.time_input_done.is_none() {
            self.time_input_done = latest.time_input_done;
        }
        if self.time_cancelled.is_none() {
            self.time_cancelled = latest.time_cancelled;
        }
    }

    /// Move to `done` with the given job outputs. Has no effect on a job
    /// that is already done.
    pub fn finish(&mut self, outputs: Vec<String>, now: DateTime<Utc>) {
        if self.state == JobState::Done {
            return;
        }
        self.stats.n_job_outputs = outputs.len() as u64;
        self.output_keys = outputs;
        self.state = JobState::Done;
        self.finish_time = Some(now);
    }

    /// Check this record against the job schema.
    pub fn validate(&self) -> Result<(), ValidationError> {
        schema::validate_serialize(RecordKind::Job, self)
    }
}
