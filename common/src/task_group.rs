use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::Phase;
use crate::schema::{self, RecordKind, ValidationError};

/// State of a task group. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskGroupState {
    Dispatched,
    Running,
    Done,
}

impl fmt::Display for TaskGroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskGroupState::Dispatched => write!(f, "dispatched"),
            TaskGroupState::Running => write!(f, "running"),
            TaskGroupState::Done => write!(f, "done"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Ok,
    Fail,
}

/// Why a task failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub code: String,
    pub message: String,
}

impl TaskError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// The outcome of processing one input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub input: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,

    /// Keys that graduate to the next phase (or become job outputs).
    #[serde(default)]
    pub outputs: Vec<String>,
    pub result: Outcome,

    /// Intermediate objects; never propagated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partials: Vec<String>,

    /// Objects the task chose to drop; never propagated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discarded: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_time: Option<DateTime<Utc>>,

    /// Present iff `result` is `fail`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl TaskResult {
    pub fn ok(input: impl Into<String>, outputs: Vec<String>) -> Self {
        Self {
            input: input.into(),
            machine: None,
            outputs,
            result: Outcome::Ok,
            partials: vec![],
            discarded: vec![],
            start_time: None,
            done_time: None,
            error: None,
        }
    }

    pub fn fail(input: impl Into<String>, error: TaskError) -> Self {
        Self {
            result: Outcome::Fail,
            error: Some(error),
            ..Self::ok(input, vec![])
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result == Outcome::Ok
    }
}

/// The unit of dispatch: one phase of one job on one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskGroup {
    pub job_id: String,
    pub task_group_id: String,
    pub host: String,
    pub input_keys: Vec<String>,

    /// Snapshot of the job's phase at dispatch time.
    pub phase: Phase,
    pub phase_num: u32,
    pub state: TaskGroupState,

    #[serde(default)]
    pub results: Vec<TaskResult>,

    /// Reducer index for reduce groups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<u32>,
}

impl TaskGroup {
    /// A freshly dispatched group with a generated id.
    pub fn dispatch(
        job_id: &str,
        host: impl Into<String>,
        phase: &Phase,
        phase_num: u32,
        input_keys: Vec<String>,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            task_group_id: uuid::Uuid::new_v4().to_string(),
            host: host.into(),
            input_keys,
            phase: phase.clone(),
            phase_num,
            state: TaskGroupState::Dispatched,
            results: vec![],
            partition: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == TaskGroupState::Done
    }

    /// Number of tasks this group stands for: one per key for per-key
    /// phases, one for a reducer.
    pub fn task_count(&self) -> u64 {
        if self.phase.kind.is_per_key() {
            self.input_keys.len() as u64
        } else {
            1
        }
    }

    /// One label per task that has no result yet: the unreported input keys
    /// of a per-key group, or the group id for a reducer.
    pub fn unreported(&self) -> Vec<String> {
        let missing = self.task_count().saturating_sub(self.results.len() as u64) as usize;
        if !self.phase.kind.is_per_key() {
            return vec![self.task_group_id.clone(); missing];
        }

        let reported: HashSet<&str> = self.results.iter().map(|r| r.input.as_str()).collect();
        let mut labels: Vec<String> = self
            .input_keys
            .iter()
            .filter(|key| !reported.contains(key.as_str()))
            .take(missing)
            .cloned()
            .collect();
        labels.resize(missing, self.task_group_id.clone());
        labels
    }

    /// Whether `other` is a later view of this group than `self`.
    ///
    /// Reads from the store may be stale, so an observation only replaces
    /// what we have when it is strictly further along.
    pub fn is_superseded_by(&self, other: &TaskGroup) -> bool {
        other.state > self.state
            || (other.state == self.state && other.results.len() > self.results.len())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        schema::validate_serialize(RecordKind::TaskGroup, self)
    }
}
