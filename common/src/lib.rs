//! Records shared by every part of the job engine.
//!
//! Jobs and task groups live in an eventually-consistent metadata store as
//! JSON documents. This crate defines their shape, the invariants they must
//! satisfy, and a validator that checks a candidate record before it is
//! written anywhere.

pub mod job;
pub mod schema;
pub mod task_group;

pub use job::{Job, JobState, JobStats, Phase, PhaseType};
pub use schema::{validate, Problem, RecordKind, ValidationError, Violation};
pub use task_group::{Outcome, TaskError, TaskGroup, TaskGroupState, TaskResult};

/////////////////////////////////////////////////////////////////////////////
// Well-known error codes
/////////////////////////////////////////////////////////////////////////////

/// The user's command failed (nonzero exit, core dump, killed).
pub const EJ_USER: &str = "EJ_USER";

/// The task exceeded its time allowance.
pub const EJ_TIMEOUT: &str = "EJ_TIMEOUT";

/// The input object could not be found on any storage node.
pub const EJ_NOENT: &str = "EJ_NOENT";

/// The task never reported a result.
pub const EJ_INTERNAL: &str = "EJ_INTERNAL";

pub(crate) fn is_false(value: &bool) -> bool {
    !*value
}
