//! Worker-side coordination for multi-phase map/reduce jobs.
//!
//! An [`Agent`] finds jobs no worker owns, claims them through the store's
//! atomic assignment, and hands each one to a [`JobDriver`]. The driver
//! chains the job's phases: the successful outputs of phase N become the
//! inputs of phase N+1, and the last phase's outputs become the job's.

pub mod agent;
pub mod config;
pub mod driver;
pub mod error;
pub mod pipeline;
pub mod timeout;

pub use agent::{Agent, AgentHandle};
pub use config::CoordinatorConfig;
pub use driver::JobDriver;
pub use error::{CoordinatorError, Result};
pub use pipeline::{plan_phase, tally, PhasePlan, PhaseState, PhaseTally};
pub use timeout::{Abandon, LogOnly, StallAction, StallPolicy, StallVerdict};
