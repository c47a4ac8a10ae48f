//! What to do when a phase stops making progress.
//!
//! The driver only detects the absence of progress. Deciding what that
//! means is left to a [`StallPolicy`].

use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use common::TaskGroup;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallVerdict {
    KeepWaiting,

    /// Stop waiting: unfinished groups are closed and their unreported
    /// tasks fail with `EJ_TIMEOUT`.
    Abandon,
}

pub trait StallPolicy: Send + Sync {
    fn on_stall(
        &self,
        job_id: &str,
        phase_num: u32,
        pending: &[&TaskGroup],
        stalled_for: Duration,
    ) -> StallVerdict;
}

/// Report the stall and keep waiting.
#[derive(Debug, Default)]
pub struct LogOnly;

impl StallPolicy for LogOnly {
    fn on_stall(
        &self,
        job_id: &str,
        phase_num: u32,
        pending: &[&TaskGroup],
        stalled_for: Duration,
    ) -> StallVerdict {
        let hosts: Vec<&str> = pending.iter().map(|g| g.host.as_str()).collect();
        warn!(
            job_id,
            phase_num,
            pending = pending.len(),
            ?hosts,
            stalled_ms = stalled_for.as_millis() as u64,
            "phase is making no progress"
        );
        StallVerdict::KeepWaiting
    }
}

/// Give up on unfinished groups.
#[derive(Debug, Default)]
pub struct Abandon;

impl StallPolicy for Abandon {
    fn on_stall(
        &self,
        job_id: &str,
        phase_num: u32,
        pending: &[&TaskGroup],
        stalled_for: Duration,
    ) -> StallVerdict {
        for group in pending {
            warn!(
                job_id,
                phase_num,
                task_group_id = %group.task_group_id,
                host = %group.host,
                stalled_ms = stalled_for.as_millis() as u64,
                "abandoning task group"
            );
        }
        StallVerdict::Abandon
    }
}

/// Selects a built-in policy from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum StallAction {
    #[default]
    Log,
    Abandon,
}

impl StallAction {
    pub fn policy(self) -> Arc<dyn StallPolicy> {
        match self {
            StallAction::Log => Arc::new(LogOnly),
            StallAction::Abandon => Arc::new(Abandon),
        }
    }
}

/// Tracks when a phase last made progress.
#[derive(Debug)]
pub struct StallClock {
    timeout: Option<Duration>,
    last_progress: Instant,
}

impl StallClock {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            last_progress: Instant::now(),
        }
    }

    pub fn progress(&mut self) {
        self.last_progress = Instant::now();
    }

    /// How long the phase has been stalled, if that exceeds the timeout.
    ///
    /// Reporting a stall restarts the clock, so a policy that keeps waiting
    /// hears about it once per timeout period rather than on every tick.
    pub fn check(&mut self) -> Option<Duration> {
        let timeout = self.timeout?;
        let stalled_for = self.last_progress.elapsed();
        if stalled_for < timeout {
            return None;
        }
        self.last_progress = Instant::now();
        Some(stalled_for)
    }
}
