//! Drives one claimed job through its phases.
//!
//! For each phase the driver locates the inputs, plans and saves task
//! groups, then watches the store until every group is done. Completion is
//! only ever learned from the store: hosts write their results there, and
//! the driver never hears from them directly.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{Job, TaskError, TaskGroup, TaskGroupState, TaskResult, EJ_NOENT, EJ_TIMEOUT};
use mrl_store::{Feed, Store, StoreError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::pipeline::{plan_phase, tally, PhaseState, PhaseTally};
use crate::timeout::{StallClock, StallPolicy, StallVerdict};

pub struct JobDriver {
    store: Arc<dyn Store>,
    config: CoordinatorConfig,
    policy: Arc<dyn StallPolicy>,
    cancel: CancellationToken,
    job: Job,
    phases: Vec<PhaseState>,
}

impl JobDriver {
    /// A driver for `job`, which this worker has already been assigned.
    pub fn new(
        store: Arc<dyn Store>,
        config: CoordinatorConfig,
        job: Job,
        cancel: CancellationToken,
    ) -> Self {
        let policy = config.stall_action.policy();
        let phases = vec![PhaseState::NotStarted; job.phases.len()];
        Self {
            store,
            config,
            policy,
            cancel,
            job,
            phases,
        }
    }

    /// Replace the stall policy chosen by configuration.
    pub fn with_policy(mut self, policy: Arc<dyn StallPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Run the job to completion and return the final record.
    ///
    /// A job always ends in `done`. Failed tasks show up in stats, not as
    /// an error here. Transient store failures are retried until they
    /// clear; any other store failure finishes the job with its
    /// outstanding tasks counted as failed. An error means the job record
    /// itself is invalid or gone.
    pub async fn run(mut self) -> Result<Job> {
        info!(job_id = %self.job.job_id, phases = self.job.phases.len(), "driving job");
        self.job.validate()?;

        match self.drive().await {
            Ok(()) => Ok(self.job),
            Err(cause) => self.give_up(cause).await,
        }
    }

    async fn drive(&mut self) -> Result<()> {
        let job_id = self.job.job_id.clone();
        self.await_input().await?;

        let mut inputs = self.job.input_keys.clone();
        self.job.stats.n_inputs_read = inputs.len() as u64;
        let mut outputs = Vec::new();

        if inputs.is_empty() {
            info!(%job_id, "job has no input");
        }

        for phase_num in 0..self.job.phases.len() {
            if inputs.is_empty() {
                self.phases[phase_num] = PhaseState::Completed;
                continue;
            }
            if self.cancelled() {
                info!(%job_id, phase_num, "job cancelled, not starting phase");
                break;
            }

            let tally = self.run_phase(phase_num as u32, inputs).await?;
            // Read back before saving so a cancellation written meanwhile
            // isn't overwritten.
            self.refresh().await?;
            self.commit(phase_num as u32, &tally);
            self.phases[phase_num] = PhaseState::Completed;
            outputs = tally.outputs;
            inputs = outputs.clone();

            self.save().await?;
        }

        self.job.finish(outputs, Utc::now());
        self.save().await?;
        info!(
            %job_id,
            outputs = self.job.output_keys.len(),
            ok = self.job.stats.n_tasks_committed_ok,
            failed = self.job.stats.n_tasks_committed_fail,
            errors = self.job.stats.n_errors,
            "job done"
        );
        Ok(())
    }

    /// Finish a job that can't be driven any further. Tasks dispatched but
    /// never committed count as failed and the job has no outputs.
    async fn give_up(mut self, cause: CoordinatorError) -> Result<Job> {
        if matches!(cause, CoordinatorError::Store(StoreError::NotFound { .. })) {
            error!(job_id = %self.job.job_id, error = %cause, "job record is gone");
            return Err(cause);
        }

        let phase_num = self
            .phases
            .iter()
            .position(|state| *state != PhaseState::Completed);
        error!(job_id = %self.job.job_id, ?phase_num, error = %cause, "giving up on job");

        let stats = &mut self.job.stats;
        let outstanding = stats.tasks_outstanding();
        stats.n_tasks_committed_fail += outstanding;
        stats.n_errors += outstanding + 1;
        self.job.finish(Vec::new(), Utc::now());

        match self.save().await {
            Ok(()) => Ok(self.job),
            Err(e) => {
                error!(job_id = %self.job.job_id, error = %e, "could not record job as done");
                Err(cause)
            }
        }
    }

    fn cancelled(&mut self) -> bool {
        if self.cancel.is_cancelled() && self.job.time_cancelled.is_none() {
            self.job.time_cancelled = Some(Utc::now());
        }
        self.job.is_cancelled()
    }

    async fn save(&self) -> Result<()> {
        let job = &self.job;
        let store = &self.store;
        retrying(&self.config, &job.job_id, "save job", || store.save_job(job)).await?;
        Ok(())
    }

    /// Pick up input keys, end-of-input, and cancellation from the stored
    /// record.
    async fn refresh(&mut self) -> Result<()> {
        let job_id = self.job.job_id.clone();
        let store = &self.store;
        let latest = retrying(&self.config, &job_id, "get job", || store.get_job(&job_id)).await?;
        self.job.absorb_input(&latest);
        Ok(())
    }

    /// Wait until every input key is known.
    async fn await_input(&mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !self.job.input_complete() && !self.cancelled() {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => continue,
            }
            self.refresh().await?;
            debug!(
                job_id = %self.job.job_id,
                inputs = self.job.input_keys.len(),
                input_done = self.job.time_input_done.is_some(),
                "waiting for input"
            );
        }
        Ok(())
    }

    async fn run_phase(&mut self, phase_num: u32, inputs: Vec<String>) -> Result<PhaseTally> {
        let job_id = self.job.job_id.clone();
        let phase = self.job.phases[phase_num as usize].clone();

        let store = &self.store;
        let located =
            retrying(&self.config, &job_id, "locate", || store.locate(&inputs)).await?;

        let plan = {
            let mut rng = rand::thread_rng();
            plan_phase(&job_id, &phase, phase_num, &inputs, &located, &mut rng)?
        };

        let unlocated: Vec<(String, TaskError)> = plan
            .unlocated
            .iter()
            .map(|key| {
                let error = TaskError::new(EJ_NOENT, "input not found on any storage node");
                (key.clone(), error)
            })
            .collect();
        self.job.stats.n_errors += unlocated.len() as u64;

        let mut tally = if plan.groups.is_empty() {
            PhaseTally::default()
        } else {
            self.job.stats.n_tasks_dispatched += plan.tasks;
            let groups = &plan.groups;
            retrying(&self.config, &job_id, "save task groups", || {
                store.save_task_groups(groups)
            })
            .await?;
            self.phases[phase_num as usize] = PhaseState::Dispatched;
            info!(
                %job_id,
                phase_num,
                kind = %phase.kind,
                groups = plan.groups.len(),
                tasks = plan.tasks,
                "phase dispatched"
            );

            let finished = self.watch(phase_num, plan.groups).await?;
            tally(&finished)
        };
        tally.errors.extend(unlocated);
        Ok(tally)
    }

    /// Poll the store until every group of the phase is done.
    async fn watch(&self, phase_num: u32, groups: Vec<TaskGroup>) -> Result<Vec<TaskGroup>> {
        let watched = self.watch_until_done(phase_num, groups).await;
        self.store.unwatch_task_groups(&self.job.job_id);
        watched
    }

    async fn watch_until_done(
        &self,
        phase_num: u32,
        mut groups: Vec<TaskGroup>,
    ) -> Result<Vec<TaskGroup>> {
        let job_id = self.job.job_id.as_str();
        let (feed, mut seen) = Feed::channel(self.config.feed_capacity);
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut clock = StallClock::new(self.config.phase_timeout);

        while !groups.iter().all(TaskGroup::is_done) {
            tokio::select! {
                _ = ticker.tick() => {
                    self.store.watch_task_groups(job_id, phase_num, &feed);
                    let Some(stalled_for) = clock.check() else {
                        continue;
                    };
                    let pending: Vec<&TaskGroup> =
                        groups.iter().filter(|g| !g.is_done()).collect();
                    let verdict = self.policy.on_stall(job_id, phase_num, &pending, stalled_for);
                    if verdict == StallVerdict::Abandon {
                        let abandoned = abandon(&mut groups, stalled_for);
                        let store = &self.store;
                        retrying(&self.config, job_id, "save task groups", || {
                            store.save_task_groups(&abandoned)
                        })
                        .await?;
                    }
                }
                Some(observed) = seen.recv() => {
                    if merge(&mut groups, observed) {
                        clock.progress();
                    }
                }
            }
        }

        Ok(groups)
    }

    fn commit(&mut self, phase_num: u32, tally: &PhaseTally) {
        let job_id = self.job.job_id.as_str();
        for (input, error) in &tally.errors {
            warn!(job_id, phase_num, %input, code = %error.code, message = %error.message, "task failed");
        }
        if tally.missing > 0 {
            warn!(job_id, phase_num, missing = tally.missing, "tasks finished without a result");
        }

        let stats = &mut self.job.stats;
        stats.n_tasks_committed_ok += tally.ok;
        stats.n_tasks_committed_fail += tally.failed;
        stats.n_errors += tally.failed;

        self.job.discarded_keys.extend(tally.discarded.iter().cloned());
        if phase_num == 0 {
            self.job.done_keys.extend(tally.committed_inputs.iter().cloned());
        }
        info!(
            job_id = %self.job.job_id,
            phase_num,
            ok = tally.ok,
            failed = tally.failed,
            outputs = tally.outputs.len(),
            "phase complete"
        );
    }
}

/// Fold a batch of observed groups into what we know. Stale observations
/// and groups from other dispatches are ignored. Returns whether anything
/// moved forward.
fn merge(known: &mut [TaskGroup], observed: Vec<TaskGroup>) -> bool {
    let mut progressed = false;
    for group in observed {
        if let Some(current) = known
            .iter_mut()
            .find(|k| k.task_group_id == group.task_group_id)
        {
            if current.is_superseded_by(&group) {
                *current = group;
                progressed = true;
            }
        }
    }
    progressed
}

/// Close every unfinished group, failing its unreported tasks with
/// `EJ_TIMEOUT`. Returns the groups that were closed.
fn abandon(groups: &mut [TaskGroup], stalled_for: Duration) -> Vec<TaskGroup> {
    let message = format!("no progress for {}ms", stalled_for.as_millis());
    let mut abandoned = Vec::new();
    for group in groups.iter_mut().filter(|g| !g.is_done()) {
        for input in group.unreported() {
            let error = TaskError::new(EJ_TIMEOUT, message.clone());
            group.results.push(TaskResult::fail(input, error));
        }
        group.state = TaskGroupState::Done;
        abandoned.push(group.clone());
    }
    abandoned
}

/// Run `op` until it succeeds or fails with anything but a transient error.
///
/// The first `retry_limit` retries wait `retry_delay`. After that the wait
/// doubles each time, up to `retry_max_delay`.
async fn retrying<T, F, Fut>(
    config: &CoordinatorConfig,
    job_id: &str,
    what: &str,
    mut op: F,
) -> std::result::Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, StoreError>>,
{
    let ceiling = config.retry_max_delay.max(config.retry_delay);
    let mut delay = config.retry_delay;
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() => {
                attempt += 1;
                if attempt > config.retry_limit {
                    delay = delay.saturating_mul(2).min(ceiling);
                    error!(
                        job_id,
                        what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "store still failing, backing off"
                    );
                } else {
                    warn!(job_id, what, attempt, error = %e, "retrying store request");
                }
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}
