//! The worker's main loop: discover unassigned jobs, claim them, and run
//! each claimed job on its own task.

use std::sync::Arc;

use common::Job;
use dashmap::DashMap;
use mrl_store::{Feed, Store, StoreError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::driver::JobDriver;
use crate::timeout::StallPolicy;

/// Jobs this worker is driving, with the token that cancels each.
type Running = Arc<DashMap<String, CancellationToken>>;

pub struct Agent {
    worker_id: String,
    store: Arc<dyn Store>,
    config: CoordinatorConfig,
    policy: Arc<dyn StallPolicy>,
}

impl Agent {
    pub fn new(worker_id: impl Into<String>, store: Arc<dyn Store>, config: CoordinatorConfig) -> Self {
        let policy = config.stall_action.policy();
        Self {
            worker_id: worker_id.into(),
            store,
            config,
            policy,
        }
    }

    /// Start discovering and driving jobs in the background.
    pub fn spawn(self) -> AgentHandle {
        let running = Running::default();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(self.run(Arc::clone(&running), shutdown.clone()));
        AgentHandle {
            running,
            shutdown,
            task,
        }
    }

    async fn run(self, running: Running, shutdown: CancellationToken) {
        info!(worker_id = %self.worker_id, "agent started");
        let (feed, mut found) = Feed::channel(self.config.feed_capacity);
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.store.find_unassigned_jobs(&feed),
                Some(job) = found.recv() => self.claim(job, &running).await,
            }
        }
        info!(worker_id = %self.worker_id, "agent stopped");
    }

    async fn claim(&self, mut job: Job, running: &Running) {
        let job_id = job.job_id.clone();
        if running.contains_key(&job_id) {
            return;
        }

        job.claim(&self.worker_id);
        match self.store.assign_job(&job).await {
            Ok(()) => {}
            Err(StoreError::Conflict { owner, .. }) => {
                debug!(%job_id, %owner, "job claimed by another worker");
                return;
            }
            Err(e) => {
                warn!(%job_id, error = %e, "failed to claim job");
                return;
            }
        }

        let cancel = CancellationToken::new();
        running.insert(job_id.clone(), cancel.clone());
        let driver = JobDriver::new(Arc::clone(&self.store), self.config.clone(), job, cancel)
            .with_policy(Arc::clone(&self.policy));
        let running = Arc::clone(running);
        tokio::spawn(async move {
            match driver.run().await {
                Ok(job) => debug!(%job_id, state = %job.state, "driver finished"),
                Err(e) => error!(%job_id, error = %e, "job record unusable, driver stopped"),
            }
            running.remove(&job_id);
        });
    }
}

/// Control over a running [`Agent`].
pub struct AgentHandle {
    running: Running,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl AgentHandle {
    /// Cancel a job this worker is driving. Its current phase drains and
    /// the job finishes with that phase's outputs. Returns whether the job
    /// was found.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.running.get(job_id) {
            Some(token) => {
                info!(job_id, "cancelling job");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of the jobs currently being driven.
    pub fn active_jobs(&self) -> Vec<String> {
        self.running.iter().map(|e| e.key().clone()).collect()
    }

    /// Stop discovering new jobs. Jobs already claimed keep running.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "agent task failed");
        }
    }
}
