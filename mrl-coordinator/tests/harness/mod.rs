//! Test harness: a mock store, coordinators driving it, and a fake execution
//! host that completes whatever gets dispatched.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{
    Job, JobState, PhaseType, TaskError, TaskGroup, TaskGroupState, TaskResult, EJ_USER,
};
use mrl_coordinator::{Agent, AgentHandle, CoordinatorConfig};
use mrl_store::{Feed, Locations, MockStore, Store, StoreConfig, StoreError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const JOBS: &str = "mrl_jobs";
pub const TASK_GROUPS: &str = "mrl_taskgroups";

/// Shorter intervals than production so scenarios settle quickly.
pub fn test_store_config() -> StoreConfig {
    StoreConfig {
        find_interval: Duration::from_millis(200),
        task_group_interval: Duration::from_millis(200),
        request_delay: Duration::from_millis(20),
        ..StoreConfig::default()
    }
}

pub fn test_coordinator_config() -> CoordinatorConfig {
    CoordinatorConfig {
        tick: Duration::from_millis(50),
        retry_delay: Duration::from_millis(50),
        retry_max_delay: Duration::from_millis(400),
        ..CoordinatorConfig::default()
    }
}

pub fn keys(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Output a map task produces for `input` in phase `phase_num`.
pub fn map_output(input: &str, phase_num: u32) -> String {
    format!("{}.{}.out", input, phase_num)
}

/// Stands in for the execution hosts. Every dispatched group is finished
/// with one result per task:
///
/// * inputs containing `abort` fail with `EJ_USER`;
/// * inputs containing `hang` are never answered (the group stays running);
/// * inputs containing `discard` also report a discarded and a partial object;
/// * everything else succeeds with one output.
pub struct FakeHost {
    held: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl FakeHost {
    pub fn spawn(store: MockStore) -> Self {
        let held = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(Self::run(store, Arc::clone(&held)));
        Self { held, task }
    }

    /// Stop completing groups until `release`.
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
    }

    async fn run(store: MockStore, held: Arc<AtomicBool>) {
        loop {
            tokio::time::sleep(Duration::from_millis(30)).await;
            if held.load(Ordering::SeqCst) {
                continue;
            }
            for (key, value) in store.records(TASK_GROUPS).await {
                let Ok(group) = serde_json::from_value::<TaskGroup>(value) else {
                    continue;
                };
                if group.state != TaskGroupState::Dispatched {
                    continue;
                }
                let group = execute(group);
                store
                    .put(TASK_GROUPS, &key, serde_json::to_value(&group).unwrap())
                    .await
                    .unwrap();
            }
        }
    }
}

impl Drop for FakeHost {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn run_task(input: &str, phase_num: u32) -> TaskResult {
    if input.contains("abort") {
        return TaskResult::fail(
            input,
            TaskError::new(EJ_USER, "user command or child process dumped core"),
        );
    }
    let mut result = TaskResult::ok(input, vec![map_output(input, phase_num)]);
    if input.contains("discard") {
        result.discarded = vec![format!("{}.discarded", input)];
        result.partials = vec![format!("{}.partial", input)];
    }
    result
}

fn execute(mut group: TaskGroup) -> TaskGroup {
    let hangs = group.input_keys.iter().any(|k| k.contains("hang"));

    if group.phase.kind == PhaseType::Reduce {
        let input = format!("reduce.{}.{}", group.phase_num, group.partition.unwrap_or(0));
        group.results = vec![TaskResult::ok(&input, vec![format!("/{}.out", input)])];
    } else {
        group.results = group
            .input_keys
            .iter()
            .filter(|k| !k.contains("hang"))
            .map(|k| run_task(k, group.phase_num))
            .collect();
    }

    group.state = if hangs {
        TaskGroupState::Running
    } else {
        TaskGroupState::Done
    };
    group
}

/// A mock store whose job record can be made unreachable or unreadable.
/// Everything else passes straight through.
#[derive(Clone)]
pub struct FaultyStore {
    pub inner: MockStore,
    outage_until: Arc<Mutex<Option<Instant>>>,
    unreadable: Arc<AtomicBool>,
}

impl FaultyStore {
    pub fn new(inner: MockStore) -> Self {
        Self {
            inner,
            outage_until: Arc::new(Mutex::new(None)),
            unreadable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fail every job read and write transiently for `length`.
    pub fn outage(&self, length: Duration) {
        *self.outage_until.lock().unwrap() = Some(Instant::now() + length);
    }

    /// Refuse every job read from now on.
    pub fn make_unreadable(&self) {
        self.unreadable.store(true, Ordering::SeqCst);
    }

    fn check_outage(&self) -> mrl_store::Result<()> {
        match *self.outage_until.lock().unwrap() {
            Some(until) if Instant::now() < until => {
                Err(StoreError::Transient("store unreachable".into()))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Store for FaultyStore {
    fn find_unassigned_jobs(&self, feed: &Feed<Job>) {
        self.inner.find_unassigned_jobs(feed)
    }

    async fn assign_job(&self, job: &Job) -> mrl_store::Result<()> {
        self.inner.assign_job(job).await
    }

    async fn save_job(&self, job: &Job) -> mrl_store::Result<()> {
        self.check_outage()?;
        self.inner.save_job(job).await
    }

    async fn get_job(&self, job_id: &str) -> mrl_store::Result<Job> {
        self.check_outage()?;
        if self.unreadable.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected {
                status: 400,
                message: format!("job {} is unreadable", job_id),
            });
        }
        self.inner.get_job(job_id).await
    }

    async fn list_task_groups(&self, job_id: &str) -> mrl_store::Result<Vec<TaskGroup>> {
        self.inner.list_task_groups(job_id).await
    }

    async fn save_task_groups(&self, groups: &[TaskGroup]) -> mrl_store::Result<()> {
        self.inner.save_task_groups(groups).await
    }

    fn watch_task_groups(&self, job_id: &str, phase_num: u32, feed: &Feed<Vec<TaskGroup>>) {
        self.inner.watch_task_groups(job_id, phase_num, feed)
    }

    fn unwatch_task_groups(&self, job_id: &str) {
        self.inner.unwatch_task_groups(job_id)
    }

    async fn locate(&self, keys: &[String]) -> mrl_store::Result<Locations> {
        self.inner.locate(keys).await
    }
}

/// A mock store with one coordinator and a fake host attached.
pub struct Cluster {
    pub store: MockStore,
    pub host: FakeHost,
    pub agent: AgentHandle,
}

impl Cluster {
    pub fn start() -> Self {
        Self::with_config(test_coordinator_config())
    }

    pub fn with_config(config: CoordinatorConfig) -> Self {
        let store = MockStore::new(test_store_config());
        let host = FakeHost::spawn(store.clone());
        let agent = Agent::new("worker-1", Arc::new(store.clone()), config).spawn();
        Self { store, host, agent }
    }

    pub async fn submit(&self, job: &Job) {
        submit(&self.store, job).await;
    }

    pub async fn job(&self, job_id: &str) -> Option<Job> {
        read_job(&self.store, job_id).await
    }

    pub async fn wait_done(&self, job_id: &str) -> Job {
        wait_done(&self.store, job_id).await
    }

    pub async fn task_groups(&self, job_id: &str) -> Vec<TaskGroup> {
        task_groups(&self.store, job_id).await
    }
}

pub async fn submit(store: &MockStore, job: &Job) {
    store
        .put(JOBS, &job.job_id, serde_json::to_value(job).unwrap())
        .await
        .unwrap();
}

pub async fn read_job(store: &MockStore, job_id: &str) -> Option<Job> {
    store
        .get(JOBS, job_id)
        .await
        .map(|value| serde_json::from_value(value).unwrap())
}

pub async fn task_groups(store: &MockStore, job_id: &str) -> Vec<TaskGroup> {
    store
        .records(TASK_GROUPS)
        .await
        .into_iter()
        .map(|(_, value)| serde_json::from_value::<TaskGroup>(value).unwrap())
        .filter(|g| g.job_id == job_id)
        .collect()
}

/// Wait (in virtual time) until the stored job is done.
pub async fn wait_done(store: &MockStore, job_id: &str) -> Job {
    wait_for(store, job_id, |job| job.state == JobState::Done).await
}

pub async fn wait_for(store: &MockStore, job_id: &str, done: impl Fn(&Job) -> bool) -> Job {
    let poll = async {
        loop {
            if let Some(job) = read_job(store, job_id).await {
                if done(&job) {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(600), poll)
        .await
        .unwrap_or_else(|_| panic!("job {} did not reach the expected state", job_id))
}

/// Wait until the job's groups for `phase_num` have been dispatched.
pub async fn wait_for_groups(store: &MockStore, job_id: &str, phase_num: u32) -> Vec<TaskGroup> {
    let poll = async {
        loop {
            let groups: Vec<TaskGroup> = task_groups(store, job_id)
                .await
                .into_iter()
                .filter(|g| g.phase_num == phase_num)
                .collect();
            if !groups.is_empty() {
                return groups;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(600), poll)
        .await
        .unwrap_or_else(|_| panic!("job {} never dispatched phase {}", job_id, phase_num))
}
