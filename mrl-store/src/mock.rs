//! In-memory store for tests and single-process deployments.
//!
//! Keeps the same contract as a real store: every request takes
//! `request_delay` to complete, polling is throttled per resource, and only
//! one operation per job may be outstanding.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::{validate, Job, JobState, RecordKind, TaskGroup};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::feed::Feed;
use crate::guard::PollGuards;
use crate::lease::{JobLocks, JobOp};
use crate::{watch_resource, Locations, Store, FIND_RESOURCE};

type Bucket = BTreeMap<String, Value>;

struct Inner {
    config: StoreConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
    guards: PollGuards,
    locks: JobLocks,

    /// Number of upcoming requests that should fail.
    failures: AtomicU32,

    /// Total requests issued, for observing throttling.
    requests: AtomicU64,
}

#[derive(Clone)]
pub struct MockStore {
    inner: Arc<Inner>,
}

impl MockStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                buckets: Mutex::new(HashMap::new()),
                guards: PollGuards::new(),
                locks: JobLocks::new(),
                failures: AtomicU32::new(0),
                requests: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Make the next `n` requests fail as if the store were unreachable.
    pub fn fail_next(&self, n: u32) {
        self.inner.failures.store(n, Ordering::SeqCst);
    }

    /// Number of requests issued so far.
    pub fn requests(&self) -> u64 {
        self.inner.requests.load(Ordering::SeqCst)
    }

    /// The operation currently outstanding for `job_id`, if any.
    pub fn outstanding(&self, job_id: &str) -> Option<JobOp> {
        self.inner.locks.outstanding(job_id)
    }

    /////////////////////////////////////////////////////////////////////////
    // Generic bucket access. No simulated latency, no per-job leases.
    /////////////////////////////////////////////////////////////////////////

    /// Store `value` under `bucket/key`, overwriting what's there.
    ///
    /// Job records only move forward: a write can't take a job back to an
    /// earlier state, change a done job, reset its cancel or end-of-input
    /// time, or change its input keys after input has ended.
    pub async fn put(&self, bucket: &str, key: &str, value: Value) -> Result<()> {
        self.inner.put(bucket, key, value).await
    }

    /// Replace the given top-level fields of an existing record in one
    /// step and return the result. A `null` field is removed.
    pub async fn patch(&self, bucket: &str, key: &str, fields: Map<String, Value>) -> Result<Value> {
        self.inner.patch(bucket, key, fields).await
    }

    /// Store several records in one step. Nothing is written unless every
    /// record is valid.
    pub async fn put_many(&self, bucket: &str, records: Vec<(String, Value)>) -> Result<()> {
        self.inner.put_many(bucket, records).await
    }

    /// Store `value` only if the existing record names no worker.
    pub async fn put_if_unassigned(&self, bucket: &str, key: &str, value: Value) -> Result<()> {
        self.inner.put_if_unassigned(bucket, key, value).await
    }

    pub async fn get(&self, bucket: &str, key: &str) -> Option<Value> {
        let buckets = self.inner.buckets.lock().await;
        buckets.get(bucket).and_then(|b| b.get(key)).cloned()
    }

    /// Keys in `bucket`, or `None` if the bucket doesn't exist.
    pub async fn list(&self, bucket: &str) -> Option<Vec<String>> {
        let buckets = self.inner.buckets.lock().await;
        buckets.get(bucket).map(|b| b.keys().cloned().collect())
    }

    /// Every record in `bucket`, in key order.
    pub async fn records(&self, bucket: &str) -> Vec<(String, Value)> {
        self.inner.records(bucket).await
    }

    pub async fn buckets(&self) -> Vec<String> {
        let buckets = self.inner.buckets.lock().await;
        let mut names: Vec<String> = buckets.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve keys to the nodes holding them without simulated latency.
    ///
    /// The i-th key of a request lives on `node{i % 3}`.
    pub fn locate_now(&self, keys: &[String]) -> Locations {
        keys.iter()
            .enumerate()
            .map(|(i, key)| (key.clone(), vec![format!("node{}", i % 3)]))
            .collect()
    }
}

impl Inner {
    /// Simulate one round trip to the store.
    async fn request(&self) -> Result<()> {
        self.issue();
        self.round_trip().await
    }

    /// Count a request as issued. Polls count at the moment they are
    /// started, not when their background task first runs.
    fn issue(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }

    async fn round_trip(&self) -> Result<()> {
        tokio::time::sleep(self.config.request_delay).await;

        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Transient("injected failure".to_string()));
        }
        Ok(())
    }

    fn check(&self, bucket: &str, value: &Value) -> Result<()> {
        if bucket == self.config.jobs_bucket {
            validate(RecordKind::Job, value)?;
        } else if bucket == self.config.task_groups_bucket {
            validate(RecordKind::TaskGroup, value)?;
        }
        Ok(())
    }

    /// Reconcile a job record about to replace `stored`.
    fn settle(&self, bucket: &str, key: &str, stored: Option<&Value>, value: &mut Value) -> Result<()> {
        let Some(stored) = stored else {
            return Ok(());
        };
        if bucket != self.config.jobs_bucket {
            return Ok(());
        }
        let settled = |reason: &str| StoreError::Settled {
            job_id: key.to_string(),
            reason: reason.to_string(),
        };

        if let Value::Object(record) = &mut *value {
            for marker in ["timeCancelled", "timeInputDone"] {
                if let Some(first) = stored.get(marker).filter(|v| !v.is_null()) {
                    record.insert(marker.to_string(), first.clone());
                }
            }
        }

        let state = |v: &Value| {
            v.get("state")
                .and_then(|s| serde_json::from_value::<JobState>(s.clone()).ok())
        };
        match (state(stored), state(&*value)) {
            (Some(JobState::Done), _) if *stored != *value => return Err(settled("it is done")),
            (Some(before), Some(after)) if after < before => {
                return Err(settled(&format!("it is {before} and can't go back to {after}")));
            }
            _ => {}
        }

        let input_done = stored.get("timeInputDone").is_some_and(|v| !v.is_null());
        if input_done && stored.get("inputKeys") != value.get("inputKeys") {
            return Err(settled("its input has ended"));
        }
        Ok(())
    }

    async fn put(&self, bucket: &str, key: &str, mut value: Value) -> Result<()> {
        self.check(bucket, &value)?;

        let mut buckets = self.buckets.lock().await;
        let target = buckets.entry(bucket.to_string()).or_default();
        self.settle(bucket, key, target.get(key), &mut value)?;
        target.insert(key.to_string(), value);
        debug!(bucket, key, "saved record");
        Ok(())
    }

    async fn patch(&self, bucket: &str, key: &str, fields: Map<String, Value>) -> Result<Value> {
        let mut buckets = self.buckets.lock().await;
        let current = buckets
            .get_mut(bucket)
            .and_then(|b| b.get_mut(key))
            .ok_or_else(|| StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        let mut value = current.clone();
        let Value::Object(record) = &mut value else {
            return Err(StoreError::Rejected {
                status: 400,
                message: format!("{}/{} is not an object", bucket, key),
            });
        };
        for (field, update) in fields {
            if update.is_null() {
                record.remove(&field);
            } else {
                record.insert(field, update);
            }
        }

        self.check(bucket, &value)?;
        self.settle(bucket, key, Some(&*current), &mut value)?;
        *current = value.clone();
        debug!(bucket, key, "patched record");
        Ok(value)
    }

    async fn put_many(&self, bucket: &str, mut records: Vec<(String, Value)>) -> Result<()> {
        for (_, value) in &records {
            self.check(bucket, value)?;
        }

        let mut buckets = self.buckets.lock().await;
        let target = buckets.entry(bucket.to_string()).or_default();
        for (key, value) in &mut records {
            self.settle(bucket, key, target.get(key.as_str()), value)?;
        }
        let count = records.len();
        for (key, value) in records {
            target.insert(key, value);
        }
        debug!(bucket, count, "saved records");
        Ok(())
    }

    async fn put_if_unassigned(&self, bucket: &str, key: &str, mut value: Value) -> Result<()> {
        self.check(bucket, &value)?;

        let mut buckets = self.buckets.lock().await;
        let current = buckets
            .get_mut(bucket)
            .and_then(|b| b.get_mut(key))
            .ok_or_else(|| StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        if let Some(owner) = current.get("worker").and_then(Value::as_str) {
            if !owner.is_empty() {
                return Err(StoreError::Conflict {
                    job_id: key.to_string(),
                    owner: owner.to_string(),
                });
            }
        }

        self.settle(bucket, key, Some(&*current), &mut value)?;
        *current = value;
        debug!(bucket, key, "assigned record");
        Ok(())
    }

    async fn records(&self, bucket: &str) -> Vec<(String, Value)> {
        let buckets = self.buckets.lock().await;
        buckets
            .get(bucket)
            .map(|b| b.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Decode every record in `bucket` that `keep` accepts, skipping (and
    /// logging) records that don't parse.
    async fn decode_where<T, F>(&self, bucket: &str, keep: F) -> Vec<T>
    where
        T: DeserializeOwned,
        F: Fn(&Value) -> bool,
    {
        let mut found = Vec::new();
        for (key, value) in self.records(bucket).await {
            if !keep(&value) {
                continue;
            }
            match serde_json::from_value(value) {
                Ok(record) => found.push(record),
                Err(e) => warn!(bucket, %key, error = %e, "skipping malformed record"),
            }
        }
        found
    }
}

fn encode<T: Serialize>(bucket: &str, key: &str, record: &T) -> Result<Value> {
    serde_json::to_value(record).map_err(|source| StoreError::Decode {
        bucket: bucket.to_string(),
        key: key.to_string(),
        source,
    })
}

fn belongs_to(value: &Value, job_id: &str) -> bool {
    value.get("jobId").and_then(Value::as_str) == Some(job_id)
}

#[async_trait]
impl Store for MockStore {
    fn find_unassigned_jobs(&self, feed: &Feed<Job>) {
        let inner = Arc::clone(&self.inner);
        if !inner.guards.try_begin(FIND_RESOURCE, inner.config.find_interval) {
            return;
        }

        inner.issue();
        let feed = feed.clone();
        tokio::spawn(async move {
            match inner.round_trip().await {
                Ok(()) => {
                    let jobs: Vec<Job> = inner
                        .decode_where(&inner.config.jobs_bucket, |_| true)
                        .await;
                    let mut found = 0;
                    for job in jobs.into_iter().filter(Job::is_unassigned) {
                        found += 1;
                        feed.offer(job);
                    }
                    debug!(found, "searched for unassigned jobs");
                }
                Err(e) => debug!(error = %e, "job search failed, retrying on a later tick"),
            }
            inner.guards.finish(FIND_RESOURCE);
        });
    }

    async fn assign_job(&self, job: &Job) -> Result<()> {
        job.validate()?;
        let bucket = &self.inner.config.jobs_bucket;
        let value = encode(bucket, &job.job_id, job)?;

        let _lease = self.inner.locks.acquire(&job.job_id, JobOp::Assign)?;
        self.inner.request().await?;
        self.inner.put_if_unassigned(bucket, &job.job_id, value).await?;
        info!(job_id = %job.job_id, worker = ?job.worker, "assigned job");
        Ok(())
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        job.validate()?;
        let bucket = &self.inner.config.jobs_bucket;
        let value = encode(bucket, &job.job_id, job)?;

        let _lease = self.inner.locks.acquire(&job.job_id, JobOp::Save)?;
        self.inner.request().await?;
        self.inner.put(bucket, &job.job_id, value).await?;
        info!(job_id = %job.job_id, state = %job.state, "saved job");
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Job> {
        let bucket = &self.inner.config.jobs_bucket;

        let _lease = self.inner.locks.acquire(job_id, JobOp::Get)?;
        self.inner.request().await?;
        let value = self.get(bucket, job_id).await.ok_or_else(|| StoreError::NotFound {
            bucket: bucket.clone(),
            key: job_id.to_string(),
        })?;
        serde_json::from_value(value).map_err(|source| StoreError::Decode {
            bucket: bucket.clone(),
            key: job_id.to_string(),
            source,
        })
    }

    async fn list_task_groups(&self, job_id: &str) -> Result<Vec<TaskGroup>> {
        let bucket = &self.inner.config.task_groups_bucket;

        let _lease = self.inner.locks.acquire(job_id, JobOp::ListTaskGroups)?;
        self.inner.request().await?;

        let mut groups = Vec::new();
        for (key, value) in self.inner.records(bucket).await {
            if !belongs_to(&value, job_id) {
                continue;
            }
            let group = serde_json::from_value(value).map_err(|source| StoreError::Decode {
                bucket: bucket.clone(),
                key,
                source,
            })?;
            groups.push(group);
        }
        Ok(groups)
    }

    async fn save_task_groups(&self, groups: &[TaskGroup]) -> Result<()> {
        let bucket = &self.inner.config.task_groups_bucket;
        let mut records = Vec::with_capacity(groups.len());
        for group in groups {
            group.validate()?;
            records.push((
                group.task_group_id.clone(),
                encode(bucket, &group.task_group_id, group)?,
            ));
        }

        let _leases = self
            .inner
            .locks
            .acquire_all(groups.iter().map(|g| g.job_id.as_str()), JobOp::SaveTaskGroups)?;
        self.inner.request().await?;
        self.inner.put_many(bucket, records).await
    }

    fn watch_task_groups(&self, job_id: &str, phase_num: u32, feed: &Feed<Vec<TaskGroup>>) {
        let inner = Arc::clone(&self.inner);
        let resource = watch_resource(job_id);
        if !inner
            .guards
            .try_begin(&resource, inner.config.task_group_interval)
        {
            return;
        }

        inner.issue();
        let feed = feed.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            match inner.round_trip().await {
                Ok(()) => {
                    let groups: Vec<TaskGroup> = inner
                        .decode_where(&inner.config.task_groups_bucket, |value| {
                            belongs_to(value, &job_id)
                                && value.get("phaseNum").and_then(Value::as_u64)
                                    == Some(u64::from(phase_num))
                        })
                        .await;
                    feed.offer(groups);
                }
                Err(e) => debug!(%job_id, error = %e, "task group poll failed, retrying on a later tick"),
            }
            inner.guards.finish(&resource);
        });
    }

    fn unwatch_task_groups(&self, job_id: &str) {
        self.inner.guards.forget(&watch_resource(job_id));
    }

    async fn locate(&self, keys: &[String]) -> Result<Locations> {
        self.inner.request().await?;
        Ok(self.locate_now(keys))
    }
}
