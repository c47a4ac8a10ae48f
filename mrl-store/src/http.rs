//! [`Store`] backed by a remote bucket service speaking the protocol in
//! [`server`](crate::server).

use std::sync::Arc;

use async_trait::async_trait;
use common::{Job, TaskGroup};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::feed::Feed;
use crate::guard::PollGuards;
use crate::lease::{JobLocks, JobOp};
use crate::server::{Entry, ErrorBody, LocateRequest};
use crate::{watch_resource, Locations, Store, EXPECT_UNASSIGNED_HEADER, FIND_RESOURCE};

struct Inner {
    config: StoreConfig,
    client: Client,
    guards: PollGuards,
    locks: JobLocks,
}

#[derive(Clone)]
pub struct HttpStore {
    inner: Arc<Inner>,
}

impl HttpStore {
    pub fn new(config: StoreConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                client,
                guards: PollGuards::new(),
                locks: JobLocks::new(),
            }),
        })
    }
}

impl Inner {
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.config.store_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Rejected {
                status: 0,
                message: format!("store url {} cannot be a base", self.config.store_url),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_record<T: DeserializeOwned>(&self, bucket: &str, key: &str) -> Result<T> {
        let url = self.url(&["m", bucket, key])?;
        let response = check(self.client.get(url).send().await?, bucket, key).await?;
        let value: Value = response.json().await?;
        decode(bucket, key, value)
    }

    async fn put_record<T: Serialize>(
        &self,
        bucket: &str,
        key: &str,
        record: &T,
        expect_unassigned: bool,
    ) -> Result<()> {
        let url = self.url(&["m", bucket, key])?;
        let mut request = self.client.put(url).json(record);
        if expect_unassigned {
            request = request.header(EXPECT_UNASSIGNED_HEADER, "true");
        }
        check(request.send().await?, bucket, key).await?;
        Ok(())
    }

    /// Every record in `bucket`. A bucket that doesn't exist yet is empty.
    async fn entries(&self, bucket: &str) -> Result<Vec<Entry>> {
        let url = self.url(&["m", bucket])?;
        let response = self
            .client
            .get(url)
            .query(&[("values", "true")])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = check(response, bucket, "").await?;
        Ok(response.json().await?)
    }

    async fn find(&self) -> Result<Vec<Job>> {
        let bucket = &self.config.jobs_bucket;
        let jobs: Vec<Job> = decode_entries(bucket, self.entries(bucket).await?, |_| true);
        Ok(jobs.into_iter().filter(Job::is_unassigned).collect())
    }

    async fn task_groups(&self, job_id: &str, phase_num: Option<u32>) -> Result<Vec<TaskGroup>> {
        let bucket = &self.config.task_groups_bucket;
        let groups: Vec<TaskGroup> = decode_entries(bucket, self.entries(bucket).await?, |value| {
            value.get("jobId").and_then(Value::as_str) == Some(job_id)
        });
        Ok(groups
            .into_iter()
            .filter(|group| phase_num.map_or(true, |n| n == group.phase_num))
            .collect())
    }
}

/// Decode the entries `keep` accepts, skipping any that don't decode.
fn decode_entries<T, F>(bucket: &str, entries: Vec<Entry>, keep: F) -> Vec<T>
where
    T: DeserializeOwned,
    F: Fn(&Value) -> bool,
{
    let mut found = Vec::new();
    for Entry { key, value } in entries {
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

fn decode<T: DeserializeOwned>(bucket: &str, key: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|source| StoreError::Decode {
        bucket: bucket.to_string(),
        key: key.to_string(),
        source,
    })
}

/// Turn a non-success response into the matching [`StoreError`].
async fn check(response: Response, bucket: &str, key: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body: ErrorBody = response.json().await.unwrap_or_default();
    Err(match status {
        StatusCode::CONFLICT => match body.owner {
            Some(owner) => StoreError::Conflict {
                job_id: key.to_string(),
                owner,
            },
            None => StoreError::Rejected {
                status: status.as_u16(),
                message: body.error,
            },
        },
        StatusCode::NOT_FOUND => StoreError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        },
        StatusCode::BAD_REQUEST => StoreError::Rejected {
            status: status.as_u16(),
            message: if body.violations.is_empty() {
                body.error
            } else {
                body.violations.join("; ")
            },
        },
        _ => StoreError::Transient(format!("{}: {}", status, body.error)),
    })
}

#[async_trait]
impl Store for HttpStore {
    fn find_unassigned_jobs(&self, feed: &Feed<Job>) {
        let inner = Arc::clone(&self.inner);
        if !inner.guards.try_begin(FIND_RESOURCE, inner.config.find_interval) {
            return;
        }

        let feed = feed.clone();
        tokio::spawn(async move {
            match inner.find().await {
                Ok(jobs) => {
                    debug!(found = jobs.len(), "searched for unassigned jobs");
                    for job in jobs {
                        feed.offer(job);
                    }
                }
                Err(e) => debug!(error = %e, "job search failed, retrying on a later tick"),
            }
            inner.guards.finish(FIND_RESOURCE);
        });
    }

    async fn assign_job(&self, job: &Job) -> Result<()> {
        job.validate()?;
        let _lease = self.inner.locks.acquire(&job.job_id, JobOp::Assign)?;
        self.inner
            .put_record(&self.inner.config.jobs_bucket, &job.job_id, job, true)
            .await?;
        info!(job_id = %job.job_id, worker = ?job.worker, "assigned job");
        Ok(())
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        job.validate()?;
        let _lease = self.inner.locks.acquire(&job.job_id, JobOp::Save)?;
        self.inner
            .put_record(&self.inner.config.jobs_bucket, &job.job_id, job, false)
            .await?;
        info!(job_id = %job.job_id, state = %job.state, "saved job");
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Job> {
        let _lease = self.inner.locks.acquire(job_id, JobOp::Get)?;
        self.inner
            .get_record(&self.inner.config.jobs_bucket, job_id)
            .await
    }

    async fn list_task_groups(&self, job_id: &str) -> Result<Vec<TaskGroup>> {
        let _lease = self.inner.locks.acquire(job_id, JobOp::ListTaskGroups)?;
        self.inner.task_groups(job_id, None).await
    }

    async fn save_task_groups(&self, groups: &[TaskGroup]) -> Result<()> {
        let mut entries = Vec::with_capacity(groups.len());
        for group in groups {
            group.validate()?;
            entries.push(Entry {
                key: group.task_group_id.clone(),
                value: serde_json::to_value(group).map_err(|source| StoreError::Decode {
                    bucket: self.inner.config.task_groups_bucket.clone(),
                    key: group.task_group_id.clone(),
                    source,
                })?,
            });
        }

        let _leases = self
            .inner
            .locks
            .acquire_all(groups.iter().map(|g| g.job_id.as_str()), JobOp::SaveTaskGroups)?;
        let bucket = &self.inner.config.task_groups_bucket;
        let url = self.inner.url(&["m", bucket])?;
        let response = self.inner.client.post(url).json(&entries).send().await?;
        check(response, bucket, "").await?;
        Ok(())
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

        let feed = feed.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            match inner.task_groups(&job_id, Some(phase_num)).await {
                Ok(groups) => {
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
        let url = self.inner.url(&["locate"])?;
        let response = self
            .inner
            .client
            .post(url)
            .json(&LocateRequest {
                keys: keys.to_vec(),
            })
            .send()
            .await?;
        let response = check(response, "locate", "").await?;
        Ok(response.json().await?)
    }
}
