use std::sync::Arc;
use std::time::Duration;

use clap::{Args, ValueEnum};
use url::Url;

use crate::error::Result;
use crate::http::HttpStore;
use crate::mock::MockStore;
use crate::Store;

/// Which store implementation to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// In-process store with simulated latency.
    Mock,

    /// Remote bucket service over HTTP.
    Http,
}

pub(crate) fn parse_millis(s: &str) -> std::result::Result<Duration, std::num::ParseIntError> {
    s.parse().map(Duration::from_millis)
}

#[derive(Debug, Clone, Args)]
pub struct StoreConfig {
    /// Store implementation.
    #[arg(long, value_enum, default_value = "mock")]
    pub backend: Backend,

    /// Base URL of the remote store (http backend only).
    #[arg(long, default_value = "http://127.0.0.1:8040/")]
    pub store_url: Url,

    /// Bucket holding job records.
    #[arg(long, default_value = "mrl_jobs")]
    pub jobs_bucket: String,

    /// Bucket holding task group records.
    #[arg(long, default_value = "mrl_taskgroups")]
    pub task_groups_bucket: String,

    /// Minimum time between searches for unassigned jobs, measured from
    /// the end of the previous search.
    #[arg(long = "find-interval-ms", default_value = "1000", value_parser = parse_millis)]
    pub find_interval: Duration,

    /// Minimum time between task group polls for one job.
    #[arg(long = "task-group-interval-ms", default_value = "1000", value_parser = parse_millis)]
    pub task_group_interval: Duration,

    /// Simulated latency of every mock store request.
    #[arg(long = "request-delay-ms", default_value = "100", value_parser = parse_millis)]
    pub request_delay: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Mock,
            store_url: Url::parse("http://127.0.0.1:8040/").expect("default store url is valid"),
            jobs_bucket: "mrl_jobs".to_string(),
            task_groups_bucket: "mrl_taskgroups".to_string(),
            find_interval: Duration::from_millis(1000),
            task_group_interval: Duration::from_millis(1000),
            request_delay: Duration::from_millis(100),
        }
    }
}

/// A connected store, keeping the concrete type around for callers that
/// need backend-specific extras (the mock's inspection surface).
#[derive(Clone)]
pub enum StoreHandle {
    Mock(MockStore),
    Http(HttpStore),
}

impl StoreHandle {
    /// Build the store selected by `config.backend`.
    pub fn connect(config: &StoreConfig) -> Result<Self> {
        match config.backend {
            Backend::Mock => Ok(StoreHandle::Mock(MockStore::new(config.clone()))),
            Backend::Http => Ok(StoreHandle::Http(HttpStore::new(config.clone())?)),
        }
    }

    pub fn store(&self) -> Arc<dyn Store> {
        match self {
            StoreHandle::Mock(store) => Arc::new(store.clone()),
            StoreHandle::Http(store) => Arc::new(store.clone()),
        }
    }

    pub fn mock(&self) -> Option<&MockStore> {
        match self {
            StoreHandle::Mock(store) => Some(store),
            StoreHandle::Http(_) => None,
        }
    }
}
