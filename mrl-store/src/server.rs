//! HTTP face of a [`MockStore`].
//!
//! Lets `mrl-ctl` and [`HttpStore`](crate::HttpStore) reach an in-process
//! store: submit jobs, end their input, and inspect every record while
//! coordinators run.
//!
//! | Route                      | Meaning                                   |
//! |----------------------------|-------------------------------------------|
//! | `GET  /m`                  | bucket names                              |
//! | `GET  /m/{bucket}`         | keys (`?values=true` for key/value pairs) |
//! | `GET  /m/{bucket}/{key}`   | one record                                |
//! | `PUT  /m/{bucket}/{key}`   | write one record                          |
//! | `PATCH /m/{bucket}/{key}`  | replace some fields of one record         |
//! | `POST /m/{bucket}`         | write a batch of records                  |
//! | `POST /locate`             | resolve keys to storage nodes             |

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::mock::MockStore;
use crate::{Locations, EXPECT_UNASSIGNED_HEADER};

/// One record in a listing or batch write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,

    /// Current owner, on an assignment conflict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// Schema violations, on a rejected write.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LocateRequest {
    pub keys: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    #[serde(default)]
    values: bool,
}

struct ApiError(StatusCode, ErrorBody);

impl ApiError {
    fn not_found(what: String) -> Self {
        ApiError(
            StatusCode::NOT_FOUND,
            ErrorBody {
                error: format!("{} not found", what),
                ..ErrorBody::default()
            },
        )
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let error = e.to_string();
        match e {
            StoreError::Validation(v) => ApiError(
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error,
                    violations: v.violations.iter().map(ToString::to_string).collect(),
                    ..ErrorBody::default()
                },
            ),
            StoreError::Conflict { owner, .. } => ApiError(
                StatusCode::CONFLICT,
                ErrorBody {
                    error,
                    owner: Some(owner),
                    ..ErrorBody::default()
                },
            ),
            StoreError::Settled { .. } => ApiError(
                StatusCode::CONFLICT,
                ErrorBody {
                    error,
                    ..ErrorBody::default()
                },
            ),
            StoreError::NotFound { .. } => ApiError(
                StatusCode::NOT_FOUND,
                ErrorBody {
                    error,
                    ..ErrorBody::default()
                },
            ),
            _ => ApiError(
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody {
                    error,
                    ..ErrorBody::default()
                },
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(self.1)).into_response()
    }
}

/// Routes over `store`.
pub fn router(store: MockStore) -> Router {
    Router::new()
        .route("/m", get(list_buckets))
        .route("/m/{bucket}", get(list_bucket).post(put_batch))
        .route(
            "/m/{bucket}/{key}",
            get(get_record).put(put_record).patch(patch_record),
        )
        .route("/locate", post(locate))
        .with_state(store)
}

/// Serve `store` on an already-bound listener until the task is dropped.
pub async fn serve(listener: TcpListener, store: MockStore) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "serving store");
    axum::serve(listener, router(store)).await
}

async fn list_buckets(State(store): State<MockStore>) -> Json<Vec<String>> {
    Json(store.buckets().await)
}

async fn list_bucket(
    State(store): State<MockStore>,
    Path(bucket): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    if query.values {
        let entries: Vec<Entry> = store
            .records(&bucket)
            .await
            .into_iter()
            .map(|(key, value)| Entry { key, value })
            .collect();
        return Ok(Json(entries).into_response());
    }

    match store.list(&bucket).await {
        Some(keys) => Ok(Json(keys).into_response()),
        None => Err(ApiError::not_found(format!("bucket {}", bucket))),
    }
}

async fn get_record(
    State(store): State<MockStore>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    store
        .get(&bucket, &key)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("{}/{}", bucket, key)))
}

async fn put_record(
    State(store): State<MockStore>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    Json(value): Json<Value>,
) -> Result<StatusCode, ApiError> {
    let expect_unassigned = headers
        .get(EXPECT_UNASSIGNED_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));

    if expect_unassigned {
        store.put_if_unassigned(&bucket, &key, value).await?;
    } else {
        store.put(&bucket, &key, value).await?;
    }
    debug!(%bucket, %key, expect_unassigned, "record written over http");
    Ok(StatusCode::NO_CONTENT)
}

async fn patch_record(
    State(store): State<MockStore>,
    Path((bucket, key)): Path<(String, String)>,
    Json(fields): Json<Map<String, Value>>,
) -> Result<Json<Value>, ApiError> {
    let patched = store.patch(&bucket, &key, fields).await?;
    debug!(%bucket, %key, "record patched over http");
    Ok(Json(patched))
}

async fn put_batch(
    State(store): State<MockStore>,
    Path(bucket): Path<String>,
    Json(entries): Json<Vec<Entry>>,
) -> Result<StatusCode, ApiError> {
    let records = entries.into_iter().map(|e| (e.key, e.value)).collect();
    store.put_many(&bucket, records).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn locate(
    State(store): State<MockStore>,
    Json(request): Json<LocateRequest>,
) -> Json<Locations> {
    Json(store.locate_now(&request.keys))
}

#[cfg(test)]
mod tests {
    use common::{Job, Phase};
    use serde_json::json;

    use super::*;
    use crate::config::StoreConfig;

    fn job_value(id: &str, worker: Option<&str>) -> Value {
        let mut job = Job::with_id(id, "wc", vec![Phase::map("wc")], vec!["/a".into()]);
        if let Some(worker) = worker {
            job.claim(worker);
        }
        serde_json::to_value(job).unwrap()
    }

    #[tokio::test]
    async fn validation_failures_carry_violations() {
        let err: ApiError = MockStore::new(StoreConfig::default())
            .put("mrl_jobs", "j1", json!({ "jobId": "j1" }))
            .await
            .unwrap_err()
            .into();

        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert!(!err.1.violations.is_empty());
    }

    #[tokio::test]
    async fn conflicts_name_the_owner() {
        let store = MockStore::new(StoreConfig::default());
        store.put("mrl_jobs", "j1", job_value("j1", Some("w1"))).await.unwrap();

        let err: ApiError = store
            .put_if_unassigned("mrl_jobs", "j1", job_value("j1", Some("w2")))
            .await
            .unwrap_err()
            .into();

        assert_eq!(err.0, StatusCode::CONFLICT);
        assert_eq!(err.1.owner.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn settled_jobs_answer_conflict_without_an_owner() {
        let store = MockStore::new(StoreConfig::default());
        let mut done: Job = serde_json::from_value(job_value("j1", Some("w1"))).unwrap();
        done.finish(Vec::new(), chrono::Utc::now());
        store
            .put("mrl_jobs", "j1", serde_json::to_value(&done).unwrap())
            .await
            .unwrap();

        let err: ApiError = store
            .put("mrl_jobs", "j1", job_value("j1", Some("w1")))
            .await
            .unwrap_err()
            .into();

        assert_eq!(err.0, StatusCode::CONFLICT);
        assert!(err.1.owner.is_none());
        assert!(err.1.error.contains("done"), "{}", err.1.error);
    }

    #[tokio::test]
    async fn patch_route_returns_the_merged_record() {
        let store = MockStore::new(StoreConfig::default());
        store.put("mrl_jobs", "j1", job_value("j1", Some("w1"))).await.unwrap();

        let mut fields = Map::new();
        fields.insert("timeCancelled".into(), json!("2026-01-01T00:00:00Z"));
        let Json(patched) = patch_record(
            State(store.clone()),
            Path(("mrl_jobs".to_string(), "j1".to_string())),
            Json(fields),
        )
        .await
        .map_err(|e| e.1.error)
        .unwrap();

        assert_eq!(patched["timeCancelled"], "2026-01-01T00:00:00Z");
        assert_eq!(store.get("mrl_jobs", "j1").await, Some(patched));
    }
}
