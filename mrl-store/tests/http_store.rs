use std::time::Duration;

use common::{Job, Phase, TaskGroup, TaskResult, TaskGroupState};
use mrl_store::{Backend, Feed, HttpStore, MockStore, Store, StoreConfig, StoreError};
use tokio::net::TcpListener;
use url::Url;

/// Serve a fresh mock store on an ephemeral port and connect a client to it.
async fn connect() -> (MockStore, HttpStore) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = StoreConfig {
        backend: Backend::Http,
        store_url: Url::parse(&format!("http://{}/", addr)).unwrap(),
        find_interval: Duration::ZERO,
        task_group_interval: Duration::ZERO,
        request_delay: Duration::ZERO,
        ..StoreConfig::default()
    };
    let backing = MockStore::new(config.clone());
    tokio::spawn(mrl_store::server::serve(listener, backing.clone()));

    (backing, HttpStore::new(config).unwrap())
}

fn job(id: &str) -> Job {
    Job::with_id(
        id,
        "wc",
        vec![Phase::map("wc"), Phase::reduce("wc -l", 1)],
        vec!["/a".into(), "/b".into()],
    )
}

async fn submit(backing: &MockStore, job: &Job) {
    backing
        .put("mrl_jobs", &job.job_id, serde_json::to_value(job).unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn finds_and_assigns_jobs() {
    let (backing, store) = connect().await;
    submit(&backing, &job("j1")).await;

    let (feed, mut found) = Feed::channel(4);
    store.find_unassigned_jobs(&feed);
    let mut claimed = tokio::time::timeout(Duration::from_secs(5), found.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.job_id, "j1");

    claimed.claim("w1");
    store.assign_job(&claimed).await.unwrap();

    let mut rival = job("j1");
    rival.claim("w2");
    match store.assign_job(&rival).await.unwrap_err() {
        StoreError::Conflict { owner, .. } => assert_eq!(owner, "w1"),
        other => panic!("unexpected error {other:?}"),
    }

    let stored = store.get_job("j1").await.unwrap();
    assert_eq!(stored.worker.as_deref(), Some("w1"));
}

#[tokio::test]
async fn finished_jobs_cannot_be_reopened_remotely() {
    let (backing, store) = connect().await;
    let mut running = job("j1");
    running.claim("w1");
    submit(&backing, &running).await;

    let mut done = running.clone();
    done.finish(Vec::new(), chrono::Utc::now());
    store.save_job(&done).await.unwrap();

    match store.save_job(&running).await.unwrap_err() {
        StoreError::Rejected { status, message } => {
            assert_eq!(status, 409);
            assert!(message.contains("done"), "{message}");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(store.get_job("j1").await.unwrap(), done);
}

#[tokio::test]
async fn missing_jobs_are_not_found() {
    let (_backing, store) = connect().await;

    assert!(matches!(
        store.get_job("nope").await,
        Err(StoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn task_groups_round_trip() {
    let (_backing, store) = connect().await;
    let phase = Phase::map("wc");
    let mut groups = vec![
        TaskGroup::dispatch("j1", "node0", &phase, 0, vec!["/user/a".into()]),
        TaskGroup::dispatch("j1", "node1", &phase, 0, vec!["/user/b".into()]),
        TaskGroup::dispatch("j1", "node1", &phase, 1, vec!["/user/c".into()]),
    ];
    groups[0].state = TaskGroupState::Done;
    groups[0].results.push(TaskResult::ok("/user/a", vec!["/out/a".into()]));

    store.save_task_groups(&groups).await.unwrap();

    let mut listed = store.list_task_groups("j1").await.unwrap();
    listed.sort_by(|a, b| a.input_keys.cmp(&b.input_keys));
    assert_eq!(listed, groups);

    let (feed, mut seen) = Feed::channel(4);
    store.watch_task_groups("j1", 0, &feed);
    let phase_zero = tokio::time::timeout(Duration::from_secs(5), seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(phase_zero.len(), 2);
    assert!(phase_zero.iter().all(|g| g.phase_num == 0));
}

#[tokio::test]
async fn invalid_records_are_refused_locally() {
    let (backing, store) = connect().await;
    let mut bad = job("j1");
    bad.job_name.clear();
    bad.phases.clear();

    assert!(matches!(
        store.save_job(&bad).await,
        Err(StoreError::Validation(_))
    ));
    assert!(backing.get("mrl_jobs", "j1").await.is_none());
}

#[tokio::test]
async fn locate_uses_the_store_placement() {
    let (_backing, store) = connect().await;
    let keys = vec!["/x".to_string(), "/y".to_string()];

    let located = store.locate(&keys).await.unwrap();

    assert_eq!(located["/x"], vec!["node0".to_string()]);
    assert_eq!(located["/y"], vec!["node1".to_string()]);
}
