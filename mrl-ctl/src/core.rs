use anyhow::{bail, Context};
use chrono::Utc;
use common::{Job, Phase};
use reqwest::{Client, Response};
use serde_json::{json, Value};
use url::Url;

/// Talks to a coordinator's store server.
pub struct Ctl {
    client: Client,
    base: Url,
    jobs_bucket: String,
}

impl Ctl {
    pub fn new(base: Url, jobs_bucket: String) -> Self {
        Self {
            client: Client::new(),
            base,
            jobs_bucket,
        }
    }

    fn url(&self, segments: &[&str]) -> anyhow::Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("{} cannot be a base url", self.base))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_value(&self, bucket: &str, key: &str) -> anyhow::Result<Value> {
        let response = self.client.get(self.url(&["m", bucket, key])?).send().await?;
        Ok(ok(response).await?.json().await?)
    }

    async fn put_value(&self, bucket: &str, key: &str, value: &Value) -> anyhow::Result<()> {
        let response = self
            .client
            .put(self.url(&["m", bucket, key])?)
            .json(value)
            .send()
            .await?;
        ok(response).await?;
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> anyhow::Result<Job> {
        let value = self.get_value(&self.jobs_bucket, job_id).await?;
        serde_json::from_value(value).with_context(|| format!("decoding job {}", job_id))
    }

    async fn put_job(&self, job: &Job) -> anyhow::Result<()> {
        self.put_value(&self.jobs_bucket, &job.job_id, &serde_json::to_value(job)?)
            .await
    }

    /// Change some fields of a job in one request. The store refuses
    /// changes to a job that is done.
    async fn patch_job(&self, job_id: &str, fields: Value) -> anyhow::Result<Job> {
        let response = self
            .client
            .patch(self.url(&["m", &self.jobs_bucket, job_id])?)
            .json(&fields)
            .send()
            .await?;
        let value: Value = ok(response).await?.json().await?;
        serde_json::from_value(value).with_context(|| format!("decoding job {}", job_id))
    }

    pub async fn buckets(&self) -> anyhow::Result<()> {
        let response = self.client.get(self.url(&["m"])?).send().await?;
        let names: Vec<String> = ok(response).await?.json().await?;
        for name in names {
            println!("{}", name);
        }
        Ok(())
    }

    pub async fn list(&self, bucket: &str, values: bool) -> anyhow::Result<()> {
        let mut request = self.client.get(self.url(&["m", bucket])?);
        if values {
            request = request.query(&[("values", "true")]);
        }
        let listing: Value = ok(request.send().await?).await?.json().await?;
        if values {
            println!("{}", serde_json::to_string_pretty(&listing)?);
        } else {
            for key in listing.as_array().into_iter().flatten() {
                println!("{}", key.as_str().unwrap_or_default());
            }
        }
        Ok(())
    }

    pub async fn get(&self, bucket: &str, key: &str) -> anyhow::Result<()> {
        let value = self.get_value(bucket, key).await?;
        println!("{}", serde_json::to_string_pretty(&value)?);
        Ok(())
    }

    pub async fn put(&self, bucket: &str, key: &str, value: &str) -> anyhow::Result<()> {
        let value: Value = serde_json::from_str(value).context("value is not valid JSON")?;
        self.put_value(bucket, key, &value).await
    }

    pub async fn submit(
        &self,
        name: String,
        phases: Vec<Phase>,
        stream: bool,
        inputs: Vec<String>,
    ) -> anyhow::Result<()> {
        if inputs.is_empty() && !stream {
            bail!("a job needs input keys unless it is submitted with --stream");
        }
        let mut job = Job::new(name, phases, inputs);
        if stream {
            job = job.streaming();
        }
        self.put_job(&job).await?;
        println!("{}", job.job_id);
        Ok(())
    }

    pub async fn add_input(&self, job_id: &str, inputs: Vec<String>) -> anyhow::Result<()> {
        let job = self.get_job(job_id).await?;
        if !job.input_streaming || job.time_input_done.is_some() {
            bail!("job {} is not accepting input", job_id);
        }
        let mut keys = job.input_keys;
        keys.extend(inputs);
        let job = self.patch_job(job_id, json!({ "inputKeys": keys })).await?;
        println!("{} inputs", job.input_keys.len());
        Ok(())
    }

    /// The store keeps the first end-of-input time if input already ended.
    pub async fn end_input(&self, job_id: &str) -> anyhow::Result<()> {
        self.patch_job(job_id, json!({ "timeInputDone": Utc::now() }))
            .await?;
        Ok(())
    }

    pub async fn cancel(&self, job_id: &str) -> anyhow::Result<()> {
        self.patch_job(job_id, json!({ "timeCancelled": Utc::now() }))
            .await?;
        Ok(())
    }

    pub async fn jobs(&self) -> anyhow::Result<()> {
        let response = self
            .client
            .get(self.url(&["m", &self.jobs_bucket])?)
            .query(&[("values", "true")])
            .send()
            .await?;
        let entries: Vec<Value> = ok(response).await?.json().await?;

        println!("[Jobs]");
        for entry in entries {
            let Some(value) = entry.get("value").cloned() else {
                continue;
            };
            match serde_json::from_value::<Job>(value) {
                Ok(job) => println!("{}", summarize(&job)),
                Err(e) => println!("(malformed job: {})", e),
            }
        }
        Ok(())
    }
}

fn summarize(job: &Job) -> String {
    let s = &job.stats;
    format!(
        "{} {:<8} {:<10} worker={} inputs={} tasks={} ok={} fail={} outputs={}",
        job.job_id,
        job.state.to_string(),
        job.job_name,
        job.worker.as_deref().unwrap_or("-"),
        job.input_keys.len(),
        s.n_tasks_dispatched,
        s.n_tasks_committed_ok,
        s.n_tasks_committed_fail,
        job.output_keys.len(),
    )
}

async fn ok(response: Response) -> anyhow::Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    bail!("store answered {}: {}", status, body)
}

#[cfg(test)]
mod tests {
    use mrl_store::{MockStore, StoreConfig};
    use tokio::net::TcpListener;

    use super::*;

    async fn serve(store: MockStore) -> Ctl {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(mrl_store::server::serve(listener, store));
        Ctl::new(Url::parse(&format!("http://{addr}/")).unwrap(), "mrl_jobs".into())
    }

    async fn stored(store: &MockStore, job: &Job) {
        store
            .put("mrl_jobs", &job.job_id, serde_json::to_value(job).unwrap())
            .await
            .unwrap();
    }

    async fn read(store: &MockStore, job_id: &str) -> Job {
        serde_json::from_value(store.get("mrl_jobs", job_id).await.unwrap()).unwrap()
    }

    #[test]
    fn summary_shows_progress() {
        let mut job = Job::with_id("j1", "wc", vec![Phase::map("wc")], vec!["/a".into()]);
        job.claim("w1");
        job.stats.n_tasks_dispatched = 1;

        let line = summarize(&job);

        assert!(line.starts_with("j1 running"));
        assert!(line.contains("worker=w1"));
        assert!(line.contains("tasks=1"));
    }

    #[test]
    fn keys_are_single_path_segments() {
        let ctl = Ctl::new(Url::parse("http://localhost:8040/").unwrap(), "mrl_jobs".into());

        let url = ctl.url(&["m", "mrl_jobs", "/a/b"]).unwrap();

        assert_eq!(url.path(), "/m/mrl_jobs/%2Fa%2Fb");
    }

    #[tokio::test]
    async fn commands_change_only_their_own_fields() {
        let store = MockStore::new(StoreConfig::default());
        let mut job = Job::with_id("j1", "wc", vec![Phase::map("wc")], vec!["/a".into()]).streaming();
        job.claim("w1");
        stored(&store, &job).await;
        let ctl = serve(store.clone()).await;

        ctl.add_input("j1", vec!["/b".into()]).await.unwrap();
        ctl.end_input("j1").await.unwrap();
        ctl.cancel("j1").await.unwrap();

        let after = read(&store, "j1").await;
        assert_eq!(after.input_keys, vec!["/a".to_string(), "/b".to_string()]);
        assert!(after.time_input_done.is_some());
        assert!(after.time_cancelled.is_some());
        assert_eq!(after.state, job.state);
        assert_eq!(after.worker.as_deref(), Some("w1"));
        assert!(ctl.add_input("j1", vec!["/c".into()]).await.is_err());
    }

    #[tokio::test]
    async fn done_jobs_are_not_reopened() {
        let store = MockStore::new(StoreConfig::default());
        let mut job = Job::with_id("j1", "wc", vec![Phase::map("wc")], vec!["/a".into()]);
        job.claim("w1");
        job.finish(vec!["/out".into()], Utc::now());
        stored(&store, &job).await;
        let ctl = serve(store.clone()).await;

        assert!(ctl.cancel("j1").await.is_err());
        assert!(ctl.end_input("j1").await.is_err());

        assert_eq!(read(&store, "j1").await, job);
    }
}
