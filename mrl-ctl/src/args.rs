use anyhow::{anyhow, bail};
use clap::{Parser, Subcommand};
use common::{Phase, PhaseType};
use url::Url;

//
// For parsing user specified command.
//
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Address of a coordinator's store server.
    #[arg(short, long, default_value = "http://127.0.0.1:8040/")]
    pub url: Url,

    /// Bucket holding job records.
    #[arg(long, default_value = "mrl_jobs")]
    pub jobs_bucket: String,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List bucket names.
    Buckets,

    /// List the keys of a bucket.
    List {
        bucket: String,

        /// Print every record, not just its key.
        #[arg(short, long)]
        values: bool,
    },

    /// Print one record.
    Get { bucket: String, key: String },

    /// Write one record. The value is JSON.
    Put {
        bucket: String,
        key: String,
        value: String,
    },

    /// Submit a job.
    Submit {
        /// Job name.
        #[arg(short, long, default_value = "job")]
        name: String,

        /// A phase, as `type:exec` (`map:wc -w`, `generic:grep x`,
        /// `reduce:sort`, or `reduce/4:sort` for four reducers). Repeat
        /// in pipeline order.
        #[arg(short, long = "phase", required = true, value_parser = parse_phase)]
        phases: Vec<Phase>,

        /// Input keys will keep arriving; see `add-input` and `end-input`.
        #[arg(long)]
        stream: bool,

        /// Input keys.
        inputs: Vec<String>,
    },

    /// Append input keys to a streaming job.
    AddInput { job_id: String, inputs: Vec<String> },

    /// Mark a streaming job's input as complete.
    EndInput { job_id: String },

    /// Ask for a job to be cancelled.
    Cancel { job_id: String },

    /// List all jobs and their progress.
    Jobs,
}

/// Parse a `type[/count]:exec` phase description.
pub fn parse_phase(s: &str) -> anyhow::Result<Phase> {
    let (head, exec) = s
        .split_once(':')
        .ok_or_else(|| anyhow!("phase {:?} is not of the form type:exec", s))?;
    if exec.trim().is_empty() {
        bail!("phase {:?} has no command", s);
    }

    let (kind, count) = match head.split_once('/') {
        Some((kind, count)) => (kind, Some(count.parse::<u32>()?)),
        None => (head, None),
    };
    let kind = match kind {
        "map" | "storage-map" => PhaseType::StorageMap,
        "generic" => PhaseType::Generic,
        "reduce" => PhaseType::Reduce,
        other => bail!("unknown phase type {:?}", other),
    };

    match (kind, count) {
        (PhaseType::Reduce, Some(0)) => bail!("a reduce phase needs at least one reducer"),
        (PhaseType::Reduce, Some(n)) => Ok(Phase::reduce(exec, n)),
        (PhaseType::Reduce, None) => Ok(Phase::reduce(exec, 1)),
        (_, Some(_)) => bail!("only reduce phases take a count"),
        (kind, None) => Ok(Phase::new(kind, exec)),
    }
}
