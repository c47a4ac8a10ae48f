mod args;
use args::{Args, Commands};

mod core;
use core::Ctl;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let ctl = Ctl::new(args.url, args.jobs_bucket);

    match args.command {
        Commands::Buckets => ctl.buckets().await?,
        Commands::List { bucket, values } => ctl.list(&bucket, values).await?,
        Commands::Get { bucket, key } => ctl.get(&bucket, &key).await?,
        Commands::Put { bucket, key, value } => ctl.put(&bucket, &key, &value).await?,
        Commands::Submit {
            name,
            phases,
            stream,
            inputs,
        } => ctl.submit(name, phases, stream, inputs).await?,
        Commands::AddInput { job_id, inputs } => ctl.add_input(&job_id, inputs).await?,
        Commands::EndInput { job_id } => ctl.end_input(&job_id).await?,
        Commands::Cancel { job_id } => ctl.cancel(&job_id).await?,
        Commands::Jobs => ctl.jobs().await?,
    }

    Ok(())
}
