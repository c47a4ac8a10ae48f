mod args;

use args::Args;

use anyhow::{bail, Context};
use clap::Parser;
use mrl_coordinator::Agent;
use mrl_store::{server, StoreHandle};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let worker_id = args
        .worker_id
        .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));

    let handle = StoreHandle::connect(&args.store).context("connecting to store")?;

    if let Some(addr) = args.listen {
        let Some(mock) = handle.mock().cloned() else {
            bail!("--listen requires the mock backend");
        };
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {}", addr))?;
        info!("Store listening on {}", addr);
        tokio::spawn(async move {
            if let Err(e) = server::serve(listener, mock).await {
                error!(error = %e, "store server failed");
            }
        });
    }

    let agent = Agent::new(worker_id.clone(), handle.store(), args.coordinator).spawn();
    info!(%worker_id, backend = ?args.store.backend, "Coordinator running");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Coordinator exiting...");
            agent.shutdown().await;
            Ok(())
        }
        Err(err) => {
            error!("Fatal error encountered {}", err);
            agent.shutdown().await;
            Err(err).context("listening for shutdown signal")
        }
    }
}
