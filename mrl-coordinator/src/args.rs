use std::net::SocketAddr;

use clap::Parser;
use mrl_coordinator::CoordinatorConfig;
use mrl_store::StoreConfig;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Name this worker records as the owner of the jobs it claims.
    /// Defaults to a random id.
    #[arg(short, long)]
    pub worker_id: Option<String>,

    /// Serve the store's buckets over HTTP on this address (mock backend
    /// only).
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    #[command(flatten)]
    pub store: StoreConfig,

    #[command(flatten)]
    pub coordinator: CoordinatorConfig,
}
