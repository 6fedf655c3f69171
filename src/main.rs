#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use singularity_edge::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "singularity-edge",
    about = "Global HTTP(S) reverse proxy and L4 passthrough load balancer"
)]
struct Cli {
    /// Path to the node config file
    #[arg(short, long, default_value = "edge.toml")]
    config: PathBuf,

    /// HTTP listen address (overrides config / PORT)
    #[arg(short, long)]
    listen: Option<String>,

    /// Admin API listen address (overrides config)
    #[arg(long)]
    admin_listen: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(server::runtime::worker_threads())
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        admin_listen: cli.admin_listen,
    }))
}
