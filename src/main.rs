use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use gridpool::comm::ExchangeServer;
use gridpool::config::{BootConfig, InstanceInfo};
use gridpool::runner::ShellRunner;
use gridpool::shutdown::install_shutdown_handler;
use gridpool::storage::DirStore;
use gridpool::worker::{PostStartHook, Supervisor, WorkerManager};

#[derive(Parser, Debug)]
#[command(name = "gridpool")]
#[command(version)]
#[command(about = "Worker lifecycle coordination for elastic batch clusters")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the worker supervisor on this instance
    Worker(WorkerArgs),

    /// Run the message exchange (hosted on the master)
    Exchange(ExchangeArgs),
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Path to the boot configuration bundle (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Master address; overrides the boot bundle
    #[arg(long)]
    master_ip: Option<String>,

    /// Worker id used as the transport routing key; overrides the boot bundle
    #[arg(long)]
    worker_id: Option<String>,
}

// =============================================================================
// Exchange Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ExchangeArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "50600")]
    port: u16,
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => BootConfig::load(path)?,
        None => {
            let master_ip = args
                .master_ip
                .clone()
                .ok_or("either --config or --master-ip is required")?;
            BootConfig::new(master_ip)
        }
    };
    if let Some(master_ip) = args.master_ip {
        config.master_ip = master_ip;
    }
    if let Some(worker_id) = args.worker_id {
        config.worker_id = Some(worker_id);
    }

    let instance_id = config
        .worker_id
        .clone()
        .unwrap_or_else(|| format!("w-{}", Uuid::new_v4().simple()));
    let instance = InstanceInfo::detect(instance_id);

    let runner = Arc::new(ShellRunner);
    let store = Arc::new(DirStore::new(config.paths.bucket_store.clone()));
    let manager = WorkerManager::new(config.clone(), instance, runner.clone());
    let hook = PostStartHook::new(&config, store, runner);

    let shutdown = install_shutdown_handler();
    Supervisor::new(config, manager, hook, shutdown).run().await;
    Ok(())
}

async fn run_exchange(args: ExchangeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let shutdown = install_shutdown_handler();
    ExchangeServer::new(addr).run(shutdown).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
        Commands::Exchange(exchange_args) => run_exchange(exchange_args).await?,
    }
    Ok(())
}
