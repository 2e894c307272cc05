//! scanrun daemon entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::{error, info};

use scanrun::bus::DeviceBus;
use scanrun::config::RunConfig;
use scanrun::context::Context;
use scanrun::queue::QueueStore;
use scanrun::scheduler::Scheduler;
use scanrun::tools::ProcessRunner;

#[derive(Parser, Debug)]
#[command(name = "scanrun", about = "Observatory scan queue execution daemon")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "scanrun.toml")]
    config: PathBuf,

    /// Override the scan queue file from the configuration
    #[arg(short, long)]
    queue: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run(Args::parse()).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let mut cfg = RunConfig::load_from(&args.config).context("loading configuration")?;
    if let Some(queue) = args.queue {
        cfg.paths.queue_file = queue;
    }
    info!(queue = %cfg.paths.queue_file.display(), "watching scan queue");

    let bus = DeviceBus::connect(&cfg.paths.channel_dir)
        .await
        .context("connecting device channels")?;
    let queue = QueueStore::new(cfg.paths.queue_file.clone());
    let ctx = Context::new(cfg, bus, queue, Box::new(ProcessRunner::new()));

    let mut scheduler = Scheduler::new(ctx);
    if !scheduler.ensure_homed().await? {
        error!("telescope could not be homed, refusing to observe");
        return Ok(ExitCode::from(1));
    }

    scheduler.run().await?;
    info!("scanrun exit");
    Ok(ExitCode::SUCCESS)
}
