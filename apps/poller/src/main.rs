use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use uppe_poller::config::Config;
use uppe_poller::standalone::{LogAvailabilitySink, LogValueSink, StaticScheduler};
use uppe_poller::{Collaborators, Poller, Shutdown};

#[derive(Debug, Parser)]
#[command(version, about = "Polls agent and HTTP agent items")]
struct Cli {
    /// Path to the config file, defaults to $XDG_CONFIG_HOME/uppe/poller.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_config(cli.config.as_ref()).context("cannot load configuration")?;
    logger::init_with(config.logging.level()?, config.logging.format()?);

    if cli.print_config {
        println!("{config}");
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("cannot create the poller runtime")?;

    runtime.block_on(run(config));
    Ok(())
}

async fn run(config: Config) {
    let scheduler = Arc::new(StaticScheduler::new(
        config.items.clone(),
        config.poller.max_batch,
        chrono::Utc::now().timestamp(),
    ));
    let collaborators = Collaborators {
        scheduler: scheduler.clone(),
        values: Arc::new(LogValueSink::new()),
        availability: Arc::new(LogAvailabilitySink::new(scheduler)),
    };

    info!(items = config.items.len(), "starting {}", config.poller.poller_type);
    let poller = Poller::with_default_transports(config.poller, config.availability, collaborators);

    let shutdown = Shutdown::new();
    tokio::spawn(watch_signals(shutdown.clone()));
    poller.run(shutdown).await;
}

/// First Ctrl-C drains the poller, a second one aborts it
async fn watch_signals(shutdown: Shutdown) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for shutdown signals");
        return;
    }
    info!("shutdown requested, finishing in-flight checks");
    shutdown.drain.cancel();

    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("second shutdown request, abandoning in-flight checks");
        shutdown.abort.cancel();
    }
}
