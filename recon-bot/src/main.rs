use anyhow::{Context, Result};
use clap::Parser;
use recon_bot::config::BotConfig;
use recon_bot::database::RunStore;
use recon_bot::dispatcher::Dispatcher;
use recon_bot::poller::StatusPoller;
use recon_bot::service::ReconService;
use recon_bot::telegram::{run_polling, TelegramApi};
use recon_bot::trickest::TrickestClient;
use recon_bot_sdk::{Notifier, WorkflowClient};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Telegram front end for Trickest recon workflows
#[derive(Parser, Debug)]
#[command(name = "recon-bot", version, about)]
struct Args {
    /// Path to a YAML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run a single status sweep and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "recon_bot=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = BotConfig::load(args.config.as_deref())?;

    let store = RunStore::new(&config.database)
        .with_context(|| format!("Failed to open run store {}", config.database.display()))?;
    store.initialize_schema()?;
    info!(database = %store.path().display(), "run store ready");

    let client: Arc<dyn WorkflowClient> = Arc::new(TrickestClient::new(config.trickest.clone()));
    let telegram = Arc::new(TelegramApi::new(&config.telegram)?);
    let notifier: Arc<dyn Notifier> = telegram.clone();

    let poller = StatusPoller::new(
        store.clone(),
        client.clone(),
        notifier,
        config.poll_interval(),
    );

    if args.once {
        let report = poller.sweep().await;
        info!(?report, "single sweep finished");
        return Ok(());
    }

    let poller = poller.spawn();

    let service = Arc::new(ReconService::new(
        store,
        client,
        config.auth_secret.clone(),
        config.outputs_dir.clone(),
    ));
    let dispatcher = Dispatcher::new(service);

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                ctrl_c.cancel();
            }
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
        }
    });

    let polled = run_polling(
        &telegram,
        &dispatcher,
        config.telegram.poll_timeout_secs,
        shutdown,
    )
    .await;

    if let Err(e) = poller.shutdown().await {
        warn!(error = %e, "status poller task ended abnormally");
    }
    polled
}
