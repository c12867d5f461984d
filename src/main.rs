use lottery_watchdog::api::{self, ApiState};
use lottery_watchdog::config::Config;
use lottery_watchdog::context::WatchdogContext;
use lottery_watchdog::health::HealthReporter;
use lottery_watchdog::scheduler::Scheduler;

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

const DEFAULT_CONFIG: &str = "watchdog.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Load config
    let path = std::env::var("WATCHDOG_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG));
    let (config, from_file) = if path.exists() {
        (Config::load(&path)?, true)
    } else {
        (Config::from_env()?, false)
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("lottery-watchdog v{} starting", env!("CARGO_PKG_VERSION"));
    if from_file {
        info!(path = %path.display(), "loaded config file");
    } else {
        info!("no {} found, using env-only config", DEFAULT_CONFIG);
    }

    // Missing or malformed settings stop us here, before any network call.
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        return Err(e.into());
    }

    let ctx = WatchdogContext::from_config(&config)?;
    info!(
        contract = %config.chain.contract_address,
        wallet = %ctx.chain.wallet_address(),
        "watchdog configured"
    );

    let scheduler = Arc::new(Scheduler::new(ctx, HealthReporter::new()));
    scheduler.startup_check().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // --- HTTP server ---
    let api_state = ApiState {
        scheduler: scheduler.clone(),
    };
    let bind = config.bind_addr();
    let mut server_rx = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = server_rx.changed().await;
        };
        if let Err(e) = api::serve(api_state, &bind, shutdown).await {
            error!(error = %e, "http server error");
        }
    });

    // --- Scheduler ---
    let ticker = tokio::spawn(scheduler.clone().run(shutdown_rx));

    wait_for_signal().await;
    info!("shutting down...");
    let _ = shutdown_tx.send(true);

    if let Err(e) = ticker.await {
        error!(error = %e, "scheduler task failed");
    }
    if let Err(e) = server.await {
        error!(error = %e, "http server task failed");
    }

    info!("lottery-watchdog stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                _ = term.recv() => info!("received SIGTERM"),
            }
        }
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler, listening for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            info!("received SIGINT");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received ctrl-c");
}
