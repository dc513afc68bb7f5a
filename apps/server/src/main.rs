//! admitsync HTTP server: crawler control, score lookups and query hooks.

mod error;
mod routes;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use admitsync_core::{BatchOrchestrator, Services};
use admitsync_shared::{load_config, load_config_from};
use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use tracing::{info, warn};

use routes::{AppState, router};

/// JSON API over the admissions store.
#[derive(Parser)]
#[command(name = "admitsync-server", version, long_about = None)]
struct Args {
    /// Config file (defaults to ~/.admitsync/admitsync.toml).
    #[arg(long, env = "ADMITSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Override `[server] bind`.
    #[arg(long)]
    bind: Option<String>,

    /// Emit JSON logs.
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("admitsync=info,tower_http=info"));
    if json {
        fmt().json().with_env_filter(env_filter).init();
    } else {
        fmt().with_env_filter(env_filter).with_target(false).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = match &args.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    let services = Arc::new(Services::from_config(&config).await?);
    let orchestrator = services.orchestrator.clone();

    let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .wrap_err_with(|| format!("failed to bind {bind}"))?;
    info!(%bind, "admitsync-server listening");

    axum::serve(listener, router(AppState { services }))
        .with_graceful_shutdown(shutdown_signal(orchestrator))
        .await
        .wrap_err("server error")?;

    info!("server stopped");
    Ok(())
}

/// How long shutdown waits for a cancelled crawl to record its final state.
const CRAWL_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve on Ctrl-C, cancelling any running crawl and waiting for it first.
async fn shutdown_signal(orchestrator: Arc<BatchOrchestrator>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    if orchestrator.stop() {
        info!("cancelled running crawl, waiting for it to finish");
        if tokio::time::timeout(CRAWL_DRAIN_TIMEOUT, orchestrator.wait_idle())
            .await
            .is_err()
        {
            warn!("crawl job still running at shutdown");
        }
    }
    info!("shutting down");
}
