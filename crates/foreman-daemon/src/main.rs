use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use foreman_daemon::{router, Registry};
use foreman_runtime::OrchestratorConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "foreman-daemon", version, about = "Event-sourced orchestrator for agent collaborators")]
struct Args {
    /// Listen address, e.g. 127.0.0.1:7420
    #[arg(long, default_value = "127.0.0.1:7420")]
    listen: SocketAddr,

    /// One subdirectory per project, holding its event log and status cache.
    #[arg(long, default_value = "~/.foreman")]
    data_dir: String,

    /// TOML file with timer, dispatch and policy settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (env-filter syntax).
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(args.log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let data_dir = PathBuf::from(
        shellexpand::full(&args.data_dir)
            .with_context(|| format!("expand data dir {}", args.data_dir))?
            .into_owned(),
    );
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("create data dir {}", data_dir.display()))?;
    let config = OrchestratorConfig::load_or_default(args.config.as_deref())?;
    let tick_every = Duration::from_millis(config.tick_interval_ms());

    let registry = Arc::new(Registry::new(&data_dir, config, Some(tick_every)));
    let opened = registry.open_existing().await?;
    tracing::info!(data_dir = %data_dir.display(), projects = opened, "projects reconciled");

    let app = router(Arc::clone(&registry));
    tracing::info!(listen = %args.listen, "daemon starting");
    axum::serve(tokio::net::TcpListener::bind(args.listen).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.shutdown().await;
    tracing::info!("daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested");
}
