use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use noisia::{Cli, PostgresDatabase, app};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler not installed: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, stopping workloads"),
        _ = terminate => info!("terminate signal received, stopping workloads"),
    }
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_config();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("noisia={}", config.log_level.as_str()).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to start the metrics listener")?;
        info!("Prometheus metrics listening on {}", addr);
    }

    let db = Arc::new(PostgresDatabase::new(&config.conninfo).context("invalid connection URL")?);

    if config.cleanup {
        app::cleanup(db.as_ref()).await;
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    info!("noisia {} starting, duration {:?}", env!("CARGO_PKG_VERSION"), config.duration);
    app::run(&config, db, shutdown).await?;
    info!("all workloads finished");

    Ok(())
}
