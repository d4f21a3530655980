mod classifier;
mod cleaner;
mod config;
mod container;
mod disk;
mod errors;
mod http;
mod idle;
mod ids;
mod journal;
mod locks;
mod logging;
mod process;
mod procutil;

use std::sync::Arc;

use clap::Parser;
use tokio::signal;

use config::{Cli, Config};
use container::Container;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli)?;
    logging::init(&config.log_level);

    tracing::info!(host = %config.host, port = config.port, "starting transcoder supervisor");

    let container = Arc::new(Container::initialize(config)?);
    container.start().await;

    let app = http::build_router(container.clone());
    let addr = format!("{}:{}", container.config.host, container.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutdown signal received, draining channels");
    container.shutdown().await;
    tracing::info!("goodbye");
    Ok(())
}

/// Waits for SIGINT or SIGTERM, mirroring the original entrypoint's
/// `signal_handler` registered for both signals plus an `atexit` hook; axum's
/// graceful shutdown plays the role the `atexit` hook played there, running
/// the same teardown regardless of which signal arrived.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
