use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;

use edge_proxy::args::Args;
use edge_proxy::logging::init_dual_logging;
use edge_proxy::{ProxyServer, load_or_create_config};

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration before the subscriber is up so the log file
    // path can come from the file itself
    let config_path = args.config.to_string_lossy().into_owned();
    let mut config = load_or_create_config(&config_path)
        .with_context(|| format!("loading configuration from '{}'", config_path))?;
    args.apply_to(&mut config);

    init_dual_logging(&config.server.log_file);

    info!(
        listeners = config.listeners.len(),
        origins = config.origins.len(),
        workers = %config.server.threads,
        "configuration loaded from '{}'",
        config_path
    );
    for origin in &config.origins {
        info!(
            "  origin '{}' with {} server(s)",
            origin.name,
            origin.servers.len()
        );
    }

    // This runtime only runs the accept loops and signal handling;
    // request work runs on the worker event-loops the server starts
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;

    rt.block_on(async {
        let server = ProxyServer::builder(config).build()?;
        server.run(shutdown_signal()).await
    })
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
