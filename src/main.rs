use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use content_store::{build_state, config::Config, server, replication::ReplicationManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    // Load configuration
    let config = Config::load()?;
    let quiet = config.quiet;
    if !quiet {
        info!(version = env!("CARGO_PKG_VERSION"), "content-store starting");
    }

    let state = build_state(config)?;
    if !quiet {
        info!("Data directory: {}", state.config.node.data_dir);
    }

    // Leftovers from a previous run that did not shut down cleanly
    server::sweep(&state).await;

    // Start replication, catching peers up on anything they missed while we were down
    state.replication.start();
    if state.replication.has_peers() {
        if !quiet {
            info!(peers = ?state.config.replication.peers, "Replicating to peers");
        }
        state.replication.reconcile_all();
    }

    let listener = tokio::net::TcpListener::bind(&state.config.node.bind_address).await?;
    if !quiet {
        info!("Listening on: {}", state.config.node.bind_address);
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(handle_signals(
        shutdown.clone(),
        std::sync::Arc::clone(&state.replication),
    ));

    server::serve(listener, std::sync::Arc::clone(&state), shutdown).await?;

    if !quiet {
        info!("Shutdown complete");
    }
    Ok(())
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM; re-run reconciliation on SIGUSR1.
async fn handle_signals(shutdown: CancellationToken, replication: std::sync::Arc<ReplicationManager>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(unix)]
    let resync = async {
        let mut signal =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
                .expect("Failed to install SIGUSR1 handler");
        while signal.recv().await.is_some() {
            info!("Resync requested");
            replication.reconcile_all();
        }
    };

    #[cfg(not(unix))]
    let resync = {
        let _ = &replication;
        std::future::pending::<()>()
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = resync => {},
    }

    info!("Shutdown signal received, draining connections");
    shutdown.cancel();
}
