//! Serving the router with a two-phase shutdown.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::api;
use crate::AppState;

/// Serve until `shutdown` is cancelled.
///
/// On shutdown the listener stops accepting and in-flight responses run to
/// completion, or until the configured timeout if one is set. Then replication
/// stops and any temp files left by interrupted uploads are removed.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = api::create_router(Arc::clone(&state));
    let signal = shutdown.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.cancelled().await });
    let mut server = tokio::spawn(async move { server.await });

    let result = tokio::select! {
        result = &mut server => result,
        _ = shutdown.cancelled() => match state.config.shutdown_timeout() {
            None => (&mut server).await,
            Some(limit) => match tokio::time::timeout(limit, &mut server).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("In-flight requests did not finish within {limit:?}, closing them");
                    server.abort();
                    Ok(Ok(()))
                }
            },
        },
    };

    state.replication.shutdown().await;
    sweep(&state).await;

    match result {
        Ok(served) => served,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(std::io::Error::other(e)),
    }
}

/// Remove temp files left by interrupted uploads.
pub async fn sweep(state: &AppState) {
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.sweep_temp_files()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(error = %e, "Failed to sweep temp files"),
        Err(e) => warn!(error = %e, "Temp file sweep panicked"),
    }
}
