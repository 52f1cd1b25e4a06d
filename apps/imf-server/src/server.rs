//! HTTP serving and the process shutdown sequence.

use anyhow::{Context, Result};
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use imf_runtime::ApplicationOrchestrator;
use imf_runtime::shutdown::ShutdownSignal;

/// Serves `router` until `shutdown_signal` resolves or the server fails.
///
/// Every exit path runs `orchestrator.shutdown()` exactly once. A signal
/// future that fails (handlers could not be installed) still shuts the
/// services down before its error is returned.
pub async fn serve<S>(
    orchestrator: Arc<ApplicationOrchestrator>,
    listener: TcpListener,
    router: Router,
    drain_timeout: Duration,
    shutdown_signal: S,
) -> Result<()>
where
    S: Future<Output = Result<ShutdownSignal>>,
{
    let cancel = CancellationToken::new();
    let mut server = tokio::spawn(
        axum::serve(listener, router)
            .with_graceful_shutdown(cancel.clone().cancelled_owned())
            .into_future(),
    );

    let outcome = tokio::select! {
        signal = shutdown_signal => match signal {
            Ok(signal) => {
                tracing::info!(%signal, "shutdown signal received");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "shutdown signal handling failed, stopping");
                Err(e.context("failed to wait for shutdown signal"))
            }
        },
        result = &mut server => {
            tracing::error!("HTTP server exited unexpectedly");
            orchestrator.shutdown().await;
            return match result {
                Ok(Ok(())) => Err(anyhow::anyhow!("HTTP server stopped without a shutdown request")),
                Ok(Err(e)) => Err(anyhow::Error::new(e).context("HTTP server failed")),
                Err(e) => Err(anyhow::Error::new(e).context("HTTP server task panicked")),
            };
        }
    };

    // Stop accepting requests first; open WebSockets end when subscribers close.
    cancel.cancel();
    let report = orchestrator.shutdown().await;
    if report.is_clean() {
        tracing::info!(stopped = ?report.stopped, "services stopped");
    } else {
        tracing::warn!(
            stopped = ?report.stopped,
            failed = ?report.failed,
            abandoned = ?report.abandoned,
            "services stopped with errors"
        );
    }

    match tokio::time::timeout(drain_timeout, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::warn!(error = %e, "HTTP server error during shutdown"),
        Ok(Err(e)) => tracing::warn!(error = %e, "HTTP server task panicked"),
        Err(_) => tracing::warn!(
            timeout_ms = u64::try_from(drain_timeout.as_millis()).unwrap_or(u64::MAX),
            "HTTP connections did not drain in time"
        ),
    }

    outcome
}

/// Binds the listener for `addr`.
pub async fn bind(addr: std::net::SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))
}
