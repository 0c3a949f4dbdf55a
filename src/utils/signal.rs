//! Shutdown signal handling for the command-line tools

use tokio::signal;
use tracing::{info, warn};

/// Wait for SIGTERM or SIGINT (Ctrl+C elsewhere)
pub async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {}", e);
                signal::ctrl_c().await.ok();
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
        }
    }
}
