//! Shutdown signal handling for long-running commands (`modinstall watch`)

use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

/// Wait for SIGTERM, SIGINT or Ctrl+C
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
            _ = sigterm.recv() => info!("Received SIGTERM, stopping"),
            _ = signal::ctrl_c() => info!("Received Ctrl+C, stopping"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
        }
    }
}

/// Channel flipped to `true` once a shutdown signal arrives
///
/// Must be called from within a tokio runtime.
pub fn create_shutdown_receiver() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = tx.send(true);
    });
    rx
}
