//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A pass that already started runs to completion; only new passes are
//! prevented.

use tokio::signal;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Cancelled once shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for SIGTERM or SIGINT, then cancel the token.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT (Ctrl+C), initiating graceful shutdown..."),
            _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
            _ = self.token.cancelled() => {}
        }

        self.token.cancel();
    }

    /// Wait until the pass holding `running` (if any) finishes.
    pub async fn drain(&self, running: &Mutex<()>) {
        if running.try_lock().is_err() {
            info!("Waiting for the running pass to finish");
        }
        let _guard = running.lock().await;
        info!("Graceful shutdown complete");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
