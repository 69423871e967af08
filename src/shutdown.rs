//! Graceful shutdown for the daemon's background tasks.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Owns the root cancellation token and every task spawned under it
pub struct ShutdownManager {
    cancel_token: CancellationToken,
    task_handles: Vec<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn register_task(&mut self, handle: JoinHandle<()>) {
        self.task_handles.push(handle);
    }

    pub fn task_count(&self) -> usize {
        self.task_handles.len()
    }

    /// Waits for Ctrl-C, then cancels and drains every task.
    pub async fn wait_for_shutdown(self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }

        tracing::info!("🛑 Shutdown signal received");
        self.shutdown().await;
    }

    /// Cancels the token and waits up to the grace period for tasks to finish.
    pub async fn shutdown(mut self) -> bool {
        self.cancel_token.cancel();

        let drain = std::pin::pin!(async {
            for handle in self.task_handles.drain(..) {
                let _ = handle.await;
            }
        });

        match tokio::time::timeout(SHUTDOWN_GRACE, drain).await {
            Ok(_) => {
                tracing::info!("✓ All tasks shut down gracefully");
                true
            }
            Err(_) => {
                tracing::warn!("⏱️  Shutdown timeout: Some tasks did not complete");
                false
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
