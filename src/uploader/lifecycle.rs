//! Uploader lifecycle: intake gating and graceful shutdown.

use std::sync::atomic::Ordering;
use std::time::Duration;

use super::BatchUploader;

/// How often the drain loop re-checks for outstanding work
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl BatchUploader {
    /// Whether new batches are currently accepted
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Graceful shutdown: stop accepting batches, wait up to `timeout` for
    /// in-flight work to drain, then cancel everything still running
    pub async fn shutdown(&self, timeout: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        tracing::info!(timeout = ?timeout, "shutting down batch uploader");

        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.progress.all_batches_terminal().await && self.queue.metrics().active_jobs == 0
            {
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        self.shutdown.cancel();
        self.health.stop_monitoring().await;
        tracing::info!("batch uploader stopped");
    }
}
