//! Background maintenance loops spawned by the facade.
//!
//! Three periodic tasks plus health sampling: sweeping expired batches out of
//! history (releasing their queue submissions and subscriptions with them),
//! dropping subscriptions for long-finished batches, and flushing
//! notifications parked while the transport was down. All loops stop on the
//! uploader's shutdown token.

use std::time::Duration;

use crate::error::TransportError;
use crate::retry::{with_retry, Backoff};

use super::BatchUploader;

/// How often the offline notification queue is checked
const NOTIFICATION_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

impl BatchUploader {
    /// Start the periodic maintenance tasks and health sampling
    ///
    /// Call once after construction; tasks run until
    /// [`shutdown`](Self::shutdown).
    pub async fn start_background_tasks(&self) {
        self.health.start_monitoring().await;
        self.spawn_history_sweeper();
        if self.config.notifications.cleanup_enabled {
            self.spawn_subscription_cleanup();
        }
        self.spawn_notification_flusher();
        tracing::info!("background tasks started");
    }

    /// Sweep expired batches and release everything tied to them
    fn spawn_history_sweeper(&self) {
        let this = self.clone();
        let interval = self.config.progress.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for batch_id in this.progress.sweep_expired().await {
                            this.queue.release_batch(&batch_id).await;
                            this.notifier.release_batch(&batch_id).await;
                        }
                    }
                }
            }
        });
    }

    /// Drop subscription state for batches that finished a while ago
    fn spawn_subscription_cleanup(&self) {
        let this = self.clone();
        let interval = self.config.notifications.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let statuses = this.progress.batch_statuses().await;
                        this.notifier.cleanup_inactive_subscriptions(&statuses).await;
                    }
                }
            }
        });
    }

    /// Flush notifications parked while the transport was down
    ///
    /// Each tick drives the queue through a short backoff loop; if the
    /// transport stays down, the parked events wait for the next tick.
    fn spawn_notification_flusher(&self) {
        let this = self.clone();
        let backoff = Backoff {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
            ..Backoff::default()
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(NOTIFICATION_FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if this.notifier.queued_notifications().await == 0 {
                            continue;
                        }
                        let notifier = this.notifier.clone();
                        let result: Result<usize, TransportError> =
                            with_retry(&backoff, || {
                                let notifier = notifier.clone();
                                async move {
                                    let delivered = notifier.process_queued_notifications().await;
                                    if notifier.queued_notifications().await == 0 {
                                        Ok(delivered)
                                    } else {
                                        Err(TransportError::Unavailable(
                                            "notification queue not drained".to_string(),
                                        ))
                                    }
                                }
                            })
                            .await;
                        if let Err(e) = result {
                            tracing::debug!(error = %e, "notification queue still parked");
                        }
                    }
                }
            }
        });
    }
}
