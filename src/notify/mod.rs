//! Notification service — throttled fan-out of progress events.
//!
//! Sits between the progress manager and the transport. Batch-level progress
//! is throttled per batch (latest-wins within the window, with terminal and
//! large-delta events bypassing the throttle), file-level progress is
//! coalesced into multi-file events, and errors always go out immediately.
//! Delivery is fire-and-forget: a dead transport never blocks an upload, the
//! event is parked in a bounded queue instead.
//!
//! The impl is split across this file (subscriptions, delivery, the offline
//! queue, cleanup) and `throttle` (the progress throttling policy).

mod throttle;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::config::NotificationConfig;
use crate::error::{Result, SubscriptionError};
use crate::transport::Transport;
use crate::types::{
    batch_topic, event_names, BatchId, BatchProgressEvent, BatchStatus, FileId, FileProgressEvent,
    ObserverId, SubscriptionStats, UploadErrorEvent,
};

/// Per-batch notification state
#[derive(Default)]
struct BatchChannel {
    subscribers: HashSet<ObserverId>,
    /// Overall progress at the last batch-level broadcast
    last_sent_progress: f64,
    /// When the last batch-level broadcast went out
    last_sent_at: Option<Instant>,
    /// Latest unsent batch event inside the current throttle window
    pending: Option<BatchProgressEvent>,
    /// A flush task is scheduled for `pending`
    flush_scheduled: bool,
    /// Latest unsent file events inside the current coalescing window
    pending_files: HashMap<FileId, FileProgressEvent>,
    /// A flush task is scheduled for `pending_files`
    file_flush_scheduled: bool,
    /// Serializes batch-level sends so a scheduled flush and a bypass can
    /// never reach the transport out of order
    send_lock: Arc<Mutex<()>>,
}

/// One undelivered event parked while the transport is down
struct QueuedNotification {
    topic: String,
    event: &'static str,
    payload: serde_json::Value,
    batch_id: BatchId,
}

/// Notification service (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct NotificationService {
    pub(crate) config: NotificationConfig,
    transport: Arc<dyn Transport>,
    channels: Arc<Mutex<HashMap<BatchId, BatchChannel>>>,
    queued: Arc<Mutex<VecDeque<QueuedNotification>>>,
}

impl NotificationService {
    /// Create a service delivering through the given transport
    pub fn new(config: NotificationConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            channels: Arc::new(Mutex::new(HashMap::new())),
            queued: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Subscribe an observer to a batch's notification topic
    ///
    /// Idempotent for an already-subscribed observer. Fails when the per-batch
    /// subscriber cap is reached or the transport cannot register the
    /// membership.
    pub async fn subscribe(&self, observer: &ObserverId, batch_id: &BatchId) -> Result<()> {
        {
            let mut channels = self.channels.lock().await;
            let channel = channels.entry(batch_id.clone()).or_default();
            if !channel.subscribers.contains(observer)
                && channel.subscribers.len() >= self.config.max_subscribers_per_batch
            {
                return Err(SubscriptionError::LimitReached {
                    batch_id: batch_id.clone(),
                    limit: self.config.max_subscribers_per_batch,
                }
                .into());
            }
        }

        self.transport
            .join_topic(observer, &batch_topic(batch_id))
            .await
            .map_err(|e| {
                tracing::warn!(observer = %observer, batch_id = %batch_id, error = %e, "topic join failed");
                SubscriptionError::TransportUnavailable
            })?;

        let raced_past_cap = {
            let mut channels = self.channels.lock().await;
            let channel = channels.entry(batch_id.clone()).or_default();
            // Re-check: a concurrent subscriber may have taken the last slot
            // while we were joining the topic
            if !channel.subscribers.contains(observer)
                && channel.subscribers.len() >= self.config.max_subscribers_per_batch
            {
                true
            } else {
                if channel.subscribers.insert(observer.clone()) {
                    tracing::debug!(observer = %observer, batch_id = %batch_id, "observer subscribed");
                }
                false
            }
        };

        if raced_past_cap {
            // Undo the topic membership we just registered
            if let Err(e) = self
                .transport
                .leave_topic(observer, &batch_topic(batch_id))
                .await
            {
                tracing::warn!(observer = %observer, batch_id = %batch_id, error = %e, "topic leave failed");
            }
            return Err(SubscriptionError::LimitReached {
                batch_id: batch_id.clone(),
                limit: self.config.max_subscribers_per_batch,
            }
            .into());
        }
        Ok(())
    }

    /// Remove an observer's subscription; a no-op if none exists
    pub async fn unsubscribe(&self, observer: &ObserverId, batch_id: &BatchId) -> Result<()> {
        let removed = {
            let mut channels = self.channels.lock().await;
            channels
                .get_mut(batch_id)
                .is_some_and(|c| c.subscribers.remove(observer))
        };
        if removed {
            // Membership removal is best-effort; the record is already gone
            if let Err(e) = self
                .transport
                .leave_topic(observer, &batch_topic(batch_id))
                .await
            {
                tracing::warn!(observer = %observer, batch_id = %batch_id, error = %e, "topic leave failed");
            }
            tracing::debug!(observer = %observer, batch_id = %batch_id, "observer unsubscribed");
        }
        Ok(())
    }

    /// Broadcast an error event immediately, never throttled
    pub async fn notify_error(&self, event: UploadErrorEvent) {
        let payload = match serde_json::to_value(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(batch_id = %event.batch_id, error = %e, "error event not serializable");
                return;
            }
        };
        self.deliver(event.batch_id.clone(), event_names::UPLOAD_ERROR, payload)
            .await;
    }

    /// Deliver one event to a batch's topic, parking it when the transport
    /// is down
    pub(crate) async fn deliver(
        &self,
        batch_id: BatchId,
        event: &'static str,
        payload: serde_json::Value,
    ) {
        let topic = batch_topic(&batch_id);
        if self.transport.is_available() {
            match self
                .transport
                .send_to_topic(&topic, event, payload.clone())
                .await
            {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(topic = %topic, event, error = %e, "delivery failed, queueing");
                }
            }
        } else {
            tracing::debug!(topic = %topic, event, "transport down, queueing");
        }
        self.enqueue(QueuedNotification {
            topic,
            event,
            payload,
            batch_id,
        })
        .await;
    }

    /// Park an undelivered event in the bounded offline queue
    ///
    /// Batch-progress events replace a queued event for the same batch
    /// (latest wins); otherwise the oldest queued event is dropped when full.
    async fn enqueue(&self, notification: QueuedNotification) {
        let mut queued = self.queued.lock().await;

        if notification.event == event_names::BATCH_PROGRESS
            && let Some(existing) = queued
                .iter_mut()
                .find(|q| q.event == notification.event && q.batch_id == notification.batch_id)
        {
            *existing = notification;
            return;
        }

        if queued.len() >= self.config.max_queued_notifications {
            if let Some(dropped) = queued.pop_front() {
                tracing::warn!(
                    topic = %dropped.topic,
                    event = dropped.event,
                    "offline queue full, dropping oldest notification"
                );
            }
        }
        queued.push_back(notification);
    }

    /// Flush the offline queue through a recovered transport
    ///
    /// Stops at the first failed send, leaving the remainder parked. Returns
    /// how many events went out.
    pub async fn process_queued_notifications(&self) -> usize {
        if !self.transport.is_available() {
            return 0;
        }

        let mut delivered = 0;
        loop {
            let next = {
                let mut queued = self.queued.lock().await;
                queued.pop_front()
            };
            let Some(notification) = next else { break };

            match self
                .transport
                .send_to_topic(
                    &notification.topic,
                    notification.event,
                    notification.payload.clone(),
                )
                .await
            {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(topic = %notification.topic, error = %e, "queue flush stopped");
                    let mut queued = self.queued.lock().await;
                    queued.push_front(notification);
                    break;
                }
            }
        }

        if delivered > 0 {
            tracing::info!(delivered, "flushed queued notifications");
        }
        delivered
    }

    /// Number of events currently parked in the offline queue
    pub async fn queued_notifications(&self) -> usize {
        self.queued.lock().await.len()
    }

    /// Remove subscription state for batches that finished long enough ago
    ///
    /// `statuses` is the progress manager's view of the tracked batches. A
    /// channel is inactive once its batch finished more than the configured
    /// age ago, or is not tracked at all (never registered, or already swept
    /// from history). Remaining members are removed from the topic. Returns
    /// how many channels were dropped.
    pub async fn cleanup_inactive_subscriptions(
        &self,
        statuses: &HashMap<BatchId, BatchStatus>,
    ) -> usize {
        let now = Utc::now();
        let age = chrono::Duration::from_std(self.config.inactive_subscription_age)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let inactive = |id: &BatchId| match statuses.get(id) {
            None => true,
            Some(status) => {
                status.status.is_terminal()
                    && now - status.completed_at.unwrap_or(status.created_at) > age
            }
        };

        let expired: Vec<(BatchId, Vec<ObserverId>)> = {
            let mut channels = self.channels.lock().await;
            let expired_ids: Vec<BatchId> = channels
                .keys()
                .filter(|&id| inactive(id))
                .cloned()
                .collect();
            expired_ids
                .into_iter()
                .filter_map(|id| {
                    channels
                        .remove(&id)
                        .map(|c| (id, c.subscribers.into_iter().collect()))
                })
                .collect()
        };

        let removed = expired.len();
        for (batch_id, observers) in expired {
            let topic = batch_topic(&batch_id);
            for observer in observers {
                if let Err(e) = self.transport.leave_topic(&observer, &topic).await {
                    tracing::debug!(observer = %observer, topic = %topic, error = %e, "leave during cleanup failed");
                }
            }
        }

        if removed > 0 {
            tracing::info!(removed, "cleaned up inactive subscriptions");
        }
        removed
    }

    /// Drop a batch's subscription state outright (used when the batch is
    /// swept from history)
    pub async fn release_batch(&self, batch_id: &BatchId) {
        let mut channels = self.channels.lock().await;
        channels.remove(batch_id);
    }

    /// Subscription counts for operational visibility
    pub async fn get_subscription_stats(&self) -> SubscriptionStats {
        let channels = self.channels.lock().await;
        let tracked_batches = channels.len();
        let total_subscribers: usize = channels.values().map(|c| c.subscribers.len()).sum();
        let average_subscribers_per_batch = if tracked_batches > 0 {
            total_subscribers as f64 / tracked_batches as f64
        } else {
            0.0
        };
        SubscriptionStats {
            tracked_batches,
            total_subscribers,
            average_subscribers_per_batch,
        }
    }

}
