//! Progress throttling and file-update coalescing.
//!
//! Batch-level progress is rate-limited per batch: the first event in a
//! window goes out immediately, later ones are held as a single latest-wins
//! pending event that a scheduled task flushes when the window closes.
//! Terminal states and large progress jumps bypass the throttle, flushing
//! any pending event first so observers never see progress move backwards.
//! File-level updates are coalesced into one multi-file event per window.

use std::time::Instant;

use crate::types::{
    event_names, BatchId, BatchProgressEvent, BatchStatus, FileProgressBatchEvent,
    FileProgressEvent,
};

use super::NotificationService;

impl NotificationService {
    /// Broadcast batch-level progress, subject to throttling
    pub async fn notify_progress(&self, status: &BatchStatus) {
        let event = BatchProgressEvent::from_status(status);
        let batch_id = event.batch_id.clone();

        // Taken before the throttle decision: a scheduled flush holding this
        // lock finishes its send before a bypass can decide and deliver
        let order = {
            let mut channels = self.channels.lock().await;
            channels
                .entry(batch_id.clone())
                .or_default()
                .send_lock
                .clone()
        };
        let _order = order.lock().await;

        let to_send: Vec<BatchProgressEvent> = {
            let mut channels = self.channels.lock().await;
            let channel = channels.entry(batch_id.clone()).or_default();

            let window_open = channel
                .last_sent_at
                .is_none_or(|t| t.elapsed() >= self.config.throttle_interval);
            let delta = (event.overall_progress - channel.last_sent_progress).abs();
            let bypass = event.is_terminal() || delta >= self.config.progress_delta_threshold;

            if window_open || bypass {
                let mut out = Vec::new();
                // Pending first keeps the stream monotonic for observers
                if let Some(pending) = channel.pending.take() {
                    out.push(pending);
                }
                channel.last_sent_at = Some(Instant::now());
                channel.last_sent_progress = event.overall_progress;
                out.push(event);
                out
            } else {
                // Inside the window: hold the latest event and make sure a
                // flush is scheduled for when the window closes
                channel.pending = Some(event);
                if !channel.flush_scheduled {
                    channel.flush_scheduled = true;
                    let elapsed = channel
                        .last_sent_at
                        .map(|t| t.elapsed())
                        .unwrap_or_default();
                    let delay = self.config.throttle_interval.saturating_sub(elapsed);
                    self.schedule_progress_flush(batch_id.clone(), delay);
                }
                Vec::new()
            }
        };

        for event in to_send {
            self.send_batch_event(event).await;
        }
    }

    /// Broadcast a file-level update, coalesced when configured
    pub async fn notify_file_progress(&self, event: FileProgressEvent) {
        if !self.config.batch_file_updates {
            self.send_file_event(event).await;
            return;
        }

        let batch_id = event.batch_id.clone();
        let schedule = {
            let mut channels = self.channels.lock().await;
            let channel = channels.entry(batch_id.clone()).or_default();
            // Latest update per file wins within the window
            channel.pending_files.insert(event.file_id.clone(), event);
            if channel.file_flush_scheduled {
                false
            } else {
                channel.file_flush_scheduled = true;
                true
            }
        };

        if schedule {
            let service = self.clone();
            let window = self.config.file_batch_window;
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                service.flush_file_events(&batch_id).await;
            });
        }
    }

    /// Spawn the task that flushes a held batch-progress event once the
    /// throttle window closes
    fn schedule_progress_flush(&self, batch_id: BatchId, delay: std::time::Duration) {
        let service = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let order = {
                let mut channels = service.channels.lock().await;
                let Some(channel) = channels.get_mut(&batch_id) else {
                    return;
                };
                channel.send_lock.clone()
            };
            // Same ordering lock as notify_progress, so this flush cannot
            // trail a bypass that already drained and delivered
            let _order = order.lock().await;
            let flushed = {
                let mut channels = service.channels.lock().await;
                let Some(channel) = channels.get_mut(&batch_id) else {
                    return;
                };
                channel.flush_scheduled = false;
                // A bypass may have drained the pending event already
                channel.pending.take().inspect(|event| {
                    channel.last_sent_at = Some(Instant::now());
                    channel.last_sent_progress = event.overall_progress;
                })
            };
            if let Some(event) = flushed {
                service.send_batch_event(event).await;
            }
        });
    }

    /// Flush the coalescing buffer for one batch
    async fn flush_file_events(&self, batch_id: &BatchId) {
        let mut events: Vec<FileProgressEvent> = {
            let mut channels = self.channels.lock().await;
            let Some(channel) = channels.get_mut(batch_id) else {
                return;
            };
            channel.file_flush_scheduled = false;
            channel.pending_files.drain().map(|(_, e)| e).collect()
        };

        match events.len() {
            0 => {}
            1 => {
                if let Some(event) = events.pop() {
                    self.send_file_event(event).await;
                }
            }
            _ => {
                events.sort_by(|a, b| a.file_id.cmp(&b.file_id));
                let batched = FileProgressBatchEvent {
                    batch_id: batch_id.clone(),
                    files: events,
                };
                match serde_json::to_value(&batched) {
                    Ok(payload) => {
                        self.deliver(batch_id.clone(), event_names::FILE_PROGRESS_BATCH, payload)
                            .await;
                    }
                    Err(e) => {
                        tracing::error!(batch_id = %batch_id, error = %e, "file batch event not serializable");
                    }
                }
            }
        }
    }

    async fn send_batch_event(&self, event: BatchProgressEvent) {
        match serde_json::to_value(&event) {
            Ok(payload) => {
                self.deliver(event.batch_id, event_names::BATCH_PROGRESS, payload)
                    .await;
            }
            Err(e) => {
                tracing::error!(batch_id = %event.batch_id, error = %e, "progress event not serializable");
            }
        }
    }

    async fn send_file_event(&self, event: FileProgressEvent) {
        match serde_json::to_value(&event) {
            Ok(payload) => {
                self.deliver(event.batch_id, event_names::FILE_PROGRESS, payload)
                    .await;
            }
            Err(e) => {
                tracing::error!(batch_id = %event.batch_id, error = %e, "file event not serializable");
            }
        }
    }
}
