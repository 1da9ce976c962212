//! Batch uploader facade — wires the queue, progress manager, notification
//! service, and health monitor into one handle.
//!
//! `BatchUploader` is cheap to clone and share; all state lives behind Arcs
//! in the component it belongs to. Creating a batch registers it with the
//! progress manager, hands the jobs to the queue, and spawns an update pump
//! that folds per-job progress back into the manager and out through the
//! notification service. Mutating operations touch the manager first, so its
//! snapshot is always the source of truth.

mod lifecycle;
mod services;
#[cfg(test)]
pub(crate) mod test_helpers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::health::HealthMonitor;
use crate::notify::NotificationService;
use crate::persistence::Persistence;
use crate::progress::{FileProgressUpdate, ProgressManager};
use crate::queue::{JobUpdate, QueueMetrics, QueuedUpload, SubmitRequest, UploadQueue};
use crate::storage::StorageBackend;
use crate::transport::Transport;
use crate::types::{
    BatchId, BatchJob, BatchStats, BatchStatus, BatchSummary, Destination, FileHandle, FileId,
    FileProgressEvent, HealthSnapshot, ObserverId, RetryOutcome, SubscriptionStats,
    UploadErrorEvent, WaitEstimate,
};

/// Batch upload orchestrator (cloneable - all state is Arc-wrapped)
#[derive(Clone)]
pub struct BatchUploader {
    config: Config,
    queue: UploadQueue,
    progress: ProgressManager,
    notifier: NotificationService,
    health: HealthMonitor,
    accepting: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl BatchUploader {
    /// Wire the components together over the given collaborators
    ///
    /// Validates the configuration up front. Background maintenance does not
    /// run until [`start_background_tasks`](Self::start_background_tasks) is
    /// called.
    pub fn new(
        config: Config,
        storage: Arc<dyn StorageBackend>,
        transport: Arc<dyn Transport>,
        persistence: Arc<dyn Persistence>,
    ) -> Result<Self> {
        config.validate()?;

        let queue = UploadQueue::new(storage);
        let progress = ProgressManager::new(config.progress.clone(), persistence);
        let notifier = NotificationService::new(config.notifications.clone(), transport);
        let health = HealthMonitor::new(config.health.clone(), Arc::new(queue.clone()));

        Ok(Self {
            config,
            queue,
            progress,
            notifier,
            health,
            accepting: Arc::new(AtomicBool::new(true)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Register a batch and start uploading it
    ///
    /// Returns the initial status snapshot as soon as the batch is registered
    /// and queued; the upload itself proceeds in the background. Fails when
    /// shutting down, on a duplicate batch id, an empty file list, or a
    /// zero-sized file.
    pub async fn create_batch(
        &self,
        batch_id: impl Into<BatchId>,
        owner_id: &str,
        files: Vec<FileHandle>,
        destination: Destination,
        concurrency: Option<usize>,
    ) -> Result<BatchStatus> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let batch_id = batch_id.into();
        let concurrency = concurrency.unwrap_or(self.config.queue.default_concurrency);

        let status = self
            .progress
            .create_batch(batch_id.clone(), owner_id, &files, destination.clone())
            .await?;

        // File ids were assigned positionally, so zip them back onto handles
        let uploads: Vec<QueuedUpload> = status
            .files
            .iter()
            .zip(files)
            .map(|(job, handle)| QueuedUpload {
                file_id: job.file_id.clone(),
                handle,
            })
            .collect();

        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let cancel = self.shutdown.child_token();

        self.spawn_update_pump(batch_id.clone(), updates_rx);

        let queue = self.queue.clone();
        let submit_batch_id = batch_id.clone();
        tokio::spawn(async move {
            let request = SubmitRequest {
                batch_id: submit_batch_id.clone(),
                destination,
                files: uploads,
                concurrency,
                updates: updates_tx,
                cancel,
            };
            if let Err(e) = queue.submit(request).await {
                tracing::error!(batch_id = %submit_batch_id, error = %e, "batch submission failed");
            }
        });

        self.notifier.notify_progress(&status).await;
        Ok(status)
    }

    /// Cancel a batch: stop dispatching its remaining jobs and broadcast the
    /// terminal state
    ///
    /// In-flight uploads run to completion and their results are still
    /// recorded. Fails once the batch is already terminal.
    pub async fn cancel_batch(
        &self,
        batch_id: &BatchId,
        reason: impl Into<String>,
    ) -> Result<BatchStatus> {
        let status = self.progress.cancel_batch(batch_id, reason).await?;
        self.queue.cancel_batch(batch_id).await;
        self.notifier.notify_progress(&status).await;
        Ok(status)
    }

    /// Re-queue every retryable failed file in a batch
    ///
    /// Permanent failures are left alone and counted as skipped.
    pub async fn retry_failed_files(&self, batch_id: &BatchId) -> Result<RetryOutcome> {
        let (outcome, file_ids) = self.progress.retry_failed_files(batch_id).await?;

        for file_id in file_ids {
            match self.queue.retry_job(batch_id, &file_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(batch_id = %batch_id, file_id = %file_id, "queue had no retryable record for file");
                }
                Err(e) => {
                    tracing::warn!(batch_id = %batch_id, file_id = %file_id, error = %e, "re-queueing failed");
                }
            }
        }

        if outcome.retried_files > 0
            && let Ok(status) = self.progress.get_batch(batch_id).await
        {
            self.notifier.notify_progress(&status).await;
        }
        Ok(outcome)
    }

    /// Apply a progress update to one file and broadcast the result
    ///
    /// Queue-driven updates flow through the internal pump; this entry point
    /// is for callers that track transfer progress themselves (for example a
    /// chunked storage backend reporting bytes as they move).
    pub async fn update_file_progress(
        &self,
        batch_id: &BatchId,
        file_id: &FileId,
        update: FileProgressUpdate,
    ) -> Result<BatchStatus> {
        let status = self
            .progress
            .update_file_progress(batch_id, file_id, update)
            .await?;
        if let Some(job) = status.job(file_id) {
            self.notifier
                .notify_file_progress(file_event(batch_id, job))
                .await;
        }
        self.notifier.notify_progress(&status).await;
        Ok(status)
    }

    /// Current status snapshot for one batch
    pub async fn get_batch_status(&self, batch_id: &BatchId) -> Result<BatchStatus> {
        self.progress.get_batch(batch_id).await
    }

    /// An owner's batches, most recent first
    pub async fn get_batch_history(&self, owner_id: &str) -> Vec<BatchStatus> {
        self.progress.get_batch_history(owner_id).await
    }

    /// Throughput metrics for one batch
    pub async fn calculate_batch_stats(&self, batch_id: &BatchId) -> Result<BatchStats> {
        self.progress.calculate_batch_stats(batch_id).await
    }

    /// Completion report for one batch
    pub async fn generate_batch_summary(&self, batch_id: &BatchId) -> Result<BatchSummary> {
        self.progress.generate_batch_summary(batch_id).await
    }

    /// Subscribe an observer to a batch's notification topic
    pub async fn subscribe(&self, observer: &ObserverId, batch_id: &BatchId) -> Result<()> {
        self.notifier.subscribe(observer, batch_id).await
    }

    /// Remove an observer's subscription
    pub async fn unsubscribe(&self, observer: &ObserverId, batch_id: &BatchId) -> Result<()> {
        self.notifier.unsubscribe(observer, batch_id).await
    }

    /// Point-in-time queue health reading
    pub fn check_queue_health(&self) -> HealthSnapshot {
        self.health.check_queue_health()
    }

    /// Estimated wait for currently queued jobs
    pub async fn estimate_wait_time(&self) -> WaitEstimate {
        self.health.estimate_wait_time().await
    }

    /// Jobs completed per second over the recent sample window
    pub async fn processing_rate(&self) -> f64 {
        self.health.calculate_processing_rate().await
    }

    /// Raw queue counters
    pub fn queue_metrics(&self) -> QueueMetrics {
        self.queue.metrics()
    }

    /// Subscription counts across tracked batches
    pub async fn get_subscription_stats(&self) -> SubscriptionStats {
        self.notifier.get_subscription_stats().await
    }

    /// Spawn the task that folds queue updates into the progress manager and
    /// drives notifications
    ///
    /// The pump lives as long as the queue retains the submission, so retried
    /// jobs report through the same channel. It exits when the batch is
    /// released or the uploader shuts down.
    fn spawn_update_pump(
        &self,
        batch_id: BatchId,
        mut updates: mpsc::UnboundedReceiver<JobUpdate>,
    ) {
        let progress = self.progress.clone();
        let notifier = self.notifier.clone();
        let max_retries = self.config.queue.max_retries;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            // Failures seen per file, for retry metadata on error events
            let mut failure_counts: std::collections::HashMap<crate::types::FileId, u32> =
                std::collections::HashMap::new();

            loop {
                let update = tokio::select! {
                    update = updates.recv() => match update {
                        Some(update) => update,
                        None => break,
                    },
                    _ = shutdown.cancelled() => break,
                };

                let (file_id, change, error) = match update {
                    JobUpdate::Started { file_id } => {
                        (file_id, FileProgressUpdate::started(), None)
                    }
                    JobUpdate::Completed { file_id, result } => {
                        (file_id, FileProgressUpdate::completed(result), None)
                    }
                    JobUpdate::Failed { file_id, error } => {
                        let retries = failure_counts.entry(file_id.clone()).or_insert(0);
                        let retry_count = *retries;
                        *retries += 1;
                        (
                            file_id,
                            FileProgressUpdate::failed(error.clone()),
                            Some((error, retry_count)),
                        )
                    }
                    // Skipped jobs stay queued; cancellation already told the
                    // caller why
                    JobUpdate::Skipped { .. } => continue,
                };

                let status = match progress
                    .update_file_progress(&batch_id, &file_id, change)
                    .await
                {
                    Ok(status) => status,
                    Err(e) => {
                        // The batch may already have been swept from history
                        tracing::debug!(batch_id = %batch_id, file_id = %file_id, error = %e, "dropping late job update");
                        continue;
                    }
                };

                if let Some((file_error, retry_count)) = error {
                    let file_name = status.job(&file_id).map(|j| j.file_name.clone());
                    notifier
                        .notify_error(UploadErrorEvent {
                            batch_id: batch_id.clone(),
                            file_id: Some(file_id.clone()),
                            file_name,
                            message: file_error.message,
                            retryable: file_error.retryable,
                            retry_count,
                            max_retries,
                        })
                        .await;
                }

                if let Some(job) = status.job(&file_id) {
                    notifier.notify_file_progress(file_event(&batch_id, job)).await;
                }
                notifier.notify_progress(&status).await;
            }
        });
    }
}

fn file_event(batch_id: &BatchId, job: &BatchJob) -> FileProgressEvent {
    FileProgressEvent {
        batch_id: batch_id.clone(),
        file_id: job.file_id.clone(),
        file_name: job.file_name.clone(),
        status: job.status,
        progress: job.progress,
        uploaded_bytes: job.uploaded_bytes,
    }
}
