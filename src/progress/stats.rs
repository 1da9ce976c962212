//! Derived batch metrics, summaries, and owner history.

use std::collections::HashMap;

use crate::error::Result;
use crate::types::{BatchId, BatchState, BatchStats, BatchStatus, BatchSummary, FailedFile, FileStatus};

use super::ProgressManager;

impl ProgressManager {
    /// Compute throughput metrics for one batch
    ///
    /// Speed is total uploaded bytes over elapsed wall time since the batch
    /// was registered. The ETA divides the remaining bytes by that speed and
    /// is infinite while nothing has been uploaded yet.
    pub async fn calculate_batch_stats(&self, batch_id: &BatchId) -> Result<BatchStats> {
        let entry = self.entry(batch_id).await?;
        let entry = entry.lock().await;

        let elapsed = entry.started.elapsed().as_secs_f64();
        let uploaded = entry.status.total_uploaded_bytes;
        let speed = if elapsed > 0.0 && uploaded > 0 {
            uploaded as f64 / elapsed
        } else {
            0.0
        };

        let remaining = entry.status.total_bytes.saturating_sub(uploaded);
        let eta = if remaining == 0 {
            0.0
        } else if speed > 0.0 {
            remaining as f64 / speed
        } else {
            f64::INFINITY
        };

        Ok(BatchStats {
            upload_speed_bps: speed,
            estimated_time_remaining_secs: eta,
            average_file_size: average_file_size(&entry.status),
        })
    }

    /// Build the per-batch completion report
    pub async fn generate_batch_summary(&self, batch_id: &BatchId) -> Result<BatchSummary> {
        let entry = self.entry(batch_id).await?;
        let entry = entry.lock().await;
        let status = &entry.status;

        let errors: Vec<FailedFile> = status
            .files
            .iter()
            .filter(|f| f.status == FileStatus::Failed)
            .map(|f| FailedFile {
                file_name: f.file_name.clone(),
                error_message: f
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "unknown error".to_string()),
                retryable: f.error.as_ref().is_some_and(|e| e.retryable),
            })
            .collect();

        Ok(BatchSummary {
            batch_id: status.batch_id.clone(),
            total_files: status.files.len(),
            successful_uploads: status.successful_uploads,
            failed_uploads: status.failed_uploads,
            total_bytes: status.total_bytes,
            average_file_size: average_file_size(status),
            errors,
        })
    }

    /// Snapshot an owner's batches, most recent first, capped at the
    /// configured history limit
    pub async fn get_batch_history(&self, owner_id: &str) -> Vec<BatchStatus> {
        let mut history = Vec::new();
        {
            let batches = self.batches.read().await;
            for entry in batches.values() {
                let entry = entry.lock().await;
                if entry.status.owner_id == owner_id {
                    history.push(entry.status.clone());
                }
            }
        }
        history.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        history.truncate(self.config.history_limit);
        history
    }

    /// Count batches currently tracked, terminal ones included
    pub async fn tracked_batches(&self) -> usize {
        self.batches.read().await.len()
    }

    /// Snapshot every tracked batch's status, keyed by id
    pub async fn batch_statuses(&self) -> HashMap<BatchId, BatchStatus> {
        let batches = self.batches.read().await;
        let mut statuses = HashMap::with_capacity(batches.len());
        for (id, entry) in batches.iter() {
            let entry = entry.lock().await;
            statuses.insert(id.clone(), entry.status.clone());
        }
        statuses
    }

    /// Ids of batches that are queued or still processing
    pub async fn active_batches(&self) -> Vec<BatchId> {
        let batches = self.batches.read().await;
        let mut active = Vec::new();
        for (id, entry) in batches.iter() {
            let entry = entry.lock().await;
            if !entry.status.status.is_terminal() {
                active.push(id.clone());
            }
        }
        active
    }

    /// True once every tracked batch is terminal
    pub async fn all_batches_terminal(&self) -> bool {
        let batches = self.batches.read().await;
        for entry in batches.values() {
            let entry = entry.lock().await;
            if !matches!(
                entry.status.status,
                BatchState::Completed | BatchState::Cancelled
            ) {
                return false;
            }
        }
        true
    }
}

fn average_file_size(status: &BatchStatus) -> u64 {
    let count = status.files.len() as u64;
    if count == 0 {
        0
    } else {
        status.total_bytes / count
    }
}
