//! Progress manager — single source of truth for batch and file state.
//!
//! Owns every [`BatchStatus`] and derives the aggregates. Writes to the same
//! batch are serialized through a per-batch mutex while different batches
//! proceed in parallel; callers only ever receive snapshots. Mutations are
//! mirrored best-effort to the injected persistence layer.
//!
//! The impl is split by domain: this file holds registration, file updates,
//! cancellation, retry, and cleanup; `stats` holds the derived speed/ETA
//! metrics, summaries, and history.

mod stats;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use crate::config::ProgressConfig;
use crate::error::{BatchError, Result};
use crate::persistence::Persistence;
use crate::types::{
    BatchId, BatchJob, BatchState, BatchStatus, Destination, FileError, FileHandle, FileId,
    FileStatus, RetryOutcome, StoredObject,
};

/// Partial update applied to one file
///
/// Unset fields leave the current value untouched.
#[derive(Clone, Debug, Default)]
pub struct FileProgressUpdate {
    /// New status
    pub status: Option<FileStatus>,
    /// New progress fraction in [0, 1]
    pub progress: Option<f64>,
    /// New uploaded byte count
    pub uploaded_bytes: Option<u64>,
    /// Classified error to attach
    pub error: Option<FileError>,
    /// Storage descriptor to attach
    pub result: Option<StoredObject>,
}

impl FileProgressUpdate {
    /// Update that marks a file as started
    pub fn started() -> Self {
        Self {
            status: Some(FileStatus::Processing),
            ..Self::default()
        }
    }

    /// Update that marks a file completed with its stored descriptor
    pub fn completed(result: StoredObject) -> Self {
        Self {
            status: Some(FileStatus::Completed),
            result: Some(result),
            ..Self::default()
        }
    }

    /// Update that marks a file failed with a classified error
    pub fn failed(error: FileError) -> Self {
        Self {
            status: Some(FileStatus::Failed),
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Tracked state for one batch: the public snapshot plus timing internals
pub(crate) struct BatchEntry {
    pub(crate) status: BatchStatus,
    /// Monotonic start instant, for speed math
    pub(crate) started: Instant,
}

/// Progress manager (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct ProgressManager {
    pub(crate) config: ProgressConfig,
    persistence: Arc<dyn Persistence>,
    /// Outer map guarded by RwLock; each batch guarded by its own Mutex so
    /// same-batch updates serialize while different batches run in parallel
    pub(crate) batches: Arc<RwLock<HashMap<BatchId, Arc<Mutex<BatchEntry>>>>>,
}

impl ProgressManager {
    /// Create a manager with the given configuration and persistence mirror
    pub fn new(config: ProgressConfig, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            config,
            persistence,
            batches: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a new batch with every file queued
    ///
    /// File ids are generated positionally, so duplicate file names never
    /// collide. Fails with `DuplicateBatchId` if the id is already tracked,
    /// and rejects empty batches and zero-sized files before registering.
    pub async fn create_batch(
        &self,
        batch_id: BatchId,
        owner_id: impl Into<String>,
        files: &[FileHandle],
        destination: Destination,
    ) -> Result<BatchStatus> {
        if files.is_empty() {
            return Err(BatchError::EmptyBatch.into());
        }
        for file in files {
            if file.size_bytes == 0 {
                return Err(BatchError::InvalidFileSize {
                    name: file.file_name.clone(),
                    size: 0,
                }
                .into());
            }
        }

        let jobs: Vec<BatchJob> = files
            .iter()
            .enumerate()
            .map(|(index, file)| BatchJob {
                file_id: FileId::new(format!("{}-f{:04}", batch_id, index)),
                file_name: file.file_name.clone(),
                total_bytes: file.size_bytes,
                status: FileStatus::Queued,
                uploaded_bytes: 0,
                progress: 0.0,
                error: None,
                result: None,
            })
            .collect();

        let status = BatchStatus {
            batch_id: batch_id.clone(),
            owner_id: owner_id.into(),
            destination,
            total_bytes: jobs.iter().map(|j| j.total_bytes).sum(),
            files: jobs,
            status: BatchState::Queued,
            processed_files: 0,
            successful_uploads: 0,
            failed_uploads: 0,
            overall_progress: 0.0,
            total_uploaded_bytes: 0,
            cancel_reason: None,
            created_at: Utc::now(),
            completed_at: None,
        };

        {
            let mut batches = self.batches.write().await;
            if batches.contains_key(&batch_id) {
                return Err(BatchError::DuplicateBatchId { id: batch_id }.into());
            }
            batches.insert(
                batch_id.clone(),
                Arc::new(Mutex::new(BatchEntry {
                    status: status.clone(),
                    started: Instant::now(),
                })),
            );
        }

        tracing::info!(
            batch_id = %batch_id,
            files = status.files.len(),
            total_bytes = status.total_bytes,
            "batch registered"
        );

        self.mirror_batch(status.clone());
        Ok(status)
    }

    /// Apply a partial update to one file and recompute the aggregates
    ///
    /// File transitions are monotonic: a terminal file ignores further status
    /// or progress changes (an explicit retry resets it instead). When the
    /// last non-terminal file finishes, the batch completes and `completed_at`
    /// is stamped. A cancelled batch is sealed: in-flight jobs may still land
    /// their terminal results, but status, progress, and byte updates are
    /// dropped.
    pub async fn update_file_progress(
        &self,
        batch_id: &BatchId,
        file_id: &FileId,
        update: FileProgressUpdate,
    ) -> Result<BatchStatus> {
        let entry = self.entry(batch_id).await?;
        let mut entry = entry.lock().await;

        let batch_cancelled = entry.status.status == BatchState::Cancelled;
        let file = entry
            .status
            .files
            .iter_mut()
            .find(|f| &f.file_id == file_id)
            .ok_or_else(|| BatchError::FileNotFound {
                batch_id: batch_id.clone(),
                file_id: file_id.clone(),
            })?;

        if file.status.is_terminal() {
            // Late or duplicate result: attach missing detail, never regress
            if file.result.is_none()
                && let Some(result) = update.result
            {
                file.result = Some(result);
            }
            if file.error.is_none()
                && let Some(error) = update.error
            {
                file.error = Some(error);
            }
        } else if batch_cancelled {
            // The batch is sealed: record only the terminal outcome of a job
            // that was already in flight when the cancel landed
            match update.status {
                Some(FileStatus::Completed) => {
                    file.status = FileStatus::Completed;
                    file.uploaded_bytes = file.total_bytes;
                    file.progress = 1.0;
                    file.error = None;
                    file.result = update.result;
                }
                Some(FileStatus::Failed) => {
                    file.status = FileStatus::Failed;
                    if let Some(error) = update.error {
                        file.error = Some(error);
                    }
                }
                Some(FileStatus::Queued | FileStatus::Processing) | None => {
                    tracing::debug!(
                        batch_id = %batch_id,
                        file_id = %file_id,
                        "dropping non-terminal update for a cancelled batch"
                    );
                    return Ok(entry.status.clone());
                }
            }
        } else {
            if let Some(uploaded) = update.uploaded_bytes {
                file.uploaded_bytes = uploaded.min(file.total_bytes);
            }
            if let Some(progress) = update.progress {
                file.progress = progress.clamp(0.0, 1.0);
                if update.uploaded_bytes.is_none() && file.total_bytes > 0 {
                    file.uploaded_bytes = (file.progress * file.total_bytes as f64) as u64;
                }
            }
            if let Some(error) = update.error {
                file.error = Some(error);
            }
            if let Some(result) = update.result {
                file.result = Some(result);
            }
            if let Some(status) = update.status {
                file.status = status;
                match status {
                    FileStatus::Completed => {
                        file.uploaded_bytes = file.total_bytes;
                        file.progress = 1.0;
                        file.error = None;
                    }
                    FileStatus::Failed | FileStatus::Processing | FileStatus::Queued => {}
                }
            } else if file.uploaded_bytes > 0 && file.status == FileStatus::Queued {
                // Bytes are flowing; the file is implicitly processing
                file.status = FileStatus::Processing;
            }
            if file.total_bytes > 0 {
                file.progress = file.uploaded_bytes as f64 / file.total_bytes as f64;
            }
        }

        let mirrored_file = file.clone();
        recompute_aggregates(&mut entry.status);

        let snapshot = entry.status.clone();
        drop(entry);

        self.mirror_file(batch_id.clone(), mirrored_file);
        self.mirror_batch(snapshot.clone());
        Ok(snapshot)
    }

    /// Cancel a batch that is still queued or processing
    ///
    /// In-flight jobs are not stopped here (the queue's cancellation token
    /// handles dispatch); this records the terminal state and reason. Fails
    /// with `AlreadyCompleted` once the batch is terminal.
    pub async fn cancel_batch(
        &self,
        batch_id: &BatchId,
        reason: impl Into<String>,
    ) -> Result<BatchStatus> {
        let entry = self.entry(batch_id).await?;
        let mut entry = entry.lock().await;

        if entry.status.status.is_terminal() {
            return Err(BatchError::AlreadyCompleted {
                id: batch_id.clone(),
                state: format!("{:?}", entry.status.status).to_lowercase(),
            }
            .into());
        }

        let reason = reason.into();
        entry.status.status = BatchState::Cancelled;
        entry.status.cancel_reason = Some(reason.clone());
        entry.status.completed_at = Some(Utc::now());

        tracing::info!(batch_id = %batch_id, reason = %reason, "batch cancelled");

        let snapshot = entry.status.clone();
        drop(entry);
        self.mirror_batch(snapshot.clone());
        Ok(snapshot)
    }

    /// Reset every retryable failed file back to queued
    ///
    /// Non-retryable failures stay failed and are counted as skipped. Returns
    /// the outcome counts together with the ids to hand back to the queue.
    pub async fn retry_failed_files(
        &self,
        batch_id: &BatchId,
    ) -> Result<(RetryOutcome, Vec<FileId>)> {
        let entry = self.entry(batch_id).await?;
        let mut entry = entry.lock().await;

        if entry.status.status == BatchState::Cancelled {
            return Err(BatchError::AlreadyCompleted {
                id: batch_id.clone(),
                state: "cancelled".to_string(),
            }
            .into());
        }

        let mut outcome = RetryOutcome::default();
        let mut retried_ids = Vec::new();

        for file in &mut entry.status.files {
            if file.status != FileStatus::Failed {
                continue;
            }
            let retryable = file.error.as_ref().is_some_and(|e| e.retryable);
            if retryable {
                file.status = FileStatus::Queued;
                file.uploaded_bytes = 0;
                file.progress = 0.0;
                file.error = None;
                outcome.retried_files += 1;
                retried_ids.push(file.file_id.clone());
            } else {
                outcome.skipped_files += 1;
            }
        }

        if outcome.retried_files > 0 {
            // Re-opened: the batch is processing again until the retries land
            entry.status.status = BatchState::Processing;
            entry.status.completed_at = None;
            recompute_aggregates(&mut entry.status);
        }

        tracing::info!(
            batch_id = %batch_id,
            retried = outcome.retried_files,
            skipped = outcome.skipped_files,
            "retry pass over failed files"
        );

        let snapshot = entry.status.clone();
        drop(entry);
        if outcome.retried_files > 0 {
            self.mirror_batch(snapshot);
        }
        Ok((outcome, retried_ids))
    }

    /// Snapshot one batch's status
    pub async fn get_batch(&self, batch_id: &BatchId) -> Result<BatchStatus> {
        let entry = self.entry(batch_id).await?;
        let entry = entry.lock().await;
        Ok(entry.status.clone())
    }

    /// Remove terminal batches past the configured age, plus per-owner
    /// overflow beyond the history limit (oldest first)
    ///
    /// Returns the removed ids so the caller can release queue submissions
    /// and subscriptions.
    pub async fn sweep_expired(&self) -> Vec<BatchId> {
        let now = Utc::now();
        let max_age = chrono::Duration::from_std(self.config.max_batch_age)
            .unwrap_or_else(|_| chrono::Duration::hours(1));

        // Collect terminal batches with their completion times
        let terminal: Vec<(BatchId, String, chrono::DateTime<Utc>)> = {
            let batches = self.batches.read().await;
            let snapshots = futures::future::join_all(batches.iter().map(|(id, entry)| {
                let id = id.clone();
                let entry = entry.clone();
                async move {
                    let entry = entry.lock().await;
                    entry.status.status.is_terminal().then(|| {
                        (
                            id,
                            entry.status.owner_id.clone(),
                            entry.status.completed_at.unwrap_or(entry.status.created_at),
                        )
                    })
                }
            }))
            .await;
            snapshots.into_iter().flatten().collect()
        };

        let mut to_remove: Vec<BatchId> = terminal
            .iter()
            .filter(|(_, _, completed)| now - *completed > max_age)
            .map(|(id, _, _)| id.clone())
            .collect();

        // Per-owner overflow beyond the history limit, oldest evicted first
        let mut by_owner: HashMap<&str, Vec<&(BatchId, String, chrono::DateTime<Utc>)>> =
            HashMap::new();
        for item in &terminal {
            by_owner.entry(item.1.as_str()).or_default().push(item);
        }
        for (_, mut items) in by_owner {
            if items.len() <= self.config.history_limit {
                continue;
            }
            items.sort_by_key(|(_, _, completed)| *completed);
            let overflow = items.len() - self.config.history_limit;
            for (id, _, _) in items.into_iter().take(overflow) {
                if !to_remove.contains(id) {
                    to_remove.push(id.clone());
                }
            }
        }

        if !to_remove.is_empty() {
            let mut batches = self.batches.write().await;
            for id in &to_remove {
                batches.remove(id);
            }
            tracing::info!(removed = to_remove.len(), "swept expired batches");
        }

        to_remove
    }

    pub(crate) async fn entry(&self, batch_id: &BatchId) -> Result<Arc<Mutex<BatchEntry>>> {
        let batches = self.batches.read().await;
        batches
            .get(batch_id)
            .cloned()
            .ok_or_else(|| BatchError::NotFound {
                id: batch_id.clone(),
            }
            .into())
    }

    /// Mirror a batch snapshot to the persistence layer, fire-and-forget
    fn mirror_batch(&self, status: BatchStatus) {
        let persistence = self.persistence.clone();
        tokio::spawn(async move {
            if let Err(e) = persistence.record_batch(&status).await {
                tracing::warn!(batch_id = %status.batch_id, error = %e, "persistence mirror failed");
            }
        });
    }

    /// Mirror one file's state to the persistence layer, fire-and-forget
    fn mirror_file(&self, batch_id: BatchId, job: BatchJob) {
        let persistence = self.persistence.clone();
        tokio::spawn(async move {
            if let Err(e) = persistence.record_file(&batch_id, &job).await {
                tracing::warn!(batch_id = %batch_id, file_id = %job.file_id, error = %e, "persistence mirror failed");
            }
        });
    }
}

/// Recompute every derived field on a batch from its files
fn recompute_aggregates(status: &mut BatchStatus) {
    status.total_uploaded_bytes = status.files.iter().map(|f| f.uploaded_bytes).sum();
    status.successful_uploads = status
        .files
        .iter()
        .filter(|f| f.status == FileStatus::Completed)
        .count();
    status.failed_uploads = status
        .files
        .iter()
        .filter(|f| f.status == FileStatus::Failed)
        .count();
    status.processed_files = status.successful_uploads + status.failed_uploads;
    status.overall_progress = if status.total_bytes > 0 {
        status.total_uploaded_bytes as f64 / status.total_bytes as f64
    } else {
        0.0
    };

    // Cancelled is sticky; otherwise the batch follows its files
    if status.status != BatchState::Cancelled {
        let all_terminal = status.files.iter().all(|f| f.status.is_terminal());
        let any_started = status
            .files
            .iter()
            .any(|f| f.status != FileStatus::Queued || f.uploaded_bytes > 0);

        if all_terminal {
            if status.status != BatchState::Completed {
                status.status = BatchState::Completed;
                status.completed_at = Some(Utc::now());
            }
        } else if any_started {
            status.status = BatchState::Processing;
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::NoOpPersistence;

    fn handle(name: &str, size: u64) -> FileHandle {
        FileHandle {
            file_name: name.to_string(),
            path: format!("/tmp/{name}").into(),
            size_bytes: size,
        }
    }

    fn manager() -> ProgressManager {
        ProgressManager::new(ProgressConfig::default(), Arc::new(NoOpPersistence))
    }

    async fn two_file_batch(manager: &ProgressManager) -> (BatchId, FileId, FileId) {
        let batch_id = BatchId::new("b1");
        let status = manager
            .create_batch(
                batch_id.clone(),
                "owner-1",
                &[handle("a.jpg", 1000), handle("b.jpg", 2000)],
                Destination::project("proj"),
            )
            .await
            .unwrap();
        let f1 = status.files[0].file_id.clone();
        let f2 = status.files[1].file_id.clone();
        (batch_id, f1, f2)
    }

    #[tokio::test]
    async fn create_batch_generates_distinct_ids_for_duplicate_names() {
        let manager = manager();
        let status = manager
            .create_batch(
                BatchId::new("b1"),
                "owner-1",
                &[handle("same.jpg", 10), handle("same.jpg", 20)],
                Destination::project("proj"),
            )
            .await
            .unwrap();

        assert_ne!(
            status.files[0].file_id, status.files[1].file_id,
            "duplicate names must still get unique file ids"
        );
        assert_eq!(status.total_bytes, 30);
        assert_eq!(status.status, BatchState::Queued);
    }

    #[tokio::test]
    async fn create_batch_rejects_duplicate_batch_ids() {
        let manager = manager();
        let files = [handle("a.jpg", 10)];
        manager
            .create_batch(
                BatchId::new("b1"),
                "owner-1",
                &files,
                Destination::project("proj"),
            )
            .await
            .unwrap();

        let err = manager
            .create_batch(
                BatchId::new("b1"),
                "owner-1",
                &files,
                Destination::project("proj"),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Batch(BatchError::DuplicateBatchId { .. })
        ));
    }

    #[tokio::test]
    async fn overall_progress_is_bytes_weighted() {
        let manager = manager();
        let (batch_id, f1, f2) = two_file_batch(&manager).await;

        // file 1 at 500/1000, file 2 at 500/2000
        manager
            .update_file_progress(
                &batch_id,
                &f1,
                FileProgressUpdate {
                    uploaded_bytes: Some(500),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let status = manager
            .update_file_progress(
                &batch_id,
                &f2,
                FileProgressUpdate {
                    uploaded_bytes: Some(500),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(status.total_bytes, 3000);
        assert_eq!(status.total_uploaded_bytes, 1000);
        assert!(
            (status.overall_progress - 1.0 / 3.0).abs() < 1e-9,
            "expected ~0.333, got {}",
            status.overall_progress
        );
        assert_eq!(status.status, BatchState::Processing);
    }

    #[tokio::test]
    async fn progress_invariant_holds_after_every_update() {
        let manager = manager();
        let (batch_id, f1, f2) = two_file_batch(&manager).await;

        for (file, bytes) in [(&f1, 100), (&f2, 900), (&f1, 1000), (&f2, 1500)] {
            let status = manager
                .update_file_progress(
                    &batch_id,
                    file,
                    FileProgressUpdate {
                        uploaded_bytes: Some(bytes),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            let expected = status.total_uploaded_bytes as f64 / status.total_bytes as f64;
            assert!(
                (status.overall_progress - expected).abs() < 1e-9,
                "invariant broken: {} vs {}",
                status.overall_progress,
                expected
            );
        }
    }

    #[tokio::test]
    async fn batch_completes_when_every_file_is_terminal_even_with_failures() {
        let manager = manager();
        let (batch_id, f1, f2) = two_file_batch(&manager).await;

        manager
            .update_file_progress(
                &batch_id,
                &f1,
                FileProgressUpdate::completed(StoredObject {
                    object_id: "o1".into(),
                    location: "loc".into(),
                    size_bytes: 1000,
                }),
            )
            .await
            .unwrap();
        let status = manager
            .update_file_progress(
                &batch_id,
                &f2,
                FileProgressUpdate::failed(FileError {
                    message: "network timeout".into(),
                    retryable: true,
                }),
            )
            .await
            .unwrap();

        assert_eq!(
            status.status,
            BatchState::Completed,
            "a batch with failures still completes, it never fails"
        );
        assert!(status.completed_at.is_some());
        assert_eq!(status.processed_files, 2);
        assert_eq!(status.successful_uploads, 1);
        assert_eq!(status.failed_uploads, 1);
        assert_eq!(
            status.processed_files,
            status.successful_uploads + status.failed_uploads
        );
    }

    #[tokio::test]
    async fn terminal_files_do_not_regress_without_retry() {
        let manager = manager();
        let (batch_id, f1, _f2) = two_file_batch(&manager).await;

        manager
            .update_file_progress(
                &batch_id,
                &f1,
                FileProgressUpdate::completed(StoredObject {
                    object_id: "o1".into(),
                    location: "loc".into(),
                    size_bytes: 1000,
                }),
            )
            .await
            .unwrap();

        // A stray late update must not pull the file back to processing
        let status = manager
            .update_file_progress(
                &batch_id,
                &f1,
                FileProgressUpdate {
                    status: Some(FileStatus::Processing),
                    uploaded_bytes: Some(10),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let job = status.job(&f1).unwrap();
        assert_eq!(job.status, FileStatus::Completed);
        assert_eq!(job.uploaded_bytes, 1000);
    }

    #[tokio::test]
    async fn unknown_ids_return_not_found() {
        let manager = manager();
        let (batch_id, _f1, _f2) = two_file_batch(&manager).await;

        let err = manager
            .update_file_progress(
                &BatchId::new("ghost"),
                &FileId::new("f"),
                FileProgressUpdate::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Batch(BatchError::NotFound { .. })
        ));

        let err = manager
            .update_file_progress(&batch_id, &FileId::new("ghost"), FileProgressUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Batch(BatchError::FileNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_records_reason_and_rejects_terminal_batches() {
        let manager = manager();
        let (batch_id, f1, f2) = two_file_batch(&manager).await;

        let status = manager.cancel_batch(&batch_id, "user aborted").await.unwrap();
        assert_eq!(status.status, BatchState::Cancelled);
        assert_eq!(status.cancel_reason.as_deref(), Some("user aborted"));
        assert!(status.completed_at.is_some());

        // Cancelling again fails and mutates nothing
        let err = manager.cancel_batch(&batch_id, "again").await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Batch(BatchError::AlreadyCompleted { .. })
        ));
        let status = manager.get_batch(&batch_id).await.unwrap();
        assert_eq!(status.cancel_reason.as_deref(), Some("user aborted"));

        // Late job results are recorded but the batch stays cancelled
        manager
            .update_file_progress(
                &batch_id,
                &f1,
                FileProgressUpdate::completed(StoredObject {
                    object_id: "o1".into(),
                    location: "loc".into(),
                    size_bytes: 1000,
                }),
            )
            .await
            .unwrap();
        let status = manager
            .update_file_progress(
                &batch_id,
                &f2,
                FileProgressUpdate::failed(FileError {
                    message: "late failure".into(),
                    retryable: false,
                }),
            )
            .await
            .unwrap();
        assert_eq!(status.status, BatchState::Cancelled);
        assert_eq!(status.job(&f1).unwrap().status, FileStatus::Completed);
    }

    #[tokio::test]
    async fn cancelled_batch_drops_non_terminal_progress() {
        let manager = manager();
        let (batch_id, f1, f2) = two_file_batch(&manager).await;

        manager.cancel_batch(&batch_id, "user aborted").await.unwrap();

        // Byte and status churn must not move a sealed batch
        let status = manager
            .update_file_progress(
                &batch_id,
                &f1,
                FileProgressUpdate {
                    status: Some(FileStatus::Processing),
                    uploaded_bytes: Some(500),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let job = status.job(&f1).unwrap();
        assert_eq!(job.status, FileStatus::Queued, "sealed files stay queued");
        assert_eq!(job.uploaded_bytes, 0);
        assert_eq!(status.total_uploaded_bytes, 0);

        // A terminal outcome from an in-flight job is still recorded
        let status = manager
            .update_file_progress(
                &batch_id,
                &f2,
                FileProgressUpdate::completed(StoredObject {
                    object_id: "o2".into(),
                    location: "loc".into(),
                    size_bytes: 2000,
                }),
            )
            .await
            .unwrap();
        assert_eq!(status.status, BatchState::Cancelled);
        assert_eq!(status.job(&f2).unwrap().status, FileStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_on_completed_batch_fails_without_mutation() {
        let manager = manager();
        let (batch_id, f1, f2) = two_file_batch(&manager).await;

        for (file, size) in [(&f1, 1000u64), (&f2, 2000)] {
            manager
                .update_file_progress(
                    &batch_id,
                    file,
                    FileProgressUpdate::completed(StoredObject {
                        object_id: "o".into(),
                        location: "loc".into(),
                        size_bytes: size,
                    }),
                )
                .await
                .unwrap();
        }

        let before = manager.get_batch(&batch_id).await.unwrap();
        assert_eq!(before.status, BatchState::Completed);

        let err = manager.cancel_batch(&batch_id, "too late").await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Batch(BatchError::AlreadyCompleted { .. })
        ));

        let after = manager.get_batch(&batch_id).await.unwrap();
        assert_eq!(after.status, BatchState::Completed);
        assert!(after.cancel_reason.is_none());
    }

    #[tokio::test]
    async fn retry_resets_exactly_the_retryable_failures() {
        let manager = manager();
        let (batch_id, f1, f2) = two_file_batch(&manager).await;

        manager
            .update_file_progress(
                &batch_id,
                &f1,
                FileProgressUpdate::failed(FileError {
                    message: "connection timed out".into(),
                    retryable: true,
                }),
            )
            .await
            .unwrap();
        manager
            .update_file_progress(
                &batch_id,
                &f2,
                FileProgressUpdate::failed(FileError {
                    message: "unsupported file type".into(),
                    retryable: false,
                }),
            )
            .await
            .unwrap();

        let (outcome, retried_ids) = manager.retry_failed_files(&batch_id).await.unwrap();
        assert_eq!(outcome.retried_files, 1);
        assert_eq!(outcome.skipped_files, 1);
        assert_eq!(retried_ids, vec![f1.clone()]);

        let status = manager.get_batch(&batch_id).await.unwrap();
        assert_eq!(status.job(&f1).unwrap().status, FileStatus::Queued);
        assert_eq!(status.job(&f2).unwrap().status, FileStatus::Failed);
        assert_eq!(
            status.status,
            BatchState::Processing,
            "a re-opened batch is processing again"
        );
        assert!(status.completed_at.is_none());
    }

    #[tokio::test]
    async fn sweep_removes_only_old_terminal_batches() {
        let mut config = ProgressConfig::default();
        config.max_batch_age = std::time::Duration::from_millis(50);
        let manager = ProgressManager::new(config, Arc::new(NoOpPersistence));

        let done = BatchId::new("done");
        let status = manager
            .create_batch(
                done.clone(),
                "owner-1",
                &[handle("a.jpg", 10)],
                Destination::project("proj"),
            )
            .await
            .unwrap();
        manager
            .update_file_progress(
                &done,
                &status.files[0].file_id,
                FileProgressUpdate::completed(StoredObject {
                    object_id: "o".into(),
                    location: "loc".into(),
                    size_bytes: 10,
                }),
            )
            .await
            .unwrap();

        let active = BatchId::new("active");
        manager
            .create_batch(
                active.clone(),
                "owner-1",
                &[handle("b.jpg", 10)],
                Destination::project("proj"),
            )
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let removed = manager.sweep_expired().await;
        assert_eq!(removed, vec![done.clone()]);
        assert!(manager.get_batch(&done).await.is_err());
        assert!(
            manager.get_batch(&active).await.is_ok(),
            "non-terminal batches are never swept"
        );
    }
}
