//! Upload queue — executes a batch's jobs under a bounded concurrency.
//!
//! Each submitted batch gets its own semaphore; permits are acquired in
//! submission order before a job task is spawned, so dispatch is FIFO and at
//! most `concurrency` storage calls run at once. Retried jobs re-enter the
//! same semaphore instead of bypassing the queue. Global counters feed the
//! health monitor.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::{BatchError, Error, Result, StorageError};
use crate::retry::IsRetryable;
use crate::storage::StorageBackend;
use crate::types::{BatchId, ConnectionStatus, Destination, FileError, FileHandle, FileId, StoredObject};

/// One file queued for upload
#[derive(Clone, Debug)]
pub struct QueuedUpload {
    /// File identifier assigned by the progress manager
    pub file_id: FileId,
    /// Handle passed through to the storage backend
    pub handle: FileHandle,
}

/// Progress pushed from the queue to whoever drives the batch
#[derive(Clone, Debug)]
pub enum JobUpdate {
    /// The job acquired a permit and is calling the storage backend
    Started {
        /// File identifier
        file_id: FileId,
    },
    /// The storage backend accepted the file
    Completed {
        /// File identifier
        file_id: FileId,
        /// Stored-object descriptor
        result: StoredObject,
    },
    /// The storage backend rejected the file
    Failed {
        /// File identifier
        file_id: FileId,
        /// Classified error
        error: FileError,
    },
    /// The job was never dispatched because the batch was cancelled
    Skipped {
        /// File identifier
        file_id: FileId,
    },
}

/// Final outcome of one job within a submission
#[derive(Clone, Debug)]
pub enum JobOutcome {
    /// Stored successfully
    Completed(StoredObject),
    /// Failed with a classified error
    Failed(FileError),
    /// Never dispatched (batch cancelled first)
    Skipped,
}

/// Acknowledgement returned once every job in a submission finished
#[derive(Debug)]
pub struct SubmitAck {
    /// Batch identifier
    pub batch_id: BatchId,
    /// Per-file outcomes in submission order
    pub outcomes: Vec<(FileId, JobOutcome)>,
}

/// A batch submission request
pub struct SubmitRequest {
    /// Batch identifier
    pub batch_id: BatchId,
    /// Where the files go
    pub destination: Destination,
    /// Files in dispatch order
    pub files: Vec<QueuedUpload>,
    /// Maximum jobs in flight for this batch (must be >= 1)
    pub concurrency: usize,
    /// Channel receiving per-job progress
    pub updates: mpsc::UnboundedSender<JobUpdate>,
    /// Cancelling this token stops further dispatch; in-flight jobs finish
    pub cancel: CancellationToken,
}

/// Queue depth and failure counts exposed to the health monitor
#[derive(Clone, Copy, Debug)]
pub struct QueueMetrics {
    /// Jobs waiting for a permit
    pub waiting_jobs: u64,
    /// Jobs executing against the storage backend
    pub active_jobs: u64,
    /// Jobs failed so far
    pub failed_jobs: u64,
    /// Jobs completed so far
    pub completed_jobs: u64,
    /// Storage backend connection status
    pub connection_status: ConnectionStatus,
}

/// Per-job state retained for retry validation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JobState {
    Pending,
    Running,
    Completed,
    Failed { retryable: bool },
    Skipped,
}

/// Retained state for one submitted batch
struct BatchSubmission {
    destination: Destination,
    files: HashMap<FileId, FileHandle>,
    states: Arc<Mutex<HashMap<FileId, JobState>>>,
    semaphore: Arc<Semaphore>,
    updates: mpsc::UnboundedSender<JobUpdate>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct QueueCounters {
    waiting: AtomicU64,
    active: AtomicU64,
    failed: AtomicU64,
    completed: AtomicU64,
    disconnected: AtomicBool,
}

/// Upload queue service (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct UploadQueue {
    storage: Arc<dyn StorageBackend>,
    counters: Arc<QueueCounters>,
    submissions: Arc<Mutex<HashMap<BatchId, BatchSubmission>>>,
}

impl UploadQueue {
    /// Create a queue executing against the given storage backend
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            counters: Arc::new(QueueCounters::default()),
            submissions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Submit a batch and wait for every job to finish
    ///
    /// Setup problems (zero concurrency, empty batch, non-positive file size)
    /// fail the call synchronously before any job runs. Individual file
    /// failures never fail the call; they appear in the acknowledgement and
    /// in the update channel.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitAck> {
        let SubmitRequest {
            batch_id,
            destination,
            files,
            concurrency,
            updates,
            cancel,
        } = request;

        if concurrency == 0 {
            return Err(Error::Batch(BatchError::InvalidConcurrency { value: 0 }));
        }
        if files.is_empty() {
            return Err(Error::Batch(BatchError::EmptyBatch));
        }
        for upload in &files {
            if upload.handle.size_bytes == 0 {
                return Err(Error::Batch(BatchError::InvalidFileSize {
                    name: upload.handle.file_name.clone(),
                    size: 0,
                }));
            }
        }

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let states: Arc<Mutex<HashMap<FileId, JobState>>> = Arc::new(Mutex::new(
            files
                .iter()
                .map(|u| (u.file_id.clone(), JobState::Pending))
                .collect(),
        ));

        {
            let mut submissions = self.submissions.lock().await;
            submissions.insert(
                batch_id.clone(),
                BatchSubmission {
                    destination: destination.clone(),
                    files: files
                        .iter()
                        .map(|u| (u.file_id.clone(), u.handle.clone()))
                        .collect(),
                    states: states.clone(),
                    semaphore: semaphore.clone(),
                    updates: updates.clone(),
                    cancel: cancel.clone(),
                },
            );
        }

        self.counters
            .waiting
            .fetch_add(files.len() as u64, Ordering::Relaxed);

        tracing::info!(
            batch_id = %batch_id,
            files = files.len(),
            concurrency = concurrency,
            "batch submitted to upload queue"
        );

        // Acquire permits in submission order before spawning, so dispatch is
        // FIFO and the semaphore enforces the concurrency cap.
        let mut handles = Vec::with_capacity(files.len());
        for upload in files {
            let file_id = upload.file_id.clone();

            if cancel.is_cancelled() {
                handles.push(JobHandle::Skipped(file_id));
                continue;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => permit,
                _ = cancel.cancelled() => {
                    handles.push(JobHandle::Skipped(file_id));
                    continue;
                }
            };

            let permit = match permit {
                Ok(p) => p,
                Err(_) => {
                    // Semaphore closed mid-shutdown; skip the remaining jobs
                    handles.push(JobHandle::Skipped(file_id));
                    continue;
                }
            };

            let job = JobContext {
                file_id: file_id.clone(),
                handle: upload.handle,
                destination: destination.clone(),
                storage: self.storage.clone(),
                counters: self.counters.clone(),
                states: states.clone(),
                updates: updates.clone(),
            };

            handles.push(JobHandle::Running(
                file_id,
                tokio::spawn(async move {
                    let _permit = permit;
                    job.run().await
                }),
            ));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle {
                JobHandle::Skipped(file_id) => {
                    self.counters.waiting.fetch_sub(1, Ordering::Relaxed);
                    {
                        let mut states = states.lock().await;
                        states.insert(file_id.clone(), JobState::Skipped);
                    }
                    updates
                        .send(JobUpdate::Skipped {
                            file_id: file_id.clone(),
                        })
                        .ok();
                    outcomes.push((file_id, JobOutcome::Skipped));
                }
                JobHandle::Running(file_id, join) => match join.await {
                    Ok(outcome) => outcomes.push((file_id, outcome)),
                    Err(e) => {
                        // A panicked job still counts as a failed upload
                        tracing::error!(file_id = %file_id, error = %e, "upload job panicked");
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        let error = FileError {
                            message: format!("upload task aborted: {}", e),
                            retryable: false,
                        };
                        {
                            let mut states = states.lock().await;
                            states.insert(file_id.clone(), JobState::Failed { retryable: false });
                        }
                        updates
                            .send(JobUpdate::Failed {
                                file_id: file_id.clone(),
                                error: error.clone(),
                            })
                            .ok();
                        outcomes.push((file_id, JobOutcome::Failed(error)));
                    }
                },
            }
        }

        Ok(SubmitAck { batch_id, outcomes })
    }

    /// Re-queue a single previously failed, retryable job
    ///
    /// Returns `Ok(true)` if the job was re-queued, `Ok(false)` as a no-op
    /// for non-retryable or non-failed jobs. The retry waits on the batch's
    /// original semaphore, behind any jobs still queued.
    pub async fn retry_job(&self, batch_id: &BatchId, file_id: &FileId) -> Result<bool> {
        let (job, cancel) = {
            let submissions = self.submissions.lock().await;
            let submission =
                submissions
                    .get(batch_id)
                    .ok_or_else(|| BatchError::NotFound {
                        id: batch_id.clone(),
                    })?;

            let handle =
                submission
                    .files
                    .get(file_id)
                    .ok_or_else(|| BatchError::FileNotFound {
                        batch_id: batch_id.clone(),
                        file_id: file_id.clone(),
                    })?;

            {
                let mut states = submission.states.lock().await;
                match states.get(file_id) {
                    Some(JobState::Failed { retryable: true }) => {
                        states.insert(file_id.clone(), JobState::Pending);
                    }
                    _ => return Ok(false),
                }
            }

            (
                JobContext {
                    file_id: file_id.clone(),
                    handle: handle.clone(),
                    destination: submission.destination.clone(),
                    storage: self.storage.clone(),
                    counters: self.counters.clone(),
                    states: submission.states.clone(),
                    updates: submission.updates.clone(),
                },
                (submission.semaphore.clone(), submission.cancel.clone()),
            )
        };

        let (semaphore, cancel_token) = cancel;
        self.counters.waiting.fetch_add(1, Ordering::Relaxed);

        tracing::info!(batch_id = %batch_id, file_id = %file_id, "re-queueing failed job");

        tokio::spawn(async move {
            let permit = tokio::select! {
                permit = semaphore.acquire_owned() => permit,
                _ = cancel_token.cancelled() => {
                    job.counters.waiting.fetch_sub(1, Ordering::Relaxed);
                    job.updates
                        .send(JobUpdate::Skipped {
                            file_id: job.file_id.clone(),
                        })
                        .ok();
                    return;
                }
            };
            let Ok(_permit) = permit else {
                job.counters.waiting.fetch_sub(1, Ordering::Relaxed);
                return;
            };
            job.run().await;
        });

        Ok(true)
    }

    /// Stop dispatching further jobs for a batch; in-flight jobs finish
    pub async fn cancel_batch(&self, batch_id: &BatchId) {
        let submissions = self.submissions.lock().await;
        if let Some(submission) = submissions.get(batch_id) {
            submission.cancel.cancel();
        }
    }

    /// Drop the retained submission for a batch (after cleanup)
    pub async fn release_batch(&self, batch_id: &BatchId) {
        let mut submissions = self.submissions.lock().await;
        if submissions.remove(batch_id).is_some() {
            tracing::debug!(batch_id = %batch_id, "released queue submission");
        }
    }

    /// Current queue depth and failure counts, for the health monitor
    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            waiting_jobs: self.counters.waiting.load(Ordering::Relaxed),
            active_jobs: self.counters.active.load(Ordering::Relaxed),
            failed_jobs: self.counters.failed.load(Ordering::Relaxed),
            completed_jobs: self.counters.completed.load(Ordering::Relaxed),
            connection_status: if self.counters.disconnected.load(Ordering::Relaxed) {
                ConnectionStatus::Disconnected
            } else {
                ConnectionStatus::Connected
            },
        }
    }
}

enum JobHandle {
    Running(FileId, tokio::task::JoinHandle<JobOutcome>),
    Skipped(FileId),
}

/// Everything one job task needs, cloned out of the queue
struct JobContext {
    file_id: FileId,
    handle: FileHandle,
    destination: Destination,
    storage: Arc<dyn StorageBackend>,
    counters: Arc<QueueCounters>,
    states: Arc<Mutex<HashMap<FileId, JobState>>>,
    updates: mpsc::UnboundedSender<JobUpdate>,
}

impl JobContext {
    /// Run one upload against the storage backend; never panics outward
    async fn run(self) -> JobOutcome {
        self.counters.waiting.fetch_sub(1, Ordering::Relaxed);
        self.counters.active.fetch_add(1, Ordering::Relaxed);
        {
            let mut states = self.states.lock().await;
            states.insert(self.file_id.clone(), JobState::Running);
        }
        self.updates
            .send(JobUpdate::Started {
                file_id: self.file_id.clone(),
            })
            .ok();

        let result = self.storage.store(&self.handle, &self.destination).await;
        self.counters.active.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(stored) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                self.counters.disconnected.store(false, Ordering::Relaxed);
                {
                    let mut states = self.states.lock().await;
                    states.insert(self.file_id.clone(), JobState::Completed);
                }
                self.updates
                    .send(JobUpdate::Completed {
                        file_id: self.file_id.clone(),
                        result: stored.clone(),
                    })
                    .ok();
                JobOutcome::Completed(stored)
            }
            Err(e) => {
                let retryable = e.is_retryable();
                if matches!(e, StorageError::Unavailable(_)) {
                    self.counters.disconnected.store(true, Ordering::Relaxed);
                }
                self.counters.failed.fetch_add(1, Ordering::Relaxed);

                tracing::warn!(
                    file_id = %self.file_id,
                    file_name = %self.handle.file_name,
                    error = %e,
                    retryable = retryable,
                    "upload job failed"
                );

                let error = FileError {
                    message: e.to_string(),
                    retryable,
                };
                {
                    let mut states = self.states.lock().await;
                    states.insert(self.file_id.clone(), JobState::Failed { retryable });
                }
                self.updates
                    .send(JobUpdate::Failed {
                        file_id: self.file_id.clone(),
                        error: error.clone(),
                    })
                    .ok();
                JobOutcome::Failed(error)
            }
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::test_helpers::MockStorage;
    use std::time::Duration;

    fn upload(id: &str, name: &str, size: u64) -> QueuedUpload {
        QueuedUpload {
            file_id: FileId::new(id),
            handle: FileHandle {
                file_name: name.to_string(),
                path: format!("/tmp/{name}").into(),
                size_bytes: size,
            },
        }
    }

    fn request(
        batch: &str,
        files: Vec<QueuedUpload>,
        concurrency: usize,
    ) -> (SubmitRequest, mpsc::UnboundedReceiver<JobUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SubmitRequest {
                batch_id: BatchId::new(batch),
                destination: Destination::project("proj"),
                files,
                concurrency,
                updates: tx,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn submit_rejects_zero_concurrency() {
        let queue = UploadQueue::new(Arc::new(MockStorage::succeeding()));
        let (req, _rx) = request("b1", vec![upload("f1", "a.jpg", 10)], 0);
        let err = queue.submit(req).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Batch(BatchError::InvalidConcurrency { value: 0 })
        ));
    }

    #[tokio::test]
    async fn submit_rejects_empty_batch_and_zero_sized_files() {
        let queue = UploadQueue::new(Arc::new(MockStorage::succeeding()));

        let (req, _rx) = request("b1", Vec::new(), 2);
        assert!(matches!(
            queue.submit(req).await.unwrap_err(),
            Error::Batch(BatchError::EmptyBatch)
        ));

        let (req, _rx) = request("b2", vec![upload("f1", "empty.bin", 0)], 2);
        assert!(matches!(
            queue.submit(req).await.unwrap_err(),
            Error::Batch(BatchError::InvalidFileSize { .. })
        ));
    }

    #[tokio::test]
    async fn all_jobs_complete_and_outcomes_preserve_submission_order() {
        let queue = UploadQueue::new(Arc::new(MockStorage::succeeding()));
        let files = vec![
            upload("f1", "a.jpg", 10),
            upload("f2", "b.jpg", 20),
            upload("f3", "c.jpg", 30),
        ];
        let (req, _rx) = request("b1", files, 2);

        let ack = queue.submit(req).await.unwrap();
        assert_eq!(ack.outcomes.len(), 3);
        let ids: Vec<_> = ack.outcomes.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["f1", "f2", "f3"]);
        for (id, outcome) in &ack.outcomes {
            assert!(
                matches!(outcome, JobOutcome::Completed(_)),
                "{id} should complete, got {outcome:?}"
            );
        }

        let metrics = queue.metrics();
        assert_eq!(metrics.completed_jobs, 3);
        assert_eq!(metrics.failed_jobs, 0);
        assert_eq!(metrics.waiting_jobs, 0);
        assert_eq!(metrics.active_jobs, 0);
    }

    #[tokio::test]
    async fn individual_file_failures_do_not_fail_the_submit_call() {
        let storage = MockStorage::succeeding();
        storage.fail_file("b.jpg", StorageError::Validation("bad".into()));
        let queue = UploadQueue::new(Arc::new(storage));

        let files = vec![upload("f1", "a.jpg", 10), upload("f2", "b.jpg", 20)];
        let (req, _rx) = request("b1", files, 2);

        let ack = queue.submit(req).await.unwrap();
        assert!(matches!(ack.outcomes[0].1, JobOutcome::Completed(_)));
        match &ack.outcomes[1].1 {
            JobOutcome::Failed(error) => {
                assert!(!error.retryable, "validation failures are permanent");
            }
            other => panic!("expected failure for b.jpg, got {other:?}"),
        }
        assert_eq!(queue.metrics().failed_jobs, 1);
    }

    #[tokio::test]
    async fn concurrency_cap_limits_parallel_storage_calls() {
        let storage = MockStorage::succeeding();
        storage.set_delay(Duration::from_millis(50));
        let storage = Arc::new(storage);
        let queue = UploadQueue::new(storage.clone());

        let files = (0..6)
            .map(|i| upload(&format!("f{i}"), &format!("{i}.jpg"), 10))
            .collect();
        let (req, _rx) = request("b1", files, 2);

        queue.submit(req).await.unwrap();
        assert!(
            storage.max_in_flight() <= 2,
            "at most 2 concurrent storage calls allowed, saw {}",
            storage.max_in_flight()
        );
    }

    #[tokio::test]
    async fn retry_job_requeues_only_retryable_failures() {
        let storage = MockStorage::succeeding();
        storage.fail_file("a.jpg", StorageError::Unavailable("down".into()));
        storage.fail_file("b.jpg", StorageError::UnsupportedType("exe".into()));
        let storage = Arc::new(storage);
        let queue = UploadQueue::new(storage.clone());

        let files = vec![upload("f1", "a.jpg", 10), upload("f2", "b.jpg", 20)];
        let (req, mut rx) = request("b1", files, 2);
        let batch_id = BatchId::new("b1");

        queue.submit(req).await.unwrap();

        // Permanent failure: no-op
        assert!(
            !queue.retry_job(&batch_id, &FileId::new("f2")).await.unwrap(),
            "non-retryable job must not be re-queued"
        );

        // Transient failure: re-queued and succeeds once the backend recovers
        storage.clear_failures();
        assert!(queue.retry_job(&batch_id, &FileId::new("f1")).await.unwrap());

        let mut saw_completed = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(JobUpdate::Completed { file_id, .. })) if file_id.as_str() == "f1" => {
                    saw_completed = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_completed, "retried job should complete");
    }

    #[tokio::test]
    async fn retry_job_rejects_unknown_ids() {
        let queue = UploadQueue::new(Arc::new(MockStorage::succeeding()));
        let err = queue
            .retry_job(&BatchId::new("nope"), &FileId::new("f1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Batch(BatchError::NotFound { .. })));
    }

    #[tokio::test]
    async fn cancelled_batch_skips_undispatched_jobs() {
        let storage = MockStorage::succeeding();
        storage.set_delay(Duration::from_millis(100));
        let queue = UploadQueue::new(Arc::new(storage));

        let files = (0..4)
            .map(|i| upload(&format!("f{i}"), &format!("{i}.jpg"), 10))
            .collect();
        let (mut req, _rx) = request("b1", files, 1);
        let cancel = CancellationToken::new();
        req.cancel = cancel.clone();

        let queue2 = queue.clone();
        let submit = tokio::spawn(async move { queue2.submit(req).await });
        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();

        let ack = submit.await.unwrap().unwrap();
        let skipped = ack
            .outcomes
            .iter()
            .filter(|(_, o)| matches!(o, JobOutcome::Skipped))
            .count();
        let completed = ack
            .outcomes
            .iter()
            .filter(|(_, o)| matches!(o, JobOutcome::Completed(_)))
            .count();
        assert!(skipped >= 1, "later jobs should be skipped after cancel");
        assert!(completed >= 1, "in-flight jobs run to completion");
        assert_eq!(queue.metrics().waiting_jobs, 0, "waiting gauge drains");
    }

    #[tokio::test]
    async fn unavailable_backend_flips_connection_status() {
        let storage = MockStorage::succeeding();
        storage.fail_file("a.jpg", StorageError::Unavailable("down".into()));
        let queue = UploadQueue::new(Arc::new(storage));

        let (req, _rx) = request("b1", vec![upload("f1", "a.jpg", 10)], 1);
        queue.submit(req).await.unwrap();

        assert_eq!(
            queue.metrics().connection_status,
            ConnectionStatus::Disconnected
        );
    }
}
