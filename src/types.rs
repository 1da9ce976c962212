//! Core types for batch-uploader

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique identifier for a batch of uploads
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub String);

impl BatchId {
    /// Create a new BatchId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BatchId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for BatchId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a file within a batch
///
/// Generated by the progress manager at batch creation. Two files with the
/// same name in one batch always receive distinct ids.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub String);

impl FileId {
    /// Create a new FileId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FileId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for an observer subscribed to batch notifications
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObserverId(pub String);

impl ObserverId {
    /// Create a new ObserverId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl From<&str> for ObserverId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a single file upload job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Waiting to start
    Queued,
    /// Upload in progress
    Processing,
    /// Successfully stored
    Completed,
    /// Failed with a classified error
    Failed,
}

impl FileStatus {
    /// Whether this status is terminal (Completed or Failed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, FileStatus::Completed | FileStatus::Failed)
    }
}

/// Aggregate status of a batch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchState {
    /// All files still queued
    Queued,
    /// At least one file has started
    Processing,
    /// Every file reached a terminal state (failures included)
    Completed,
    /// Explicitly cancelled by the caller
    Cancelled,
}

impl BatchState {
    /// Whether this state is terminal (Completed or Cancelled)
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchState::Completed | BatchState::Cancelled)
    }
}

/// Where a batch's files are stored
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Target project identifier
    pub project_id: String,

    /// Target album within the project (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album_id: Option<String>,
}

impl Destination {
    /// Destination with a project id only
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            album_id: None,
        }
    }
}

/// Descriptor returned by the storage backend for a stored file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    /// Backend-assigned object identifier
    pub object_id: String,

    /// Where the object lives (backend-specific locator)
    pub location: String,

    /// Stored size in bytes
    pub size_bytes: u64,
}

/// Classified error attached to a failed file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    /// Human-readable message
    pub message: String,

    /// Whether the failure is transient and eligible for retry
    pub retryable: bool,
}

/// One file's upload unit of work within a batch
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchJob {
    /// Unique within the batch
    pub file_id: FileId,

    /// Original file name
    pub file_name: String,

    /// Total size in bytes
    pub total_bytes: u64,

    /// Current status
    pub status: FileStatus,

    /// Bytes uploaded so far
    pub uploaded_bytes: u64,

    /// Fraction uploaded, in [0, 1]
    pub progress: f64,

    /// Classified error (for failed jobs)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FileError>,

    /// Storage descriptor (for completed jobs)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<StoredObject>,
}

/// Aggregate status over a batch's jobs
///
/// Owned exclusively by the progress manager; callers receive snapshots.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchStatus {
    /// Batch identifier
    pub batch_id: BatchId,

    /// Owner who created the batch
    pub owner_id: String,

    /// Where the files are being stored
    pub destination: Destination,

    /// Per-file jobs, in submission order
    pub files: Vec<BatchJob>,

    /// Aggregate state
    pub status: BatchState,

    /// Number of files in a terminal state
    pub processed_files: usize,

    /// Number of successfully stored files
    pub successful_uploads: usize,

    /// Number of failed files
    pub failed_uploads: usize,

    /// Bytes-weighted overall progress in [0, 1]
    pub overall_progress: f64,

    /// Sum of all file sizes
    pub total_bytes: u64,

    /// Sum of uploaded bytes across files
    pub total_uploaded_bytes: u64,

    /// Reason recorded by an explicit cancellation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,

    /// When the batch was registered
    pub created_at: DateTime<Utc>,

    /// When the batch reached a terminal state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchStatus {
    /// Total number of files in the batch
    pub fn total_files(&self) -> usize {
        self.files.len()
    }

    /// Look up one job by file id
    pub fn job(&self, file_id: &FileId) -> Option<&BatchJob> {
        self.files.iter().find(|f| &f.file_id == file_id)
    }
}

/// Derived speed and ETA metrics for a batch
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BatchStats {
    /// Bytes transferred per second since the batch started
    pub upload_speed_bps: f64,

    /// Seconds until completion at the current speed (INFINITY at zero speed)
    pub estimated_time_remaining_secs: f64,

    /// Average file size in bytes
    pub average_file_size: u64,
}

/// One failed file in a batch summary
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailedFile {
    /// File name
    pub file_name: String,

    /// Human-readable failure message
    pub error_message: String,

    /// Whether the failure is eligible for retry
    pub retryable: bool,
}

/// Totals and failure listing for a batch
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Batch identifier
    pub batch_id: BatchId,

    /// Total number of files
    pub total_files: usize,

    /// Number of successful uploads
    pub successful_uploads: usize,

    /// Number of failed uploads
    pub failed_uploads: usize,

    /// Sum of all file sizes
    pub total_bytes: u64,

    /// Average file size in bytes
    pub average_file_size: u64,

    /// Every failure with a human-readable message and retry eligibility
    pub errors: Vec<FailedFile>,
}

/// Outcome of a retry-failed-files pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOutcome {
    /// Retryable failures reset to queued
    pub retried_files: usize,

    /// Permanent failures left as-is
    pub skipped_files: usize,
}

/// Connection status between the queue and its storage backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Last storage interaction succeeded
    Connected,
    /// Last storage interaction reported the backend unavailable
    Disconnected,
}

/// Point-in-time read of queue health metrics
///
/// Immutable once produced; superseded by the next sample.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Jobs waiting for a concurrency permit
    pub waiting_jobs: u64,

    /// Jobs currently executing against the storage backend
    pub active_jobs: u64,

    /// Jobs that have failed so far
    pub failed_jobs: u64,

    /// Overall health verdict
    pub is_healthy: bool,

    /// Storage backend connection status
    pub connection_status: ConnectionStatus,

    /// Human-readable descriptions of detected problems
    pub issues: Vec<String>,

    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
}

/// Estimated wait time for queued jobs
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct WaitEstimate {
    /// Estimated seconds until the queue drains (INFINITY at zero rate)
    pub total_wait_secs: f64,

    /// Estimated seconds per waiting job
    pub per_job_wait_secs: f64,

    /// How much to trust the estimate, based on sample size
    pub confidence: EstimateConfidence,
}

/// Confidence qualifier for wait estimates
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimateConfidence {
    /// Plenty of samples in the window
    High,
    /// A few samples
    Medium,
    /// Not enough samples to be meaningful
    Low,
}

/// Subscription counts for operational visibility
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SubscriptionStats {
    /// Batches with at least one tracked subscription record
    pub tracked_batches: usize,

    /// Subscribers across all batches
    pub total_subscribers: usize,

    /// Average subscribers per tracked batch (0 when none tracked)
    pub average_subscribers_per_batch: f64,
}

/// Handle to a local file pending upload
///
/// The storage backend decides how the bytes actually move; this crate only
/// passes the handle through.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHandle {
    /// File name as presented to the destination
    pub file_name: String,

    /// Local path to read from
    pub path: PathBuf,

    /// Size in bytes (must be positive)
    pub size_bytes: u64,
}

/// Batch-level progress event payload
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchProgressEvent {
    /// Batch identifier
    pub batch_id: BatchId,

    /// Aggregate state at emission time
    pub status: BatchState,

    /// Bytes-weighted overall progress in [0, 1]
    pub overall_progress: f64,

    /// Uploaded bytes across the batch
    pub total_uploaded_bytes: u64,

    /// Total bytes across the batch
    pub total_bytes: u64,

    /// Files in a terminal state
    pub processed_files: usize,

    /// Total files in the batch
    pub total_files: usize,
}

impl BatchProgressEvent {
    /// Build the payload from a status snapshot
    pub fn from_status(status: &BatchStatus) -> Self {
        Self {
            batch_id: status.batch_id.clone(),
            status: status.status,
            overall_progress: status.overall_progress,
            total_uploaded_bytes: status.total_uploaded_bytes,
            total_bytes: status.total_bytes,
            processed_files: status.processed_files,
            total_files: status.total_files(),
        }
    }

    /// Whether the event carries a terminal batch state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// File-level progress event payload
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileProgressEvent {
    /// Batch identifier
    pub batch_id: BatchId,

    /// File identifier
    pub file_id: FileId,

    /// File name
    pub file_name: String,

    /// Current file status
    pub status: FileStatus,

    /// Fraction uploaded, in [0, 1]
    pub progress: f64,

    /// Bytes uploaded so far
    pub uploaded_bytes: u64,
}

/// Coalesced multi-file progress event payload
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileProgressBatchEvent {
    /// Batch identifier
    pub batch_id: BatchId,

    /// File updates merged within one coalescing window (latest per file)
    pub files: Vec<FileProgressEvent>,
}

/// Error event payload, always delivered immediately
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadErrorEvent {
    /// Batch identifier
    pub batch_id: BatchId,

    /// File identifier (if the error is file-scoped)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<FileId>,

    /// File name (if file-scoped)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,

    /// Human-readable message
    pub message: String,

    /// Whether the failure is eligible for retry
    pub retryable: bool,

    /// Retries already attempted for this file
    pub retry_count: u32,

    /// Maximum retries allowed
    pub max_retries: u32,
}

/// Logical event names sent through the transport
pub mod event_names {
    /// Batch-level progress broadcast
    pub const BATCH_PROGRESS: &str = "batch_progress";
    /// Single-file progress broadcast
    pub const FILE_PROGRESS: &str = "file_progress";
    /// Coalesced multi-file progress broadcast
    pub const FILE_PROGRESS_BATCH: &str = "file_progress_batch";
    /// Upload error broadcast
    pub const UPLOAD_ERROR: &str = "upload_error";
}

/// Topic name for a batch's notification stream
pub fn batch_topic(batch_id: &BatchId) -> String {
    format!("batch:{}", batch_id)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_status_terminal_classification() {
        assert!(!FileStatus::Queued.is_terminal());
        assert!(!FileStatus::Processing.is_terminal());
        assert!(FileStatus::Completed.is_terminal());
        assert!(FileStatus::Failed.is_terminal());
    }

    #[test]
    fn batch_state_terminal_classification() {
        assert!(!BatchState::Queued.is_terminal());
        assert!(!BatchState::Processing.is_terminal());
        assert!(BatchState::Completed.is_terminal());
        assert!(BatchState::Cancelled.is_terminal());
    }

    #[test]
    fn batch_id_display_matches_inner_value() {
        let id = BatchId::new("batch-7");
        assert_eq!(id.to_string(), "batch-7");
        assert_eq!(id.as_str(), "batch-7");
    }

    #[test]
    fn batch_topic_is_prefixed_with_batch() {
        let id = BatchId::new("abc");
        assert_eq!(batch_topic(&id), "batch:abc");
    }

    #[test]
    fn status_enums_serialize_lowercase() {
        assert_eq!(
            serde_json::to_string(&FileStatus::Processing).unwrap(),
            "\"processing\""
        );
        assert_eq!(
            serde_json::to_string(&BatchState::Cancelled).unwrap(),
            "\"cancelled\""
        );
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::Disconnected).unwrap(),
            "\"disconnected\""
        );
    }

    #[test]
    fn batch_progress_event_copies_aggregates_from_status() {
        let status = BatchStatus {
            batch_id: BatchId::new("b1"),
            owner_id: "owner".to_string(),
            destination: Destination::project("p1"),
            files: Vec::new(),
            status: BatchState::Processing,
            processed_files: 1,
            successful_uploads: 1,
            failed_uploads: 0,
            overall_progress: 0.5,
            total_bytes: 200,
            total_uploaded_bytes: 100,
            cancel_reason: None,
            created_at: Utc::now(),
            completed_at: None,
        };

        let event = BatchProgressEvent::from_status(&status);
        assert_eq!(event.batch_id, status.batch_id);
        assert!((event.overall_progress - 0.5).abs() < f64::EPSILON);
        assert_eq!(event.total_uploaded_bytes, 100);
        assert!(!event.is_terminal(), "Processing is not a terminal state");
    }
}
