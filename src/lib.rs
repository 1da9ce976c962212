//! # batch-uploader
//!
//! Batch upload orchestration with live progress tracking.
//!
//! ## Design Philosophy
//!
//! batch-uploader is designed to be:
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Pluggable** - Storage, notification transport, and persistence are
//!   trait seams the host application implements
//! - **Event-driven** - Observers subscribe to per-batch topics, no polling
//!   required
//! - **Backpressure-aware** - Progress broadcasts are throttled and coalesced
//!   so chatty uploads never flood the transport
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use batch_uploader::{
//!     BatchUploader, BroadcastTransport, Config, Destination, FileHandle,
//!     LocalStorageBackend, NoOpPersistence,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BroadcastTransport::new(1024));
//!     let uploader = BatchUploader::new(
//!         Config::default(),
//!         Arc::new(LocalStorageBackend::new("/var/lib/uploads")),
//!         transport.clone(),
//!         Arc::new(NoOpPersistence),
//!     )?;
//!     uploader.start_background_tasks().await;
//!
//!     // Watch every event going out to observers
//!     let mut events = transport.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("{} -> {}: {}", event.topic, event.event, event.payload);
//!         }
//!     });
//!
//!     let status = uploader
//!         .create_batch(
//!             "batch-1",
//!             "user-42",
//!             vec![FileHandle {
//!                 file_name: "photo.jpg".to_string(),
//!                 path: "/tmp/photo.jpg".into(),
//!                 size_bytes: 1_048_576,
//!             }],
//!             Destination::project("project-7"),
//!             None,
//!         )
//!         .await?;
//!     println!("batch {} queued", status.batch_id);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Queue health monitoring and wait estimation
pub mod health;
/// Throttled notification fan-out
pub mod notify;
/// Persistence trait for mirroring batch state
pub mod persistence;
/// Batch and file progress tracking (decomposed into focused submodules)
pub mod progress;
/// Upload queue with bounded per-batch concurrency
pub mod queue;
/// Failure classification and retry with exponential backoff
pub mod retry;
/// Storage backend trait and local filesystem implementation
pub mod storage;
/// Notification transport trait and in-process implementation
pub mod transport;
/// Core types and events
pub mod types;
/// Facade wiring the components together
pub mod uploader;

// Re-export commonly used types
pub use config::{Config, HealthConfig, NotificationConfig, ProgressConfig, QueueConfig};
pub use error::{
    BatchError, Error, PersistenceError, Result, StorageError, SubscriptionError,
    TransportError,
};
pub use health::{HealthMonitor, QueueMetricsSource};
pub use notify::NotificationService;
pub use persistence::{NoOpPersistence, Persistence};
pub use progress::{FileProgressUpdate, ProgressManager};
pub use queue::{JobOutcome, JobUpdate, QueueMetrics, QueuedUpload, UploadQueue};
pub use retry::{Backoff, IsRetryable, with_retry};
pub use storage::{LocalStorageBackend, StorageBackend};
pub use transport::{BroadcastTransport, TopicEvent, Transport};
pub use types::{
    BatchId, BatchJob, BatchProgressEvent, BatchState, BatchStats, BatchStatus, BatchSummary,
    ConnectionStatus, Destination, EstimateConfidence, FileError, FileHandle, FileId,
    FileProgressBatchEvent, FileProgressEvent, FileStatus, HealthSnapshot, ObserverId,
    RetryOutcome, StoredObject, SubscriptionStats, UploadErrorEvent, WaitEstimate,
};
pub use uploader::BatchUploader;

/// Helper function to run the uploader with graceful signal handling.
///
/// Waits for a termination signal and then calls the uploader's `shutdown()`
/// method with the given drain timeout.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use batch_uploader::{
///     BatchUploader, BroadcastTransport, Config, LocalStorageBackend, NoOpPersistence,
///     run_with_shutdown,
/// };
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let uploader = BatchUploader::new(
///         Config::default(),
///         Arc::new(LocalStorageBackend::new("/var/lib/uploads")),
///         Arc::new(BroadcastTransport::new(1024)),
///         Arc::new(NoOpPersistence),
///     )?;
///     uploader.start_background_tasks().await;
///
///     run_with_shutdown(uploader, Duration::from_secs(30)).await;
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(uploader: BatchUploader, drain_timeout: std::time::Duration) {
    wait_for_signal().await;
    uploader.shutdown(drain_timeout).await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments (containers, tests);
    // wait on whatever handlers could be set up, ctrl_c as the last resort
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM, draining"),
                _ = sigint.recv() => tracing::info!("received SIGINT, draining"),
            }
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "SIGINT handler unavailable, waiting on SIGTERM only");
            sigterm.recv().await;
            tracing::info!("received SIGTERM, draining");
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting on SIGINT only");
            sigint.recv().await;
            tracing::info!("received SIGINT, draining");
        }
        (Err(term_err), Err(int_err)) => {
            tracing::error!(%term_err, %int_err, "no unix signal handlers available, falling back to ctrl_c");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "ctrl_c listener failed");
        return;
    }
    tracing::info!("received ctrl_c, draining");
}
