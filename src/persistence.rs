//! Best-effort persistence mirror
//!
//! The progress manager is the source of truth in memory; every mutation is
//! mirrored to a [`Persistence`] implementation so a host application can
//! keep durable records. Mirror failures are logged and never propagated —
//! an upload must not fail because a bookkeeping write did.

use async_trait::async_trait;

use crate::error::PersistenceError;
use crate::types::{BatchId, BatchJob, BatchStatus};

/// Trait for durably recording batch and file state
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Record the full batch status after a mutation
    async fn record_batch(&self, status: &BatchStatus) -> Result<(), PersistenceError>;

    /// Record one file's state after a mutation
    async fn record_file(&self, batch_id: &BatchId, job: &BatchJob)
    -> Result<(), PersistenceError>;
}

/// Persistence implementation that records nothing
///
/// The default for purely in-memory deployments.
pub struct NoOpPersistence;

#[async_trait]
impl Persistence for NoOpPersistence {
    async fn record_batch(&self, _status: &BatchStatus) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn record_file(
        &self,
        _batch_id: &BatchId,
        _job: &BatchJob,
    ) -> Result<(), PersistenceError> {
        Ok(())
    }
}
