//! Shared test doubles for queue and facade tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage::StorageBackend;
use crate::types::{Destination, FileHandle, StoredObject};

/// In-memory storage backend with scriptable failures and delays
///
/// Failures are keyed by file name and persist until cleared. Tracks the
/// high-water mark of concurrent `store` calls for concurrency assertions.
pub(crate) struct MockStorage {
    failures: Mutex<HashMap<String, StorageError>>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockStorage {
    /// A backend that accepts everything
    pub(crate) fn succeeding() -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Make every upload of `file_name` fail with the given error
    pub(crate) fn fail_file(&self, file_name: &str, error: StorageError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(file_name.to_string(), error);
        }
    }

    /// Remove all scripted failures
    pub(crate) fn clear_failures(&self) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.clear();
        }
    }

    /// Delay every `store` call by the given duration
    pub(crate) fn set_delay(&self, delay: Duration) {
        if let Ok(mut slot) = self.delay.lock() {
            *slot = Some(delay);
        }
    }

    /// Highest number of concurrent `store` calls observed
    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn scripted_failure(&self, file_name: &str) -> Option<StorageError> {
        let failures = self.failures.lock().ok()?;
        failures.get(file_name).map(clone_error)
    }
}

/// StorageError carries no Clone; rebuild the variant by hand
fn clone_error(error: &StorageError) -> StorageError {
    match error {
        StorageError::Unavailable(m) => StorageError::Unavailable(m.clone()),
        StorageError::Timeout(m) => StorageError::Timeout(m.clone()),
        StorageError::Io(m) => StorageError::Io(m.clone()),
        StorageError::UnsupportedType(m) => StorageError::UnsupportedType(m.clone()),
        StorageError::TooLarge { size, limit } => StorageError::TooLarge {
            size: *size,
            limit: *limit,
        },
        StorageError::Validation(m) => StorageError::Validation(m.clone()),
        StorageError::Other(m) => StorageError::Other(m.clone()),
    }
}

#[async_trait]
impl StorageBackend for MockStorage {
    async fn store(
        &self,
        file: &FileHandle,
        destination: &Destination,
    ) -> Result<StoredObject, StorageError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = self.delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = match self.scripted_failure(&file.file_name) {
            Some(error) => Err(error),
            None => Ok(StoredObject {
                object_id: format!("obj-{}", file.file_name),
                location: format!("{}/{}", destination.project_id, file.file_name),
                size_bytes: file.size_bytes,
            }),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
