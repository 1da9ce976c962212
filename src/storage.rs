//! Storage backend abstraction
//!
//! The queue service never moves bytes itself; it hands a [`FileHandle`] to a
//! [`StorageBackend`] and records the outcome. Implementations can target an
//! object store, a remote API, or — as the shipped [`LocalStorageBackend`]
//! does — a local directory tree.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::StorageError;
use crate::types::{Destination, FileHandle, StoredObject};

/// Trait for storing one file at a destination
///
/// Implementations must be safe to call concurrently up to the queue's
/// configured concurrency limit.
///
/// # Examples
///
/// ```no_run
/// use batch_uploader::storage::{LocalStorageBackend, StorageBackend};
/// use batch_uploader::types::{Destination, FileHandle};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalStorageBackend::new("/var/uploads");
/// let stored = backend
///     .store(
///         &FileHandle {
///             file_name: "photo.jpg".to_string(),
///             path: "/tmp/photo.jpg".into(),
///             size_bytes: 1024,
///         },
///         &Destination::project("holiday"),
///     )
///     .await?;
/// println!("stored at {}", stored.location);
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store one file, returning its descriptor or a classified error
    async fn store(
        &self,
        file: &FileHandle,
        destination: &Destination,
    ) -> Result<StoredObject, StorageError>;
}

/// Storage backend that copies files into a local directory tree
///
/// Files land under `<root>/<project_id>[/<album_id>]/<file_name>`. Useful as
/// a development default and for integration tests.
pub struct LocalStorageBackend {
    root: PathBuf,
}

impl LocalStorageBackend {
    /// Create a backend rooted at the given directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn destination_dir(&self, destination: &Destination) -> PathBuf {
        let mut dir = self.root.join(&destination.project_id);
        if let Some(album) = &destination.album_id {
            dir = dir.join(album);
        }
        dir
    }
}

#[async_trait]
impl StorageBackend for LocalStorageBackend {
    async fn store(
        &self,
        file: &FileHandle,
        destination: &Destination,
    ) -> Result<StoredObject, StorageError> {
        let dir = self.destination_dir(destination);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::Io(format!("create {}: {}", dir.display(), e)))?;

        let target = dir.join(&file.file_name);
        let copied = tokio::fs::copy(&file.path, &target).await.map_err(|e| {
            StorageError::Io(format!(
                "copy {} to {}: {}",
                file.path.display(),
                target.display(),
                e
            ))
        })?;

        tracing::debug!(
            file_name = %file.file_name,
            target = %target.display(),
            bytes = copied,
            "stored file locally"
        );

        Ok(StoredObject {
            object_id: format!("{}/{}", destination.project_id, file.file_name),
            location: target.display().to_string(),
            size_bytes: copied,
        })
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_backend_copies_file_into_project_album_tree() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();

        let src = src_dir.path().join("photo.jpg");
        tokio::fs::write(&src, b"not really a jpeg").await.unwrap();

        let backend = LocalStorageBackend::new(dst_dir.path());
        let stored = backend
            .store(
                &FileHandle {
                    file_name: "photo.jpg".to_string(),
                    path: src,
                    size_bytes: 17,
                },
                &Destination {
                    project_id: "proj".to_string(),
                    album_id: Some("album".to_string()),
                },
            )
            .await
            .unwrap();

        assert_eq!(stored.size_bytes, 17);
        let target = dst_dir.path().join("proj").join("album").join("photo.jpg");
        assert!(target.exists(), "file should land under project/album");
        assert_eq!(stored.object_id, "proj/photo.jpg");
    }

    #[tokio::test]
    async fn missing_source_surfaces_an_io_error() {
        let dst_dir = tempfile::tempdir().unwrap();
        let backend = LocalStorageBackend::new(dst_dir.path());

        let err = backend
            .store(
                &FileHandle {
                    file_name: "ghost.bin".to_string(),
                    path: "/nonexistent/ghost.bin".into(),
                    size_bytes: 1,
                },
                &Destination::project("proj"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Io(_)), "got {err:?}");
    }
}
