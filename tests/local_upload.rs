//! End-to-end tests over the public API with the local filesystem backend.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use batch_uploader::{
    BatchId, BatchState, BatchUploader, BroadcastTransport, Config, Destination, FileHandle,
    FileStatus, LocalStorageBackend, NoOpPersistence, ObserverId,
};

struct Harness {
    uploader: BatchUploader,
    transport: Arc<BroadcastTransport>,
    _source_dir: TempDir,
    dest_dir: TempDir,
    files: Vec<FileHandle>,
}

/// Build an uploader over real temp directories with `names` source files
async fn harness(names: &[(&str, usize)]) -> Harness {
    let source_dir = TempDir::new().expect("source tempdir");
    let dest_dir = TempDir::new().expect("dest tempdir");

    let mut files = Vec::new();
    for (name, size) in names {
        let path = source_dir.path().join(name);
        tokio::fs::write(&path, vec![0x5a; *size])
            .await
            .expect("write source file");
        files.push(FileHandle {
            file_name: name.to_string(),
            path,
            size_bytes: *size as u64,
        });
    }

    let transport = Arc::new(BroadcastTransport::new(1024));
    let mut config = Config::default();
    config.notifications.throttle_interval = Duration::from_millis(20);
    config.notifications.file_batch_window = Duration::from_millis(20);

    let uploader = BatchUploader::new(
        config,
        Arc::new(LocalStorageBackend::new(dest_dir.path())),
        transport.clone(),
        Arc::new(NoOpPersistence),
    )
    .expect("config validates");
    uploader.start_background_tasks().await;

    Harness {
        uploader,
        transport,
        _source_dir: source_dir,
        dest_dir,
        files,
    }
}

async fn wait_for_completion(uploader: &BatchUploader, batch_id: &BatchId) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = uploader
            .get_batch_status(batch_id)
            .await
            .expect("batch should be tracked");
        if status.status == BatchState::Completed {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "batch never completed, stuck at {:?}",
            status.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn files_land_in_the_destination_tree() {
    let h = harness(&[("one.jpg", 1024), ("two.jpg", 2048)]).await;
    let batch_id = BatchId::new("e2e-1");

    h.uploader
        .create_batch(
            batch_id.clone(),
            "owner-1",
            h.files.clone(),
            Destination {
                project_id: "proj".to_string(),
                album_id: Some("album".to_string()),
            },
            None,
        )
        .await
        .expect("create batch");

    wait_for_completion(&h.uploader, &batch_id).await;

    for name in ["one.jpg", "two.jpg"] {
        let stored = h.dest_dir.path().join("proj").join("album").join(name);
        let metadata = tokio::fs::metadata(&stored)
            .await
            .unwrap_or_else(|e| panic!("{name} missing from destination: {e}"));
        assert!(metadata.is_file());
    }

    let status = h.uploader.get_batch_status(&batch_id).await.expect("status");
    assert_eq!(status.successful_uploads, 2);
    assert_eq!(status.total_uploaded_bytes, 3072);
    for job in &status.files {
        assert_eq!(job.status, FileStatus::Completed);
        let stored = job.result.as_ref().expect("stored descriptor");
        assert_eq!(stored.size_bytes, job.total_bytes);
    }
}

#[tokio::test]
async fn observers_see_progress_through_the_transport() {
    let h = harness(&[("pic.jpg", 4096)]).await;
    let batch_id = BatchId::new("e2e-2");
    let observer = ObserverId::new("viewer-1");

    h.uploader
        .subscribe(&observer, &batch_id)
        .await
        .expect("subscribe");
    let mut events = h.transport.subscribe();

    h.uploader
        .create_batch(
            batch_id.clone(),
            "owner-1",
            h.files.clone(),
            Destination::project("proj"),
            None,
        )
        .await
        .expect("create batch");
    wait_for_completion(&h.uploader, &batch_id).await;

    let mut saw_terminal_progress = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        assert_eq!(event.topic, "batch:e2e-2");
        if event.event == "batch_progress" && event.payload["status"] == "completed" {
            assert_eq!(event.payload["overall_progress"], 1.0);
            saw_terminal_progress = true;
            break;
        }
    }
    assert!(
        saw_terminal_progress,
        "a terminal batch_progress event must reach the topic"
    );

    h.uploader
        .unsubscribe(&observer, &batch_id)
        .await
        .expect("unsubscribe");
}

#[tokio::test]
async fn missing_source_file_fails_that_job_only() {
    let mut h = harness(&[("real.jpg", 512)]).await;
    h.files.push(FileHandle {
        file_name: "ghost.jpg".to_string(),
        path: h._source_dir.path().join("ghost.jpg"),
        size_bytes: 100,
    });
    let batch_id = BatchId::new("e2e-3");

    h.uploader
        .create_batch(
            batch_id.clone(),
            "owner-1",
            h.files.clone(),
            Destination::project("proj"),
            None,
        )
        .await
        .expect("create batch");
    wait_for_completion(&h.uploader, &batch_id).await;

    let status = h.uploader.get_batch_status(&batch_id).await.expect("status");
    assert_eq!(status.successful_uploads, 1);
    assert_eq!(status.failed_uploads, 1);

    let summary = h
        .uploader
        .generate_batch_summary(&batch_id)
        .await
        .expect("summary");
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].file_name, "ghost.jpg");

    let history = h.uploader.get_batch_history("owner-1").await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].batch_id, batch_id);
}

#[tokio::test]
async fn shutdown_drains_inflight_work() {
    let h = harness(&[("a.jpg", 256), ("b.jpg", 256)]).await;
    let batch_id = BatchId::new("e2e-4");

    h.uploader
        .create_batch(
            batch_id.clone(),
            "owner-1",
            h.files.clone(),
            Destination::project("proj"),
            None,
        )
        .await
        .expect("create batch");

    h.uploader.shutdown(Duration::from_secs(5)).await;

    let status = h.uploader.get_batch_status(&batch_id).await.expect("status");
    assert_eq!(
        status.status,
        BatchState::Completed,
        "a small batch should drain within the shutdown timeout"
    );
    assert!(!h.uploader.is_accepting());
}
