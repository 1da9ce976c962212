//! Health monitor — queue health verdicts, processing rate, wait estimates.
//!
//! Samples the queue's counters on an interval and derives a processing rate
//! over a sliding window. Snapshots are point-in-time reads; each one is
//! superseded by the next.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::HealthConfig;
use crate::queue::{QueueMetrics, UploadQueue};
use crate::types::{ConnectionStatus, EstimateConfidence, HealthSnapshot, WaitEstimate};

/// Source of queue counters, implemented by [`UploadQueue`]
///
/// A trait seam so the monitor can be driven by a stub in tests.
pub trait QueueMetricsSource: Send + Sync {
    /// Current counter readings
    fn metrics(&self) -> QueueMetrics;
}

impl QueueMetricsSource for UploadQueue {
    fn metrics(&self) -> QueueMetrics {
        UploadQueue::metrics(self)
    }
}

/// One throughput sample
#[derive(Clone, Copy)]
struct Sample {
    at: Instant,
    completed_jobs: u64,
}

/// Health monitor (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct HealthMonitor {
    config: HealthConfig,
    source: Arc<dyn QueueMetricsSource>,
    samples: Arc<Mutex<VecDeque<Sample>>>,
    monitor: Arc<Mutex<Option<CancellationToken>>>,
}

impl HealthMonitor {
    /// Create a monitor reading from the given metrics source
    pub fn new(config: HealthConfig, source: Arc<dyn QueueMetricsSource>) -> Self {
        Self {
            config,
            source,
            samples: Arc::new(Mutex::new(VecDeque::new())),
            monitor: Arc::new(Mutex::new(None)),
        }
    }

    /// Take a point-in-time health reading
    ///
    /// Unhealthy when the failed-job count exceeds the configured limit or
    /// the storage backend is disconnected; `issues` names each problem.
    pub fn check_queue_health(&self) -> HealthSnapshot {
        let metrics = self.source.metrics();
        let mut issues = Vec::new();

        if metrics.failed_jobs > self.config.failed_jobs_limit {
            issues.push(format!(
                "failed jobs ({}) exceed the limit of {}",
                metrics.failed_jobs, self.config.failed_jobs_limit
            ));
        }
        if metrics.connection_status == ConnectionStatus::Disconnected {
            issues.push("storage backend is disconnected".to_string());
        }

        HealthSnapshot {
            waiting_jobs: metrics.waiting_jobs,
            active_jobs: metrics.active_jobs,
            failed_jobs: metrics.failed_jobs,
            is_healthy: issues.is_empty(),
            connection_status: metrics.connection_status,
            issues,
            timestamp: Utc::now(),
        }
    }

    /// Record one throughput sample and prune everything outside the window
    pub async fn record_sample(&self) {
        let metrics = self.source.metrics();
        let now = Instant::now();
        let mut samples = self.samples.lock().await;
        samples.push_back(Sample {
            at: now,
            completed_jobs: metrics.completed_jobs,
        });
        while let Some(oldest) = samples.front() {
            if now.duration_since(oldest.at) > self.config.rate_window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Jobs completed per second over the sliding window
    ///
    /// Zero until at least two samples exist.
    pub async fn calculate_processing_rate(&self) -> f64 {
        let samples = self.samples.lock().await;
        let (Some(first), Some(last)) = (samples.front(), samples.back()) else {
            return 0.0;
        };
        let elapsed = last.at.duration_since(first.at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        let completed = last.completed_jobs.saturating_sub(first.completed_jobs);
        completed as f64 / elapsed
    }

    /// Estimate how long the currently waiting jobs will take to drain
    ///
    /// Confidence tracks sample count: 10 or more samples is high, 3 or more
    /// is medium, anything less is low. The estimate is infinite while jobs
    /// wait but the rate is zero.
    pub async fn estimate_wait_time(&self) -> WaitEstimate {
        let waiting = self.source.metrics().waiting_jobs;
        let rate = self.calculate_processing_rate().await;
        let sample_count = self.samples.lock().await.len();

        let confidence = if sample_count >= 10 {
            EstimateConfidence::High
        } else if sample_count >= 3 {
            EstimateConfidence::Medium
        } else {
            EstimateConfidence::Low
        };

        let (total_wait_secs, per_job_wait_secs) = if waiting == 0 {
            (0.0, 0.0)
        } else if rate > 0.0 {
            (waiting as f64 / rate, 1.0 / rate)
        } else {
            (f64::INFINITY, f64::INFINITY)
        };

        WaitEstimate {
            total_wait_secs,
            per_job_wait_secs,
            confidence,
        }
    }

    /// Start the periodic sampling loop; a no-op if already running
    pub async fn start_monitoring(&self) {
        let mut monitor = self.monitor.lock().await;
        if monitor.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *monitor = Some(cancel.clone());

        let this = self.clone();
        let interval = self.config.sample_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        this.record_sample().await;
                        let snapshot = this.check_queue_health();
                        if !snapshot.is_healthy {
                            tracing::warn!(
                                failed_jobs = snapshot.failed_jobs,
                                waiting_jobs = snapshot.waiting_jobs,
                                issues = ?snapshot.issues,
                                "queue unhealthy"
                            );
                        }
                    }
                }
            }
            tracing::debug!("health monitoring stopped");
        });
        tracing::debug!(interval = ?interval, "health monitoring started");
    }

    /// Stop the sampling loop; a no-op if not running
    pub async fn stop_monitoring(&self) {
        let mut monitor = self.monitor.lock().await;
        if let Some(cancel) = monitor.take() {
            cancel.cancel();
        }
    }
}
