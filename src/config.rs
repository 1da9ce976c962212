//! Configuration types for batch-uploader

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Queue execution configuration
///
/// Groups settings for how upload jobs are dispatched against the storage
/// backend. Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Default per-batch concurrency when the caller does not specify one (default: 3)
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,

    /// Maximum retries reported in error events for a single file (default: 3)
    ///
    /// Retries are driven explicitly through `retry_failed_files`; this cap is
    /// advisory metadata carried on error notifications.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_concurrency: default_concurrency(),
            max_retries: default_max_retries(),
        }
    }
}

/// Progress tracking and history configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Maximum batches retained per owner in history lookups (default: 50)
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Age past which a terminal batch is swept from memory (default: 1 hour)
    #[serde(default = "default_max_batch_age", with = "duration_ms_serde")]
    pub max_batch_age: Duration,

    /// Interval between cleanup sweeps (default: 5 minutes)
    #[serde(default = "default_sweep_interval", with = "duration_ms_serde")]
    pub sweep_interval: Duration,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            max_batch_age: default_max_batch_age(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

/// Notification throttling and delivery configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Minimum interval between throttled batch-progress broadcasts (default: 2s)
    #[serde(default = "default_throttle_interval", with = "duration_ms_serde")]
    pub throttle_interval: Duration,

    /// Progress delta since the last broadcast that bypasses throttling (default: 0.10)
    #[serde(default = "default_progress_delta_threshold")]
    pub progress_delta_threshold: f64,

    /// Merge file-level updates arriving within the coalescing window (default: true)
    #[serde(default = "default_true")]
    pub batch_file_updates: bool,

    /// Coalescing window for file-level updates (default: 250ms)
    #[serde(default = "default_file_batch_window", with = "duration_ms_serde")]
    pub file_batch_window: Duration,

    /// Maximum subscribers per batch (default: 100)
    #[serde(default = "default_max_subscribers")]
    pub max_subscribers_per_batch: usize,

    /// Maximum undelivered events held while the transport is down (default: 100)
    #[serde(default = "default_max_queued")]
    pub max_queued_notifications: usize,

    /// Whether the periodic subscription cleanup runs (default: true)
    #[serde(default = "default_true")]
    pub cleanup_enabled: bool,

    /// Interval between subscription cleanup passes (default: 60s)
    #[serde(default = "default_cleanup_interval", with = "duration_ms_serde")]
    pub cleanup_interval: Duration,

    /// Age past completion after which subscriptions are removed (default: 5 minutes)
    #[serde(default = "default_inactive_age", with = "duration_ms_serde")]
    pub inactive_subscription_age: Duration,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            throttle_interval: default_throttle_interval(),
            progress_delta_threshold: default_progress_delta_threshold(),
            batch_file_updates: true,
            file_batch_window: default_file_batch_window(),
            max_subscribers_per_batch: default_max_subscribers(),
            max_queued_notifications: default_max_queued(),
            cleanup_enabled: true,
            cleanup_interval: default_cleanup_interval(),
            inactive_subscription_age: default_inactive_age(),
        }
    }
}

/// Health monitoring configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Failed-job count above which the queue is flagged unhealthy (default: 25)
    #[serde(default = "default_failed_jobs_limit")]
    pub failed_jobs_limit: u64,

    /// Interval between monitoring samples (default: 5s)
    #[serde(default = "default_sample_interval", with = "duration_ms_serde")]
    pub sample_interval: Duration,

    /// Sliding window over which the processing rate is computed (default: 60s)
    #[serde(default = "default_rate_window", with = "duration_ms_serde")]
    pub rate_window: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failed_jobs_limit: default_failed_jobs_limit(),
            sample_interval: default_sample_interval(),
            rate_window: default_rate_window(),
        }
    }
}

/// Main configuration for [`BatchUploader`](crate::BatchUploader)
///
/// Fields are organized into logical sub-configs:
/// - [`queue`](QueueConfig) — job dispatch and retry metadata
/// - [`progress`](ProgressConfig) — history bounds and cleanup cadence
/// - [`notifications`](NotificationConfig) — throttling, coalescing, delivery queue
/// - [`health`](HealthConfig) — health thresholds and sampling
///
/// All durations serialize as integer milliseconds.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Job dispatch settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Progress tracking and history settings
    #[serde(default)]
    pub progress: ProgressConfig,

    /// Notification throttling and delivery settings
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Health monitoring settings
    #[serde(default)]
    pub health: HealthConfig,
}

impl Config {
    /// Validate settings that cannot be expressed through types alone
    pub fn validate(&self) -> Result<()> {
        if self.queue.default_concurrency == 0 {
            return Err(Error::Config {
                message: "default_concurrency must be >= 1".to_string(),
                key: Some("queue.default_concurrency".to_string()),
            });
        }
        if !(0.0..=1.0).contains(&self.notifications.progress_delta_threshold) {
            return Err(Error::Config {
                message: format!(
                    "progress_delta_threshold must be within [0, 1], got {}",
                    self.notifications.progress_delta_threshold
                ),
                key: Some("notifications.progress_delta_threshold".to_string()),
            });
        }
        if self.notifications.max_subscribers_per_batch == 0 {
            return Err(Error::Config {
                message: "max_subscribers_per_batch must be >= 1".to_string(),
                key: Some("notifications.max_subscribers_per_batch".to_string()),
            });
        }
        if self.notifications.throttle_interval.is_zero() {
            return Err(Error::Config {
                message: "throttle_interval must be non-zero".to_string(),
                key: Some("notifications.throttle_interval".to_string()),
            });
        }
        Ok(())
    }
}

fn default_concurrency() -> usize {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_history_limit() -> usize {
    50
}

fn default_max_batch_age() -> Duration {
    Duration::from_secs(3600)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_throttle_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_progress_delta_threshold() -> f64 {
    0.10
}

fn default_file_batch_window() -> Duration {
    Duration::from_millis(250)
}

fn default_max_subscribers() -> usize {
    100
}

fn default_max_queued() -> usize {
    100
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_inactive_age() -> Duration {
    Duration::from_secs(300)
}

fn default_failed_jobs_limit() -> u64 {
    25
}

fn default_sample_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_rate_window() -> Duration {
    Duration::from_secs(60)
}

fn default_true() -> bool {
    true
}

// Duration serialization helper (integer milliseconds)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn empty_json_deserializes_to_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.queue.default_concurrency, 3);
        assert_eq!(config.progress.history_limit, 50);
        assert_eq!(
            config.notifications.throttle_interval,
            Duration::from_secs(2)
        );
        assert!(config.notifications.batch_file_updates);
        assert_eq!(config.health.failed_jobs_limit, 25);
    }

    #[test]
    fn durations_round_trip_as_milliseconds() {
        let mut config = Config::default();
        config.notifications.throttle_interval = Duration::from_millis(1500);

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["notifications"]["throttle_interval"], 1500);

        let back: Config = serde_json::from_value(json).unwrap();
        assert_eq!(
            back.notifications.throttle_interval,
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn out_of_range_delta_threshold_is_rejected() {
        let mut config = Config::default();
        config.notifications.progress_delta_threshold = 1.5;
        let err = config.validate().unwrap_err();
        assert!(
            err.to_string().contains("progress_delta_threshold"),
            "error should name the offending key: {err}"
        );
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = Config::default();
        config.queue.default_concurrency = 0;
        assert!(config.validate().is_err());
    }
}
