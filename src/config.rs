use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// S3 requires every non-final multipart part to be at least 5 MiB.
pub const MIN_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("chunk_size {0} is below the object store minimum part size of {MIN_CHUNK_SIZE} bytes")]
    ChunkTooSmall(u64),
    #[error("worker_concurrency must be at least 1")]
    NoWorkers,
    #[error("queue_capacity {capacity} is below worker_concurrency {workers}")]
    QueueTooSmall { capacity: usize, workers: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Multipart part size in bytes. Also the single-shot cutoff.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// Upload queue capacity. Unset means twice the worker count.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    /// Seconds between monitor passes. 0 disables the monitor.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
    /// Minimum mtime quiescence before the monitor picks a file up.
    #[serde(default = "default_stability_threshold")]
    pub stability_threshold_secs: u64,
    /// Transient-error retries per object store call.
    #[serde(default = "default_part_retry_attempts")]
    pub part_retry_attempts: u32,
    #[serde(default = "default_part_timeout")]
    pub part_timeout_secs: u64,
    /// Head-check every uploaded file during the recovery pass.
    #[serde(default)]
    pub verify_uploaded_on_recovery: bool,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    #[serde(skip_serializing)]
    pub s3_secret_key: Option<String>,
}

fn default_chunk_size() -> u64 {
    MIN_CHUNK_SIZE
}
fn default_worker_concurrency() -> usize {
    5
}
fn default_monitor_interval() -> u64 {
    60
}
fn default_stability_threshold() -> u64 {
    2
}
fn default_part_retry_attempts() -> u32 {
    3
}
fn default_part_timeout() -> u64 {
    30
}
fn default_database_path() -> String {
    "./state/stower.db".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            worker_concurrency: default_worker_concurrency(),
            queue_capacity: None,
            monitor_interval_secs: default_monitor_interval(),
            stability_threshold_secs: default_stability_threshold(),
            part_retry_attempts: default_part_retry_attempts(),
            part_timeout_secs: default_part_timeout(),
            verify_uploaded_on_recovery: false,
            database_path: default_database_path(),
            s3_region: None,
            s3_endpoint: None,
            s3_access_key: None,
            s3_secret_key: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(ConfigError::ChunkTooSmall(self.chunk_size));
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if let Some(capacity) = self.queue_capacity {
            if capacity < self.worker_concurrency {
                return Err(ConfigError::QueueTooSmall {
                    capacity,
                    workers: self.worker_concurrency,
                });
            }
        }
        Ok(())
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
            .unwrap_or(self.worker_concurrency * 2)
            .max(1)
    }

    pub fn part_timeout(&self) -> Duration {
        Duration::from_secs(self.part_timeout_secs)
    }
}
