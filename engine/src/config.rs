//! Engine configuration.
//!
//! One `EngineConfig` may be shared read-only by any number of jobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checksums::ChecksumAlgorithm;
use crate::error::EngineError;

pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 100;
pub const DEFAULT_COPY_TOKEN: &str = "copy";

/// What a unit failure does to the rest of the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    /// Record the failure, carry on with the remaining units, summarize at the end
    #[default]
    Continue,
    /// Stop the job at the first unit that cannot be completed
    AbortOnFirstError,
    /// Suspend the job and let the caller retry, skip or abort
    Ask,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bytes per read/write chunk; pause and cancel take effect between chunks
    pub chunk_size: usize,
    /// Automatic retries for transient failures
    pub max_retries: u32,
    /// Linear backoff base between retries
    pub retry_backoff_ms: u64,
    pub error_policy: ErrorPolicy,
    /// Content checksum compared after copying, on top of the size check
    pub verify: Option<ChecksumAlgorithm>,
    /// Marker inserted into KeepBoth names
    pub copy_token: String,
    pub throughput_window_ms: u64,
    /// Minimum spacing between progress notifications
    pub progress_interval_ms: u64,
    /// Leave the `.part` file of a failed unit in place
    pub keep_partial_on_failure: bool,
    /// Leave the `.part` file of the in-flight unit when cancelled
    pub keep_partial_on_cancel: bool,
    pub preserve_mtime: bool,
    /// Refuse file roots larger than the free space of their target
    pub check_free_space: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            error_policy: ErrorPolicy::Continue,
            verify: None,
            copy_token: DEFAULT_COPY_TOKEN.to_string(),
            throughput_window_ms: 5_000,
            progress_interval_ms: 200,
            keep_partial_on_failure: true,
            keep_partial_on_cancel: false,
            preserve_mtime: true,
            check_free_space: true,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.chunk_size == 0 {
            return Err(EngineError::InvalidConfig("chunk_size must be greater than zero".into()));
        }
        if self.copy_token.trim().is_empty() {
            return Err(EngineError::InvalidConfig("copy_token must not be empty".into()));
        }
        if self.throughput_window_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "throughput_window_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(attempt as u64))
    }

    pub fn throughput_window(&self) -> Duration {
        Duration::from_millis(self.throughput_window_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}
