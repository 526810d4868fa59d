//! Remote Read Configuration
//!
//! Controls the tiered read path: where hydrated segments land on local
//! disk, how much disk they may use, and how downloads back off.
//!
//! ## Usage
//!
//! ```ignore
//! use tierstream_storage::RemoteReadConfig;
//!
//! let config = RemoteReadConfig {
//!     cache_root: "/var/lib/tierstream/cache".into(),
//!     cache_capacity_bytes: 50 * 1024 * 1024 * 1024, // 50 GiB
//!     ..Default::default()
//! };
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{BackoffPolicy, RetryNode};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteReadConfig {
    /// Directory for hydrated segment files
    pub cache_root: PathBuf,

    /// Soft byte capacity of the segment cache (default: 20 GiB)
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity_bytes: u64,

    /// Bytes reserved up front per in-flight download (default: 64 MiB)
    #[serde(default = "default_reserved_bytes")]
    pub cache_reserved_bytes: u64,

    /// Largest segment the writer produces; bounds cache overshoot (default: 64 MiB)
    #[serde(default = "default_max_segment_size")]
    pub max_segment_size: u64,

    /// Trailing bytes tolerated as padding at the end of a segment (default: 32 KiB)
    #[serde(default = "default_padding_tolerance")]
    pub padding_tolerance_bytes: u64,

    /// Download attempts before a hydration is declared failed (default: 3)
    #[serde(default = "default_download_attempts")]
    pub download_attempts: u32,

    /// Concurrent segment downloads allowed per shard (default: 4)
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,

    /// Backoff between download attempts
    #[serde(default)]
    pub backoff: BackoffPolicy,

    /// Deadline applied when the caller does not supply one (default: 30s)
    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,
}

impl Default for RemoteReadConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("/var/lib/tierstream/cache"),
            cache_capacity_bytes: default_cache_capacity(),
            cache_reserved_bytes: default_reserved_bytes(),
            max_segment_size: default_max_segment_size(),
            padding_tolerance_bytes: default_padding_tolerance(),
            download_attempts: default_download_attempts(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            backoff: BackoffPolicy::default(),
            default_deadline_ms: default_deadline_ms(),
        }
    }
}

impl RemoteReadConfig {
    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    /// Root retry-chain node carrying this configuration's deadline,
    /// attempts budget and backoff.
    pub fn retry_root(&self) -> RetryNode {
        RetryNode::root(
            self.default_deadline(),
            self.download_attempts,
            self.backoff.clone(),
        )
    }
}

fn default_cache_capacity() -> u64 {
    20 * 1024 * 1024 * 1024 // 20 GiB
}

fn default_reserved_bytes() -> u64 {
    64 * 1024 * 1024 // one segment
}

fn default_max_segment_size() -> u64 {
    64 * 1024 * 1024
}

fn default_padding_tolerance() -> u64 {
    32 * 1024
}

fn default_download_attempts() -> u32 {
    3
}

fn default_max_concurrent_downloads() -> usize {
    4
}

fn default_deadline_ms() -> u64 {
    30_000
}
