//! Storage Error Types
//!
//! Error kinds surfaced by the tiered read path. The split matters for
//! callers:
//!
//! - `Aborted`, `DeadlineExceeded`, `Shutdown` are envelope errors: the
//!   operation was cut short, the segment itself is fine.
//! - `HydrationFailed` and `CacheFull` are transient for the segment; a
//!   later attempt with a fresh retry chain may succeed.
//! - `RemoteSegmentMissing` means the manifest lists an object the store
//!   does not have. Catalog drift, not retryable here.
//! - `DataCorruption` is fatal for the reader; the cached copy should be
//!   evicted before the segment is read again.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Operation aborted")]
    Aborted,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Subsystem is shutting down")]
    Shutdown,

    #[error("Hydration failed for {key}: {reason}")]
    HydrationFailed { key: String, reason: String },

    #[error("Remote segment missing from object store: {key}")]
    RemoteSegmentMissing { key: String },

    #[error("Data corruption: {0}")]
    DataCorruption(String),

    #[error("Cache full and no entries are evictable")]
    CacheFull,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error(transparent)]
    Core(#[from] tierstream_core::Error),
}

impl Error {
    /// Whether a hydration-level retry could succeed without caller changes.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::HydrationFailed { .. } | Error::CacheFull | Error::DeadlineExceeded
        )
    }
}
