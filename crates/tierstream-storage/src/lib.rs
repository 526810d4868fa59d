//! tierstream Storage Layer: tiered read path
//!
//! This crate implements the remote half of the broker's storage layer:
//! reading segments that have been offloaded to S3-compatible object
//! storage. The write/offload side lives elsewhere; everything here is
//! read-side hydration.
//!
//! ## Read flow
//!
//! ```text
//! RemoteSegmentReader::read_some(rtc)
//!         │
//!         ▼
//! RemoteSegment::hydrate ──── cache hit? ──▶ pin Ready file
//!         │                      │
//!         │              in-flight download? ──▶ await it, then pin
//!         ▼
//! RemoteStore::download_object (retry chain: attempts, backoff, abort)
//!         │
//!         ▼
//! SegmentCache::publish (atomic rename .part → final)
//!         │
//!         ▼
//! BatchParser over a shared-descriptor SegmentDataStream
//!         │
//!         ▼
//! filtered, offset-translated record batches
//! ```
//!
//! The cache is the collapse point: at most one download per key is ever
//! in flight, no matter how many readers ask. Readers pin the hydrated
//! file; eviction is LRU over unpinned entries only.
//!
//! ## Offset spaces
//!
//! Raw offsets count every record, kafka offsets only data records; the
//! manifest carries the delta per segment and the reader translates on the
//! fly. See [`manifest`] for the contract.

pub mod cache;
pub mod config;
pub mod error;
pub mod gate;
pub mod manifest;
pub mod parser;
pub mod reader;
pub mod remote;
pub mod retry;
pub mod segment;

pub use cache::{CacheEntryStatus, CacheGuard, CacheKey, CacheStats, SegmentCache};
pub use config::RemoteReadConfig;
pub use error::{Error, Result};
pub use gate::{Gate, GateGuard};
pub use manifest::{
    raw_to_kafka, DeltaOffset, IndexEntry, KafkaOffset, Ntp, PartitionManifest, RawOffset,
    SegmentMeta,
};
pub use parser::{BatchConsumer, BatchParser, ConsumeAck, ParseOutcome};
pub use reader::{ReadConfig, RemoteSegmentReader};
pub use remote::{DownloadOutcome, RemoteStore};
pub use retry::{BackoffPolicy, RetryNode};
pub use segment::{RemoteSegment, SegmentDataStream};
