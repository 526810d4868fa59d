//! Remote Segment
//!
//! Orchestrates the hydration of one offloaded segment: at most one
//! concurrent download per key (collapsed through the cache's Downloading
//! state), a shared file handle once hydrated, and an orderly shutdown that
//! drains in-flight operations before dropping the cache pin.
//!
//! The segment copies its [`SegmentMeta`] out of the manifest at
//! construction instead of borrowing it, so its lifetime is decoupled from
//! manifest updates; the manifest is logically immutable for the duration
//! of a read anyway.
//!
//! Readers obtain [`SegmentDataStream`]s over the hydrated file. Streams
//! share one open descriptor via positional reads, each with its own
//! cursor, and hold the segment's gate so `stop()` cannot release the pin
//! underneath them.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheGuard, CacheKey, SegmentCache};
use crate::error::{Error, Result};
use crate::gate::{Gate, GateGuard};
use crate::manifest::{DeltaOffset, KafkaOffset, Ntp, RawOffset, SegmentMeta};
use crate::remote::{DownloadOutcome, RemoteStore};
use crate::retry::RetryNode;

struct Hydrated {
    guard: Option<CacheGuard>,
    file: Arc<File>,
    len: u64,
    path: PathBuf,
}

/// One segment living in object storage, hydrated on demand.
pub struct RemoteSegment {
    remote: Arc<RemoteStore>,
    cache: Arc<SegmentCache>,
    ntp: Ntp,
    meta: SegmentMeta,
    key: CacheKey,
    gate: Gate,
    rtc: RetryNode,
    hydration: tokio::sync::Mutex<Option<Hydrated>>,
}

impl RemoteSegment {
    /// Create a segment handle. `meta` is copied out of the manifest entry.
    pub fn new(
        remote: Arc<RemoteStore>,
        cache: Arc<SegmentCache>,
        ntp: Ntp,
        meta: SegmentMeta,
        parent: &RetryNode,
    ) -> Self {
        let key = CacheKey::for_segment(&ntp, &meta);
        Self {
            remote,
            cache,
            ntp,
            meta,
            key,
            gate: Gate::new(),
            rtc: parent.child(),
            hydration: tokio::sync::Mutex::new(None),
        }
    }

    pub fn ntp(&self) -> &Ntp {
        &self.ntp
    }

    /// Raw offset of the segment's first record.
    pub fn base_offset(&self) -> RawOffset {
        self.meta.base_offset
    }

    /// Raw offset of the segment's last record.
    pub fn committed_offset(&self) -> RawOffset {
        self.meta.committed_offset
    }

    /// Delta in effect at the segment's base offset.
    pub fn delta_offset(&self) -> DeltaOffset {
        self.meta.delta_offset
    }

    /// Kafka offset of the segment's first record.
    pub fn base_kafka_offset(&self) -> KafkaOffset {
        self.meta.base_kafka_offset()
    }

    pub fn term(&self) -> i64 {
        self.meta.segment_term
    }

    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    /// Ensure the segment is present in the local cache and pinned.
    ///
    /// Idempotent; concurrent callers across segment handles collapse onto
    /// a single download through the cache. Returns the hydrated file path.
    pub async fn hydrate(&self) -> Result<PathBuf> {
        let _op = self.gate.enter()?;
        let mut slot = self.hydration.lock().await;
        if let Some(hydrated) = slot.as_ref() {
            return Ok(hydrated.path.clone());
        }

        let rtc = self.rtc.child();
        let guard = self.download_and_pin(&rtc).await?;
        let path = guard.path().to_path_buf();

        let open_path = path.clone();
        let file = tokio::task::spawn_blocking(move || File::open(open_path))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
        let len = file.metadata()?.len();

        tracing::debug!(key = %self.key, len, "Segment hydrated");
        *slot = Some(Hydrated {
            guard: Some(guard),
            file: Arc::new(file),
            len,
            path: path.clone(),
        });
        Ok(path)
    }

    /// The hydration algorithm: reserve in the cache, and if this caller
    /// drew the producer role, download under the retry chain.
    async fn download_and_pin(&self, rtc: &RetryNode) -> Result<CacheGuard> {
        let attempts = rtc.attempts().max(1);
        let mut attempt: u32 = 0;

        loop {
            rtc.check()?;

            let guard = self
                .cache
                .reserve_or_wait(&self.key, self.meta.size_bytes, rtc)
                .await?;
            if !guard.is_producer() {
                tracing::debug!(key = %self.key, "Hydration satisfied from cache");
                return Ok(guard);
            }

            let object_key = self.meta.object_key(&self.ntp);
            match self
                .remote
                .download_object(&object_key, guard.path(), rtc)
                .await
            {
                Ok(DownloadOutcome::Success { bytes }) => {
                    if bytes == 0 || bytes != self.meta.size_bytes {
                        guard.abandon();
                        return Err(Error::HydrationFailed {
                            key: object_key,
                            reason: format!(
                                "downloaded {} bytes, manifest says {}",
                                bytes, self.meta.size_bytes
                            ),
                        });
                    }
                    return guard.publish(bytes).await;
                }
                Ok(DownloadOutcome::NotFound) => {
                    guard.abandon();
                    return Err(Error::RemoteSegmentMissing { key: object_key });
                }
                Ok(DownloadOutcome::PermanentError(reason)) => {
                    guard.abandon();
                    return Err(Error::HydrationFailed {
                        key: object_key,
                        reason,
                    });
                }
                Ok(DownloadOutcome::TransientError(reason)) => {
                    guard.abandon();
                    attempt += 1;
                    if attempt >= attempts {
                        return Err(Error::HydrationFailed {
                            key: object_key,
                            reason: format!("{} attempts exhausted: {}", attempts, reason),
                        });
                    }
                    tracing::warn!(
                        key = %object_key,
                        attempt,
                        error = %reason,
                        "Transient download failure, backing off"
                    );
                    rtc.sleep_backoff(attempt - 1).await?;
                }
                Err(err) => {
                    guard.abandon();
                    return Err(err);
                }
            }
        }
    }

    /// Open a read stream at byte `pos` over the hydrated file.
    ///
    /// The stream shares the segment's file descriptor; each stream has an
    /// independent cursor. Requires a prior successful [`hydrate`].
    pub async fn data_stream(&self, pos: u64) -> Result<SegmentDataStream> {
        let op = self.gate.enter()?;
        let slot = self.hydration.lock().await;
        let hydrated = slot.as_ref().ok_or_else(|| Error::HydrationFailed {
            key: self.key.to_string(),
            reason: "data_stream on a segment that is not hydrated".to_string(),
        })?;

        Ok(SegmentDataStream {
            file: hydrated.file.clone(),
            pos,
            len: hydrated.len,
            _op: op,
            token: self.rtc.abort_token(),
        })
    }

    /// Abort in-flight work, drain the gate and drop the cache pin.
    pub async fn stop(&self) {
        self.rtc.abort();
        self.gate.close().await;
        let mut slot = self.hydration.lock().await;
        if let Some(mut hydrated) = slot.take() {
            if let Some(guard) = hydrated.guard.take() {
                guard.release();
            }
        }
        tracing::debug!(key = %self.key, "Remote segment stopped");
    }
}

/// Read-only view over a hydrated segment file.
///
/// Cheap to create; holds the segment's gate for its lifetime. Reads are
/// positional (`pread`), so streams never contend on a shared seek cursor.
pub struct SegmentDataStream {
    file: Arc<File>,
    pos: u64,
    len: u64,
    _op: GateGuard,
    token: CancellationToken,
}

impl SegmentDataStream {
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Total length of the underlying file.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes left between the cursor and end of file.
    pub fn remaining(&self) -> u64 {
        self.len.saturating_sub(self.pos)
    }

    /// Read up to `len` bytes at the cursor; a short result means end of
    /// file. Observes the segment's abort signal.
    pub async fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        if self.token.is_cancelled() {
            return Err(Error::Aborted);
        }
        let take = len.min(self.remaining() as usize);
        if take == 0 {
            return Ok(Bytes::new());
        }

        let file = self.file.clone();
        let pos = self.pos;
        let buf = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; take];
            let mut done = 0;
            while done < take {
                let n = file.read_at(&mut buf[done..], pos + done as u64)?;
                if n == 0 {
                    break;
                }
                done += n;
            }
            buf.truncate(done);
            Ok::<_, std::io::Error>(buf)
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;

        self.pos += buf.len() as u64;
        Ok(Bytes::from(buf))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::BackoffPolicy;
    use object_store::ObjectStore;
    use std::time::Duration;

    fn test_meta(size_bytes: u64) -> SegmentMeta {
        SegmentMeta {
            base_offset: 0,
            committed_offset: 99,
            delta_offset: 0,
            segment_term: 1,
            size_bytes,
            index: Vec::new(),
        }
    }

    fn root_rtc() -> RetryNode {
        RetryNode::root(Duration::from_secs(5), 3, BackoffPolicy::default())
    }

    async fn fixture(data: &[u8]) -> (tempfile::TempDir, RemoteSegment) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(object_store::memory::InMemory::new());
        let ntp = Ntp::new("orders", 0);
        let meta = test_meta(data.len() as u64);
        store
            .put(
                &object_store::path::Path::from(meta.object_key(&ntp)),
                Bytes::copy_from_slice(data).into(),
            )
            .await
            .unwrap();

        let cache = Arc::new(
            SegmentCache::new(dir.path().join("cache"), 1 << 20, 1 << 16, 1 << 16)
                .await
                .unwrap(),
        );
        let segment = RemoteSegment::new(
            Arc::new(RemoteStore::new(store)),
            cache,
            ntp,
            meta,
            &root_rtc(),
        );
        (dir, segment)
    }

    #[tokio::test]
    async fn test_hydrate_and_stream() {
        let (_dir, segment) = fixture(b"0123456789").await;

        let path = segment.hydrate().await.unwrap();
        assert!(path.exists());

        let mut stream = segment.data_stream(4).await.unwrap();
        assert_eq!(stream.remaining(), 6);
        let chunk = stream.read_bytes(3).await.unwrap();
        assert_eq!(&chunk[..], b"456");
        assert_eq!(stream.position(), 7);

        // short read at end of file
        let rest = stream.read_bytes(100).await.unwrap();
        assert_eq!(&rest[..], b"789");
        assert!(stream.read_bytes(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hydrate_idempotent() {
        let (_dir, segment) = fixture(b"payload").await;

        let first = segment.hydrate().await.unwrap();
        let second = segment.hydrate().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_independent_cursors() {
        let (_dir, segment) = fixture(b"abcdefgh").await;
        segment.hydrate().await.unwrap();

        let mut one = segment.data_stream(0).await.unwrap();
        let mut two = segment.data_stream(4).await.unwrap();

        assert_eq!(&one.read_bytes(4).await.unwrap()[..], b"abcd");
        assert_eq!(&two.read_bytes(4).await.unwrap()[..], b"efgh");
        assert_eq!(&one.read_bytes(4).await.unwrap()[..], b"efgh");
    }

    #[tokio::test]
    async fn test_hydrate_missing_object() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(object_store::memory::InMemory::new());
        let cache = Arc::new(
            SegmentCache::new(dir.path().join("cache"), 1 << 20, 1 << 16, 1 << 16)
                .await
                .unwrap(),
        );
        let segment = RemoteSegment::new(
            Arc::new(RemoteStore::new(store)),
            cache,
            Ntp::new("orders", 0),
            test_meta(100),
            &root_rtc(),
        );

        let result = segment.hydrate().await;
        assert!(matches!(result, Err(Error::RemoteSegmentMissing { .. })));
    }

    #[tokio::test]
    async fn test_hydrate_size_mismatch() {
        // manifest says 999 bytes but the object is 7
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(object_store::memory::InMemory::new());
        let ntp = Ntp::new("orders", 0);
        let meta = test_meta(999);
        store
            .put(
                &object_store::path::Path::from(meta.object_key(&ntp)),
                Bytes::from_static(b"payload").into(),
            )
            .await
            .unwrap();
        let cache = Arc::new(
            SegmentCache::new(dir.path().join("cache"), 1 << 20, 1 << 16, 1 << 16)
                .await
                .unwrap(),
        );
        let segment = RemoteSegment::new(
            Arc::new(RemoteStore::new(store)),
            cache.clone(),
            ntp.clone(),
            meta.clone(),
            &root_rtc(),
        );

        let result = segment.hydrate().await;
        assert!(matches!(result, Err(Error::HydrationFailed { .. })));

        // the slot was abandoned, not poisoned
        let key = CacheKey::for_segment(&ntp, &meta);
        assert!(cache.entry_status(&key).is_none());
    }

    #[tokio::test]
    async fn test_data_stream_requires_hydration() {
        let (_dir, segment) = fixture(b"payload").await;
        assert!(segment.data_stream(0).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_then_hydrate_fails() {
        let (_dir, segment) = fixture(b"payload").await;
        segment.hydrate().await.unwrap();
        segment.stop().await;
        assert!(matches!(segment.hydrate().await, Err(Error::Shutdown)));
    }
}
