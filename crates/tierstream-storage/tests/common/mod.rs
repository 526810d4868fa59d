//! Shared fixtures for the integration tests: segment builders, an
//! instrumented object store, and a pre-wired cache + remote environment.

// not every test binary uses every helper
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use object_store::path::Path;
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore, PutMultipartOpts,
    PutOptions, PutPayload, PutResult,
};
use tokio::sync::Notify;

use tierstream_core::batch::{Batch, BatchType};
use tierstream_core::Record;
use tierstream_storage::{
    BackoffPolicy, IndexEntry, Ntp, RemoteSegment, RemoteStore, RetryNode, SegmentCache,
    SegmentMeta,
};

pub const PADDING_TOLERANCE: u64 = 32 * 1024;

/// Object store wrapper that counts GET requests.
#[derive(Debug)]
pub struct CountingStore {
    inner: Arc<dyn ObjectStore>,
    gets: Arc<AtomicUsize>,
}

impl CountingStore {
    pub fn wrap(inner: Arc<dyn ObjectStore>) -> (Arc<Self>, Arc<AtomicUsize>) {
        let gets = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                inner,
                gets: gets.clone(),
            }),
            gets,
        )
    }
}

impl std::fmt::Display for CountingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "counting({})", self.inner)
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(
        &self,
        location: &Path,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        if !options.head {
            self.gets.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &Path) -> object_store::Result<()> {
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(
        &self,
        prefix: Option<&Path>,
    ) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}

/// Object store wrapper that fails the first N GETs with a transient error.
#[derive(Debug)]
pub struct FlakyStore {
    inner: Arc<dyn ObjectStore>,
    failures_left: AtomicUsize,
}

impl FlakyStore {
    pub fn wrap(inner: Arc<dyn ObjectStore>, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures_left: AtomicUsize::new(failures),
        })
    }
}

impl std::fmt::Display for FlakyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "flaky({})", self.inner)
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(
        &self,
        location: &Path,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        if !options.head {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(object_store::Error::Generic {
                    store: "flaky",
                    source: "injected transient failure".into(),
                });
            }
        }
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &Path) -> object_store::Result<()> {
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(
        &self,
        prefix: Option<&Path>,
    ) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}

/// Object store wrapper whose GETs park until released, to hold a download
/// in flight at a known point.
#[derive(Debug)]
pub struct ParkedStore {
    inner: Arc<dyn ObjectStore>,
    release: Arc<Notify>,
    parked: AtomicUsize,
}

impl ParkedStore {
    pub fn wrap(inner: Arc<dyn ObjectStore>) -> (Arc<Self>, Arc<Notify>) {
        let release = Arc::new(Notify::new());
        (
            Arc::new(Self {
                inner,
                release: release.clone(),
                parked: AtomicUsize::new(0),
            }),
            release,
        )
    }

    pub fn parked_count(&self) -> usize {
        self.parked.load(Ordering::SeqCst)
    }
}

impl std::fmt::Display for ParkedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "parked({})", self.inner)
    }
}

#[async_trait]
impl ObjectStore for ParkedStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(
        &self,
        location: &Path,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        if !options.head {
            self.parked.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
        }
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &Path) -> object_store::Result<()> {
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(
        &self,
        prefix: Option<&Path>,
    ) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}

/// Recipe for one batch inside a built segment.
#[derive(Debug, Clone, Copy)]
pub struct BatchSpec {
    pub base: i64,
    pub count: usize,
    pub batch_type: BatchType,
    pub payload: usize,
}

impl BatchSpec {
    pub fn data(base: i64, count: usize) -> Self {
        Self {
            base,
            count,
            batch_type: BatchType::Data,
            payload: 100,
        }
    }

    pub fn control(base: i64, count: usize) -> Self {
        Self {
            base,
            count,
            batch_type: BatchType::Configuration,
            payload: 16,
        }
    }
}

/// Serialize a sequence of batches with a per-batch seek index.
pub fn build_segment(
    term: i64,
    delta_offset: i64,
    specs: &[BatchSpec],
) -> (Vec<u8>, SegmentMeta, Vec<Batch>) {
    assert!(!specs.is_empty());
    let mut buf = BytesMut::new();
    let mut index = Vec::new();
    let mut batches = Vec::new();

    for spec in specs {
        let records: Vec<Record> = (0..spec.count)
            .map(|i| {
                let offset = spec.base + i as i64;
                Record::new(
                    offset,
                    1_700_000_000_000 + offset,
                    Some(Bytes::from(format!("k{}", offset))),
                    Bytes::from(vec![b'x'; spec.payload]),
                )
            })
            .collect();
        let batch = Batch::build(term, spec.batch_type, -1, records).unwrap();
        index.push(IndexEntry {
            offset: batch.base_offset(),
            file_pos: buf.len() as u64,
        });
        batch.encode(&mut buf);
        batches.push(batch);
    }

    let meta = SegmentMeta {
        base_offset: specs.first().unwrap().base,
        committed_offset: batches.last().unwrap().last_offset(),
        delta_offset,
        segment_term: term,
        size_bytes: buf.len() as u64,
        index,
    };

    (buf.to_vec(), meta, batches)
}

/// A cache + remote store wired for tests.
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub gets: Arc<AtomicUsize>,
    pub remote: Arc<RemoteStore>,
    pub cache: Arc<SegmentCache>,
    pub ntp: Ntp,
    backing: Arc<dyn ObjectStore>,
}

impl TestEnv {
    pub async fn new(capacity_bytes: u64, max_segment_size: u64) -> Self {
        let backing: Arc<dyn ObjectStore> = Arc::new(object_store::memory::InMemory::new());
        let (counting, gets) = CountingStore::wrap(backing.clone());
        Self::with_store(counting, gets, backing, capacity_bytes, max_segment_size).await
    }

    pub async fn with_store(
        store: Arc<dyn ObjectStore>,
        gets: Arc<AtomicUsize>,
        backing: Arc<dyn ObjectStore>,
        capacity_bytes: u64,
        max_segment_size: u64,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(
            SegmentCache::new(
                dir.path().join("cache"),
                capacity_bytes,
                max_segment_size,
                max_segment_size,
            )
            .await
            .unwrap(),
        );
        Self {
            dir,
            gets,
            remote: Arc::new(RemoteStore::new(store)),
            cache,
            ntp: Ntp::new("orders", 0),
            backing,
        }
    }

    /// Upload a built segment to the backing store under its manifest key.
    pub async fn put_segment(&self, meta: &SegmentMeta, bytes: &[u8]) {
        self.backing
            .put(
                &Path::from(meta.object_key(&self.ntp)),
                Bytes::copy_from_slice(bytes).into(),
            )
            .await
            .unwrap();
    }

    pub fn segment(&self, meta: SegmentMeta, parent: &RetryNode) -> Arc<RemoteSegment> {
        Arc::new(RemoteSegment::new(
            self.remote.clone(),
            self.cache.clone(),
            self.ntp.clone(),
            meta,
            parent,
        ))
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

pub fn rtc_secs(secs: u64) -> RetryNode {
    RetryNode::root(Duration::from_secs(secs), 3, fast_backoff())
}

pub fn rtc_millis(millis: u64) -> RetryNode {
    RetryNode::root(Duration::from_millis(millis), 3, fast_backoff())
}

pub fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        initial_backoff_ms: 5,
        max_backoff_ms: 20,
        multiplier: 2.0,
    }
}
