//! Local Segment Cache
//!
//! Bounded on-disk store of hydrated segment files. The cache is the
//! coordination point that makes hydration collapse: for any key there is
//! at most one Downloading entry, and every other caller either pins the
//! Ready file or waits for the download to settle.
//!
//! ## Entry lifecycle
//!
//! ```text
//! reserve_or_wait (miss)          reserve_or_wait (hit)
//!         │                               │
//!         ▼                               ▼
//!    Downloading ──publish──▶ Ready ──release to pin 0──▶ evictable
//!         │                               │
//!      abandon                     evicted (LRU, unpinned only)
//!         │                               │
//!     entry gone                     entry gone, file unlinked
//! ```
//!
//! ## Capacity model
//!
//! Soft byte capacity; a download reserves its expected size up front and
//! the reservation is replaced by the actual size at publish. If the actual
//! size overshoots, the overshoot is tolerated up to one maximum segment
//! size and eviction runs afterwards. Eviction removes least-recently-used
//! unpinned Ready entries; a pinned entry is never evicted, only marked so
//! the final `release` completes the eviction.
//!
//! All state mutations happen under one mutex that is never held across an
//! await; waiters park on `Notify` handles and re-examine the state machine
//! on wake, so eviction and pin observation stay linearizable.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tokio::sync::Notify;

use crate::config::RemoteReadConfig;
use crate::error::{Error, Result};
use crate::manifest::{Ntp, RawOffset, SegmentMeta};
use crate::retry::RetryNode;

/// Stable identity of a cached segment file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub ntp: Ntp,
    pub segment_term: i64,
    pub base_offset: RawOffset,
}

impl CacheKey {
    pub fn for_segment(ntp: &Ntp, meta: &SegmentMeta) -> Self {
        Self {
            ntp: ntp.clone(),
            segment_term: meta.segment_term,
            base_offset: meta.base_offset,
        }
    }

    /// Path of the hydrated file relative to the cache root.
    fn rel_path(&self) -> PathBuf {
        PathBuf::from(&self.ntp.topic)
            .join(format!("{}_{}", self.ntp.partition, self.segment_term))
            .join(format!("{}.log", self.base_offset))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}_{}/{}",
            self.ntp.topic, self.ntp.partition, self.segment_term, self.base_offset
        )
    }
}

/// Signals download completion to parked waiters.
#[derive(Debug, Default)]
struct DownloadSignal {
    notify: Notify,
    failed: AtomicBool,
}

#[derive(Debug)]
enum EntryState {
    Downloading { reserved: u64 },
    Ready { size: u64 },
}

#[derive(Debug)]
struct Entry {
    state: EntryState,
    pins: u32,
    evict_on_release: bool,
    signal: Arc<DownloadSignal>,
}

impl Entry {
    fn downloading(reserved: u64) -> Self {
        Self {
            state: EntryState::Downloading { reserved },
            // the producer holds the first pin
            pins: 1,
            evict_on_release: false,
            signal: Arc::new(DownloadSignal::default()),
        }
    }
}

struct CacheState {
    entries: HashMap<CacheKey, Entry>,
    /// Recency order of Ready entries; most recently used first.
    recency: LruCache<CacheKey, ()>,
    /// Sum of Ready sizes and Downloading reservations.
    bytes: u64,
    stopped: bool,
}

/// Observable state of a cache entry, for introspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEntryStatus {
    Downloading,
    Ready { pins: u32, size_bytes: u64 },
}

/// Aggregate cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub bytes: u64,
    pub capacity_bytes: u64,
    pub entries: usize,
}

/// Bounded, pinned, content-addressed store of hydrated segment files.
pub struct SegmentCache {
    root: PathBuf,
    capacity_bytes: u64,
    reserved_bytes: u64,
    max_segment_size: u64,
    state: Mutex<CacheState>,
    /// Woken whenever bytes are freed or a pin drops.
    space_freed: Notify,
}

enum WaitTarget {
    /// Caller is the producer; proceed to download.
    Produce,
    /// Wait for an in-flight download on the same key.
    Download(Arc<DownloadSignal>),
    /// Wait for capacity to free up.
    Space,
}

impl SegmentCache {
    /// Create a cache rooted at `root` with a soft byte capacity.
    pub async fn new<P: AsRef<Path>>(
        root: P,
        capacity_bytes: u64,
        reserved_bytes: u64,
        max_segment_size: u64,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;

        Ok(Self {
            root,
            capacity_bytes,
            reserved_bytes,
            max_segment_size,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                recency: LruCache::new(NonZeroUsize::new(100_000).unwrap()),
                bytes: 0,
                stopped: false,
            }),
            space_freed: Notify::new(),
        })
    }

    /// Create a cache sized per the read-path configuration.
    pub async fn with_config(config: &RemoteReadConfig) -> Result<Self> {
        Self::new(
            &config.cache_root,
            config.cache_capacity_bytes,
            config.cache_reserved_bytes,
            config.max_segment_size,
        )
        .await
    }

    /// Final on-disk path for a key.
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.rel_path())
    }

    /// Temporary download path for a key.
    pub fn part_path(&self, key: &CacheKey) -> PathBuf {
        let mut path = self.entry_path(key).into_os_string();
        path.push(".part");
        PathBuf::from(path)
    }

    /// Pin an existing entry, wait for an in-flight download, or become the
    /// producer of a new one.
    ///
    /// `size_hint` is the expected segment size; zero falls back to the
    /// configured reservation headroom. The returned guard pins the entry
    /// (producers pin the slot they are filling) until dropped or released.
    pub async fn reserve_or_wait(
        self: &Arc<Self>,
        key: &CacheKey,
        size_hint: u64,
        rtc: &RetryNode,
    ) -> Result<CacheGuard> {
        let reservation = if size_hint > 0 {
            size_hint
        } else {
            self.reserved_bytes
        };

        loop {
            rtc.check()?;

            let mut evicted = Vec::new();
            let target = {
                let mut guard = self.state.lock().unwrap();
                let st = &mut *guard;
                if st.stopped {
                    return Err(Error::Shutdown);
                }
                match st.entries.get_mut(key) {
                    Some(entry) => match entry.state {
                        EntryState::Ready { .. } => {
                            entry.pins += 1;
                            st.recency.get(key);
                            return Ok(CacheGuard {
                                cache: self.clone(),
                                key: key.clone(),
                                path: self.entry_path(key),
                                producer: false,
                                released: false,
                            });
                        }
                        EntryState::Downloading { .. } => WaitTarget::Download(entry.signal.clone()),
                    },
                    None => {
                        if self.make_room(st, reservation, &mut evicted) {
                            st.entries.insert(key.clone(), Entry::downloading(reservation));
                            st.bytes += reservation;
                            WaitTarget::Produce
                        } else {
                            WaitTarget::Space
                        }
                    }
                }
            };
            self.remove_evicted(evicted).await;

            match target {
                WaitTarget::Produce => {
                    let part = self.part_path(key);
                    if let Some(parent) = part.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tracing::debug!(key = %key, reservation, "Registered download");
                    return Ok(CacheGuard {
                        cache: self.clone(),
                        key: key.clone(),
                        path: part,
                        producer: true,
                        released: false,
                    });
                }
                WaitTarget::Download(signal) => {
                    let notified = signal.notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    // the download may have settled before we registered
                    if self.download_settled(key) {
                        if signal.failed.load(Ordering::Acquire) {
                            return Err(Error::HydrationFailed {
                                key: key.to_string(),
                                reason: "download abandoned".to_string(),
                            });
                        }
                        continue;
                    }
                    rtc.wait(notified).await?;
                    if signal.failed.load(Ordering::Acquire) {
                        return Err(Error::HydrationFailed {
                            key: key.to_string(),
                            reason: "download abandoned".to_string(),
                        });
                    }
                }
                WaitTarget::Space => {
                    let notified = self.space_freed.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if self.could_admit(reservation) {
                        continue;
                    }
                    match rtc.wait(notified).await {
                        Ok(()) => {}
                        Err(Error::DeadlineExceeded) => return Err(Error::CacheFull),
                        Err(other) => return Err(other),
                    }
                }
            }
        }
    }

    /// Promote a finished download: rename the temporary file into place,
    /// swap the reservation for the actual size and wake waiters.
    async fn publish_entry(&self, key: &CacheKey, actual_size: u64) -> Result<()> {
        let part = self.part_path(key);
        let final_path = self.entry_path(key);
        tokio::fs::rename(&part, &final_path).await?;

        let (signal, evicted) = {
            let mut guard = self.state.lock().unwrap();
            let st = &mut *guard;
            let entry = match st.entries.get_mut(key) {
                Some(entry) => entry,
                None => {
                    return Err(Error::HydrationFailed {
                        key: key.to_string(),
                        reason: "cache entry vanished before publish".to_string(),
                    })
                }
            };
            let reserved = match entry.state {
                EntryState::Downloading { reserved } => reserved,
                EntryState::Ready { .. } => {
                    return Err(Error::HydrationFailed {
                        key: key.to_string(),
                        reason: "entry already published".to_string(),
                    })
                }
            };
            if actual_size > reserved + self.max_segment_size {
                tracing::warn!(
                    key = %key,
                    actual_size,
                    reserved,
                    "Published segment overshoots its reservation by more than one segment"
                );
            }
            entry.state = EntryState::Ready { size: actual_size };
            let signal = entry.signal.clone();
            st.bytes = st.bytes - reserved + actual_size;
            st.recency.put(key.clone(), ());
            let mut evicted = Vec::new();
            self.evict_excess(st, &mut evicted);
            (signal, evicted)
        };
        self.remove_evicted(evicted).await;

        signal.notify.notify_waiters();
        self.space_freed.notify_waiters();
        tracing::debug!(key = %key, size = actual_size, "Published segment to cache");
        Ok(())
    }

    /// Drop a failed download's slot and wake waiters with the failure.
    fn abandon_entry(&self, key: &CacheKey) {
        let signal = {
            let mut st = self.state.lock().unwrap();
            match st.entries.remove(key) {
                Some(entry) => {
                    if let EntryState::Downloading { reserved } = entry.state {
                        st.bytes = st.bytes.saturating_sub(reserved);
                    }
                    Some(entry.signal)
                }
                None => None,
            }
        };
        self.unlink_detached(self.part_path(key));
        if let Some(signal) = signal {
            signal.failed.store(true, Ordering::Release);
            signal.notify.notify_waiters();
        }
        self.space_freed.notify_waiters();
        tracing::debug!(key = %key, "Abandoned download");
    }

    /// Drop one pin. The last release of an entry marked for eviction
    /// removes it.
    fn release_entry(&self, key: &CacheKey) {
        let evicted_path = {
            let mut guard = self.state.lock().unwrap();
            let st = &mut *guard;
            let finish_eviction = match st.entries.get_mut(key) {
                Some(entry) => {
                    entry.pins = entry.pins.saturating_sub(1);
                    entry.pins == 0 && entry.evict_on_release
                }
                None => false,
            };
            if finish_eviction {
                Some(self.evict_one(st, key))
            } else {
                None
            }
        };
        if let Some(path) = evicted_path {
            self.unlink_detached(path);
        }
        self.space_freed.notify_waiters();
    }

    /// Stop accepting waiters. Existing guards stay valid until released.
    pub fn stop(&self) {
        let signals: Vec<Arc<DownloadSignal>> = {
            let mut st = self.state.lock().unwrap();
            st.stopped = true;
            st.entries.values().map(|e| e.signal.clone()).collect()
        };
        for signal in signals {
            signal.notify.notify_waiters();
        }
        self.space_freed.notify_waiters();
        tracing::debug!(root = %self.root.display(), "Segment cache stopping");
    }

    pub fn stats(&self) -> CacheStats {
        let st = self.state.lock().unwrap();
        CacheStats {
            bytes: st.bytes,
            capacity_bytes: self.capacity_bytes,
            entries: st.entries.len(),
        }
    }

    pub fn entry_status(&self, key: &CacheKey) -> Option<CacheEntryStatus> {
        let st = self.state.lock().unwrap();
        st.entries.get(key).map(|entry| match entry.state {
            EntryState::Downloading { .. } => CacheEntryStatus::Downloading,
            EntryState::Ready { size } => CacheEntryStatus::Ready {
                pins: entry.pins,
                size_bytes: size,
            },
        })
    }

    fn download_settled(&self, key: &CacheKey) -> bool {
        let st = self.state.lock().unwrap();
        !matches!(
            st.entries.get(key).map(|e| &e.state),
            Some(EntryState::Downloading { .. })
        )
    }

    fn could_admit(&self, need: u64) -> bool {
        let st = self.state.lock().unwrap();
        st.bytes + need <= self.capacity_bytes
    }

    /// Evict unpinned LRU entries until `need` more bytes fit, collecting
    /// the files to unlink into `evicted`. When only pinned entries
    /// remain, marks the coldest one so its final release completes the
    /// eviction, and reports failure.
    fn make_room(&self, st: &mut CacheState, need: u64, evicted: &mut Vec<PathBuf>) -> bool {
        if st.bytes + need <= self.capacity_bytes {
            return true;
        }
        if need > self.capacity_bytes {
            tracing::warn!(
                need,
                capacity = self.capacity_bytes,
                "Segment larger than cache capacity"
            );
        }

        // most-recently-used first; walk from the cold end
        let candidates: Vec<CacheKey> = st.recency.iter().map(|(k, _)| k.clone()).collect();
        for key in candidates.into_iter().rev() {
            if st.bytes + need <= self.capacity_bytes {
                break;
            }
            let pins = match st.entries.get(&key) {
                Some(entry) => entry.pins,
                None => continue,
            };
            if pins == 0 {
                evicted.push(self.evict_one(st, &key));
            }
        }

        if st.bytes + need <= self.capacity_bytes {
            return true;
        }

        // everything left is pinned; defer to the coldest entry's release
        let coldest_pinned = st
            .recency
            .iter()
            .map(|(k, _)| k.clone())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .find(|k| st.entries.get(k).map(|e| e.pins > 0).unwrap_or(false));
        if let Some(key) = coldest_pinned {
            if let Some(entry) = st.entries.get_mut(&key) {
                entry.evict_on_release = true;
            }
        }
        false
    }

    /// Best-effort eviction after a publish overshoot, collecting the
    /// files to unlink into `evicted`.
    fn evict_excess(&self, st: &mut CacheState, evicted: &mut Vec<PathBuf>) {
        if st.bytes <= self.capacity_bytes {
            return;
        }
        let candidates: Vec<CacheKey> = st.recency.iter().map(|(k, _)| k.clone()).collect();
        for key in candidates.into_iter().rev() {
            if st.bytes <= self.capacity_bytes {
                break;
            }
            let pins = match st.entries.get(&key) {
                Some(entry) => entry.pins,
                None => continue,
            };
            if pins == 0 {
                evicted.push(self.evict_one(st, &key));
            }
        }
    }

    /// Drop one Ready entry from lookup and accounting. No file I/O here;
    /// the returned path is unlinked by the caller once the lock is gone.
    fn evict_one(&self, st: &mut CacheState, key: &CacheKey) -> PathBuf {
        if let Some(entry) = st.entries.remove(key) {
            if let EntryState::Ready { size } = entry.state {
                st.bytes = st.bytes.saturating_sub(size);
            }
        }
        st.recency.pop(key);
        tracing::debug!(key = %key, "Evicted segment from cache");
        self.entry_path(key)
    }

    /// Unlink files whose entries have already been dropped from the
    /// cache state.
    async fn remove_evicted(&self, paths: Vec<PathBuf>) {
        for path in paths {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "Failed to delete evicted segment"
                    );
                }
            }
        }
    }

    /// Unlink without blocking the caller, for paths that cannot await
    /// (guard drops). Falls back to an inline removal when no runtime is
    /// running.
    fn unlink_detached(&self, path: PathBuf) {
        let unlink = move || {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "Failed to delete cache file"
                    );
                }
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(unlink);
            }
            Err(_) => unlink(),
        }
    }
}

/// Pin on a cache entry.
///
/// A consumer guard pins a Ready file; a producer guard owns the
/// Downloading slot and must [`publish`](CacheGuard::publish) or
/// [`abandon`](CacheGuard::abandon) it. Dropping a guard releases the pin;
/// dropping an unfinished producer abandons the download.
pub struct CacheGuard {
    cache: Arc<SegmentCache>,
    key: CacheKey,
    path: PathBuf,
    producer: bool,
    released: bool,
}

impl CacheGuard {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Hydrated file path for consumers; `.part` path for producers.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_producer(&self) -> bool {
        self.producer
    }

    /// Finish a download: atomically promote the `.part` file and convert
    /// this guard into a consumer pin on the Ready entry.
    pub async fn publish(mut self, actual_size: u64) -> Result<CacheGuard> {
        assert!(self.producer, "publish on a consumer guard");
        self.cache.publish_entry(&self.key, actual_size).await?;
        self.released = true;
        let cache = self.cache.clone();
        let key = self.key.clone();
        let path = cache.entry_path(&key);
        Ok(CacheGuard {
            cache,
            key,
            path,
            producer: false,
            released: false,
        })
    }

    /// Give up a download, freeing the slot for the next caller.
    pub fn abandon(mut self) {
        assert!(self.producer, "abandon on a consumer guard");
        self.released = true;
        self.cache.abandon_entry(&self.key);
    }

    /// Explicitly drop the pin.
    pub fn release(mut self) {
        self.released = true;
        self.cache.release_entry(&self.key);
    }
}

impl Drop for CacheGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.producer {
            self.cache.abandon_entry(&self.key);
        } else {
            self.cache.release_entry(&self.key);
        }
    }
}
