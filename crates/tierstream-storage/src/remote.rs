//! Object Store Adapter
//!
//! Thin wrapper over `object_store` for the read path: a single-shot
//! GET-to-file and a HEAD. The adapter classifies failures but does not
//! retry; looping and backoff belong to the retry chain, so callers see
//! exactly one transfer per invocation.
//!
//! Downloads stream to the destination path chunk by chunk, observing the
//! retry chain's abort between chunks; a cancelled transfer leaves at most
//! a partial temporary file, which the cache never publishes.

use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use object_store::ObjectStore;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;

use crate::config::RemoteReadConfig;
use crate::error::{Error, Result};
use crate::retry::RetryNode;

/// Outcome of one download attempt.
#[derive(Debug)]
pub enum DownloadOutcome {
    /// Object fully written to the destination path.
    Success { bytes: u64 },
    /// Object does not exist in the store.
    NotFound,
    /// Failure worth retrying under the chain's backoff.
    TransientError(String),
    /// Failure no retry will fix (auth, bad key, unsupported op).
    PermanentError(String),
}

/// Read-side object store client.
///
/// A semaphore bounds concurrent downloads per shard; waiting for a slot
/// counts against the caller's retry-chain envelope.
pub struct RemoteStore {
    store: Arc<dyn ObjectStore>,
    download_permits: Arc<Semaphore>,
}

impl RemoteStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self::with_concurrency(store, 4)
    }

    pub fn with_concurrency(store: Arc<dyn ObjectStore>, max_concurrent: usize) -> Self {
        Self {
            store,
            download_permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn with_config(store: Arc<dyn ObjectStore>, config: &RemoteReadConfig) -> Self {
        Self::with_concurrency(store, config.max_concurrent_downloads)
    }

    /// Download `key` into `dest`, streaming chunks under the retry chain's
    /// envelope. One attempt only; the caller owns the retry loop.
    pub async fn download_object(
        &self,
        key: &str,
        dest: &Path,
        rtc: &RetryNode,
    ) -> Result<DownloadOutcome> {
        rtc.check()?;

        let _permit = match rtc.wait(self.download_permits.clone().acquire_owned()).await? {
            Ok(permit) => permit,
            Err(_) => return Err(Error::Shutdown),
        };

        let location = object_store::path::Path::from(key);
        let get = match rtc.wait(self.store.get(&location)).await? {
            Ok(get) => get,
            Err(err) => return Ok(classify(err)),
        };

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = get.into_stream();
        let mut bytes_written: u64 = 0;

        loop {
            let chunk = match rtc.wait(stream.next()).await? {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => return Ok(classify(err)),
                None => break,
            };
            file.write_all(&chunk).await?;
            bytes_written += chunk.len() as u64;
        }
        file.flush().await?;

        tracing::debug!(key = %key, bytes = bytes_written, "Downloaded object");
        Ok(DownloadOutcome::Success {
            bytes: bytes_written,
        })
    }

    /// HEAD: size of the object, or `None` if it does not exist.
    pub async fn object_size(&self, key: &str, rtc: &RetryNode) -> Result<Option<u64>> {
        rtc.check()?;
        let location = object_store::path::Path::from(key);
        match rtc.wait(self.store.head(&location)).await? {
            Ok(meta) => Ok(Some(meta.size as u64)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn classify(err: object_store::Error) -> DownloadOutcome {
    match err {
        object_store::Error::NotFound { .. } => DownloadOutcome::NotFound,
        object_store::Error::PermissionDenied { .. }
        | object_store::Error::Unauthenticated { .. }
        | object_store::Error::InvalidPath { .. }
        | object_store::Error::NotSupported { .. }
        | object_store::Error::NotImplemented => DownloadOutcome::PermanentError(err.to_string()),
        other => DownloadOutcome::TransientError(other.to_string()),
    }
}
