//! Operation Gate
//!
//! Counts in-flight operations on an object so shutdown can wait for them
//! to drain. Entering a closed gate fails with [`Error::Shutdown`]; closing
//! waits until every outstanding [`GateGuard`] has dropped.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Shared {
    count: AtomicUsize,
    closed: AtomicBool,
    drained: Notify,
}

/// Tracks outstanding operations for orderly shutdown.
#[derive(Debug, Default)]
pub struct Gate {
    shared: Arc<Shared>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation. Fails once the gate is closed.
    pub fn enter(&self) -> Result<GateGuard> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        self.shared.count.fetch_add(1, Ordering::AcqRel);
        // closing may have raced the increment; back out if so
        if self.shared.closed.load(Ordering::Acquire) {
            let guard = GateGuard {
                shared: self.shared.clone(),
            };
            drop(guard);
            return Err(Error::Shutdown);
        }
        Ok(GateGuard {
            shared: self.shared.clone(),
        })
    }

    /// Close the gate and wait for all outstanding guards to drop.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        loop {
            if self.shared.count.load(Ordering::Acquire) == 0 {
                return;
            }
            let notified = self.shared.drained.notified();
            if self.shared.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

/// Handle for one in-flight operation; dropping it exits the gate.
#[derive(Debug)]
pub struct GateGuard {
    shared: Arc<Shared>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        if self.shared.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.drained.notify_waiters();
        }
    }
}
