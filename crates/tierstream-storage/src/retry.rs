//! Retry Chain
//!
//! Hierarchical deadline/abort envelope shared by nested operations. A
//! [`RetryNode`] carries a deadline, an attempts budget, a backoff policy
//! and a cancellation token; children inherit the tighter of their own and
//! their parent's deadline, and cancelling a node cancels every descendant.
//!
//! The chain scopes every suspension point on the read path (object-store
//! transfers, cache waits, backoff sleeps) under one cancellable envelope:
//!
//! ```text
//! reader read_some (deadline A)
//!   └── segment hydrate (child, deadline min(A, B))
//!         ├── cache reserve_or_wait
//!         └── download attempt 1..n, backoff between attempts
//! ```
//!
//! Cancellation is cooperative: a fired abort is observed at the next
//! suspension point and surfaces as [`Error::Aborted`]. Abort takes
//! precedence over the deadline, which takes precedence over retries.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Exponential backoff policy for download retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Initial backoff in milliseconds (default: 100)
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds (default: 30s)
    pub max_backoff_ms: u64,

    /// Multiplier for exponential growth (default: 2.0)
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Backoff duration for a 0-indexed attempt, capped at the maximum.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ms = self.initial_backoff_ms as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(ms as u64).min(Duration::from_millis(self.max_backoff_ms))
    }

    /// Backoff with ±25% jitter, to spread simultaneous retries.
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let jitter = 0.75 + rand::thread_rng().gen::<f64>() * 0.5;
        Duration::from_millis((base.as_millis() as f64 * jitter) as u64)
    }
}

/// One node of the retry chain.
pub struct RetryNode {
    deadline: Instant,
    attempts: u32,
    policy: BackoffPolicy,
    token: CancellationToken,
}

impl RetryNode {
    /// Root node with its own timeout, attempts budget and backoff policy.
    pub fn root(timeout: Duration, attempts: u32, policy: BackoffPolicy) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            attempts,
            policy,
            token: CancellationToken::new(),
        }
    }

    /// Child inheriting this node's deadline, budget and policy.
    ///
    /// The child's token is a descendant of this node's: cancelling the
    /// parent cancels the child, not vice versa.
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            attempts: self.attempts,
            policy: self.policy.clone(),
            token: self.token.child_token(),
        }
    }

    /// Child with a tighter timeout: deadline = min(parent, now + timeout).
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let mut child = self.child();
        child.deadline = self.deadline.min(Instant::now() + timeout);
        child
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Fire the abort signal for this node and all descendants.
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Observe the envelope: abort beats deadline.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Aborted);
        }
        if Instant::now() >= self.deadline {
            return Err(Error::DeadlineExceeded);
        }
        Ok(())
    }

    /// Run a future under this envelope, racing it against abort and
    /// deadline. The future is dropped if the envelope fires first.
    pub async fn wait<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Aborted),
            _ = tokio::time::sleep_until(self.deadline) => Err(Error::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }

    /// Sleep the jittered backoff for `attempt`, honoring abort and
    /// deadline. Waking exactly at the deadline counts as exceeding it.
    pub async fn sleep_backoff(&self, attempt: u32) -> Result<()> {
        let wake = Instant::now() + self.policy.jittered_backoff(attempt);
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Aborted),
            _ = tokio::time::sleep_until(self.deadline) => Err(Error::DeadlineExceeded),
            _ = tokio::time::sleep_until(wake) => Ok(()),
        }
    }

    /// Clone of the abort token, for code that selects on it directly.
    pub fn abort_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_max_cap() {
        let policy = BackoffPolicy {
            initial_backoff_ms: 1000,
            max_backoff_ms: 4000,
            multiplier: 2.0,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff(5), Duration::from_millis(4000));
    }

    #[test]
    fn test_jitter_stays_in_window() {
        let policy = BackoffPolicy::default();
        for _ in 0..50 {
            let jittered = policy.jittered_backoff(2).as_millis() as f64;
            let base = policy.backoff(2).as_millis() as f64;
            assert!(jittered >= base * 0.75 - 1.0);
            assert!(jittered <= base * 1.25 + 1.0);
        }
    }

    #[tokio::test]
    async fn test_check_ok_when_fresh() {
        let node = RetryNode::root(Duration::from_secs(10), 3, BackoffPolicy::default());
        assert!(node.check().is_ok());
    }

    #[tokio::test]
    async fn test_abort_propagates_to_children() {
        let root = RetryNode::root(Duration::from_secs(10), 3, BackoffPolicy::default());
        let child = root.child();
        let grandchild = child.child();

        root.abort();
        assert!(matches!(child.check(), Err(Error::Aborted)));
        assert!(matches!(grandchild.check(), Err(Error::Aborted)));
    }

    #[tokio::test]
    async fn test_child_abort_does_not_reach_parent() {
        let root = RetryNode::root(Duration::from_secs(10), 3, BackoffPolicy::default());
        let child = root.child();

        child.abort();
        assert!(root.check().is_ok());
        assert!(matches!(child.check(), Err(Error::Aborted)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let node = RetryNode::root(Duration::from_millis(50), 3, BackoffPolicy::default());
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(matches!(node.check(), Err(Error::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_child_inherits_tighter_deadline() {
        let root = RetryNode::root(Duration::from_millis(100), 3, BackoffPolicy::default());
        let child = root.child_with_timeout(Duration::from_secs(60));
        // parent deadline is tighter than the requested 60s
        assert!(child.deadline() <= root.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_aborted_mid_future() {
        let node = RetryNode::root(Duration::from_secs(10), 3, BackoffPolicy::default());
        let token = node.abort_token();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let result = node.wait(tokio::time::sleep(Duration::from_secs(5))).await;
        assert!(matches!(result, Err(Error::Aborted)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_backoff_hits_deadline_first() {
        let policy = BackoffPolicy {
            initial_backoff_ms: 10_000,
            max_backoff_ms: 10_000,
            multiplier: 1.0,
        };
        let node = RetryNode::root(Duration::from_millis(100), 3, policy);
        let result = node.sleep_backoff(0).await;
        assert!(matches!(result, Err(Error::DeadlineExceeded)));
    }
}
