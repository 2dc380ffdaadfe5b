//! Guard for second-opinion reads (sampling checks and dark reads).
//!
//! Verification reads share the request path with the answer they verify,
//! so each one is bounded by a timeout and skipped entirely for a cooldown
//! window after a run of consecutive failures.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::VindexError;

/// Result of one guarded verification read.
#[derive(Debug)]
pub enum Verdict<T> {
    Completed(T),
    Failed(VindexError),
    TimedOut,
    /// The breaker was open; nothing ran.
    Skipped,
}

#[derive(Debug)]
pub struct VerificationBreaker {
    name: String,
    threshold: u32,
    cooldown: Duration,
    failures: AtomicU32,
    open_until: Mutex<Option<Instant>>,
}

impl VerificationBreaker {
    /// `threshold == 0` disables tripping.
    pub fn new(name: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            threshold,
            cooldown,
            failures: AtomicU32::new(0),
            open_until: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        let mut open_until = self
            .open_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match *open_until {
            Some(deadline) if Instant::now() < deadline => true,
            Some(_) => {
                // Cooldown elapsed: allow the next read through.
                *open_until = None;
                self.failures.store(0, Ordering::Relaxed);
                false
            }
            None => false,
        }
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if self.threshold == 0 || failures < self.threshold {
            return;
        }
        let mut open_until = self
            .open_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if open_until.is_none() {
            warn!(
                verifier = %self.name,
                failures,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "verification reads failing; pausing them"
            );
            *open_until = Some(Instant::now() + self.cooldown);
        }
    }

    /// Runs `read` unless the breaker is open, bounded by `timeout`
    /// (`Duration::ZERO` disables the bound).
    pub async fn run<T, F>(&self, timeout: Duration, read: F) -> Verdict<T>
    where
        F: Future<Output = crate::error::Result<T>>,
    {
        if self.is_open() {
            return Verdict::Skipped;
        }
        let outcome = if timeout.is_zero() {
            Ok(read.await)
        } else {
            tokio::time::timeout(timeout, read).await
        };
        match outcome {
            Ok(Ok(value)) => {
                self.record_success();
                Verdict::Completed(value)
            }
            Ok(Err(err)) => {
                self.record_failure();
                Verdict::Failed(err)
            }
            Err(_) => {
                self.record_failure();
                Verdict::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing() -> crate::error::Result<()> {
        Err(VindexError::internal("sample read", "boom"))
    }

    #[tokio::test]
    async fn trips_after_threshold_and_skips() {
        let breaker = VerificationBreaker::new("v", 2, Duration::from_secs(60));
        assert!(matches!(
            breaker.run(Duration::ZERO, async { failing() }).await,
            Verdict::Failed(_)
        ));
        assert!(!breaker.is_open());
        assert!(matches!(
            breaker.run(Duration::ZERO, async { failing() }).await,
            Verdict::Failed(_)
        ));
        assert!(breaker.is_open());
        assert!(matches!(
            breaker.run(Duration::ZERO, async { Ok(1) }).await,
            Verdict::Skipped
        ));
    }

    #[tokio::test]
    async fn success_resets_the_failure_run() {
        let breaker = VerificationBreaker::new("v", 2, Duration::from_secs(60));
        let _ = breaker.run(Duration::ZERO, async { failing() }).await;
        assert!(matches!(
            breaker.run(Duration::ZERO, async { Ok(7) }).await,
            Verdict::Completed(7)
        ));
        let _ = breaker.run(Duration::ZERO, async { failing() }).await;
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn cooldown_expiry_closes_the_breaker() {
        let breaker = VerificationBreaker::new("v", 1, Duration::ZERO);
        let _ = breaker.run(Duration::ZERO, async { failing() }).await;
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn slow_reads_time_out() {
        let breaker = VerificationBreaker::new("v", 0, Duration::from_secs(60));
        let verdict = breaker
            .run(Duration::from_millis(5), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(verdict, Verdict::TimedOut));
        assert!(!breaker.is_open());
    }
}
