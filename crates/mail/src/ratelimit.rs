//! Token-bucket rate limiting with retry-and-backoff.
//!
//! A background producer refills a bounded channel of permits with `rate`
//! tokens every `period`; callers block on [`RateLimit::get`] until a
//! permit is available. [`RateLimit::do_with_backoff`] layers geometric
//! retry on top for calls that can fail transiently (quota errors from a
//! REST endpoint).

use anyhow::{Result, anyhow};
use crossbeam::channel::{Receiver, bounded};
use log::warn;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// How many periods' worth of permits may be outstanding at once. Kept at
/// one bucket so a burst cannot exceed a single period's budget by much.
const WINDOWS: usize = 1;

/// A shared token-bucket rate limiter.
///
/// Cloneable across threads; all clones draw from the same permit pool.
#[derive(Clone)]
pub struct RateLimit {
    backoff_limit: u32,
    backoff_start: Duration,
    toks: Receiver<()>,
    stopped: Arc<AtomicBool>,
}

impl RateLimit {
    /// Start a limiter releasing `rate` permits every `period`.
    ///
    /// `backoff_limit` and `backoff_start` control [`do_with_backoff`]:
    /// at most `backoff_limit` attempts, sleeping `backoff_start * 2^i`
    /// between them.
    ///
    /// [`do_with_backoff`]: RateLimit::do_with_backoff
    pub fn start(
        period: Duration,
        rate: usize,
        backoff_limit: u32,
        backoff_start: Duration,
    ) -> Self {
        let (tx, rx) = bounded::<()>(WINDOWS * rate.max(1));
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopped);
        thread::spawn(move || {
            loop {
                for _ in 0..rate {
                    // All receivers gone: the limiter was dropped.
                    if tx.send(()).is_err() {
                        return;
                    }
                }
                thread::sleep(period);
                if flag.load(Ordering::Relaxed) {
                    return;
                }
            }
        });
        Self {
            backoff_limit,
            backoff_start,
            toks: rx,
            stopped,
        }
    }

    /// Block until a permit is available.
    pub fn get(&self) {
        let _ = self.toks.recv();
    }

    /// Take a permit if one is immediately available.
    pub fn try_get(&self) -> bool {
        self.toks.try_recv().is_ok()
    }

    /// Shut down the refill producer after its current period elapses.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    /// Run `f` under the rate limit, retrying transient failures.
    ///
    /// Each attempt consumes one permit. Errors for which `transient`
    /// returns false are returned immediately; transient ones are retried
    /// after a geometrically growing sleep, up to `backoff_limit` attempts
    /// in total.
    pub fn do_with_backoff<T>(
        &self,
        mut f: impl FnMut() -> Result<T>,
        transient: impl Fn(&anyhow::Error) -> bool,
    ) -> Result<T> {
        let mut last = None;
        for attempt in 0..self.backoff_limit {
            self.get();
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if transient(&e) => {
                    if attempt + 1 < self.backoff_limit {
                        let delay = self.backoff_start * 2u32.saturating_pow(attempt);
                        warn!("Transient error: {e:#}; retrying in {delay:?}");
                        thread::sleep(delay);
                    }
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| anyhow!("retry budget of zero attempts")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn test_limiter(rate: usize, backoff_limit: u32) -> RateLimit {
        RateLimit::start(
            Duration::from_millis(50),
            rate,
            backoff_limit,
            Duration::from_millis(1),
        )
    }

    #[test]
    fn test_try_get_honors_bucket_size() {
        let limiter = test_limiter(3, 1);
        // Give the refill producer a moment to fill the bucket.
        thread::sleep(Duration::from_millis(20));
        assert!(limiter.try_get());
        assert!(limiter.try_get());
        assert!(limiter.try_get());
        assert!(!limiter.try_get());
        limiter.stop();
    }

    #[test]
    fn test_backoff_retries_transient_until_success() {
        let limiter = test_limiter(100, 5);
        let calls = AtomicU32::new(0);
        let result = limiter.do_with_backoff(
            || {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(anyhow!("quota"))
                } else {
                    Ok(42)
                }
            },
            |_| true,
        );
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        limiter.stop();
    }

    #[test]
    fn test_backoff_fatal_error_returns_immediately() {
        let limiter = test_limiter(100, 5);
        let calls = AtomicU32::new(0);
        let result: Result<()> = limiter.do_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("bad request"))
            },
            |_| false,
        );
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        limiter.stop();
    }

    #[test]
    fn test_backoff_gives_up_after_limit() {
        let limiter = test_limiter(100, 3);
        let calls = AtomicU32::new(0);
        let result: Result<()> = limiter.do_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("quota"))
            },
            |_| true,
        );
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        limiter.stop();
    }
}
