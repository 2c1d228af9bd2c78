//! Shared API throttle
//!
//! A token-bucket limiter that governs every outbound forge call made by the
//! collectors, plus the retry wrapper used around individual API operations.
//! One `Throttle` instance is shared by all workers in a sync so aggregate
//! throughput stays under the forge's abuse limits regardless of pool sizes.

use crate::config::ThrottleConfig;
use crate::error::{is_cancelled, CollectorError};
use anyhow::Result;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Substrings that mark an error as a rate-limit response, matched
/// case-insensitively against the rendered error chain
const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "abuse",
    "secondary rate",
    "too many requests",
    "api rate limit exceeded",
    "403",
    "429",
];

/// Classify an error as a transient rate-limit response
pub fn is_rate_limit_error(err: &anyhow::Error) -> bool {
    let text = format!("{:#}", err).to_ascii_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|marker| text.contains(marker))
}

/// Mutable bucket state; tokens are fractional so refill stays smooth
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Monotonic counters observable as a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThrottleStats {
    pub total_calls: u64,
    pub total_retries: u64,
    pub total_wait_ms: u64,
}

/// Token-bucket throttle shared across all concurrent collectors
pub struct Throttle {
    config: ThrottleConfig,
    bucket: Mutex<Bucket>,
    total_calls: AtomicU64,
    total_retries: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl Throttle {
    /// Create a throttle with a full bucket
    pub fn new(config: ThrottleConfig) -> Self {
        let bucket = Bucket {
            tokens: config.burst_size as f64,
            last_refill: Instant::now(),
        };

        Self {
            config,
            bucket: Mutex::new(bucket),
            total_calls: AtomicU64::new(0),
            total_retries: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
        }
    }

    /// Take one token, or report how long until one is available
    fn try_acquire(&self) -> std::result::Result<(), Duration> {
        // A non-positive refill rate disables throttling entirely
        if self.config.requests_per_second <= 0.0 {
            return Ok(());
        }

        let mut bucket = self.bucket.lock().unwrap();

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * self.config.requests_per_second)
                .min(self.config.burst_size as f64);
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            Err(Duration::from_secs_f64(
                deficit / self.config.requests_per_second,
            ))
        }
    }

    /// Acquire one token, blocking until available or cancellation fires
    ///
    /// Increments the call counter on success and accumulates the time spent
    /// waiting. Returns the cancellation sentinel if the ambient signal fires
    /// before a token becomes available.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        let start = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Err(CollectorError::Cancelled.into());
            }

            match self.try_acquire() {
                Ok(()) => {
                    self.total_calls.fetch_add(1, Ordering::Relaxed);
                    let waited = start.elapsed().as_millis() as u64;
                    if waited > 0 {
                        self.total_wait_ms.fetch_add(waited, Ordering::Relaxed);
                    }
                    return Ok(());
                }
                Err(wait) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CollectorError::Cancelled.into()),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// Sleep for the configured inter-repo delay, cancellable
    ///
    /// No-op when the delay is zero.
    pub async fn pause_between_repos(&self, cancel: &CancellationToken) -> Result<()> {
        let delay = self.config.inter_repo_delay();
        if delay.is_zero() {
            return Ok(());
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(CollectorError::Cancelled.into()),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Run an API operation under the throttle, retrying on rate-limit errors
    ///
    /// A token is acquired before every attempt so burst behavior stays
    /// correct when retries cluster. Non-rate-limit errors pass through
    /// untouched; cancellation always wins; rate-limit errors are retried
    /// with geometric backoff and surfaced as `RetriesExhausted` once the
    /// retry budget is spent.
    pub async fn run_with_retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        mut thunk: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.config.initial_backoff();
        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                self.total_retries.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "{}: retry {}/{} after {:?}",
                    operation, attempt, self.config.max_retries, backoff
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(CollectorError::Cancelled.into()),
                    _ = tokio::time::sleep(backoff) => {}
                }

                backoff = backoff
                    .mul_f64(self.config.backoff_multiplier)
                    .min(self.config.max_backoff());
            }

            self.acquire(cancel).await?;

            match thunk().await {
                Ok(value) => return Ok(value),
                Err(err) if is_cancelled(&err) => return Err(err),
                Err(err) if is_rate_limit_error(&err) => {
                    warn!("{}: rate limited: {:#}", operation, err);
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        let last_error = last_error
            .map(|err| format!("{:#}", err))
            .unwrap_or_else(|| "unknown error".to_string());

        Err(CollectorError::RetriesExhausted {
            operation: operation.to_string(),
            attempts: self.config.max_retries + 1,
            last_error,
        }
        .into())
    }

    /// Snapshot of the monotonic counters
    pub fn stats(&self) -> ThrottleStats {
        ThrottleStats {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            total_wait_ms: self.total_wait_ms.load(Ordering::Relaxed),
        }
    }
}
