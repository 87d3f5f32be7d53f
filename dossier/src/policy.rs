//! Shared rate-limit and retry policy for all stage workers.
//!
//! One limiter type and one retry policy, configured per collaborator and
//! reused everywhere, instead of ad-hoc retry loops sprinkled across
//! services.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorLimiter};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::clients::ClientError;

/// Tokens-per-interval rate limit for one collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Tokens replenished per interval.
    pub permits: u32,
    /// Interval length in milliseconds.
    pub interval_ms: u64,
}

impl RateLimit {
    pub fn per_second(permits: u32) -> Self {
        Self {
            permits,
            interval_ms: 1_000,
        }
    }

    pub fn per_minute(permits: u32) -> Self {
        Self {
            permits,
            interval_ms: 60_000,
        }
    }
}

/// Token-bucket limiter over one collaborator.
///
/// `None` limit means unconstrained (the collaborator still applies its
/// own limits; 429s go through the retry policy).
pub struct RateLimiter {
    inner: Option<DefaultDirectRateLimiter>,
}

impl RateLimiter {
    pub fn new(limit: Option<RateLimit>) -> Self {
        let inner = limit.and_then(|limit| {
            let permits = NonZeroU32::new(limit.permits.max(1))?;
            let replenish = Duration::from_millis(limit.interval_ms.max(1)) / permits.get();
            let quota = Quota::with_period(replenish)?.allow_burst(permits);
            Some(GovernorLimiter::direct(quota))
        });
        Self { inner }
    }

    pub fn unlimited() -> Self {
        Self { inner: None }
    }

    /// Wait until a token is available.
    pub async fn acquire(&self) {
        if let Some(limiter) = &self.inner {
            limiter.until_ready().await;
        }
    }
}

/// Exponential backoff with jitter, bounded attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base backoff in milliseconds (exponentially increased).
    pub backoff_ms: u64,
    /// Factor applied per retry.
    pub backoff_factor: u64,
    /// Backoff ceiling in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
            backoff_factor: 2,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based), jitter excluded.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponential = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(attempt));
        Duration::from_millis(exponential.min(self.max_backoff_ms))
    }

    /// Run an operation under this policy.
    ///
    /// Retryable errors (429, 5xx, network) are retried with exponential
    /// backoff plus up to 50% jitter; everything else returns
    /// immediately. Auth failures are logged at error level so they get
    /// alerted.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ClientError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_auth() => {
                    tracing::error!(operation = what, error = %err, "Authentication failure");
                    return Err(err);
                }
                Err(err) if err.is_retryable() && attempt + 1 < self.max_attempts => {
                    let base = self.backoff(attempt);
                    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
                    let delay = base + Duration::from_millis(jitter_ms);
                    tracing::warn!(
                        operation = what,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after transient collaborator error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_ms: 100,
            backoff_factor: 2,
            max_backoff_ms: 300,
        };
        assert_eq!(policy.backoff(0).as_millis(), 100);
        assert_eq!(policy.backoff(1).as_millis(), 200);
        assert_eq!(policy.backoff(2).as_millis(), 300); // capped
        assert_eq!(policy.backoff(10).as_millis(), 300);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_ms: 1,
            backoff_factor: 1,
            max_backoff_ms: 2,
        };
        let calls = AtomicU32::new(0);
        let result = policy
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ClientError::RateLimited)
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_error_not_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ClientError::Status {
                        status: 400,
                        body: "bad".to_string(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_error_not_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ClientError::Auth("nope".to_string())) }
            })
            .await;
        assert!(matches!(result, Err(ClientError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_ms: 1,
            backoff_factor: 1,
            max_backoff_ms: 2,
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ClientError::RateLimited) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unlimited_acquire_is_immediate() {
        let limiter = RateLimiter::unlimited();
        tokio::time::timeout(Duration::from_millis(10), limiter.acquire())
            .await
            .expect("unlimited limiter must not block");
    }

    #[tokio::test]
    async fn test_limiter_allows_burst() {
        let limiter = RateLimiter::new(Some(RateLimit::per_second(100)));
        for _ in 0..5 {
            tokio::time::timeout(Duration::from_millis(50), limiter.acquire())
                .await
                .expect("burst tokens should be available");
        }
    }
}
