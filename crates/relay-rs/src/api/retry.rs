//! Retry with exponential backoff and a closed remote-error classification.
//!
//! Rate limits (429), gateway errors (5xx) and transport failures are retried
//! within the same turn attempt. A 400 carrying the "already has an active
//! run" message is its own class: callers drain the stray run and retry. All
//! other HTTP failures are permanent.

use crate::error::{RelayError, RemoteError};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries (0 = fail on the first error).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Scale delays by a fixed jitter factor per attempt.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    /// Delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.jitter {
            // Deterministic factors keep the schedule reproducible in tests.
            let jitter_factor = match attempt % 4 {
                0 => 0.75,
                1 => 0.90,
                2 => 0.60,
                _ => 0.85,
            };
            Duration::from_secs_f64(capped * jitter_factor)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

// ── Classification ─────────────────────────────────────────────────

/// What a remote failure means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorClass {
    /// HTTP 429. Wait and retry.
    RateLimited,
    /// The thread already has an active run. Drain it, then retry.
    ActiveRun,
    /// Gateway or network failure. Retry with backoff.
    Transient,
    /// Anything else. Do not retry within the attempt.
    Permanent,
}

impl RemoteErrorClass {
    /// Whether plain backoff can fix it.
    pub fn is_retryable(self) -> bool {
        matches!(self, RemoteErrorClass::RateLimited | RemoteErrorClass::Transient)
    }
}

pub fn classify(error: &RemoteError) -> RemoteErrorClass {
    match error {
        RemoteError::Http { status: 429, .. } => RemoteErrorClass::RateLimited,
        RemoteError::Http { status: 400, body } if is_active_run_message(body) => {
            RemoteErrorClass::ActiveRun
        }
        RemoteError::Http {
            status: 408 | 500 | 502 | 503 | 504,
            ..
        } => RemoteErrorClass::Transient,
        RemoteError::Http { .. } | RemoteError::Decode(_) => RemoteErrorClass::Permanent,
        RemoteError::Transport(_) => RemoteErrorClass::Transient,
    }
}

fn is_active_run_message(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("active run") || lower.contains("while a run")
}

impl RemoteError {
    pub fn class(&self) -> RemoteErrorClass {
        classify(self)
    }
}

// ── Retry loop ─────────────────────────────────────────────────────

/// Run `op` until it succeeds, retrying retryable remote failures with
/// backoff. Cancellation is checked before every attempt and during every
/// backoff sleep.
pub async fn retry_remote<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> Result<T, RelayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < config.max_retries && e.class().is_retryable() => {
                let delay = config.delay_for_attempt(attempt);
                attempt += 1;
                warn!(
                    "{label} failed ({e}); retrying in {:.1}s ({attempt}/{})",
                    delay.as_secs_f64(),
                    config.max_retries
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn http(status: u16, body: &str) -> RemoteError {
        RemoteError::Http {
            status,
            body: body.into(),
        }
    }

    #[test]
    fn delay_increases_exponentially() {
        let config = RetryConfig {
            jitter: false,
            ..RetryConfig::with_retries(5)
        };
        let d0 = config.delay_for_attempt(0);
        let d1 = config.delay_for_attempt(1);
        let d2 = config.delay_for_attempt(2);
        assert!(d1 > d0, "d1={d1:?} should be > d0={d0:?}");
        assert!(d2 > d1, "d2={d2:?} should be > d1={d1:?}");
    }

    #[test]
    fn delay_capped_at_max() {
        let config = RetryConfig {
            jitter: false,
            max_delay: Duration::from_secs(2),
            ..RetryConfig::with_retries(10)
        };
        assert!(config.delay_for_attempt(10) <= Duration::from_secs(2));
    }

    #[test]
    fn classifies_remote_failures() {
        assert_eq!(classify(&http(429, "slow down")), RemoteErrorClass::RateLimited);
        assert_eq!(
            classify(&http(
                400,
                "Thread thread_abc already has an active run run_xyz."
            )),
            RemoteErrorClass::ActiveRun
        );
        assert_eq!(classify(&http(502, "bad gateway")), RemoteErrorClass::Transient);
        assert_eq!(
            classify(&RemoteError::Transport("connection reset".into())),
            RemoteErrorClass::Transient
        );
        assert_eq!(classify(&http(400, "bad request")), RemoteErrorClass::Permanent);
        assert_eq!(classify(&http(401, "unauthorized")), RemoteErrorClass::Permanent);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_remote_recovers_from_rate_limit() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::with_retries(3);
        let cancel = CancellationToken::new();
        let result = retry_remote(&config, &cancel, "create run", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(http(429, "rate limited"))
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
    async fn retry_remote_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::with_retries(3);
        let cancel = CancellationToken::new();
        let result: Result<(), _> = retry_remote(&config, &cancel, "create run", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(http(401, "unauthorized")) }
        })
        .await;
        assert!(matches!(result, Err(RelayError::Remote(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_remote_observes_cancellation() {
        let config = RetryConfig::with_retries(3);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> =
            retry_remote(&config, &cancel, "create run", || async { Ok(()) }).await;
        assert!(matches!(result, Err(RelayError::Cancelled)));
    }
}
