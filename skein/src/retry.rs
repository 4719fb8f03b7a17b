//! Exponential backoff with jitter around provider calls.
//!
//! Classification is policy-driven: rate-limit and 5xx statuses plus a set
//! of known transient message substrings retry; everything else surfaces
//! immediately. Backoff sleeps are interruptible through the run context,
//! and each attempt is narrated on the event stream when a sink is given.

use std::time::Duration;

use tracing::{debug, warn};

use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::event::{EventPayload, EventSink};

/// HTTP statuses treated as transient.
const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Message substrings treated as transient, matched case-insensitively.
const TRANSIENT_SUBSTRINGS: [&str; 6] = [
    "connection reset",
    "connection refused",
    "rate limit",
    "too many requests",
    "service unavailable",
    "gateway timeout",
];

/// Backoff configuration.
///
/// `delay(attempt) = min(max_delay, initial_delay * multiplier^attempt)`,
/// then scaled by a uniform factor in `1 ± jitter`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrySettings {
    /// Total attempts, including the first. `1` disables retrying.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Exponential growth factor.
    pub multiplier: f64,
    /// Jitter fraction in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetrySettings {
    /// One attempt, no retries.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// The backoff delay before retry number `retry` (0-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self.initial_delay.as_secs_f64() * self.multiplier.powi(retry.min(63) as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 + jitter * (fastrand::f64() * 2.0 - 1.0);
        Duration::from_secs_f64((capped * factor).max(0.0))
    }
}

/// Whether an error is worth retrying at the provider layer.
#[must_use]
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Provider { message, status } => {
            if status.is_some_and(|s| RETRYABLE_STATUSES.contains(&s)) {
                return true;
            }
            let lowered = message.to_lowercase();
            TRANSIENT_SUBSTRINGS.iter().any(|s| lowered.contains(s))
        }
        _ => false,
    }
}

/// Run `op` with retries per `settings`, narrating attempts on `sink`.
///
/// Cancellation interrupts backoff sleeps and surfaces as `Cancelled`
/// without further attempts. Non-retryable errors are returned from the
/// failing attempt directly.
pub async fn retry<T, F, Fut>(
    ctx: &RunContext,
    settings: RetrySettings,
    sink: Option<&EventSink>,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = settings.max_attempts.max(1);
    let mut last_error: Option<Error> = None;

    for attempt in 1..=attempts {
        ctx.check_live()?;
        // The first call is not a retry; only re-attempts are narrated.
        if attempt > 1
            && let Some(sink) = sink
        {
            sink.emit(EventPayload::RetryAttempt { attempt });
        }

        match ctx.run_until(op()).await? {
            Ok(value) => {
                if attempt > 1 {
                    if let Some(sink) = sink {
                        sink.emit(EventPayload::RetrySuccess);
                    }
                    debug!(attempt, "call succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_cancellation() => return Err(err),
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(err);
                }
                warn!(attempt, error = %err, "transient provider failure");
                if let Some(sink) = sink {
                    sink.emit(EventPayload::RetryFailed {
                        error: err.to_string(),
                    });
                }
                if attempt < attempts {
                    let delay = settings.delay_for(attempt - 1);
                    if let Some(sink) = sink {
                        sink.emit(EventPayload::RetryScheduled {
                            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        });
                    }
                    ctx.run_until(tokio::time::sleep(delay)).await?;
                }
                last_error = Some(err);
            }
        }
    }

    let err = last_error.unwrap_or_else(|| Error::provider("retry budget exhausted"));
    if let Some(sink) = sink {
        sink.emit(EventPayload::RetryExhausted {
            error: err.to_string(),
        });
    }
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> Error {
        Error::provider_status("too many requests", 429)
    }

    #[test]
    fn classification() {
        assert!(is_retryable(&Error::provider_status("oops", 503)));
        assert!(is_retryable(&Error::provider("connection reset by peer")));
        assert!(is_retryable(&Error::provider("Rate Limit hit")));
        assert!(!is_retryable(&Error::provider_status("bad request", 400)));
        assert!(!is_retryable(&Error::configuration("no provider")));
        assert!(!is_retryable(&Error::Cancelled));
    }

    #[test]
    fn delay_growth_and_cap() {
        let settings = RetrySettings {
            jitter: 0.0,
            ..RetrySettings::default()
        };
        assert_eq!(settings.delay_for(0), Duration::from_millis(500));
        assert_eq!(settings.delay_for(1), Duration::from_secs(1));
        assert_eq!(settings.delay_for(10), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_in_band() {
        let settings = RetrySettings::default();
        for retry in 0..8_i32 {
            let capped = (settings.initial_delay.as_secs_f64() * settings.multiplier.powi(retry))
                .min(settings.max_delay.as_secs_f64());
            let delay = settings.delay_for(retry as u32).as_secs_f64();
            assert!(delay >= capped * 0.8 - 1e-9, "delay {delay} below band");
            assert!(delay <= capped * 1.2 + 1e-9, "delay {delay} above band");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let ctx = RunContext::new();
        let calls = Arc::new(AtomicU32::new(0));
        let settings = RetrySettings {
            max_attempts: 3,
            ..RetrySettings::default()
        };

        let counter = Arc::clone(&calls);
        let result = retry(&ctx, settings, None, move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let ctx = RunContext::new();
        let calls = Arc::new(AtomicU32::new(0));
        let settings = RetrySettings {
            max_attempts: 3,
            ..RetrySettings::default()
        };

        let counter = Arc::clone(&calls);
        let result: Result<()> = retry(&ctx, settings, None, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Provider { status: Some(429), .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_make_exactly_one_call() {
        let ctx = RunContext::new();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let result: Result<()> = retry(&ctx, RetrySettings::default(), None, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::provider_status("unauthorized", 401))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_preset_means_one_attempt() {
        let ctx = RunContext::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = retry(&ctx, RetrySettings::disabled(), None, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
