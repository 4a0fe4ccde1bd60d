use std::{future::Future, time::Duration};

use tracing::warn;

/// Exponential backoff: `min(base * 2^attempt, max)`. `attempt` is
/// zero-indexed, so the first retry waits a full `base`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    match 2u32.checked_pow(attempt) {
        Some(factor) => base.saturating_mul(factor).min(max),
        None => max,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Transient,
    Fatal,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

const RETRYABLE_HTTP_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Default classifier for HTTP calls: transport-level failures and the
/// retryable status set are transient, everything else is fatal.
pub fn classify_http(err: &reqwest::Error) -> RetryClass {
    if let Some(status) = err.status() {
        if RETRYABLE_HTTP_STATUSES.contains(&status.as_u16()) {
            return RetryClass::Transient;
        }
        return RetryClass::Fatal;
    }
    if err.is_builder() || err.is_redirect() {
        return RetryClass::Fatal;
    }
    RetryClass::Transient
}

/// Runs `operation` up to `max_retries + 1` times, sleeping the
/// scheduled backoff between transient failures. Fatal errors and
/// exhaustion propagate immediately with no trailing delay. Only
/// idempotent operations may be wrapped.
pub async fn execute<T, E, Fut, Op, Classify>(
    policy: RetryPolicy,
    mut operation: Op,
    classify: Classify,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    Classify: Fn(&E) -> RetryClass,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if classify(&err) == RetryClass::Fatal {
                    return Err(err);
                }
                if attempt >= policy.max_retries {
                    warn!(
                        attempts = attempt + 1,
                        "retryable call exhausted its attempts: {err}"
                    );
                    return Err(err);
                }
                let delay = backoff_delay(attempt, policy.base_delay, policy.max_delay);
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "retryable call failed, backing off: {err}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
