//! Transient error classification and exponential backoff.
//!
//! Network-facing clients (chart repository fetches, image pulls) call
//! [`is_retryable`] to decide whether a failure is worth another attempt and
//! [`exponential_delay`] to pace those attempts. Registry readiness polling
//! does not use this module; it retries on a fixed interval.
//!
//! # Example
//!
//! ```ignore
//! use kindling_common::retry::{retry_transient, RetryConfig};
//!
//! let index = retry_transient(
//!     &RetryConfig::default(),
//!     &token,
//!     "helm repo update",
//!     || async { helm.repo_update().await },
//! ).await?;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Phrases that mark an error as transient.
const TRANSIENT_MARKERS: &[&str] = &[
    "Internal Server Error",
    "Bad Gateway",
    "Service Unavailable",
    "Gateway Timeout",
    "connection reset by peer",
    "connection refused",
    "i/o timeout",
    "TLS handshake timeout",
    "unexpected EOF",
    "no such host",
];

/// Bare 5xx status codes. Word boundaries keep ports like `:5000` out.
static SERVER_ERROR_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b50[0-4]\b").expect("static regex is valid"));

/// Whether `err` describes a transient network failure.
///
/// `None` is never retryable.
pub fn is_retryable<E: Display + ?Sized>(err: Option<&E>) -> bool {
    match err {
        Some(e) => is_retryable_message(&e.to_string()),
        None => false,
    }
}

/// Text-level classifier behind [`is_retryable`].
pub fn is_retryable_message(message: &str) -> bool {
    TRANSIENT_MARKERS.iter().any(|m| message.contains(m))
        || SERVER_ERROR_CODE.is_match(message)
}

/// `min(base * 2^(attempt-1), max)` with `attempt` 1-indexed.
///
/// Attempt 0 is treated as 1; large attempts saturate at `max`.
pub fn exponential_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1);
    2u32.checked_pow(exponent)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

/// Retry policy for network-facing clients.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(15),
        }
    }
}

/// Run `operation`, retrying only transient failures.
///
/// Non-retryable errors are returned immediately. Retryable errors are
/// retried until `max_attempts` is reached or the token is cancelled, in
/// which case the last error is returned.
pub async fn retry_transient<F, Fut, T, E>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !is_retryable(Some(&err)) {
            return Err(err);
        }

        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt,
                error = %err,
                "Operation failed after max retries"
            );
            return Err(err);
        }

        let delay = exponential_delay(attempt, config.base_delay, config.max_delay);
        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "Transient failure, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(err),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
