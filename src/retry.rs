//! Retry with exponential backoff and reconnect supervision
//!
//! Shared by every channel adapter's connect and send paths, and by the model
//! failover chain. Errors are classified as transient (rate limits, overload,
//! network blips) or permanent (auth failures, malformed requests); only
//! transient errors are retried.

use std::fmt::Display;
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Whether an error is expected to succeed on retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Overload, rate limit or network blip; retry with backoff
    Transient,
    /// Auth failure, not-found, malformed request; surface immediately
    Permanent,
}

impl ErrorClass {
    /// Whether this class is worth retrying
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Known overload / unavailable signatures
static TRANSIENT_SIGNATURES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(rate[ _-]?limit|too many requests|quota|overloaded|service[ _.-]?unavailable|high[ _.-]?demand|temporarily[ _.-]?unavailable|capacity|timed? ?out|connection\b|dns error|\b(429|502|503|504)\b)",
    )
    .expect("valid regex")
});

/// Classify an error message as transient or permanent
#[must_use]
pub fn classify(message: &str) -> ErrorClass {
    if TRANSIENT_SIGNATURES.is_match(message) {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

/// Classify an HTTP status plus response body
///
/// Rate limits (429) and server errors (5xx) are transient; anything else
/// falls back to matching the body text.
#[must_use]
pub fn classify_status(status: u16, body: &str) -> ErrorClass {
    if status == 429 || (500..600).contains(&status) {
        return ErrorClass::Transient;
    }

    if (400..500).contains(&status) {
        return ErrorClass::Permanent;
    }

    classify(body)
}

/// Errors that know their own retry class
pub trait Classify {
    /// Transient or permanent
    fn class(&self) -> ErrorClass;
}

impl Classify for crate::Error {
    fn class(&self) -> ErrorClass {
        Self::class(self)
    }
}

impl Classify for String {
    fn class(&self) -> ErrorClass {
        classify(self)
    }
}

/// Retry policy for platform and backend calls
///
/// Controls how many attempts are made and how long to wait between them
/// using exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failure (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Compute the delay after a failed attempt (0-based)
///
/// `min(base_delay * 2^attempt, max_delay)`
#[must_use]
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(policy.max_delay)
}

/// Why a retried operation ultimately failed
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// A permanent error; no retries were attempted after it
    #[error("permanent failure: {0}")]
    Permanent(E),

    /// Every attempt failed with a transient error
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error from the final attempt
        last: E,
    },

    /// Shutdown was requested while waiting to retry
    #[error("cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// The underlying error, if any attempt produced one
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Permanent(e) | Self::Exhausted { last: e, .. } => Some(e),
            Self::Cancelled => None,
        }
    }
}

/// Sleep for `delay` unless `cancel` fires first
///
/// Returns `false` if cancelled.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

/// Run `operation`, retrying transient failures with exponential backoff
///
/// A permanent error or attempt exhaustion is returned immediately. Backoff
/// sleeps observe `cancel`, so shutdown is never blocked behind a retry.
///
/// # Errors
///
/// Returns `RetryError` describing the final failure
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> std::result::Result<T, RetryError<E>>
where
    E: Classify + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 0..max_attempts {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.class().is_transient() {
            tracing::debug!(attempt = attempt + 1, error = %err, "permanent error, not retrying");
            return Err(RetryError::Permanent(err));
        }

        if attempt + 1 >= max_attempts {
            tracing::warn!(attempts = max_attempts, error = %err, "retries exhausted");
            return Err(RetryError::Exhausted {
                attempts: max_attempts,
                last: err,
            });
        }

        let delay = delay_for_attempt(policy, attempt);
        tracing::warn!(
            attempt = attempt + 1,
            max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "transient error, retrying"
        );

        if !sleep_or_cancel(delay, cancel).await {
            return Err(RetryError::Cancelled);
        }
    }

    Err(RetryError::Cancelled)
}

/// Reconnect policy for long-lived streaming connections
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay floor, used after a healthy session and for the first failure
    pub initial_delay: Duration,
    /// Delay cap
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

/// Doubling backoff state for a reconnect loop
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    current: Duration,
}

impl Backoff {
    /// Start at the policy's floor
    #[must_use]
    pub fn new(policy: ReconnectPolicy) -> Self {
        let current = policy.initial_delay;
        Self { policy, current }
    }

    /// Delay to wait now; the following delay doubles (capped)
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.policy.max_delay);
        delay
    }

    /// Drop back to the floor after a successful connection
    pub fn reset(&mut self) {
        self.current = self.policy.initial_delay;
    }

    /// The delay the next failure would wait
    #[must_use]
    pub const fn current(&self) -> Duration {
        self.current
    }
}

/// Keep a streaming session alive until `cancel` fires
///
/// `session` connects and runs until the connection drops. `Ok(())` means the
/// connection was established and later closed, which resets the backoff to
/// its floor; `Err` means the connect itself failed, which doubles it. Both
/// wait before reconnecting. Cancellation interrupts both the session and the
/// wait immediately.
pub async fn reconnect_loop<F, Fut, E>(
    channel: &str,
    policy: &ReconnectPolicy,
    cancel: &CancellationToken,
    mut session: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<(), E>>,
    E: Display,
{
    let mut backoff = Backoff::new(policy.clone());

    while !cancel.is_cancelled() {
        let outcome = tokio::select! {
            () = cancel.cancelled() => break,
            outcome = session() => outcome,
        };

        if cancel.is_cancelled() {
            break;
        }

        let delay = match outcome {
            Ok(()) => {
                backoff.reset();
                let delay = backoff.next_delay();
                tracing::warn!(channel, delay_secs = delay.as_secs(), "connection lost, reconnecting");
                delay
            }
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    channel,
                    error = %e,
                    delay_secs = delay.as_secs(),
                    "reconnect failed"
                );
                delay
            }
        };

        if !sleep_or_cancel(delay, cancel).await {
            break;
        }
    }

    tracing::info!(channel, "reconnect loop stopped");
}
