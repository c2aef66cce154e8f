//! Ordered model failover
//!
//! The agent call path tries the primary model first, then each fallback in
//! order. Transient errors are retried per model with exponential backoff; a
//! permanent error moves straight to the next model.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::retry::{Classify, sleep_or_cancel};

/// A provider/model pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl ModelRef {
    #[must_use]
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}

/// Parse `"provider:model, provider:model"` into model refs
///
/// Entries split on the first `:`, so model names may contain further colons
/// (`ollama:llama3:8b`). Entries without a separator are logged and skipped.
#[must_use]
pub fn parse_failover_chain(spec: &str) -> Vec<ModelRef> {
    spec.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.split_once(':') {
            Some((provider, model)) if !provider.trim().is_empty() && !model.trim().is_empty() => {
                Some(ModelRef::new(provider.trim(), model.trim()))
            }
            _ => {
                tracing::warn!(entry, "invalid failover entry, expected provider:model");
                None
            }
        })
        .collect()
}

/// Failover settings for one call path
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// When false only the primary is tried
    pub enabled: bool,
    /// Fallback models, in order
    pub chain: Vec<ModelRef>,
    /// Attempts per model before moving on
    pub max_retries_per_model: u32,
    /// Backoff base between attempts on the same model
    pub base_backoff: Duration,
    /// Backoff cap
    pub max_backoff: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chain: Vec::new(),
            max_retries_per_model: 1,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl FailoverConfig {
    /// Build from a chain spec string
    #[must_use]
    pub fn from_spec(spec: &str) -> Self {
        Self {
            chain: parse_failover_chain(spec),
            ..Self::default()
        }
    }

    /// Delay after a failed attempt (0-based) on the same model
    ///
    /// `min(base_backoff * 2^attempt, max_backoff)`
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff)
    }

    /// `[primary] + chain`, with consecutive repeats collapsed
    #[must_use]
    pub fn models_to_try(&self, primary: &ModelRef) -> Vec<ModelRef> {
        let mut models = vec![primary.clone()];
        if self.enabled {
            models.extend(self.chain.iter().cloned());
        }
        models.dedup();
        models
    }
}

/// Why every model in the chain failed
#[derive(Debug, Error)]
pub enum FailoverError<E> {
    /// All models failed; carries the last error seen
    #[error("all {models} models failed, last error: {last}")]
    Exhausted {
        /// Number of models tried
        models: usize,
        /// Final error
        last: E,
    },

    /// Shutdown was requested mid-chain
    #[error("cancelled")]
    Cancelled,
}

impl<E> FailoverError<E> {
    /// The last underlying error, if any
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            Self::Cancelled => None,
        }
    }
}

/// Per-model counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModelStats {
    pub success: u64,
    pub failure: u64,
    pub failover_to: u64,
}

/// Success / failure / failover counters keyed by `provider:model`
#[derive(Debug, Default)]
pub struct FailoverStats {
    inner: Mutex<HashMap<String, ModelStats>>,
}

impl FailoverStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, model: &ModelRef, f: impl FnOnce(&mut ModelStats)) {
        let mut stats = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(stats.entry(model.to_string()).or_default());
    }

    pub fn record_success(&self, model: &ModelRef) {
        self.update(model, |s| s.success += 1);
    }

    pub fn record_failure(&self, model: &ModelRef) {
        self.update(model, |s| s.failure += 1);
    }

    pub fn record_failover(&self, model: &ModelRef) {
        self.update(model, |s| s.failover_to += 1);
    }

    /// Snapshot of all counters
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, ModelStats> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Call `call` against each model in turn until one succeeds
///
/// # Errors
///
/// Returns `FailoverError::Exhausted` with the last error when every model
/// fails, or `FailoverError::Cancelled` if `cancel` fires.
pub async fn call_with_failover<T, E, F, Fut>(
    primary: &ModelRef,
    config: &FailoverConfig,
    cancel: &CancellationToken,
    stats: Option<&FailoverStats>,
    mut call: F,
) -> std::result::Result<T, FailoverError<E>>
where
    E: Classify + Display,
    F: FnMut(ModelRef) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let models = config.models_to_try(primary);
    let attempts_per_model = config.max_retries_per_model.max(1);
    let mut last_error = None;

    for (idx, model) in models.iter().enumerate() {
        for attempt in 0..attempts_per_model {
            if cancel.is_cancelled() {
                return Err(FailoverError::Cancelled);
            }

            let err = match call(model.clone()).await {
                Ok(value) => {
                    if idx > 0 {
                        tracing::info!(model = %model, attempt = attempt + 1, "failover succeeded");
                    }
                    if let Some(stats) = stats {
                        stats.record_success(model);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if let Some(stats) = stats {
                stats.record_failure(model);
            }

            if !err.class().is_transient() {
                tracing::error!(model = %model, error = %err, "non-retriable error");
                last_error = Some(err);
                break;
            }

            tracing::warn!(
                model = %model,
                attempt = attempt + 1,
                max_attempts = attempts_per_model,
                error = %err,
                "retriable error"
            );
            last_error = Some(err);

            if attempt + 1 < attempts_per_model {
                let delay = config.backoff_for_attempt(attempt);
                if !sleep_or_cancel(delay, cancel).await {
                    return Err(FailoverError::Cancelled);
                }
            }
        }

        if let Some(next) = models.get(idx + 1) {
            tracing::info!(from = %model, to = %next, "failing over");
            if let Some(stats) = stats {
                stats.record_failover(next);
            }
        }
    }

    match last_error {
        Some(last) => {
            tracing::error!(models = models.len(), error = %last, "all models failed");
            Err(FailoverError::Exhausted {
                models: models.len(),
                last,
            })
        }
        None => Err(FailoverError::Cancelled),
    }
}
