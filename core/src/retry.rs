//! Retry orchestration
//!
//! The orchestrator re-runs a failed operation according to a [`RetryPolicy`]. It is
//! the only component that looks at an error's retry class: terminal errors surface
//! immediately, transient ones are retried until the attempt budget is spent.

use crate::{
    backoff::Backoff,
    classifier::{Classify, ErrorClass},
    errors::RetryError,
    instrumentation::Instrumentation,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// 0.0 disables jitter
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::exponential(self.base_delay_ms, self.max_delay_ms)
            .with_multiplier(self.multiplier)
            .with_jitter(self.jitter_factor)
    }
}

type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;
type ClassifyFn<E> = Arc<dyn Fn(&E) -> ErrorClass + Send + Sync>;
type RetryAfterFn<E> = Arc<dyn Fn(&E) -> Option<Duration> + Send + Sync>;

/// How many times to try, how long to wait and which errors are worth another go
pub struct RetryPolicy<E> {
    max_attempts: u32,
    backoff: BackoffFn,
    classifier: ClassifyFn<E>,
    retry_after: Option<RetryAfterFn<E>>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: Arc::clone(&self.backoff),
            classifier: Arc::clone(&self.classifier),
            retry_after: self.retry_after.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("honours_retry_after", &self.retry_after.is_some())
            .finish_non_exhaustive()
    }
}

impl<E> RetryPolicy<E> {
    /// Policy with an explicit classification predicate.
    pub fn new<C>(config: &RetryConfig, classifier: C) -> Self
    where
        C: Fn(&E) -> ErrorClass + Send + Sync + 'static,
    {
        let backoff = config.backoff();
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Arc::new(move |attempt| backoff.delay(attempt)),
            classifier: Arc::new(classifier),
            retry_after: None,
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Replace the delay schedule; `attempt` is the 1-based number of the failed attempt.
    pub fn with_backoff<F>(mut self, backoff: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Wait at least as long as the hint extracted from the error.
    pub fn with_retry_after<F>(mut self, hint: F) -> Self
    where
        F: Fn(&E) -> Option<Duration> + Send + Sync + 'static,
    {
        self.retry_after = Some(Arc::new(hint));
        self
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn classify(&self, error: &E) -> ErrorClass {
        (self.classifier)(error)
    }

    /// Delay after failed attempt `attempt`.
    pub fn delay_for(&self, attempt: u32, error: &E) -> Duration {
        let scheduled = (self.backoff)(attempt);
        let hinted = self
            .retry_after
            .as_ref()
            .and_then(|hint| hint(error))
            .unwrap_or_default();
        scheduled.max(hinted)
    }
}

impl<E: Classify + 'static> RetryPolicy<E> {
    /// Policy that trusts the error's own [`Classify`] impl, retry hints included.
    pub fn from_classify(config: &RetryConfig) -> Self {
        Self::new(config, E::error_class).with_retry_after(E::retry_after)
    }
}

#[derive(Debug, Default)]
struct Counters {
    calls: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    recovered: AtomicU64,
    exhausted: AtomicU64,
    terminal: AtomicU64,
}

/// Counters for everything an orchestrator has run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    pub calls: u64,
    pub attempts: u64,
    pub retries: u64,
    /// Calls that succeeded after at least one retry
    pub recovered: u64,
    pub exhausted: u64,
    pub terminal: u64,
}

/// Runs operations under a retry policy and keeps statistics
#[derive(Debug)]
pub struct RetryOrchestrator {
    name: String,
    counters: Counters,
    instrumentation: Option<Arc<Instrumentation>>,
}

impl RetryOrchestrator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            counters: Counters::default(),
            instrumentation: None,
        }
    }

    pub fn with_instrumentation(mut self, instrumentation: Arc<Instrumentation>) -> Self {
        self.instrumentation = Some(instrumentation);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `operation` until it succeeds, fails terminally or runs out of attempts.
    ///
    /// At most `policy.attempts()` attempts are made. The error in the returned
    /// [`RetryError`] is the last attempt's error, unchanged.
    pub async fn with_retry<F, Fut, T, E>(
        &self,
        mut operation: F,
        policy: &RetryPolicy<E>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.counters.calls.fetch_add(1, Ordering::Relaxed);
        let max_attempts = policy.attempts();
        let mut attempt = 1;

        loop {
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);
            let delay = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        self.counters.recovered.fetch_add(1, Ordering::Relaxed);
                        info!(op = %self.name, attempt, "operation recovered after retry");
                    }
                    self.record("success", attempt);
                    return Ok(value);
                }
                Err(error) if policy.classify(&error) == ErrorClass::Terminal => {
                    self.counters.terminal.fetch_add(1, Ordering::Relaxed);
                    debug!(op = %self.name, attempt, %error, "terminal error, not retrying");
                    self.record("terminal", attempt);
                    return Err(RetryError::Terminal { attempt, error });
                }
                Err(error) if attempt >= max_attempts => {
                    self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                    warn!(op = %self.name, attempts = attempt, %error, "retries exhausted");
                    self.record("exhausted", attempt);
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: error,
                    });
                }
                Err(error) => {
                    let delay = policy.delay_for(attempt, &error);
                    debug!(
                        op = %self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "retrying after transient error"
                    );
                    delay
                }
            };

            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    pub fn stats(&self) -> RetryStats {
        let c = &self.counters;
        RetryStats {
            calls: c.calls.load(Ordering::Relaxed),
            attempts: c.attempts.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            recovered: c.recovered.load(Ordering::Relaxed),
            exhausted: c.exhausted.load(Ordering::Relaxed),
            terminal: c.terminal.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &'static str, attempts: u32) {
        if let Some(instrumentation) = &self.instrumentation {
            instrumentation.retry_outcome(&self.name, outcome, attempts);
        }
    }
}

/// One-off retry without a long-lived orchestrator.
pub async fn with_retry<F, Fut, T, E>(operation: F, policy: &RetryPolicy<E>) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    RetryOrchestrator::new("retry")
        .with_retry(operation, policy)
        .await
}
