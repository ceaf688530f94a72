//! Composed call path: retry around breaker around limiter around the operation
//!
//! ```text
//! retry( breaker.execute( limiter.acquire(weight) -> operation ) )
//! ```
//!
//! The limiter is consulted inside the breaker, so a refused local budget is recorded
//! as a breaker failure the same way a remote 429 would be.

use crate::{
    CircuitBreaker,
    circuit::CircuitState,
    classifier::{Classify, ErrorClass},
    errors::{CircuitError, RateLimitError, RetryError},
    instrumentation::Instrumentation,
    rate_limiter::RateLimiter,
    retry::{RetryConfig, RetryOrchestrator, RetryPolicy, RetryStats},
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// One attempt's failure, flattened across the three layers
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The breaker refused the call
    #[error("circuit '{circuit}' is {state}, call not attempted")]
    Rejected {
        circuit: String,
        state: CircuitState,
        retry_after: Option<Duration>,
    },
    /// The local budget refused the call
    #[error(transparent)]
    RateLimited(RateLimitError),
    /// The operation ran and failed
    #[error("{0}")]
    Failed(E),
}

impl<E> CallError<E> {
    pub fn was_attempted(&self) -> bool {
        matches!(self, CallError::Failed(_))
    }

    pub fn into_failure(self) -> Option<E> {
        match self {
            CallError::Failed(error) => Some(error),
            _ => None,
        }
    }
}

impl<E: Classify> Classify for CallError<E> {
    fn error_class(&self) -> ErrorClass {
        match self {
            // Spinning on an open breaker only adds rejections.
            CallError::Rejected { .. } => ErrorClass::Terminal,
            CallError::RateLimited(error) => error.error_class(),
            CallError::Failed(error) => error.error_class(),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            CallError::Rejected { retry_after, .. } => *retry_after,
            CallError::RateLimited(error) => error.retry_after(),
            CallError::Failed(error) => error.retry_after(),
        }
    }
}

enum Attempt<E> {
    Limited(RateLimitError),
    Failed(E),
}

impl<E: fmt::Display> fmt::Display for Attempt<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attempt::Limited(error) => error.fmt(f),
            Attempt::Failed(error) => error.fmt(f),
        }
    }
}

/// Breaker, optional limiter and retry policy for one (exchange, operation class).
pub struct ResiliencePipeline {
    breaker: CircuitBreaker,
    limiter: Option<Arc<RateLimiter>>,
    retry: RetryConfig,
    orchestrator: RetryOrchestrator,
    acquire_timeout: Option<Duration>,
}

impl ResiliencePipeline {
    pub fn new(breaker: CircuitBreaker) -> Self {
        let orchestrator = RetryOrchestrator::new(breaker.name());
        Self {
            breaker,
            limiter: None,
            retry: RetryConfig::default(),
            orchestrator,
            acquire_timeout: None,
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Wait up to `timeout` for limiter capacity instead of failing immediately.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    pub fn with_instrumentation(mut self, instrumentation: Arc<Instrumentation>) -> Self {
        self.orchestrator = self.orchestrator.with_instrumentation(instrumentation);
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref()
    }

    pub fn retry_stats(&self) -> RetryStats {
        self.orchestrator.stats()
    }

    /// Run `op` through every layer. `operation` selects the limiter weight.
    ///
    /// Each retry attempt passes the breaker and limiter again. The returned
    /// [`RetryError`] tells an exhausted retry budget apart from a terminal failure,
    /// and its [`CallError`] tells a policy refusal apart from a real failure.
    pub async fn call<F, Fut, T, E>(
        &self,
        operation: &str,
        op: F,
    ) -> Result<T, RetryError<CallError<E>>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display + 'static,
    {
        let policy = RetryPolicy::<CallError<E>>::from_classify(&self.retry);
        let weight = self
            .limiter
            .as_ref()
            .map_or(1, |limiter| limiter.weight_of(operation));
        let op = &op;

        self.orchestrator
            .with_retry(move || self.attempt(weight, op), &policy)
            .await
    }

    async fn attempt<F, Fut, T, E>(&self, weight: u32, op: &F) -> Result<T, CallError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display + 'static,
    {
        let result = self
            .breaker
            .execute(|| async move {
                if let Some(limiter) = &self.limiter {
                    let admitted = match self.acquire_timeout {
                        Some(timeout) => limiter.acquire_timeout(weight, timeout).await,
                        None => limiter.try_acquire(weight),
                    };
                    if let Err(error) = admitted {
                        return Err(Attempt::Limited(error));
                    }
                }
                op().await.map_err(Attempt::Failed)
            })
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(CircuitError::Open {
                circuit,
                state,
                retry_after,
                ..
            }) => Err(CallError::Rejected {
                circuit,
                state,
                retry_after,
            }),
            Err(CircuitError::HalfOpenLimitReached { circuit }) => Err(CallError::Rejected {
                circuit,
                state: CircuitState::HalfOpen,
                retry_after: None,
            }),
            Err(CircuitError::Execution(Attempt::Limited(error))) => {
                Err(CallError::RateLimited(error))
            }
            Err(CircuitError::Execution(Attempt::Failed(error))) => Err(CallError::Failed(error)),
        }
    }
}

impl fmt::Debug for ResiliencePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResiliencePipeline")
            .field("breaker", &self.breaker)
            .field("limiter", &self.limiter.as_ref().map(|l| l.name().to_owned()))
            .field("retry", &self.retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::Config;
    use crate::rate_limiter::{RateLimiterConfig, WeightTable};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    enum VenueError {
        Unavailable,
        BadSignature,
    }

    impl fmt::Display for VenueError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                VenueError::Unavailable => f.write_str("503 service unavailable"),
                VenueError::BadSignature => f.write_str("invalid signature"),
            }
        }
    }

    impl Classify for VenueError {
        fn error_class(&self) -> ErrorClass {
            match self {
                VenueError::Unavailable => ErrorClass::Transient,
                VenueError::BadSignature => ErrorClass::Terminal,
            }
        }
    }

    fn retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 100,
            ..RetryConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers_through_every_layer() {
        let limiter = Arc::new(RateLimiter::new(
            "binance-rest",
            RateLimiterConfig::new(100, 60_000).with_weights(WeightTable::new().with("place_order", 10)),
        ));
        let pipeline = ResiliencePipeline::new(CircuitBreaker::new("binance:orders", Config::default()))
            .with_limiter(Arc::clone(&limiter))
            .with_retry(retry(3));
        let calls = &AtomicU32::new(0);

        let result = pipeline
            .call("place_order", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(VenueError::Unavailable)
                } else {
                    Ok("order-42")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "order-42");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(limiter.used(), 20);
        assert_eq!(pipeline.breaker().metrics().failed_calls, 1);
        assert_eq!(pipeline.retry_stats().recovered, 1);
    }

    #[tokio::test]
    async fn test_terminal_failure_is_not_retried() {
        let pipeline = ResiliencePipeline::new(CircuitBreaker::new("okx:orders", Config::default()))
            .with_retry(retry(5));
        let calls = &AtomicU32::new(0);

        let error = pipeline
            .call("cancel_order", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(VenueError::BadSignature)
            })
            .await
            .unwrap_err();

        assert!(matches!(error, RetryError::Terminal { attempt: 1, .. }));
        assert!(error.inner().was_attempted());
        assert_eq!(error.into_inner().into_failure(), Some(VenueError::BadSignature));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_is_not_attempted() {
        let breaker = CircuitBreaker::builder("kraken:orders")
            .failure_threshold(1)
            .minimum_request_volume(1)
            .build();
        breaker.record_failure("timeout", 0.5);
        let pipeline = ResiliencePipeline::new(breaker).with_retry(retry(3));
        let calls = &AtomicU32::new(0);

        let error = pipeline
            .call("place_order", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, VenueError>(())
            })
            .await
            .unwrap_err();

        let RetryError::Terminal { error, .. } = error else {
            panic!("expected a terminal rejection");
        };
        assert!(!error.was_attempted());
        assert!(matches!(error, CallError::Rejected { state: CircuitState::Open, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_attempts_wait_for_the_window() {
        let limiter = Arc::new(RateLimiter::new("bybit-rest", RateLimiterConfig::new(1, 1_000)));
        let pipeline = ResiliencePipeline::new(CircuitBreaker::new("bybit:orders", Config::default()))
            .with_limiter(Arc::clone(&limiter))
            .with_retry(retry(3));
        limiter.try_acquire(1).unwrap();
        let calls = &AtomicU32::new(0);

        let result = pipeline
            .call("place_order", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, VenueError>("filled")
            })
            .await;

        assert_eq!(result.unwrap(), "filled");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.retry_stats().retries, 1);
    }
}
