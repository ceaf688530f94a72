//! Weighted sliding-window rate limiter
//!
//! Every grant is logged with its weight. A request is admitted while the weights
//! granted inside the trailing window plus its own weight stay within `max_requests`.
//! Exchanges publish limits this way ("1200 weight per minute"), so a burst can use
//! the whole budget but never more.

use crate::{errors::RateLimitError, instrumentation::Instrumentation};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Operation name to request weight. Unknown operations weigh 1.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightTable(HashMap<String, u32>);

impl WeightTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, operation: impl Into<String>, weight: u32) -> Self {
        self.insert(operation, weight);
        self
    }

    pub fn insert(&mut self, operation: impl Into<String>, weight: u32) {
        self.0.insert(operation.into(), weight);
    }

    pub fn weight_of(&self, operation: &str) -> u32 {
        self.0.get(operation).copied().unwrap_or(1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.0.iter().map(|(operation, weight)| (operation.as_str(), *weight))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, u32)> for WeightTable {
    fn from_iter<I: IntoIterator<Item = (K, u32)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, w)| (k.into(), w)).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Weight budget per window
    pub max_requests: u32,
    pub window_ms: u64,
    pub weights: WeightTable,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window_ms: 60_000,
            weights: WeightTable::default(),
        }
    }
}

impl RateLimiterConfig {
    pub fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
            weights: WeightTable::default(),
        }
    }

    pub fn with_weights(mut self, weights: WeightTable) -> Self {
        self.weights = weights;
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, Copy)]
struct Grant {
    at: Instant,
    weight: u32,
}

#[derive(Debug, Default)]
struct Log {
    grants: VecDeque<Grant>,
    used: u32,
}

impl Log {
    fn expire(&mut self, now: Instant, window: Duration) {
        // A grant from the future (clock stepped back) stays until it ages out.
        while let Some(front) = self.grants.front() {
            if now.saturating_duration_since(front.at) < window {
                break;
            }
            self.used = self.used.saturating_sub(front.weight);
            self.grants.pop_front();
        }
    }

    /// Wait until enough old grants expire to fit `weight`.
    fn wait_for(&self, weight: u32, max: u32, now: Instant, window: Duration) -> Duration {
        let excess = self.used.saturating_add(weight).saturating_sub(max);
        let mut freed = 0u32;
        for grant in &self.grants {
            freed = freed.saturating_add(grant.weight);
            if freed >= excess {
                return (grant.at + window).saturating_duration_since(now);
            }
        }
        window
    }
}

/// Sliding-window limiter for one endpoint class
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    log: Mutex<Log>,
    // Blocking acquirers queue here, tokio's mutex hands out turns in FIFO order.
    turn: tokio::sync::Mutex<()>,
    instrumentation: Option<Arc<Instrumentation>>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        Self {
            name: name.into(),
            config,
            log: Mutex::new(Log::default()),
            turn: tokio::sync::Mutex::new(()),
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

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    pub fn weight_of(&self, operation: &str) -> u32 {
        self.config.weights.weight_of(operation)
    }

    /// Admit `weight` now or fail with [`RateLimitError::Rejected`] and a retry hint.
    pub fn try_acquire(&self, weight: u32) -> Result<(), RateLimitError> {
        self.check_weight(weight)?;
        match self.take(weight) {
            Ok(()) => Ok(()),
            Err(wait) => {
                debug!(limiter = %self.name, weight, retry_after_ms = wait.as_millis() as u64, "request rejected");
                Err(RateLimitError::Rejected {
                    limiter: self.name.clone(),
                    weight,
                    retry_after: Some(wait),
                })
            }
        }
    }

    pub fn try_acquire_operation(&self, operation: &str) -> Result<(), RateLimitError> {
        self.try_acquire(self.weight_of(operation))
    }

    /// Wait until `weight` fits in the window.
    ///
    /// Blocking callers are served in arrival order; only a weight larger than the whole
    /// window fails.
    pub async fn acquire(&self, weight: u32) -> Result<(), RateLimitError> {
        self.check_weight(weight)?;
        let _turn = self.turn.lock().await;
        loop {
            match self.take(weight) {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    debug!(limiter = %self.name, weight, wait_ms = wait.as_millis() as u64, "waiting for window capacity");
                    tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    /// [`acquire`](Self::acquire) that gives up with [`RateLimitError::Timeout`].
    pub async fn acquire_timeout(&self, weight: u32, timeout: Duration) -> Result<(), RateLimitError> {
        match tokio::time::timeout(timeout, self.acquire(weight)).await {
            Ok(result) => result,
            Err(_) => {
                if let Some(instrumentation) = &self.instrumentation {
                    instrumentation.limiter_timeout(&self.name);
                }
                Err(RateLimitError::Timeout {
                    limiter: self.name.clone(),
                    waited: timeout,
                })
            }
        }
    }

    pub async fn acquire_operation(&self, operation: &str) -> Result<(), RateLimitError> {
        self.acquire(self.weight_of(operation)).await
    }

    /// Weight still available in the current window, never negative.
    pub fn remaining(&self) -> u32 {
        let mut log = self.lock();
        log.expire(Instant::now(), self.config.window());
        self.config.max_requests.saturating_sub(log.used)
    }

    /// Weight granted inside the current window
    pub fn used(&self) -> u32 {
        let mut log = self.lock();
        log.expire(Instant::now(), self.config.window());
        log.used
    }

    fn lock(&self) -> MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_weight(&self, weight: u32) -> Result<(), RateLimitError> {
        if weight > self.config.max_requests {
            return Err(RateLimitError::WeightExceedsCapacity {
                limiter: self.name.clone(),
                weight,
                capacity: self.config.max_requests,
            });
        }
        Ok(())
    }

    /// Grant `weight` or report how long until it would fit.
    fn take(&self, weight: u32) -> Result<(), Duration> {
        let now = Instant::now();
        let window = self.config.window();
        let decision = {
            let mut log = self.lock();
            log.expire(now, window);
            if log.used.saturating_add(weight) <= self.config.max_requests {
                log.grants.push_back(Grant { at: now, weight });
                log.used += weight;
                Ok(())
            } else {
                Err(log.wait_for(weight, self.config.max_requests, now, window))
            }
        };

        if let Some(instrumentation) = &self.instrumentation {
            instrumentation.limiter_decision(&self.name, decision.is_ok(), weight);
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn per_minute(max: u32) -> RateLimiter {
        RateLimiter::new("binance:rest", RateLimiterConfig::new(max, 60_000))
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_rejects_then_recovers() {
        let limiter = per_minute(60);
        for _ in 0..60 {
            limiter.try_acquire(1).unwrap();
        }

        match limiter.try_acquire(1) {
            Err(RateLimitError::Rejected { retry_after, .. }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(60)));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(limiter.remaining(), 0);

        tokio::time::advance(Duration::from_millis(60_000)).await;
        assert!(limiter.try_acquire(1).is_ok());
        assert_eq!(limiter.remaining(), 59);
    }

    #[tokio::test(start_paused = true)]
    async fn test_weights_from_table() {
        let weights = WeightTable::new().with("fetch_order_book", 5).with("create_order", 2);
        let limiter = RateLimiter::new(
            "kraken:rest",
            RateLimiterConfig::new(10, 1_000).with_weights(weights),
        );

        limiter.try_acquire_operation("fetch_order_book").unwrap();
        limiter.try_acquire_operation("create_order").unwrap();
        limiter.try_acquire_operation("fetch_ticker").unwrap();
        assert_eq!(limiter.used(), 8);

        assert!(limiter.try_acquire_operation("fetch_order_book").is_err());
        limiter.try_acquire_operation("create_order").unwrap();
        assert_eq!(limiter.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_covers_enough_expired_weight() {
        let limiter = RateLimiter::new("okx:rest", RateLimiterConfig::new(10, 10_000));
        limiter.try_acquire(4).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        limiter.try_acquire(4).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        limiter.try_acquire(2).unwrap();

        // 6 more needs both of the first two grants gone: the second expires at t=12s.
        let err = limiter.try_acquire(6).unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(8)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_acquire_waits_for_capacity() {
        let limiter = per_minute(2);
        limiter.acquire(2).await.unwrap();

        let start = Instant::now();
        limiter.acquire(1).await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(60) && waited < Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_not_rejection() {
        let limiter = per_minute(1);
        limiter.try_acquire(1).unwrap();

        let err = limiter
            .acquire_timeout(1, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::Timeout { waited, .. } if waited == Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_oversized_weight_fails_fast() {
        let limiter = per_minute(10);
        let err = limiter.acquire(11).await.unwrap_err();
        assert!(matches!(
            err,
            RateLimitError::WeightExceedsCapacity { weight: 11, capacity: 10, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admitted_weight_never_exceeds_budget() {
        let limiter = Arc::new(per_minute(5));
        let mut tasks = Vec::new();
        for _ in 0..12 {
            let limiter = Arc::clone(&limiter);
            tasks.push(tokio::spawn(async move {
                limiter.acquire(1).await.unwrap();
                Instant::now()
            }));
        }

        let mut grants = Vec::new();
        for task in tasks {
            grants.push(task.await.unwrap());
        }
        grants.sort();
        for (i, at) in grants.iter().enumerate() {
            let in_window = grants[i..]
                .iter()
                .take_while(|later| later.duration_since(*at) < Duration::from_secs(60))
                .count();
            assert!(in_window <= 5, "{in_window} grants inside one window");
        }
    }
}
