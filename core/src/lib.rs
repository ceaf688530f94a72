//! Exchange Resilience - fault tolerance for exchange adapters
//!
//! Every call an adapter makes to a venue goes through this layer:
//! - Circuit breaker state machine (Closed → Open → HalfOpen) over a sliding outcome window
//! - Weighted sliding-window rate limiter with rejecting and blocking acquisition
//! - Retry orchestration with capped exponential backoff and error classification
//! - Streaming connection manager that reconnects, replays subscriptions and feeds
//!   bounded drop-oldest queues
//!
//! All clocks are `tokio::time::Instant`, so tests can drive time with tokio's paused clock.
//!
//! # Example
//!
//! ```rust
//! use exchange_resilience::{
//!     CircuitBreaker, RateLimiter, RateLimiterConfig, ResiliencePipeline, RetryConfig, WeightTable,
//! };
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let breaker = CircuitBreaker::builder("binance:orders")
//!     .failure_threshold(5)
//!     .reset_timeout_ms(30_000)
//!     .on_open(|name| println!("Circuit {name} opened!"))
//!     .build();
//! let limiter = RateLimiter::new(
//!     "binance:rest",
//!     RateLimiterConfig::new(1200, 60_000).with_weights(WeightTable::new().with("order_book", 10)),
//! );
//!
//! let pipeline = ResiliencePipeline::new(breaker)
//!     .with_limiter(Arc::new(limiter))
//!     .with_retry(RetryConfig::default());
//!
//! let order_id = pipeline
//!     .call("place_order", || async { Ok::<_, std::io::Error>("42") })
//!     .await
//!     .unwrap();
//! assert_eq!(order_id, "42");
//! # }
//! ```

pub mod backoff;
pub mod builder;
pub mod callbacks;
pub mod circuit;
pub mod classifier;
pub mod config;
pub mod connection;
pub mod errors;
pub mod instrumentation;
pub mod pipeline;
pub mod probe;
pub mod queue;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod storage;

pub use backoff::Backoff;
pub use builder::CircuitBuilder;
pub use callbacks::{ListenerId, Listeners};
pub use circuit::{
    BreakerEvent, CircuitBreaker, CircuitBreakerMetrics, CircuitState, Config, FallbackContext,
    Transition,
};
pub use classifier::{
    Classify, DefaultClassifier, ErrorClass, FailureClassifier, FailureContext,
    PredicateClassifier,
};
pub use config::ResilienceConfig;
pub use connection::{
    ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState, Connector, Frame,
    JsonCodec, StreamCodec, StreamSession, Subscription, SubscriptionId, WsConnector,
};
pub use errors::{CircuitError, ConfigError, ConnectionError, RateLimitError, RetryError};
pub use instrumentation::Instrumentation;
pub use pipeline::{CallError, ResiliencePipeline};
pub use probe::{ProbeGate, ProbePermit};
pub use queue::{BoundedQueue, Push};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, WeightTable};
pub use registry::{BreakerKey, BreakerRegistry, LimiterRegistry};
pub use retry::{RetryConfig, RetryOrchestrator, RetryPolicy, RetryStats, with_retry};
pub use storage::{MemoryStorage, StorageBackend};

/// Outcome kind recorded by a breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Success,
    Failure,
}

/// A single outcome in a breaker's sliding window
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    /// Seconds since the storage backend started
    pub timestamp: f64,
    pub duration: f64,
}
