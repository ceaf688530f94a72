//! Error types for resilience operations

use crate::circuit::CircuitState;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when a call goes through a circuit breaker
#[derive(Debug, Error)]
pub enum CircuitError<E = Box<dyn std::error::Error + Send + Sync>> {
    /// Circuit is open, calls are being rejected without reaching the operation
    #[error("circuit '{circuit}' is {state} (opened at {opened_at:.3}s)")]
    Open {
        circuit: String,
        state: CircuitState,
        opened_at: f64,
        /// Time left until the circuit lets a probe through
        retry_after: Option<Duration>,
    },
    /// Every half-open probe slot is taken
    #[error("circuit '{circuit}' half-open probe limit reached")]
    HalfOpenLimitReached { circuit: String },
    /// The wrapped operation failed
    #[error("circuit execution failed: {0}")]
    Execution(#[source] E),
}

impl<E> CircuitError<E> {
    /// `false` when the breaker rejected the call before the operation ran.
    pub fn was_attempted(&self) -> bool {
        matches!(self, CircuitError::Execution(_))
    }

    pub fn is_rejection(&self) -> bool {
        !self.was_attempted()
    }

    pub fn into_execution(self) -> Option<E> {
        match self {
            CircuitError::Execution(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors returned by the weighted rate limiter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    /// Not enough capacity left in the current window
    #[error("rate limiter '{limiter}' rejected weight {weight}")]
    Rejected {
        limiter: String,
        weight: u32,
        retry_after: Option<Duration>,
    },
    /// Blocking acquisition gave up waiting
    #[error("rate limiter '{limiter}' timed out after {waited:?}")]
    Timeout { limiter: String, waited: Duration },
    /// The request can never fit in a single window
    #[error("rate limiter '{limiter}': weight {weight} exceeds window capacity {capacity}")]
    WeightExceedsCapacity {
        limiter: String,
        weight: u32,
        capacity: u32,
    },
}

impl RateLimitError {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateLimitError::Rejected { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Final outcome of a retried operation that never succeeded
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a transient error
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },
    /// The operation failed with an error that must not be retried
    #[error("terminal failure on attempt {attempt}: {error}")]
    Terminal {
        attempt: u32,
        #[source]
        error: E,
    },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Terminal { attempt, .. } => *attempt,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    pub fn inner(&self) -> &E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Terminal { error, .. } => error,
        }
    }

    /// The error from the last attempt.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Terminal { error, .. } => error,
        }
    }
}

/// Errors raised by a managed stream connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("no frame received for {0:?}")]
    IdleTimeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error("reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

/// Configuration loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// Every violated constraint, not just the first one
    #[error("invalid config: {}", .0.join("; "))]
    Validation(Vec<String>),
}
