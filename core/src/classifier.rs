//! Error classification
//!
//! Two independent questions get asked about a failed call:
//! - does it count against the circuit breaker? ([`FailureClassifier`])
//! - is it worth retrying? ([`Classify`] / [`ErrorClass`])

use crate::errors::{CircuitError, ConnectionError, RateLimitError};
use std::any::Any;
use std::time::Duration;

/// What the breaker knows about a failed call
#[derive(Debug)]
pub struct FailureContext<'a> {
    pub circuit_name: &'a str,
    /// The operation's error, downcast it to inspect
    pub error: &'a dyn Any,
    /// Seconds spent in the failed call
    pub duration: f64,
}

/// Decides whether a failure is recorded by the breaker.
///
/// Returning `false` makes the call invisible to the failure window: useful for
/// client-side errors (bad parameters, insufficient balance) that say nothing about
/// the health of the exchange.
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool;
}

/// Counts every failure
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn should_trip(&self, _ctx: &FailureContext<'_>) -> bool {
        true
    }
}

/// Closure-backed classifier
pub struct PredicateClassifier<F> {
    predicate: F,
}

impl<F> PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> FailureClassifier for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl<F> std::fmt::Debug for PredicateClassifier<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateClassifier").finish_non_exhaustive()
    }
}

/// Retry classification of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Network blips, timeouts, 5xx, rate limiting: try again
    Transient,
    /// Validation, auth, business-rule failures: retrying cannot help
    Terminal,
}

impl ErrorClass {
    pub fn is_transient(self) -> bool {
        self == ErrorClass::Transient
    }
}

/// Errors that know their own retry class.
///
/// [`crate::retry::RetryPolicy::from_classify`] builds a policy straight from this trait.
pub trait Classify {
    fn error_class(&self) -> ErrorClass;

    /// Server-provided wait hint (e.g. `Retry-After`). The retry loop never waits less.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Classify for RateLimitError {
    fn error_class(&self) -> ErrorClass {
        match self {
            RateLimitError::Rejected { .. } | RateLimitError::Timeout { .. } => ErrorClass::Transient,
            RateLimitError::WeightExceedsCapacity { .. } => ErrorClass::Terminal,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        RateLimitError::retry_after(self)
    }
}

impl Classify for ConnectionError {
    fn error_class(&self) -> ErrorClass {
        match self {
            ConnectionError::ReconnectExhausted { .. } | ConnectionError::Codec(_) => {
                ErrorClass::Terminal
            }
            _ => ErrorClass::Transient,
        }
    }
}

impl<E: Classify> Classify for CircuitError<E> {
    fn error_class(&self) -> ErrorClass {
        match self {
            // Retrying inside the reset timeout only collects more rejections.
            CircuitError::Open { .. } => ErrorClass::Terminal,
            CircuitError::HalfOpenLimitReached { .. } => ErrorClass::Transient,
            CircuitError::Execution(e) => e.error_class(),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            CircuitError::Open { retry_after, .. } => *retry_after,
            CircuitError::HalfOpenLimitReached { .. } => None,
            CircuitError::Execution(e) => e.retry_after(),
        }
    }
}

impl Classify for std::io::Error {
    fn error_class(&self) -> ErrorClass {
        use std::io::ErrorKind;
        match self.kind() {
            ErrorKind::InvalidInput
            | ErrorKind::InvalidData
            | ErrorKind::PermissionDenied
            | ErrorKind::NotFound
            | ErrorKind::Unsupported => ErrorClass::Terminal,
            _ => ErrorClass::Transient,
        }
    }
}

impl Classify for serde_json::Error {
    fn error_class(&self) -> ErrorClass {
        if self.is_io() {
            ErrorClass::Transient
        } else {
            ErrorClass::Terminal
        }
    }
}
