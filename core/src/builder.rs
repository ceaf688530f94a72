//! Fluent configuration for circuit breakers

use crate::{
    MemoryStorage, StorageBackend,
    callbacks::Listeners,
    circuit::{BreakerEvent, CircuitBreaker, CircuitContext, Config},
    classifier::FailureClassifier,
    instrumentation::Instrumentation,
};
use std::sync::Arc;

/// Builder for [`CircuitBreaker`]
pub struct CircuitBuilder {
    name: String,
    config: Config,
    storage: Option<Arc<dyn StorageBackend>>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    instrumentation: Option<Arc<Instrumentation>>,
    listeners: Listeners<BreakerEvent>,
}

impl CircuitBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Config::default(),
            storage: None,
            failure_classifier: None,
            instrumentation: None,
            listeners: Listeners::new(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn failure_threshold(mut self, threshold: usize) -> Self {
        self.config.failure_threshold = Some(threshold);
        self
    }

    /// Only the error-rate check can open the circuit.
    pub fn disable_failure_threshold(mut self) -> Self {
        self.config.failure_threshold = None;
        self
    }

    /// Error rate in percent, clamped to 0-100.
    pub fn error_threshold_percentage(mut self, percentage: f64) -> Self {
        self.config.error_threshold_percentage = Some(percentage.clamp(0.0, 100.0));
        self
    }

    /// Only the absolute failure count can open the circuit.
    pub fn disable_error_threshold(mut self) -> Self {
        self.config.error_threshold_percentage = None;
        self
    }

    pub fn minimum_request_volume(mut self, volume: usize) -> Self {
        self.config.minimum_request_volume = volume;
        self
    }

    pub fn time_window_ms(mut self, window_ms: u64) -> Self {
        self.config.time_window_ms = window_ms;
        self
    }

    pub fn reset_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.reset_timeout_ms = timeout_ms;
        self
    }

    pub fn success_threshold(mut self, threshold: usize) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Concurrent half-open trial calls, at least one.
    pub fn half_open_max_probes(mut self, probes: usize) -> Self {
        self.config.half_open_max_probes = probes.max(1);
        self
    }

    /// Jitter for the reset timeout (0.0 = none, 1.0 = full)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Share an outcome store between breakers. Outcomes are keyed by circuit name.
    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Decide which errors count toward opening the circuit.
    ///
    /// ```rust
    /// use exchange_resilience::{CircuitBreaker, PredicateClassifier};
    /// use std::sync::Arc;
    ///
    /// // Slow failures only, quick 4xx-style rejections are ignored.
    /// let breaker = CircuitBreaker::builder("binance:orders")
    ///     .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| ctx.duration > 1.0)))
    ///     .build();
    /// ```
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    pub fn instrumentation(mut self, instrumentation: Arc<Instrumentation>) -> Self {
        self.instrumentation = Some(instrumentation);
        self
    }

    /// Subscribe to every [`BreakerEvent`].
    pub fn on_event<F>(self, listener: F) -> Self
    where
        F: Fn(&BreakerEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener);
        self
    }

    /// Called with the circuit name whenever it opens.
    pub fn on_open<F>(self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_transition(BreakerEvent::Open, callback)
    }

    pub fn on_close<F>(self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_transition(BreakerEvent::Close, callback)
    }

    pub fn on_half_open<F>(self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_transition(BreakerEvent::HalfOpen, callback)
    }

    fn on_transition<F>(self, wanted: BreakerEvent, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let name = self.name.clone();
        self.listeners.subscribe(move |event| {
            if *event == wanted {
                callback(&name);
            }
        });
        self
    }

    pub fn build(self) -> CircuitBreaker {
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let context = CircuitContext::new(self.name, self.config, storage);

        CircuitBreaker::from_parts(
            context,
            self.failure_classifier,
            self.listeners,
            self.instrumentation,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitState;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn test_builder_sets_config() {
        let breaker = CircuitBuilder::new("bitfinex:orders")
            .failure_threshold(7)
            .error_threshold_percentage(140.0)
            .minimum_request_volume(3)
            .time_window_ms(5_000)
            .reset_timeout_ms(2_000)
            .success_threshold(4)
            .half_open_max_probes(0)
            .jitter_factor(0.25)
            .build();

        let config = breaker.config();
        assert_eq!(breaker.name(), "bitfinex:orders");
        assert_eq!(config.failure_threshold, Some(7));
        assert_eq!(config.error_threshold_percentage, Some(100.0));
        assert_eq!(config.minimum_request_volume, 3);
        assert_eq!(config.time_window_ms, 5_000);
        assert_eq!(config.reset_timeout_ms, 2_000);
        assert_eq!(config.success_threshold, 4);
        assert_eq!(config.half_open_max_probes, 1);
        assert_eq!(config.jitter_factor, 0.25);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_named_callbacks_fire_on_transitions() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (opened, half, closed) = (Arc::clone(&log), Arc::clone(&log), Arc::clone(&log));

        let breaker = CircuitBuilder::new("kucoin:orders")
            .failure_threshold(1)
            .minimum_request_volume(1)
            .success_threshold(1)
            .reset_timeout_ms(1_000)
            .on_open(move |name| opened.lock().unwrap().push(format!("open {name}")))
            .on_half_open(move |name| half.lock().unwrap().push(format!("half {name}")))
            .on_close(move |name| closed.lock().unwrap().push(format!("close {name}")))
            .build();

        breaker.record_failure("timeout", 0.1);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.can_execute());
        breaker.record_success(0.1);

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "open kucoin:orders",
                "half kucoin:orders",
                "close kucoin:orders"
            ]
        );
    }

    #[tokio::test]
    async fn test_shared_storage_keys_by_name() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
        let orders = CircuitBuilder::new("a:orders")
            .storage(Arc::clone(&storage))
            .build();
        let market = CircuitBuilder::new("a:market")
            .storage(Arc::clone(&storage))
            .build();

        orders.record_failure("boom", 0.1);
        orders.record_failure("boom", 0.1);
        market.record_success(0.1);

        assert_eq!(storage.failure_count("a:orders", 60.0), 2);
        assert_eq!(storage.failure_count("a:market", 60.0), 0);
        assert_eq!(market.metrics().window_requests, 1);
    }
}
