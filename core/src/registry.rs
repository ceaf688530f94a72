//! Lazily created per-key breakers and limiters
//!
//! Every exchange integration asks for its gate by key. The first request builds it
//! from the shared defaults, every later one gets the same instance.

use crate::{
    CircuitBreaker, MemoryStorage, StorageBackend,
    circuit::Config,
    instrumentation::Instrumentation,
    rate_limiter::{RateLimiter, RateLimiterConfig},
};
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Identifies one breaker: an exchange plus a class of operations against it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakerKey {
    pub exchange: String,
    pub operation_class: String,
}

impl BreakerKey {
    pub fn new(exchange: impl Into<String>, operation_class: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            operation_class: operation_class.into(),
        }
    }
}

impl fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.operation_class)
    }
}

/// One [`CircuitBreaker`] per [`BreakerKey`], all sharing a storage backend.
pub struct BreakerRegistry {
    defaults: Config,
    overrides: HashMap<String, Config>,
    storage: Arc<dyn StorageBackend>,
    instrumentation: Option<Arc<Instrumentation>>,
    breakers: DashMap<BreakerKey, CircuitBreaker>,
}

impl BreakerRegistry {
    pub fn new(defaults: Config) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            storage: Arc::new(MemoryStorage::new()),
            instrumentation: None,
            breakers: DashMap::new(),
        }
    }

    /// Use `config` instead of the defaults for one operation class on every exchange.
    pub fn with_override(mut self, operation_class: impl Into<String>, config: Config) -> Self {
        self.overrides.insert(operation_class.into(), config);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_instrumentation(mut self, instrumentation: Arc<Instrumentation>) -> Self {
        self.instrumentation = Some(instrumentation);
        self
    }

    /// The breaker for `exchange`/`operation_class`, built on first use.
    pub fn get(&self, exchange: &str, operation_class: &str) -> CircuitBreaker {
        self.get_key(&BreakerKey::new(exchange, operation_class))
    }

    pub fn get_key(&self, key: &BreakerKey) -> CircuitBreaker {
        if let Some(existing) = self.breakers.get(key) {
            return existing.value().clone();
        }
        self.breakers
            .entry(key.clone())
            .or_insert_with(|| self.build(key))
            .value()
            .clone()
    }

    fn build(&self, key: &BreakerKey) -> CircuitBreaker {
        let config = self
            .overrides
            .get(&key.operation_class)
            .unwrap_or(&self.defaults)
            .clone();
        let mut builder = CircuitBreaker::builder(key.to_string())
            .config(config)
            .storage(Arc::clone(&self.storage));
        if let Some(instrumentation) = &self.instrumentation {
            builder = builder.instrumentation(Arc::clone(instrumentation));
        }
        builder.build()
    }

    pub fn contains(&self, exchange: &str, operation_class: &str) -> bool {
        self.breakers
            .contains_key(&BreakerKey::new(exchange, operation_class))
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Keys sorted for stable output.
    pub fn keys(&self) -> Vec<BreakerKey> {
        let mut keys: Vec<_> = self.breakers.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Force every breaker back to CLOSED.
    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.value().reset();
        }
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("breakers", &self.breakers.len())
            .finish()
    }
}

/// One [`RateLimiter`] per endpoint class.
pub struct LimiterRegistry {
    defaults: RateLimiterConfig,
    overrides: HashMap<String, RateLimiterConfig>,
    instrumentation: Option<Arc<Instrumentation>>,
    limiters: DashMap<String, Arc<RateLimiter>>,
}

impl LimiterRegistry {
    pub fn new(defaults: RateLimiterConfig) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            instrumentation: None,
            limiters: DashMap::new(),
        }
    }

    pub fn with_override(mut self, endpoint_class: impl Into<String>, config: RateLimiterConfig) -> Self {
        self.overrides.insert(endpoint_class.into(), config);
        self
    }

    pub fn with_instrumentation(mut self, instrumentation: Arc<Instrumentation>) -> Self {
        self.instrumentation = Some(instrumentation);
        self
    }

    pub fn get(&self, endpoint_class: &str) -> Arc<RateLimiter> {
        if let Some(existing) = self.limiters.get(endpoint_class) {
            return Arc::clone(existing.value());
        }
        let limiter = self
            .limiters
            .entry(endpoint_class.to_owned())
            .or_insert_with(|| Arc::new(self.build(endpoint_class)));
        Arc::clone(limiter.value())
    }

    fn build(&self, endpoint_class: &str) -> RateLimiter {
        let config = self
            .overrides
            .get(endpoint_class)
            .unwrap_or(&self.defaults)
            .clone();
        let limiter = RateLimiter::new(endpoint_class, config);
        match &self.instrumentation {
            Some(instrumentation) => limiter.with_instrumentation(Arc::clone(instrumentation)),
            None => limiter,
        }
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

impl fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterRegistry")
            .field("limiters", &self.limiters.len())
            .finish()
    }
}
