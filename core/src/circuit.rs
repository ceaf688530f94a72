//! Circuit breaker built on a dynamic state machine
//!
//! The machine decides *whether* a transition is allowed (guards read the failure streak
//! and the outcome window from storage); [`CircuitBreaker`] owns the machine behind a mutex, records outcomes,
//! gates calls and publishes [`BreakerEvent`]s once the lock is released.

use crate::{
    Event,
    callbacks::{ListenerId, Listeners},
    classifier::{FailureClassifier, FailureContext},
    errors::CircuitError,
    instrumentation::Instrumentation,
    probe::{ProbeGate, ProbePermit},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

// Float slack when comparing monotonic seconds against a timeout.
const CLOCK_EPSILON: f64 = 1e-6;

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Consecutive failures in CLOSED that open the circuit, reset by any success.
    /// `None` leaves only the error-rate check.
    pub failure_threshold: Option<usize>,

    /// Consecutive half-open successes required to close the circuit
    pub success_threshold: usize,

    /// Rolling window for outcome counting
    pub time_window_ms: u64,

    /// Time spent open before a probe is let through
    pub reset_timeout_ms: u64,

    /// Requests inside the window before either threshold is evaluated
    pub minimum_request_volume: usize,

    /// Error rate in percent (0-100) that opens the circuit.
    /// `None` leaves only the absolute count check.
    pub error_threshold_percentage: Option<f64>,

    /// Concurrent trial calls allowed while half-open
    pub half_open_max_probes: usize,

    /// Jitter for the reset timeout (0.0 = none, 1.0 = full).
    /// chrono-machines formula: timeout * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            failure_threshold: Some(5),
            success_threshold: 2,
            time_window_ms: 60_000,
            reset_timeout_ms: 30_000,
            minimum_request_volume: 10,
            error_threshold_percentage: Some(50.0),
            half_open_max_probes: 1,
            jitter_factor: 0.0,
        }
    }
}

impl Config {
    pub fn window_secs(&self) -> f64 {
        self.time_window_ms as f64 / 1000.0
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Breaker state as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn from_machine(state: &str) -> Self {
        match state {
            "Open" => CircuitState::Open,
            "HalfOpen" => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification published by a breaker
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerEvent {
    StateChange {
        from: CircuitState,
        to: CircuitState,
    },
    Open,
    HalfOpen,
    Close,
    Success,
    /// A counted failure, with the error rendered for display
    Failure(String),
    /// A call refused by the gate
    Reject,
}

impl BreakerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BreakerEvent::StateChange { .. } => "state_change",
            BreakerEvent::Open => "open",
            BreakerEvent::HalfOpen => "half_open",
            BreakerEvent::Close => "close",
            BreakerEvent::Success => "success",
            BreakerEvent::Failure(_) => "failure",
            BreakerEvent::Reject => "reject",
        }
    }
}

/// What recording an outcome did to the breaker
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    /// Events published for this outcome, in order
    pub events: Vec<BreakerEvent>,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Handed to fallbacks when the gate refuses a call
#[derive(Debug, Clone)]
pub struct FallbackContext {
    pub circuit_name: String,
    pub state: CircuitState,
    pub opened_at: Option<f64>,
    pub retry_after: Option<Duration>,
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    /// Every call that reached the gate, rejected ones included
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    /// Outcomes currently inside the rolling window
    pub window_requests: usize,
    /// Failure percentage over the rolling window
    pub error_rate: f64,
    /// Monotonic seconds of the last transition
    pub last_state_change: f64,
    pub consecutive_successes: u64,
    pub consecutive_failures: u64,
}

/// The generated state machine and its guards
mod machine {
    use super::{CLOCK_EPSILON, Config};
    use crate::{MemoryStorage, StorageBackend};
    use state_machines::state_machine;
    use std::fmt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Shared data visible to every state of the machine
    #[derive(Clone)]
    pub struct CircuitContext {
        pub name: String,
        pub config: Config,
        pub storage: Arc<dyn StorageBackend>,
        /// Failures since the last success, shared with the owning breaker
        pub failure_streak: Arc<AtomicU64>,
    }

    impl CircuitContext {
        pub fn new(
            name: impl Into<String>,
            config: Config,
            storage: Arc<dyn StorageBackend>,
        ) -> Self {
            Self {
                name: name.into(),
                config,
                storage,
                failure_streak: Arc::new(AtomicU64::new(0)),
            }
        }

        pub fn consecutive_failures(&self) -> u64 {
            self.failure_streak.load(Ordering::Relaxed)
        }

        pub(super) fn set_consecutive_failures(&self, value: u64) {
            self.failure_streak.store(value, Ordering::Relaxed);
        }

        /// (failures, volume) inside the rolling window
        pub(super) fn window_counts(&self) -> (usize, usize) {
            let window = self.config.window_secs();
            let failures = self.storage.failure_count(&self.name, window);
            let successes = self.storage.success_count(&self.name, window);
            (failures, failures + successes)
        }

        /// Volume gate first, then the failure streak or the window error rate.
        fn thresholds_exceeded(&self, consecutive_failures: u64) -> bool {
            let (failures, volume) = self.window_counts();
            if volume < self.config.minimum_request_volume {
                return false;
            }

            if let Some(threshold) = self.config.failure_threshold
                && consecutive_failures >= threshold as u64
            {
                return true;
            }

            if let Some(percentage) = self.config.error_threshold_percentage
                && volume > 0
            {
                return failures as f64 * 100.0 / volume as f64 >= percentage;
            }

            false
        }
    }

    impl Default for CircuitContext {
        fn default() -> Self {
            Self::new(String::new(), Config::default(), Arc::new(MemoryStorage::new()))
        }
    }

    impl fmt::Debug for CircuitContext {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("CircuitContext")
                .field("name", &self.name)
                .field("config", &self.config)
                .finish_non_exhaustive()
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct OpenData {
        pub opened_at: f64,
        /// Jittered reset timeout in seconds, fixed when the circuit opened
        pub reset_after: f64,
    }

    #[derive(Debug, Clone, Default)]
    pub struct HalfOpenData {
        pub consecutive_successes: usize,
    }

    state_machine! {
        name: Circuit,
        context: CircuitContext,
        dynamic: true,

        initial: Closed,
        states: [
            Closed,
            Open(OpenData),
            HalfOpen(HalfOpenData),
        ],
        events {
            trip {
                guards: [should_open],
                transition: { from: [Closed, HalfOpen], to: Open }
            }
            attempt_reset {
                guards: [timeout_elapsed],
                transition: { from: Open, to: HalfOpen }
            }
            close {
                guards: [should_close],
                transition: { from: HalfOpen, to: Closed }
            }
        }
    }

    impl Circuit<Closed> {
        fn should_open(&self, ctx: &CircuitContext) -> bool {
            ctx.thresholds_exceeded(ctx.consecutive_failures())
        }
    }

    impl Circuit<HalfOpen> {
        /// A failed probe reopens without consulting the window.
        fn should_open(&self, _ctx: &CircuitContext) -> bool {
            true
        }

        fn should_close(&self, ctx: &CircuitContext) -> bool {
            self.state_data_half_open()
                .is_some_and(|data| data.consecutive_successes >= ctx.config.success_threshold)
        }
    }

    impl Circuit<Open> {
        fn timeout_elapsed(&self, ctx: &CircuitContext) -> bool {
            self.state_data_open().is_some_and(|data| {
                ctx.storage.monotonic_time() - data.opened_at + CLOCK_EPSILON >= data.reset_after
            })
        }
    }
}

pub use machine::{CircuitContext, HalfOpenData, OpenData};
use machine::{CircuitEvent, DynamicCircuit};

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    successes: u64,
    failures: u64,
    rejected: u64,
    consecutive_successes: u64,
}

struct Core {
    machine: DynamicCircuit,
    counters: Counters,
    last_state_change: f64,
    // Bumped on every open and reset so stale reset timers do nothing.
    generation: u64,
}

impl Core {
    fn state(&self) -> CircuitState {
        CircuitState::from_machine(self.machine.current_state())
    }
}

struct Inner {
    context: CircuitContext,
    classifier: Option<Arc<dyn FailureClassifier>>,
    probes: Arc<ProbeGate>,
    listeners: Listeners<BreakerEvent>,
    instrumentation: Option<Arc<Instrumentation>>,
    core: Mutex<Core>,
}

enum Rejection {
    Open { opened_at: f64, retry_after: Duration },
    ProbesExhausted,
}

/// Async circuit breaker.
///
/// Cheap to clone: clones share state. Outcomes are applied in completion order, so a
/// slow call that fails after a later success can still open the circuit.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

impl CircuitBreaker {
    /// Breaker with in-memory storage, see [`builder`](Self::builder) for the rest.
    pub fn new(name: impl Into<String>, config: Config) -> Self {
        crate::builder::CircuitBuilder::new(name).config(config).build()
    }

    pub fn builder(name: impl Into<String>) -> crate::builder::CircuitBuilder {
        crate::builder::CircuitBuilder::new(name)
    }

    pub(crate) fn from_parts(
        context: CircuitContext,
        classifier: Option<Arc<dyn FailureClassifier>>,
        listeners: Listeners<BreakerEvent>,
        instrumentation: Option<Arc<Instrumentation>>,
    ) -> Self {
        let probes = Arc::new(ProbeGate::new(context.config.half_open_max_probes.max(1)));
        let core = Core {
            machine: DynamicCircuit::new(context.clone()),
            counters: Counters::default(),
            last_state_change: context.storage.monotonic_time(),
            generation: 0,
        };

        Self {
            inner: Arc::new(Inner {
                context,
                classifier,
                probes,
                listeners,
                instrumentation,
                core: Mutex::new(core),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.context.name
    }

    pub fn config(&self) -> &Config {
        &self.inner.context.config
    }

    /// Run `operation` behind the gate.
    ///
    /// Rejected calls never invoke `operation`. The operation's own error comes back
    /// untouched inside [`CircuitError::Execution`].
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display + 'static,
    {
        let _permit = self.admit().map_err(|r| self.rejection_error(r))?;

        let storage = &self.inner.context.storage;
        let start = storage.monotonic_time();
        let result = operation().await;
        let duration = storage.monotonic_time() - start;

        match result {
            Ok(value) => {
                self.complete_success(duration);
                Ok(value)
            }
            Err(error) => {
                if self.counts_as_failure(&error, duration) {
                    self.complete_failure(error.to_string(), duration);
                } else {
                    debug!(circuit = %self.name(), "failure ignored by classifier");
                }
                Err(CircuitError::Execution(error))
            }
        }
    }

    /// Like [`execute`](Self::execute), but a rejected call runs `fallback` instead.
    pub async fn execute_or_else<F, Fut, G, GFut, T, E>(
        &self,
        operation: F,
        fallback: G,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce(FallbackContext) -> GFut,
        GFut: Future<Output = Result<T, E>>,
        E: fmt::Display + 'static,
    {
        let rejected = match self.execute(operation).await {
            Err(rejected) if rejected.is_rejection() => rejected,
            other => return other,
        };

        let (state, opened_at, retry_after) = match rejected {
            CircuitError::Open {
                state,
                opened_at,
                retry_after,
                ..
            } => (state, Some(opened_at), retry_after),
            _ => (CircuitState::HalfOpen, None, None),
        };
        let ctx = FallbackContext {
            circuit_name: self.name().to_owned(),
            state,
            opened_at,
            retry_after,
        };
        fallback(ctx).await.map_err(CircuitError::Execution)
    }

    /// Whether a call would be admitted right now. Promotes OPEN to HALF_OPEN once the
    /// reset timeout has elapsed. In HALF_OPEN this is false while every probe permit
    /// (`half_open_max_probes`) is held by an in-flight call.
    pub fn can_execute(&self) -> bool {
        let mut events = Vec::new();
        let allowed = {
            let mut core = self.lock();
            self.promote_if_due(&mut core, &mut events);
            match core.state() {
                CircuitState::Closed => true,
                CircuitState::HalfOpen => self.inner.probes.available() > 0,
                CircuitState::Open => false,
            }
        };
        self.dispatch(&events);
        allowed
    }

    /// Record a success observed outside [`execute`](Self::execute).
    pub fn record_success(&self, duration: f64) -> Transition {
        self.lock().counters.total += 1;
        self.complete_success(duration)
    }

    /// Record a failure observed outside [`execute`](Self::execute).
    pub fn record_failure(&self, error: impl fmt::Display, duration: f64) -> Transition {
        self.lock().counters.total += 1;
        self.complete_failure(error.to_string(), duration)
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    /// Back to CLOSED with an empty window.
    pub fn reset(&self) {
        let ctx = &self.inner.context;
        let events = {
            let mut core = self.lock();
            let from = core.state();
            core.machine = DynamicCircuit::new(ctx.clone());
            core.counters.consecutive_successes = 0;
            ctx.set_consecutive_failures(0);
            core.generation += 1;
            core.last_state_change = ctx.storage.monotonic_time();
            ctx.storage.clear(&ctx.name);

            if from == CircuitState::Closed {
                Vec::new()
            } else {
                vec![
                    BreakerEvent::StateChange {
                        from,
                        to: CircuitState::Closed,
                    },
                    BreakerEvent::Close,
                ]
            }
        };
        self.dispatch(&events);
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let (failures, volume) = self.inner.context.window_counts();
        let core = self.lock();
        CircuitBreakerMetrics {
            state: core.state(),
            total_calls: core.counters.total,
            successful_calls: core.counters.successes,
            failed_calls: core.counters.failures,
            rejected_calls: core.counters.rejected,
            window_requests: volume,
            error_rate: if volume == 0 {
                0.0
            } else {
                failures as f64 * 100.0 / volume as f64
            },
            last_state_change: core.last_state_change,
            consecutive_successes: core.counters.consecutive_successes,
            consecutive_failures: self.inner.context.consecutive_failures(),
        }
    }

    /// Recent outcomes, oldest first
    pub fn event_log(&self, limit: usize) -> Vec<Event> {
        let ctx = &self.inner.context;
        ctx.storage.event_log(&ctx.name, limit)
    }

    pub fn on_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&BreakerEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.unsubscribe(id)
    }

    /// Remove every listener.
    pub fn destroy(&self) {
        self.inner.listeners.destroy();
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.inner
            .core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self) -> Result<Option<ProbePermit>, Rejection> {
        let mut events = Vec::new();
        let verdict = {
            let mut core = self.lock();
            core.counters.total += 1;
            self.promote_if_due(&mut core, &mut events);

            let verdict = match core.state() {
                CircuitState::Closed => Ok(None),
                CircuitState::HalfOpen => self
                    .inner
                    .probes
                    .try_acquire()
                    .map(Some)
                    .ok_or(Rejection::ProbesExhausted),
                CircuitState::Open => {
                    let (opened_at, reset_after) = core
                        .machine
                        .open_data()
                        .map(|data| (data.opened_at, data.reset_after))
                        .unwrap_or_default();
                    let now = self.inner.context.storage.monotonic_time();
                    let remaining = (opened_at + reset_after - now).max(0.0);
                    Err(Rejection::Open {
                        opened_at,
                        retry_after: Duration::from_secs_f64(remaining),
                    })
                }
            };

            if verdict.is_err() {
                core.counters.rejected += 1;
                events.push(BreakerEvent::Reject);
            }
            verdict
        };
        self.dispatch(&events);
        verdict
    }

    fn rejection_error<E>(&self, rejection: Rejection) -> CircuitError<E> {
        match rejection {
            Rejection::Open {
                opened_at,
                retry_after,
            } => CircuitError::Open {
                circuit: self.name().to_owned(),
                state: CircuitState::Open,
                opened_at,
                retry_after: Some(retry_after),
            },
            Rejection::ProbesExhausted => CircuitError::HalfOpenLimitReached {
                circuit: self.name().to_owned(),
            },
        }
    }

    fn counts_as_failure<E: 'static>(&self, error: &E, duration: f64) -> bool {
        match &self.inner.classifier {
            Some(classifier) => classifier.should_trip(&FailureContext {
                circuit_name: self.name(),
                error: error as &dyn std::any::Any,
                duration,
            }),
            None => true,
        }
    }

    fn complete_success(&self, duration: f64) -> Transition {
        let ctx = &self.inner.context;
        ctx.storage.record_success(&ctx.name, duration);
        ctx.storage.prune(&ctx.name, ctx.config.window_secs());

        let transition = {
            let mut core = self.lock();
            let from = core.state();
            let mut events = vec![BreakerEvent::Success];
            core.counters.successes += 1;
            core.counters.consecutive_successes += 1;
            ctx.set_consecutive_failures(0);

            if from == CircuitState::HalfOpen {
                if let Some(data) = core.machine.half_open_data_mut() {
                    data.consecutive_successes += 1;
                }
                if core.machine.handle(CircuitEvent::Close).is_ok() {
                    ctx.storage.clear(&ctx.name);
                    core.counters.consecutive_successes = 0;
                    core.last_state_change = ctx.storage.monotonic_time();
                    events.push(BreakerEvent::StateChange {
                        from,
                        to: CircuitState::Closed,
                    });
                    events.push(BreakerEvent::Close);
                }
            }

            Transition {
                from,
                to: core.state(),
                events,
            }
        };
        self.dispatch(&transition.events);
        transition
    }

    fn complete_failure(&self, error: String, duration: f64) -> Transition {
        let ctx = &self.inner.context;
        ctx.storage.record_failure(&ctx.name, duration);
        ctx.storage.prune(&ctx.name, ctx.config.window_secs());

        let (transition, reset_timer) = {
            let mut core = self.lock();
            let from = core.state();
            let mut events = vec![BreakerEvent::Failure(error)];
            core.counters.failures += 1;
            ctx.set_consecutive_failures(ctx.consecutive_failures() + 1);
            core.counters.consecutive_successes = 0;

            // A late failure while already open is only recorded.
            let tripped = from != CircuitState::Open
                && core.machine.handle(CircuitEvent::Trip).is_ok();
            let reset_timer = tripped.then(|| self.mark_open(&mut core, from, &mut events));

            let transition = Transition {
                from,
                to: core.state(),
                events,
            };
            (transition, reset_timer)
        };

        if let Some((generation, after)) = reset_timer {
            self.schedule_half_open(generation, after);
        }
        self.dispatch(&transition.events);
        transition
    }

    fn mark_open(
        &self,
        core: &mut Core,
        from: CircuitState,
        events: &mut Vec<BreakerEvent>,
    ) -> (u64, Duration) {
        let now = self.inner.context.storage.monotonic_time();
        let reset_after = reset_after_secs(&self.inner.context.config);
        if let Some(data) = core.machine.open_data_mut() {
            data.opened_at = now;
            data.reset_after = reset_after;
        }
        core.last_state_change = now;
        core.generation += 1;
        events.push(BreakerEvent::StateChange {
            from,
            to: CircuitState::Open,
        });
        events.push(BreakerEvent::Open);
        (core.generation, Duration::from_secs_f64(reset_after))
    }

    fn promote_if_due(&self, core: &mut Core, events: &mut Vec<BreakerEvent>) -> bool {
        if core.state() != CircuitState::Open
            || core.machine.handle(CircuitEvent::AttemptReset).is_err()
        {
            return false;
        }
        core.counters.consecutive_successes = 0;
        core.last_state_change = self.inner.context.storage.monotonic_time();
        events.push(BreakerEvent::StateChange {
            from: CircuitState::Open,
            to: CircuitState::HalfOpen,
        });
        events.push(BreakerEvent::HalfOpen);
        true
    }

    /// Move to HALF_OPEN when the reset timeout fires, without waiting for the next call.
    /// Outside a tokio runtime the promotion only happens lazily.
    fn schedule_half_open(&self, generation: u64, after: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let breaker = Arc::downgrade(&self.inner);
        runtime.spawn(async move {
            tokio::time::sleep(after).await;
            let Some(inner) = breaker.upgrade() else {
                return;
            };
            let breaker = CircuitBreaker { inner };
            let mut events = Vec::new();
            {
                let mut core = breaker.lock();
                if core.generation == generation {
                    breaker.promote_if_due(&mut core, &mut events);
                }
            }
            breaker.dispatch(&events);
        });
    }

    fn dispatch(&self, events: &[BreakerEvent]) {
        let name = self.name();
        for event in events {
            match event {
                BreakerEvent::StateChange { from, to } => match to {
                    CircuitState::Open => warn!(circuit = %name, %from, "circuit opened"),
                    CircuitState::HalfOpen => info!(circuit = %name, "circuit half-open, probing"),
                    CircuitState::Closed => info!(circuit = %name, %from, "circuit closed"),
                },
                BreakerEvent::Reject => debug!(circuit = %name, "call rejected"),
                BreakerEvent::Failure(error) => debug!(circuit = %name, %error, "failure recorded"),
                _ => {}
            }
            if let Some(instrumentation) = &self.inner.instrumentation {
                instrumentation.breaker_event(name, event);
            }
            self.inner.listeners.emit(event);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

fn reset_after_secs(config: &Config) -> f64 {
    if config.jitter_factor > 0.0 {
        let policy = chrono_machines::Policy {
            max_attempts: 1,
            base_delay_ms: config.reset_timeout_ms,
            multiplier: 1.0,
            max_delay_ms: config.reset_timeout_ms,
        };
        let timeout_ms = policy.calculate_delay(1, config.jitter_factor.min(1.0));
        timeout_ms as f64 / 1000.0
    } else {
        config.reset_timeout_ms as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryStorage, StorageBackend};
    use crate::classifier::PredicateClassifier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scenario_config() -> Config {
        Config {
            failure_threshold: Some(5),
            minimum_request_volume: 10,
            reset_timeout_ms: 30_000,
            ..Default::default()
        }
    }

    async fn succeed(breaker: &CircuitBreaker) {
        let _ = breaker.execute(|| async { Ok::<_, String>(()) }).await;
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .execute(|| async { Err::<(), _>("exchange unavailable".to_string()) })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_volume_and_rejects_without_calling() {
        let breaker = CircuitBreaker::new("binance:orders", scenario_config());

        for _ in 0..4 {
            succeed(&breaker).await;
        }
        for _ in 0..5 {
            fail(&breaker).await;
        }
        assert!(breaker.is_closed(), "volume still below minimum");

        fail(&breaker).await;
        assert!(breaker.is_open());

        let mut invoked = false;
        let result = breaker
            .execute(|| {
                invoked = true;
                async { Ok::<_, String>(()) }
            })
            .await;

        assert!(!invoked);
        match result {
            Err(CircuitError::Open {
                state, retry_after, ..
            }) => {
                assert_eq!(state, CircuitState::Open);
                assert_eq!(retry_after, Some(Duration::from_secs(30)));
            }
            other => panic!("expected open rejection, got {other:?}"),
        }
        assert_eq!(breaker.metrics().rejected_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_percentage_opens_circuit() {
        let breaker = CircuitBreaker::new(
            "kraken:market",
            Config {
                failure_threshold: None,
                minimum_request_volume: 4,
                error_threshold_percentage: Some(50.0),
                ..Default::default()
            },
        );

        succeed(&breaker).await;
        fail(&breaker).await;
        succeed(&breaker).await;
        assert!(breaker.is_closed());

        fail(&breaker).await;
        assert!(breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_streak() {
        let breaker = CircuitBreaker::new(
            "binance:account",
            Config {
                failure_threshold: Some(5),
                minimum_request_volume: 10,
                error_threshold_percentage: Some(50.0),
                ..Default::default()
            },
        );

        for _ in 0..5 {
            fail(&breaker).await;
        }
        for _ in 0..20 {
            succeed(&breaker).await;
        }
        assert_eq!(breaker.metrics().consecutive_failures, 0);

        fail(&breaker).await;
        let metrics = breaker.metrics();
        assert!(breaker.is_closed());
        assert_eq!(metrics.consecutive_failures, 1);
        assert_eq!(metrics.window_requests, 26);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_streak_opens_once_volume_is_met() {
        let breaker = CircuitBreaker::new(
            "binance:margin",
            Config {
                failure_threshold: Some(3),
                minimum_request_volume: 6,
                error_threshold_percentage: None,
                ..Default::default()
            },
        );

        for _ in 0..3 {
            succeed(&breaker).await;
        }
        fail(&breaker).await;
        fail(&breaker).await;
        assert!(breaker.is_closed());

        fail(&breaker).await;
        assert!(breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcomes_outside_window_do_not_count() {
        let breaker = CircuitBreaker::new(
            "okx:orders",
            Config {
                failure_threshold: Some(3),
                minimum_request_volume: 3,
                time_window_ms: 10_000,
                error_threshold_percentage: None,
                ..Default::default()
            },
        );

        fail(&breaker).await;
        fail(&breaker).await;
        tokio::time::advance(Duration::from_secs(11)).await;
        fail(&breaker).await;

        assert!(breaker.is_closed());
        assert_eq!(breaker.metrics().window_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_timeout_promotes_to_half_open() {
        let breaker = CircuitBreaker::new("bybit:orders", scenario_config());
        for _ in 0..10 {
            fail(&breaker).await;
        }
        assert!(breaker.is_open());

        tokio::time::advance(Duration::from_millis(29_000)).await;
        assert!(!breaker.can_execute());

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_timer_fires_without_traffic() {
        let breaker = CircuitBreaker::new("bybit:market", scenario_config());
        for _ in 0..10 {
            fail(&breaker).await;
        }
        assert!(breaker.is_open());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new("coinbase:orders", scenario_config());
        for _ in 0..10 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.can_execute());

        fail(&breaker).await;
        assert!(breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_threshold_closes_and_clears_window() {
        let breaker = CircuitBreaker::new(
            "coinbase:market",
            Config {
                success_threshold: 2,
                ..scenario_config()
            },
        );
        for _ in 0..10 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        succeed(&breaker).await;
        assert!(breaker.is_half_open());
        succeed(&breaker).await;
        assert!(breaker.is_closed());

        let metrics = breaker.metrics();
        assert_eq!(metrics.window_requests, 0);
        assert_eq!(metrics.consecutive_successes, 0);
        assert_eq!(metrics.consecutive_failures, 0);
        assert_eq!(metrics.failed_calls, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_while_half_open() {
        let breaker = CircuitBreaker::new("gate:orders", scenario_config());
        for _ in 0..10 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let (release, hold) = tokio::sync::oneshot::channel::<()>();
        let probe = breaker.clone();
        let in_flight = tokio::spawn(async move {
            probe
                .execute(|| async move {
                    let _ = hold.await;
                    Ok::<_, String>("probed")
                })
                .await
        });
        tokio::task::yield_now().await;

        let second = breaker.execute(|| async { Ok::<_, String>("second") }).await;
        assert!(matches!(
            second,
            Err(CircuitError::HalfOpenLimitReached { .. })
        ));

        release.send(()).unwrap();
        assert_eq!(in_flight.await.unwrap().unwrap(), "probed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_classifier_ignored_errors_never_open() {
        let breaker = CircuitBreaker::builder("htx:orders")
            .failure_threshold(1)
            .minimum_request_volume(1)
            .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
                ctx.error
                    .downcast_ref::<String>()
                    .is_none_or(|e| !e.starts_with("400"))
            })))
            .build();

        let _ = breaker
            .execute(|| async { Err::<(), _>("400 bad symbol".to_string()) })
            .await;
        assert!(breaker.is_closed());

        let _ = breaker
            .execute(|| async { Err::<(), _>("503 maintenance".to_string()) })
            .await;
        assert!(breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_published_in_order() {
        let breaker = CircuitBreaker::builder("gate:market")
            .failure_threshold(1)
            .minimum_request_volume(1)
            .build();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        breaker.on_event(move |event| sink.lock().unwrap().push(event.clone()));

        let _ = breaker.execute(|| async { Err::<(), _>("boom") }).await;
        let _ = breaker.execute(|| async { Ok::<_, &str>(()) }).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                BreakerEvent::Failure("boom".into()),
                BreakerEvent::StateChange {
                    from: CircuitState::Closed,
                    to: CircuitState::Open,
                },
                BreakerEvent::Open,
                BreakerEvent::Reject,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_removes_listeners() {
        let breaker = CircuitBreaker::new("mexc:orders", Config::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        breaker.on_event(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        succeed(&breaker).await;
        breaker.destroy();
        succeed(&breaker).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_runs_only_when_rejected() {
        let breaker = CircuitBreaker::builder("bitget:ticker")
            .failure_threshold(1)
            .minimum_request_volume(1)
            .build();

        let live = breaker
            .execute_or_else(
                || async { Ok::<_, String>(101.5) },
                |_| async { Ok(0.0) },
            )
            .await;
        assert_eq!(live.unwrap(), 101.5);

        fail(&breaker).await;

        let cached = breaker
            .execute_or_else(
                || async { Ok::<_, String>(102.0) },
                |ctx| async move {
                    assert_eq!(ctx.state, CircuitState::Open);
                    assert_eq!(ctx.circuit_name, "bitget:ticker");
                    Ok(100.0)
                },
            )
            .await;
        assert_eq!(cached.unwrap(), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_recording_reports_transition() {
        let breaker = CircuitBreaker::builder("deribit:orders")
            .failure_threshold(2)
            .minimum_request_volume(2)
            .build();

        let first = breaker.record_failure("timeout", 0.5);
        assert!(!first.changed());

        let second = breaker.record_failure("timeout", 0.5);
        assert_eq!(second.from, CircuitState::Closed);
        assert_eq!(second.to, CircuitState::Open);
        assert!(second.events.contains(&BreakerEvent::Open));

        breaker.reset();
        assert!(breaker.is_closed());
        assert_eq!(breaker.metrics().window_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_machine_guards() {
        let storage = Arc::new(MemoryStorage::new());
        let ctx = CircuitContext::new(
            "guarded",
            Config {
                failure_threshold: Some(2),
                minimum_request_volume: 2,
                error_threshold_percentage: None,
                reset_timeout_ms: 1_000,
                ..Default::default()
            },
            storage.clone(),
        );
        let mut machine = DynamicCircuit::new(ctx.clone());

        assert!(machine.handle(CircuitEvent::Trip).is_err());
        storage.record_failure("guarded", 0.1);
        storage.record_failure("guarded", 0.1);
        ctx.set_consecutive_failures(1);
        assert!(machine.handle(CircuitEvent::Trip).is_err(), "streak below threshold");

        ctx.set_consecutive_failures(2);
        machine.handle(CircuitEvent::Trip).unwrap();
        assert_eq!(machine.current_state(), "Open");

        if let Some(data) = machine.open_data_mut() {
            data.opened_at = storage.monotonic_time();
            data.reset_after = 1.0;
        }
        assert!(machine.handle(CircuitEvent::AttemptReset).is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        machine.handle(CircuitEvent::AttemptReset).unwrap();
        assert_eq!(machine.current_state(), "HalfOpen");

        assert!(machine.handle(CircuitEvent::Close).is_err());
        machine.handle(CircuitEvent::Trip).unwrap();
        assert_eq!(machine.current_state(), "Open");
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = Config {
            reset_timeout_ms: 10_000,
            jitter_factor: 0.5,
            ..Default::default()
        };

        for _ in 0..200 {
            let secs = reset_after_secs(&config);
            assert!((5.0..=10.0).contains(&secs), "jittered timeout {secs}");
        }

        let fixed = Config {
            reset_timeout_ms: 10_000,
            ..Default::default()
        };
        assert_eq!(reset_after_secs(&fixed), 10.0);
    }
}
