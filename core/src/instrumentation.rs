//! Shared metrics hooks
//!
//! Every component takes an optional `Arc<Instrumentation>` from its builder. Each hook
//! forwards to the `metrics` facade (a no-op until the host installs a recorder) and
//! bumps an in-process counter so a snapshot can be read without any exporter.
//!
//! The process-wide instance is opt-in: [`initialize`] creates it, [`global`] hands out
//! clones, and [`teardown`] drops it. Nothing in this crate reads it implicitly.

use crate::{
    circuit::BreakerEvent,
    connection::{ConnectionEvent, ConnectionState},
};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

static GLOBAL: RwLock<Option<Arc<Instrumentation>>> = RwLock::new(None);

/// Counter sink shared by breakers, limiters, retry orchestrators and connections.
///
/// Snapshot keys are `<component>.<name>.<measurement>`, for example
/// `breaker.binance:orders.open` or `limiter.rest.rejected_weight`.
#[derive(Default)]
pub struct Instrumentation {
    counters: DashMap<String, u64>,
}

impl Instrumentation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn breaker_event(&self, circuit: &str, event: &BreakerEvent) {
        metrics::counter!(
            "resilience_breaker_events_total",
            "circuit" => circuit.to_owned(),
            "event" => event.name()
        )
        .increment(1);

        if let BreakerEvent::StateChange { to, .. } = event {
            metrics::gauge!("resilience_breaker_state", "circuit" => circuit.to_owned())
                .set(state_gauge(to.as_str()));
        }
        self.bump(format!("breaker.{circuit}.{}", event.name()), 1);
    }

    pub fn limiter_decision(&self, limiter: &str, granted: bool, weight: u32) {
        let decision = if granted { "granted" } else { "rejected" };
        metrics::counter!(
            "resilience_limiter_decisions_total",
            "limiter" => limiter.to_owned(),
            "decision" => decision
        )
        .increment(1);

        self.bump(format!("limiter.{limiter}.{decision}"), 1);
        self.bump(format!("limiter.{limiter}.{decision}_weight"), u64::from(weight));
    }

    pub fn limiter_timeout(&self, limiter: &str) {
        metrics::counter!("resilience_limiter_timeouts_total", "limiter" => limiter.to_owned())
            .increment(1);
        self.bump(format!("limiter.{limiter}.timeout"), 1);
    }

    /// `outcome` is one of `success`, `exhausted` or `terminal`.
    pub fn retry_outcome(&self, operation: &str, outcome: &'static str, attempts: u32) {
        metrics::counter!(
            "resilience_retry_outcomes_total",
            "operation" => operation.to_owned(),
            "outcome" => outcome
        )
        .increment(1);
        metrics::counter!("resilience_retry_attempts_total", "operation" => operation.to_owned())
            .increment(u64::from(attempts));

        self.bump(format!("retry.{operation}.{outcome}"), 1);
        self.bump(format!("retry.{operation}.attempts"), u64::from(attempts));
    }

    pub fn connection_event(&self, connection: &str, event: &ConnectionEvent) {
        metrics::counter!(
            "resilience_connection_events_total",
            "connection" => connection.to_owned(),
            "event" => event.name()
        )
        .increment(1);

        if let ConnectionEvent::StateChange { to, .. } = event {
            metrics::gauge!("resilience_connection_state", "connection" => connection.to_owned())
                .set(connection_gauge(*to));
        }
        self.bump(format!("connection.{connection}.{}", event.name()), 1);
    }

    /// A slow consumer lost its oldest buffered message.
    pub fn queue_evicted(&self, connection: &str, channel: &str) {
        metrics::counter!(
            "resilience_queue_evictions_total",
            "connection" => connection.to_owned(),
            "channel" => channel.to_owned()
        )
        .increment(1);
        self.bump(format!("connection.{connection}.evicted"), 1);
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.counters.get(key).map(|value| *value).unwrap_or(0)
    }

    /// Point-in-time copy of every counter, sorted by key.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn reset(&self) {
        self.counters.clear();
    }

    fn bump(&self, key: String, by: u64) {
        *self.counters.entry(key).or_insert(0) += by;
    }
}

impl fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrumentation")
            .field("counters", &self.counters.len())
            .finish()
    }
}

fn state_gauge(state: &str) -> f64 {
    match state {
        "closed" => 0.0,
        "half_open" => 1.0,
        _ => 2.0,
    }
}

fn connection_gauge(state: ConnectionState) -> f64 {
    match state {
        ConnectionState::Disconnected => 0.0,
        ConnectionState::Connecting => 1.0,
        ConnectionState::Connected => 2.0,
        ConnectionState::Reconnecting => 3.0,
        ConnectionState::Closed => 4.0,
    }
}

/// Install the process-wide instance. Calling it again returns the existing one.
pub fn initialize() -> Arc<Instrumentation> {
    let mut slot = GLOBAL.write().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(slot.get_or_insert_with(|| Arc::new(Instrumentation::new())))
}

pub fn is_initialized() -> bool {
    GLOBAL
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some()
}

pub fn global() -> Option<Arc<Instrumentation>> {
    GLOBAL.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Drop the process-wide instance. Components holding a clone keep recording into it.
pub fn teardown() {
    GLOBAL.write().unwrap_or_else(PoisonError::into_inner).take();
}
