//! Outcome storage for circuit breakers
//!
//! Breakers record each call outcome with a monotonic timestamp and ask the storage how
//! many successes and failures fall inside the rolling window. Several breakers can
//! share one backend; outcomes are keyed by circuit name.

use crate::{Event, EventKind};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::time::Instant;

/// Storage backend for breaker outcomes
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    fn record_success(&self, circuit_name: &str, duration: f64);

    fn record_failure(&self, circuit_name: &str, duration: f64);

    /// Successes with a timestamp inside the last `window_seconds`
    fn success_count(&self, circuit_name: &str, window_seconds: f64) -> usize;

    /// Failures with a timestamp inside the last `window_seconds`
    fn failure_count(&self, circuit_name: &str, window_seconds: f64) -> usize;

    /// Drop outcomes that fell out of the window.
    fn prune(&self, circuit_name: &str, window_seconds: f64);

    fn clear(&self, circuit_name: &str);

    fn clear_all(&self);

    /// Most recent `limit` outcomes, oldest first
    fn event_log(&self, circuit_name: &str, limit: usize) -> Vec<Event>;

    /// Seconds since the backend was created, never goes backwards
    fn monotonic_time(&self) -> f64;
}

/// In-memory outcome log with a per-circuit cap
#[derive(Debug)]
pub struct MemoryStorage {
    events: RwLock<HashMap<String, Vec<Event>>>,
    max_events: usize,
    // tokio's clock, so paused-time tests drive the window too
    start_time: Instant,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_max_events(1000)
    }

    pub fn with_max_events(max_events: usize) -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
            max_events: max_events.max(1),
            start_time: Instant::now(),
        }
    }

    fn record(&self, circuit_name: &str, kind: EventKind, duration: f64) {
        let timestamp = self.monotonic_time();
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        let log = events.entry(circuit_name.to_owned()).or_default();
        log.push(Event {
            kind,
            timestamp,
            duration,
        });

        if log.len() > self.max_events {
            let excess = log.len() - self.max_events;
            log.drain(..excess);
        }
    }

    fn count(&self, circuit_name: &str, kind: EventKind, window_seconds: f64) -> usize {
        let cutoff = self.monotonic_time() - window_seconds;
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(circuit_name)
            .map(|log| {
                log.iter()
                    .filter(|e| e.kind == kind && e.timestamp >= cutoff)
                    .count()
            })
            .unwrap_or(0)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryStorage {
    fn record_success(&self, circuit_name: &str, duration: f64) {
        self.record(circuit_name, EventKind::Success, duration);
    }

    fn record_failure(&self, circuit_name: &str, duration: f64) {
        self.record(circuit_name, EventKind::Failure, duration);
    }

    fn success_count(&self, circuit_name: &str, window_seconds: f64) -> usize {
        self.count(circuit_name, EventKind::Success, window_seconds)
    }

    fn failure_count(&self, circuit_name: &str, window_seconds: f64) -> usize {
        self.count(circuit_name, EventKind::Failure, window_seconds)
    }

    fn prune(&self, circuit_name: &str, window_seconds: f64) {
        let cutoff = self.monotonic_time() - window_seconds;
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(log) = events.get_mut(circuit_name) {
            // Timestamps are appended in order.
            let stale = log.partition_point(|e| e.timestamp < cutoff);
            log.drain(..stale);
            if log.is_empty() {
                events.remove(circuit_name);
            }
        }
    }

    fn clear(&self, circuit_name: &str) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(circuit_name);
    }

    fn clear_all(&self) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn event_log(&self, circuit_name: &str, limit: usize) -> Vec<Event> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(circuit_name)
            .map(|log| log[log.len().saturating_sub(limit)..].to_vec())
            .unwrap_or_default()
    }

    fn monotonic_time(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_counts_stay_inside_window() {
        let storage = MemoryStorage::new();

        storage.record_failure("bybit:orders", 0.1);
        storage.record_success("bybit:orders", 0.1);
        tokio::time::advance(Duration::from_secs(45)).await;
        storage.record_failure("bybit:orders", 0.1);

        assert_eq!(storage.failure_count("bybit:orders", 60.0), 2);
        assert_eq!(storage.failure_count("bybit:orders", 30.0), 1);
        assert_eq!(storage.success_count("bybit:orders", 30.0), 0);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(storage.failure_count("bybit:orders", 60.0), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_drops_stale_outcomes() {
        let storage = MemoryStorage::new();
        storage.record_failure("okx:market", 0.2);
        storage.record_failure("okx:market", 0.2);
        tokio::time::advance(Duration::from_secs(90)).await;
        storage.record_success("okx:market", 0.2);

        storage.prune("okx:market", 60.0);

        let log = storage.event_log("okx:market", 10);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, EventKind::Success);

        tokio::time::advance(Duration::from_secs(90)).await;
        storage.prune("okx:market", 60.0);
        assert!(storage.event_log("okx:market", 10).is_empty());
    }

    #[test]
    fn test_circuits_are_isolated() {
        let storage = MemoryStorage::new();
        storage.record_failure("a", 0.1);
        storage.record_failure("b", 0.1);
        storage.record_failure("b", 0.1);

        assert_eq!(storage.failure_count("a", 60.0), 1);
        assert_eq!(storage.failure_count("b", 60.0), 2);

        storage.clear("b");
        assert_eq!(storage.failure_count("b", 60.0), 0);
        assert_eq!(storage.failure_count("a", 60.0), 1);

        storage.clear_all();
        assert_eq!(storage.failure_count("a", 60.0), 0);
    }

    #[test]
    fn test_cap_keeps_newest() {
        let storage = MemoryStorage::with_max_events(3);
        for i in 0..5 {
            storage.record_success("capped", i as f64);
        }

        let durations: Vec<f64> = storage
            .event_log("capped", 10)
            .iter()
            .map(|e| e.duration)
            .collect();
        assert_eq!(durations, vec![2.0, 3.0, 4.0]);
        assert_eq!(storage.event_log("capped", 2).len(), 2);
    }
}
