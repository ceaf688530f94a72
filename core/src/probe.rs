//! Probe permits for half-open circuits
//!
//! While a circuit is half-open only a bounded number of trial calls may be in flight;
//! everything else is rejected until those probes report back.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counting gate over concurrent probe calls
#[derive(Debug)]
pub struct ProbeGate {
    limit: usize,
    in_flight: AtomicUsize,
}

impl ProbeGate {
    /// # Panics
    ///
    /// Panics if `limit` is 0.
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "probe limit must be greater than 0");
        Self {
            limit,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Claim a probe slot, `None` when all slots are taken.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ProbePermit> {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.limit).then_some(current + 1)
            })
            .ok()
            .map(|_| ProbePermit {
                gate: Arc::clone(self),
            })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.in_flight())
    }
}

/// Releases its probe slot on drop, including on panic or cancellation
#[derive(Debug)]
pub struct ProbePermit {
    gate: Arc<ProbeGate>,
}

impl Drop for ProbePermit {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_single_probe_slot() {
        let gate = Arc::new(ProbeGate::new(1));

        let permit = gate.try_acquire().expect("first probe");
        assert!(gate.try_acquire().is_none());
        assert_eq!(gate.available(), 0);

        drop(permit);
        assert_eq!(gate.in_flight(), 0);
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn test_concurrent_probes_never_exceed_limit() {
        let gate = Arc::new(ProbeGate::new(3));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    if let Some(_permit) = gate.try_acquire() {
                        peak.fetch_max(gate.in_flight(), Ordering::SeqCst);
                        thread::sleep(std::time::Duration::from_millis(5));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn test_permit_released_on_panic() {
        let gate = Arc::new(ProbeGate::new(1));
        let inner = Arc::clone(&gate);

        let result = std::panic::catch_unwind(move || {
            let _permit = inner.try_acquire().unwrap();
            panic!("probe blew up");
        });

        assert!(result.is_err());
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    #[should_panic(expected = "probe limit must be greater than 0")]
    fn test_zero_limit_rejected() {
        ProbeGate::new(0);
    }
}
