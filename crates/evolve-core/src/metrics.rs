//! Global atomic counters for pipeline observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. after each daemon tick).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocation or locking.
pub struct Metrics {
    cycles_started: AtomicU64,
    cycles_failed: AtomicU64,
    candidates_generated: AtomicU64,
    candidates_promoted: AtomicU64,
    generation_calls: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            cycles_started: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
            candidates_generated: AtomicU64::new(0),
            candidates_promoted: AtomicU64::new(0),
            generation_calls: AtomicU64::new(0),
        }
    }

    pub fn inc_cycles_started(&self) {
        self.cycles_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cycles_started", "counter incremented");
    }

    pub fn inc_cycles_failed(&self) {
        self.cycles_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cycles_failed", "counter incremented");
    }

    pub fn add_candidates_generated(&self, n: u64) {
        self.candidates_generated.fetch_add(n, Ordering::Relaxed);
        tracing::trace!(metric = "candidates_generated", n, "counter incremented");
    }

    pub fn inc_candidates_promoted(&self) {
        self.candidates_promoted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "candidates_promoted", "counter incremented");
    }

    pub fn inc_generation_calls(&self) {
        self.generation_calls.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "generation_calls", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            cycles_started = self.cycles_started(),
            cycles_failed = self.cycles_failed(),
            candidates_generated = self.candidates_generated(),
            candidates_promoted = self.candidates_promoted(),
            generation_calls = self.generation_calls(),
        );
    }

    pub fn cycles_started(&self) -> u64 {
        self.cycles_started.load(Ordering::Relaxed)
    }

    pub fn cycles_failed(&self) -> u64 {
        self.cycles_failed.load(Ordering::Relaxed)
    }

    pub fn candidates_generated(&self) -> u64 {
        self.candidates_generated.load(Ordering::Relaxed)
    }

    pub fn candidates_promoted(&self) -> u64 {
        self.candidates_promoted.load(Ordering::Relaxed)
    }

    pub fn generation_calls(&self) -> u64 {
        self.generation_calls.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.cycles_started.store(0, Ordering::Relaxed);
        self.cycles_failed.store(0, Ordering::Relaxed);
        self.candidates_generated.store(0, Ordering::Relaxed);
        self.candidates_promoted.store(0, Ordering::Relaxed);
        self.generation_calls.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_cycles_started();
        m.inc_cycles_started();
        m.inc_cycles_failed();
        m.add_candidates_generated(3);
        m.inc_candidates_promoted();
        m.inc_generation_calls();
        assert_eq!(m.cycles_started(), 2);
        assert_eq!(m.cycles_failed(), 1);
        assert_eq!(m.candidates_generated(), 3);
        assert_eq!(m.candidates_promoted(), 1);
        assert_eq!(m.generation_calls(), 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_cycles_started();
        m.add_candidates_generated(2);
        m.reset();
        assert_eq!(m.cycles_started(), 0);
        assert_eq!(m.candidates_generated(), 0);
    }
}
