//! Structured observability hooks for cycle lifecycle events.
//!
//! - `CycleSpan` tagging everything inside a cycle with its ids
//! - `emit_*` functions for lifecycle events (`event = "<name>"` field)

use evolve_state::{CycleStatus, Recommendation};
use tracing::{info, warn};

/// Cycle-scoped span.
///
/// Holds an owned span rather than an `EnteredSpan` so it can cross `.await`
/// points; attach it to async bodies with `tracing::Instrument`.
pub struct CycleSpan {
    span: tracing::Span,
}

impl CycleSpan {
    pub fn new(subject_id: &str, cycle_id: &str) -> Self {
        Self {
            span: tracing::info_span!("evolve.cycle", subject_id = %subject_id, cycle_id = %cycle_id),
        }
    }

    pub fn span(&self) -> tracing::Span {
        self.span.clone()
    }
}

pub fn emit_cycle_started(subject_id: &str, cycle_id: &str, forced: bool) {
    info!(event = "cycle.started", subject_id = %subject_id, cycle_id = %cycle_id, forced);
}

pub fn emit_cycle_transition(cycle_id: &str, from: CycleStatus, to: CycleStatus) {
    info!(event = "cycle.transition", cycle_id = %cycle_id, from = %from, to = %to);
}

pub fn emit_cycle_finished(
    cycle_id: &str,
    status: CycleStatus,
    candidates: u32,
    passed: u32,
    duration_ms: u64,
) {
    info!(
        event = "cycle.finished",
        cycle_id = %cycle_id,
        status = %status,
        candidates,
        passed,
        duration_ms,
    );
}

/// Warn level: the cycle ended in `failed`.
pub fn emit_cycle_failed(cycle_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "cycle.failed", cycle_id = %cycle_id, error = %error);
}

/// The subject was not eligible; no cycle record was created.
pub fn emit_cycle_ineligible(subject_id: &str, reason: &str) {
    info!(event = "cycle.ineligible", subject_id = %subject_id, reason = %reason);
}

pub fn emit_candidate_tested(
    candidate_id: &str,
    improvement: f64,
    regressions: usize,
    recommendation: Recommendation,
) {
    info!(
        event = "candidate.tested",
        candidate_id = %candidate_id,
        improvement,
        regressions,
        recommendation = %recommendation,
    );
}

pub fn emit_gate_evaluated(candidate_id: &str, passed: bool, confidence: f64) {
    info!(event = "gate.evaluated", candidate_id = %candidate_id, passed, confidence);
}

pub fn emit_candidate_promoted(subject_id: &str, candidate_id: &str, version_id: &str, by: &str) {
    info!(
        event = "candidate.promoted",
        subject_id = %subject_id,
        candidate_id = %candidate_id,
        version_id = %version_id,
        promoted_by = %by,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_span_create() {
        let guard = CycleSpan::new("writer", "cycle-1");
        let _entered = guard.span().entered();
    }
}
