//! Cycle and candidate state machines.
//!
//! All status changes go through [`advance`] / [`advance_candidate`], which
//! look the `(state, event)` pair up in a fixed transition table. Pairs that
//! are not in the table are errors; callers never assign statuses directly.

use evolve_state::{CandidateStatus, CycleStatus};
use serde::{Deserialize, Serialize};

use super::error::{EvolveError, Result};

/// Something that happened to a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleEvent {
    /// Feedback analysis finished.
    FeedbackAnalyzed,
    /// At least one valid candidate was generated and stored.
    CandidatesReady,
    /// Testing finished with candidates waiting on a reviewer.
    AwaitReview,
    /// Nothing left to decide (promoted, nothing eligible, or review resolved).
    Complete,
    /// Unrecoverable error while running.
    Fail,
}

impl CycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleEvent::FeedbackAnalyzed => "feedback_analyzed",
            CycleEvent::CandidatesReady => "candidates_ready",
            CycleEvent::AwaitReview => "await_review",
            CycleEvent::Complete => "complete",
            CycleEvent::Fail => "fail",
        }
    }
}

/// Apply `event` to a cycle in `status`.
pub fn advance(status: CycleStatus, event: CycleEvent) -> Result<CycleStatus> {
    use CycleEvent as E;
    use CycleStatus as S;

    let next = match (status, event) {
        (S::Analyzing, E::FeedbackAnalyzed) => S::Generating,
        (S::Generating, E::CandidatesReady) => S::Testing,
        (S::Testing, E::AwaitReview) => S::Reviewing,
        (S::Testing, E::Complete) => S::Completed,
        (S::Reviewing, E::Complete) => S::Completed,
        (s, E::Fail) if s.is_running() => S::Failed,
        (from, event) => {
            return Err(EvolveError::InvalidTransition {
                from,
                event: event.as_str().to_string(),
            })
        }
    };
    Ok(next)
}

/// Something that happened to a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateEvent {
    StartTesting,
    GatesPassed,
    GatesFailed,
    QueueForReview,
    Promote,
    Reject,
}

impl CandidateEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateEvent::StartTesting => "start_testing",
            CandidateEvent::GatesPassed => "gates_passed",
            CandidateEvent::GatesFailed => "gates_failed",
            CandidateEvent::QueueForReview => "queue_for_review",
            CandidateEvent::Promote => "promote",
            CandidateEvent::Reject => "reject",
        }
    }
}

/// Apply `event` to a candidate in `status`.
pub fn advance_candidate(status: CandidateStatus, event: CandidateEvent) -> Result<CandidateStatus> {
    use CandidateEvent as E;
    use CandidateStatus as S;

    let next = match (status, event) {
        (S::Pending, E::StartTesting) => S::Testing,
        (S::Testing, E::GatesPassed) => S::Passed,
        (S::Testing, E::GatesFailed) => S::Failed,
        (S::Passed, E::QueueForReview) => S::PendingReview,
        (S::Passed | S::PendingReview, E::Promote) => S::Promoted,
        (S::Passed | S::PendingReview, E::Reject) => S::Rejected,
        (from, event) => {
            return Err(EvolveError::InvalidCandidateTransition {
                from,
                event: event.as_str().to_string(),
            })
        }
    };
    Ok(next)
}
