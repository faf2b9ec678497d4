//! Domain-level error taxonomy for the evolution pipeline.

use evolve_state::{CandidateStatus, CycleStatus, StorageError};

use crate::generation::GenerationError;

/// Evolution pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum EvolveError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("illegal cycle transition: {event} from {from}")]
    InvalidTransition { from: CycleStatus, event: String },

    #[error("illegal candidate transition: {event} from {from}")]
    InvalidCandidateTransition { from: CandidateStatus, event: String },

    #[error("subject '{subject_id}' already has a running cycle")]
    CycleAlreadyRunning { subject_id: String },

    #[error("cycle {cycle_id} is still running")]
    CycleStillRunning { cycle_id: String },

    #[error("no instruction set found for subject '{subject_id}'")]
    MissingInstructions { subject_id: String },

    #[error("no valid candidates generated: {reason}")]
    NoCandidates { reason: String },

    #[error(
        "candidate {candidate_id} was tested against version {tested:?} but production is at {current:?}"
    )]
    StaleCandidate {
        candidate_id: String,
        tested: Option<String>,
        current: Option<String>,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

/// Result type for evolution operations.
pub type Result<T> = std::result::Result<T, EvolveError>;
