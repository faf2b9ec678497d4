//! Evolve-State: persistence layer for agent instruction evolution
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: data integrity for the one piece of shared mutable state (the
//! production instruction set, kept as an append-only version history) and
//! for cycle/candidate records.
//!
//! ## Key Components
//!
//! - `storage_traits`: `InstructionStore`, `FeedbackStore`, `TestCaseStore`, `EvolutionStore`
//! - `fakes`: in-memory implementations for tests and local runs
//! - `SurrealHandle` / `SurrealEvolutionStore`: SurrealDB backend
//! - `schema` / `evaluation`: records and the value objects embedded in them

mod error;
pub mod evaluation;
pub mod fakes;
mod handle;
pub mod schema;
pub mod storage_traits;
pub mod surreal_stores;

pub use error::{StateError, StorageError};
pub use evaluation::{
    AbTestResult, CasePair, CaseRun, GateCheck, GateKind, QualityGateResult, QualityGates,
    Recommendation, Regression, TestComparison, TestRunSummary,
};
pub use handle::{CloudConfig, SurrealHandle};
pub use schema::{
    CandidateStatus, ChangeMetadata, CycleStatus, Dimension, DimensionScores, EvolutionConfig,
    EvolutionCycle, ExpectedCriteria, FeedbackRecord, InstructionSet, InstructionVersion,
    MinScores, PromptCandidate, PromptTemplate, ReviewRecord, TestCase,
};
pub use storage_traits::{
    ContentDigest, EvolutionStore, FeedbackStore, InstructionStore, StorageResult, TestCaseStore,
};
pub use surreal_stores::SurrealEvolutionStore;

/// Result type for connection-level operations
pub type Result<T> = std::result::Result<T, StateError>;
