//! Domain types for the evolution pipeline.

pub mod error;
pub mod feedback;
pub mod lifecycle;

pub use error::{EvolveError, Result};
pub use feedback::{
    AnalysisSource, FeedbackAnalysis, FeedbackSummary, FrequencyEntry, ImprovementPriority,
    ScoreDistribution, Trend, WeakArea,
};
pub use lifecycle::{advance, advance_candidate, CandidateEvent, CycleEvent};
