//! Evolve Core Library
//!
//! Feedback-driven evolution of agent instruction sets: analyze feedback,
//! generate candidate instructions, A/B test them against production, and
//! promote or queue them for review through an explicit cycle lifecycle.

pub mod candidate_generator;
pub mod comparison;
pub mod domain;
pub mod feedback_analyzer;
pub mod generation;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod parse;
pub mod telemetry;

pub use candidate_generator::{CandidateGenerator, GeneratedCandidate, GenerationOutcome};

pub use comparison::{
    evaluate_results, render_template, BoundedParallelExecutor, CaseExecutor,
    ComparativeTestRunner, CriteriaScorer, OutputScorer, SequentialExecutor,
};

pub use domain::{
    advance, advance_candidate, AnalysisSource, CandidateEvent, CycleEvent, EvolveError,
    FeedbackAnalysis, FeedbackSummary, FrequencyEntry, ImprovementPriority, Result,
    ScoreDistribution, Trend, WeakArea,
};

pub use feedback_analyzer::FeedbackAnalyzer;

pub use generation::{
    GenerationConfig, GenerationError, GenerationRequest, GenerationResponse,
    HttpTextGeneration, ScriptedGeneration, TextGeneration, TokenUsage,
};

pub use orchestrator::{
    BatchSummary, ConfigUpdate, CycleOutcome, EvolutionOrchestrator, EvolutionStatus, Stores,
    STALE_CYCLE_AFTER_MINUTES,
};

pub use parse::{parse_model_output, ParseOutcome};

pub use evolve_state::{
    AbTestResult, CandidateStatus, CycleStatus, Dimension, DimensionScores, EvolutionConfig,
    EvolutionCycle, ExpectedCriteria, FeedbackRecord, InstructionSet, InstructionVersion,
    MinScores, PromptCandidate, QualityGateResult, Recommendation, TestCase,
};
