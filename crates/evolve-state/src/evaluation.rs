//! Comparison value objects embedded in candidate records.
//!
//! None of these are persisted on their own: an `AbTestResult` and a
//! `QualityGateResult` live inside the `PromptCandidate` they describe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schema::{Dimension, DimensionScores};

/// Result of running one variant against one test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRun {
    pub case_id: String,
    pub case_name: String,
    pub scores: DimensionScores,
    pub passed: bool,
    /// Parsed model output, when the response contained a JSON object.
    pub output: Option<serde_json::Value>,
    /// Generation or parse failure, recorded instead of aborting the run.
    pub error: Option<String>,
    pub latency_ms: u64,
}

impl CaseRun {
    /// A run that produced nothing usable; scores zero and does not pass.
    pub fn failed(case_id: &str, case_name: &str, error: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            case_id: case_id.to_string(),
            case_name: case_name.to_string(),
            scores: DimensionScores::default(),
            passed: false,
            output: None,
            error: Some(error.into()),
            latency_ms,
        }
    }
}

/// Baseline and candidate runs for the same case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CasePair {
    pub baseline: CaseRun,
    pub candidate: CaseRun,
}

impl CasePair {
    /// Candidate minus baseline, per dimension.
    pub fn delta(&self) -> DimensionScores {
        self.candidate.scores.minus(&self.baseline.scores)
    }
}

/// Aggregate over all cases for one variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestRunSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub pass_rate: f64,
    pub mean_scores: DimensionScores,
    pub wall_clock_ms: u64,
}

/// A per-case, per-dimension score drop larger than the regression margin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Regression {
    pub case_id: String,
    pub case_name: String,
    pub dimension: Dimension,
    pub baseline: f64,
    pub candidate: f64,
    /// `baseline - candidate`; always positive.
    pub magnitude: f64,
}

/// Candidate-versus-baseline comparison.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestComparison {
    /// Candidate mean minus baseline mean, per dimension.
    pub improvement: DimensionScores,
    pub pass_rate_delta: f64,
    pub improved_cases: u32,
    pub regressed_cases: u32,
    pub unchanged_cases: u32,
    pub regressions: Vec<Regression>,
    pub significant: bool,
}

impl TestComparison {
    pub fn overall_improvement(&self) -> f64 {
        self.improvement.overall
    }

    /// Largest single regression magnitude, 0 when there are none.
    pub fn max_regression(&self) -> f64 {
        self.regressions
            .iter()
            .map(|r| r.magnitude)
            .fold(0.0, f64::max)
    }
}

/// What to do with a candidate after comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Promote,
    Review,
    MoreTesting,
    Reject,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Promote => "promote",
            Recommendation::Review => "review",
            Recommendation::MoreTesting => "more_testing",
            Recommendation::Reject => "reject",
        }
    }
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Full A/B comparison of a candidate against the production baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbTestResult {
    pub baseline: TestRunSummary,
    pub candidate: TestRunSummary,
    pub cases: Vec<CasePair>,
    pub comparison: TestComparison,
    pub recommendation: Recommendation,
    pub executed_at: DateTime<Utc>,
}

impl AbTestResult {
    /// Result for an empty suite: all zeros, needs more testing.
    pub fn empty() -> Self {
        Self {
            baseline: TestRunSummary::default(),
            candidate: TestRunSummary::default(),
            cases: Vec::new(),
            comparison: TestComparison::default(),
            recommendation: Recommendation::MoreTesting,
            executed_at: Utc::now(),
        }
    }
}

/// Named quality gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    MinImprovementThreshold,
    MaxRegressionAllowed,
    MinTestPassRate,
}

impl GateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateKind::MinImprovementThreshold => "min_improvement_threshold",
            GateKind::MaxRegressionAllowed => "max_regression_allowed",
            GateKind::MinTestPassRate => "min_test_pass_rate",
        }
    }
}

/// Gate thresholds, usually taken from the subject's `EvolutionConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityGates {
    pub min_improvement_threshold: f64,
    pub max_regression_allowed: f64,
    pub min_test_pass_rate: f64,
}

impl Default for QualityGates {
    fn default() -> Self {
        Self {
            min_improvement_threshold: 0.1,
            max_regression_allowed: 1.5,
            min_test_pass_rate: 0.8,
        }
    }
}

/// Outcome of a single gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateCheck {
    pub gate: GateKind,
    pub passed: bool,
    pub actual: f64,
    pub threshold: f64,
    pub message: String,
}

/// Outcome of all gates plus the adjusted recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGateResult {
    pub passed: bool,
    pub checks: Vec<GateCheck>,
    /// Comparison recommendation, downgraded from promote when a gate fails.
    pub recommendation: Recommendation,
    /// 0–1.
    pub confidence: f64,
}

impl QualityGateResult {
    pub fn failed_gates(&self) -> Vec<GateKind> {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.gate)
            .collect()
    }
}
