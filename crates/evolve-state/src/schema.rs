//! Record schema for the evolution store
//!
//! Records:
//! - `InstructionVersion`: one entry in a subject's append-only instruction history
//! - `FeedbackRecord`: per-execution feedback (written by the platform, read here)
//! - `TestCase`: fixed comparison input with expected criteria and minimum scores
//! - `EvolutionConfig`: per-subject evolution policy
//! - `EvolutionCycle`: one improvement attempt
//! - `PromptCandidate`: a proposed replacement instruction set

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::evaluation::{AbTestResult, QualityGateResult};
use crate::storage_traits::ContentDigest;

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Scoring dimensions
// ---------------------------------------------------------------------------

/// Scored dimension of an agent output (all scores live on a 0–5 scale).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Overall,
    Relevance,
    Quality,
    Creativity,
}

impl Dimension {
    pub const ALL: [Dimension; 4] = [
        Dimension::Overall,
        Dimension::Relevance,
        Dimension::Quality,
        Dimension::Creativity,
    ];

    /// The dimensions feedback reviewers score individually.
    pub const DETAIL: [Dimension; 3] = [
        Dimension::Relevance,
        Dimension::Quality,
        Dimension::Creativity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Overall => "overall",
            Dimension::Relevance => "relevance",
            Dimension::Quality => "quality",
            Dimension::Creativity => "creativity",
        }
    }

    /// Parse a dimension name as produced by a model (case-insensitive).
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "overall" => Some(Dimension::Overall),
            "relevance" => Some(Dimension::Relevance),
            "quality" => Some(Dimension::Quality),
            "creativity" => Some(Dimension::Creativity),
            _ => None,
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One score per dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DimensionScores {
    pub overall: f64,
    pub relevance: f64,
    pub quality: f64,
    pub creativity: f64,
}

impl DimensionScores {
    pub fn new(overall: f64, relevance: f64, quality: f64, creativity: f64) -> Self {
        Self {
            overall,
            relevance,
            quality,
            creativity,
        }
    }

    pub fn get(&self, dimension: Dimension) -> f64 {
        match dimension {
            Dimension::Overall => self.overall,
            Dimension::Relevance => self.relevance,
            Dimension::Quality => self.quality,
            Dimension::Creativity => self.creativity,
        }
    }

    /// Component-wise `self - other`.
    pub fn minus(&self, other: &DimensionScores) -> DimensionScores {
        DimensionScores {
            overall: self.overall - other.overall,
            relevance: self.relevance - other.relevance,
            quality: self.quality - other.quality,
            creativity: self.creativity - other.creativity,
        }
    }

    /// Component-wise mean; all zeros for an empty slice.
    pub fn mean(scores: &[DimensionScores]) -> DimensionScores {
        if scores.is_empty() {
            return DimensionScores::default();
        }
        let n = scores.len() as f64;
        let sum = scores.iter().fold(DimensionScores::default(), |acc, s| {
            DimensionScores {
                overall: acc.overall + s.overall,
                relevance: acc.relevance + s.relevance,
                quality: acc.quality + s.quality,
                creativity: acc.creativity + s.creativity,
            }
        });
        DimensionScores {
            overall: sum.overall / n,
            relevance: sum.relevance / n,
            quality: sum.quality / n,
            creativity: sum.creativity / n,
        }
    }
}

// ---------------------------------------------------------------------------
// Instruction sets
// ---------------------------------------------------------------------------

/// A named prompt template. Order within an instruction set is significant:
/// the first template is the one test cases are rendered into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub name: String,
    pub body: String,
}

impl PromptTemplate {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }
}

/// System text + named templates (+ optional model options) driving a subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionSet {
    pub system_text: String,
    pub templates: Vec<PromptTemplate>,
    #[serde(default)]
    pub model_options: Option<serde_json::Value>,
}

impl InstructionSet {
    pub fn new(system_text: impl Into<String>) -> Self {
        Self {
            system_text: system_text.into(),
            templates: Vec::new(),
            model_options: None,
        }
    }

    pub fn with_template(mut self, name: impl Into<String>, body: impl Into<String>) -> Self {
        self.templates.push(PromptTemplate::new(name, body));
        self
    }

    pub fn with_model_options(mut self, options: serde_json::Value) -> Self {
        self.model_options = Some(options);
        self
    }

    pub fn template(&self, name: &str) -> Option<&PromptTemplate> {
        self.templates.iter().find(|t| t.name == name)
    }

    pub fn first_template(&self) -> Option<&PromptTemplate> {
        self.templates.first()
    }

    /// Template names in declaration order.
    pub fn template_names(&self) -> Vec<&str> {
        self.templates.iter().map(|t| t.name.as_str()).collect()
    }

    /// Content digest over a canonical encoding (templates keyed by name).
    pub fn digest(&self) -> ContentDigest {
        let templates: BTreeMap<&str, &str> = self
            .templates
            .iter()
            .map(|t| (t.name.as_str(), t.body.as_str()))
            .collect();
        let canonical = serde_json::json!({
            "system_text": self.system_text,
            "templates": templates,
            "template_order": self.template_names(),
            "model_options": self.model_options,
        });
        ContentDigest::from_bytes(canonical.to_string().as_bytes())
    }
}

/// Who changed an instruction set and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeMetadata {
    pub changed_by: String,
    pub notes: Option<String>,
    /// Candidate that produced this version, when it came from a cycle.
    pub candidate_id: Option<String>,
}

impl ChangeMetadata {
    pub fn new(changed_by: impl Into<String>) -> Self {
        Self {
            changed_by: changed_by.into(),
            notes: None,
            candidate_id: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_candidate(mut self, candidate_id: impl Into<String>) -> Self {
        self.candidate_id = Some(candidate_id.into());
        self
    }
}

/// One entry in a subject's instruction history.
///
/// The newest entry is the production instruction set. Entries are never
/// modified; each write appends a version that names its predecessor, so the
/// history doubles as the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionVersion {
    pub version_id: String,
    pub subject_id: String,
    /// 1 for the first version, incremented on every append.
    pub sequence: u64,
    pub previous_version_id: Option<String>,
    pub instruction_set: InstructionSet,
    pub digest: ContentDigest,
    pub change: ChangeMetadata,
    pub created_at: DateTime<Utc>,
}

impl InstructionVersion {
    /// Build the version that follows `previous` (or the first version).
    pub fn next(
        subject_id: &str,
        previous: Option<&InstructionVersion>,
        instruction_set: InstructionSet,
        change: ChangeMetadata,
    ) -> Self {
        let digest = instruction_set.digest();
        Self {
            version_id: new_id(),
            subject_id: subject_id.to_string(),
            sequence: previous.map(|p| p.sequence + 1).unwrap_or(1),
            previous_version_id: previous.map(|p| p.version_id.clone()),
            instruction_set,
            digest,
            change,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Feedback
// ---------------------------------------------------------------------------

/// Feedback left on a single execution of a subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    #[serde(default = "new_id")]
    pub feedback_id: String,
    pub subject_id: String,
    pub scores: DimensionScores,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl FeedbackRecord {
    pub fn new(subject_id: &str, scores: DimensionScores) -> Self {
        Self {
            feedback_id: new_id(),
            subject_id: subject_id.to_string(),
            scores,
            strengths: Vec::new(),
            weaknesses: Vec::new(),
            suggestions: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_weakness(mut self, weakness: impl Into<String>) -> Self {
        self.weaknesses.push(weakness.into());
        self
    }

    pub fn with_strength(mut self, strength: impl Into<String>) -> Self {
        self.strengths.push(strength.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Test cases
// ---------------------------------------------------------------------------

/// What a good output for a test case looks like.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpectedCriteria {
    /// Top-level fields that must be present and non-empty.
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Top-level fields that must equal the given value.
    #[serde(default)]
    pub expected_values: BTreeMap<String, serde_json::Value>,
    /// Terms the output text should mention.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Terms the output text must not mention.
    #[serde(default)]
    pub forbidden: Vec<String>,
    /// Minimum character count across all string values.
    #[serde(default)]
    pub min_length: Option<usize>,
}

/// Per-dimension minimum scores a variant must reach to pass a case.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinScores {
    pub overall: f64,
    pub relevance: f64,
    pub quality: f64,
}

impl Default for MinScores {
    fn default() -> Self {
        Self {
            overall: 3.0,
            relevance: 3.0,
            quality: 3.0,
        }
    }
}

impl MinScores {
    pub fn is_met_by(&self, scores: &DimensionScores) -> bool {
        scores.overall >= self.overall
            && scores.relevance >= self.relevance
            && scores.quality >= self.quality
    }
}

/// A fixed input used to compare two instruction sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default = "new_id")]
    pub case_id: String,
    pub subject_id: String,
    pub name: String,
    pub input: serde_json::Value,
    #[serde(default)]
    pub expected: ExpectedCriteria,
    #[serde(default)]
    pub min_scores: MinScores,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl TestCase {
    pub fn new(subject_id: &str, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            case_id: new_id(),
            subject_id: subject_id.to_string(),
            name: name.into(),
            input,
            expected: ExpectedCriteria::default(),
            min_scores: MinScores::default(),
            priority: 0,
            active: true,
        }
    }

    pub fn with_expected(mut self, expected: ExpectedCriteria) -> Self {
        self.expected = expected;
        self
    }

    pub fn with_min_scores(mut self, min_scores: MinScores) -> Self {
        self.min_scores = min_scores;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

// ---------------------------------------------------------------------------
// Evolution policy
// ---------------------------------------------------------------------------

/// Per-subject evolution policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionConfig {
    pub config_id: String,
    pub subject_id: String,
    pub enabled: bool,
    /// Feedback records (last 30 days) required before a cycle may run.
    pub min_feedback_count: u32,
    /// Gate: minimum overall improvement (0–5 scale).
    pub min_improvement_threshold: f64,
    /// Overall improvement at or above which promotion may happen unattended.
    pub auto_promote_threshold: f64,
    pub require_human_approval: bool,
    pub max_candidates_per_cycle: u32,
    /// Gate: largest tolerated single-case regression magnitude.
    pub max_regression_allowed: f64,
    /// Gate: minimum candidate pass rate (0–1).
    pub min_test_pass_rate: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EvolutionConfig {
    /// Default policy for a subject seen for the first time.
    pub fn with_defaults(subject_id: &str) -> Self {
        let now = Utc::now();
        Self {
            config_id: new_id(),
            subject_id: subject_id.to_string(),
            enabled: true,
            min_feedback_count: 10,
            min_improvement_threshold: 0.1,
            auto_promote_threshold: 0.3,
            require_human_approval: true,
            max_candidates_per_cycle: 3,
            max_regression_allowed: 1.5,
            min_test_pass_rate: 0.8,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Cycles
// ---------------------------------------------------------------------------

/// Lifecycle state of an evolution cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Analyzing,
    Generating,
    Testing,
    /// Candidates passed gates and wait for an explicit approve/reject.
    Reviewing,
    Completed,
    Failed,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Analyzing => "analyzing",
            CycleStatus::Generating => "generating",
            CycleStatus::Testing => "testing",
            CycleStatus::Reviewing => "reviewing",
            CycleStatus::Completed => "completed",
            CycleStatus::Failed => "failed",
        }
    }

    /// Whether the cycle is still executing pipeline steps.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            CycleStatus::Analyzing | CycleStatus::Generating | CycleStatus::Testing
        )
    }

    /// Terminal cycles are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CycleStatus::Completed | CycleStatus::Failed)
    }
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One end-to-end attempt to evolve a subject's instruction set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionCycle {
    pub cycle_id: String,
    pub subject_id: String,
    pub config_id: String,
    pub status: CycleStatus,
    pub forced: bool,
    pub feedback_count: u32,
    /// Mean overall feedback score at analysis time.
    pub baseline_score: Option<f64>,
    /// Production version the candidates were generated against.
    pub base_version_id: Option<String>,
    pub candidates_generated: u32,
    pub candidates_passed: u32,
    pub best_candidate_id: Option<String>,
    pub best_improvement: Option<f64>,
    pub promoted_candidate_id: Option<String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EvolutionCycle {
    pub fn start(config: &EvolutionConfig, forced: bool) -> Self {
        let now = Utc::now();
        Self {
            cycle_id: new_id(),
            subject_id: config.subject_id.clone(),
            config_id: config.config_id.clone(),
            status: CycleStatus::Analyzing,
            forced,
            feedback_count: 0,
            baseline_score: None,
            base_version_id: None,
            candidates_generated: 0,
            candidates_passed: 0,
            best_candidate_id: None,
            best_improvement: None,
            promoted_candidate_id: None,
            error_message: None,
            started_at: now,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

/// Lifecycle status of a prompt candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Pending,
    Testing,
    /// Passed gates; either about to be promoted or queued for review.
    Passed,
    Failed,
    PendingReview,
    Rejected,
    Promoted,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::Pending => "pending",
            CandidateStatus::Testing => "testing",
            CandidateStatus::Passed => "passed",
            CandidateStatus::Failed => "failed",
            CandidateStatus::PendingReview => "pending_review",
            CandidateStatus::Rejected => "rejected",
            CandidateStatus::Promoted => "promoted",
        }
    }
}

impl std::fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reviewer decision recorded on a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub reviewer: String,
    pub notes: Option<String>,
    pub reviewed_at: DateTime<Utc>,
}

/// A proposed replacement instruction set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptCandidate {
    pub candidate_id: String,
    pub cycle_id: String,
    pub subject_id: String,
    /// References the subject's policy; the candidate does not own it.
    pub config_id: String,
    /// Production version this candidate was generated against.
    pub base_version_id: Option<String>,
    pub instruction_set: InstructionSet,
    pub generation_rationale: String,
    /// Non-fatal validation findings from generation.
    pub warnings: Vec<String>,
    pub status: CandidateStatus,
    pub ab_result: Option<AbTestResult>,
    pub gate_result: Option<QualityGateResult>,
    pub improvement: Option<f64>,
    pub review: Option<ReviewRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PromptCandidate {
    pub fn new(
        cycle: &EvolutionCycle,
        instruction_set: InstructionSet,
        generation_rationale: impl Into<String>,
        warnings: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            candidate_id: new_id(),
            cycle_id: cycle.cycle_id.clone(),
            subject_id: cycle.subject_id.clone(),
            config_id: cycle.config_id.clone(),
            base_version_id: cycle.base_version_id.clone(),
            instruction_set,
            generation_rationale: generation_rationale.into(),
            warnings,
            status: CandidateStatus::Pending,
            ab_result: None,
            gate_result: None,
            improvement: None,
            review: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn passed_gates(&self) -> bool {
        self.gate_result.as_ref().map(|g| g.passed).unwrap_or(false)
    }
}
