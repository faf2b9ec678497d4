//! Evolution cycle orchestration.
//!
//! [`EvolutionOrchestrator`] drives one subject through
//! analyze → generate → test → decide, persisting the cycle and its
//! candidates at every step, and exposes the review and maintenance
//! operations the control surfaces call.
//!
//! Every status change goes through the transition tables in
//! [`crate::domain::lifecycle`]. The production instruction set is only
//! written through [`InstructionStore::write_with_history`] with the version
//! the writer last saw, so concurrent promotions cannot silently overwrite
//! each other.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{Duration, Utc};
use evolve_state::fakes::{
    MemoryEvolutionStore, MemoryFeedbackStore, MemoryInstructionStore, MemoryTestCaseStore,
};
use evolve_state::{
    CandidateStatus, ChangeMetadata, CycleStatus, EvolutionConfig, EvolutionCycle,
    EvolutionStore, FeedbackStore, InstructionSet, InstructionStore, InstructionVersion,
    PromptCandidate, QualityGates, ReviewRecord, StorageError, TestCaseStore,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn, Instrument};

use crate::candidate_generator::CandidateGenerator;
use crate::comparison::compare::at_least;
use crate::comparison::{evaluate_results, ComparativeTestRunner};
use crate::domain::{advance, advance_candidate, CandidateEvent, CycleEvent, EvolveError, Result};
use crate::feedback_analyzer::{FeedbackAnalyzer, DEFAULT_WINDOW_DAYS};
use crate::generation::TextGeneration;
use crate::metrics::METRICS;
use crate::obs::{self, CycleSpan};

/// Reviewer name recorded on automatic decisions.
pub const SYSTEM_ACTOR: &str = "evolution-orchestrator";

/// How many recent cycles are scanned for one still marked running.
const RUNNING_SCAN_LIMIT: usize = 50;
const STATUS_RECENT_CYCLES: usize = 10;

/// Minutes without an update after which a running cycle not owned by this
/// process is treated as orphaned.
pub const STALE_CYCLE_AFTER_MINUTES: i64 = 120;

const STALE_CYCLE_MESSAGE: &str = "stale cycle recovered";

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// The four stores the pipeline reads and writes.
#[derive(Clone)]
pub struct Stores {
    pub instructions: Arc<dyn InstructionStore>,
    pub feedback: Arc<dyn FeedbackStore>,
    pub test_cases: Arc<dyn TestCaseStore>,
    pub evolution: Arc<dyn EvolutionStore>,
}

impl Stores {
    /// Fresh in-memory fakes.
    pub fn in_memory() -> Self {
        Self {
            instructions: Arc::new(MemoryInstructionStore::new()),
            feedback: Arc::new(MemoryFeedbackStore::new()),
            test_cases: Arc::new(MemoryTestCaseStore::new()),
            evolution: Arc::new(MemoryEvolutionStore::new()),
        }
    }

    /// One backend serving every store (e.g. `SurrealEvolutionStore`).
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: InstructionStore + FeedbackStore + TestCaseStore + EvolutionStore + 'static,
    {
        Self {
            instructions: store.clone(),
            feedback: store.clone(),
            test_cases: store.clone(),
            evolution: store,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What a cycle request produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleOutcome {
    pub subject_id: String,
    /// `None` when the subject was ineligible and no cycle was recorded.
    pub cycle_id: Option<String>,
    pub status: CycleStatus,
    /// Ineligibility reason or failure message.
    pub reason: Option<String>,
    pub candidates_generated: u32,
    pub candidates_passed: u32,
    pub best_candidate_id: Option<String>,
    pub best_improvement: Option<f64>,
    pub promoted_candidate_id: Option<String>,
    pub pending_review: u32,
}

impl CycleOutcome {
    fn ineligible(subject_id: &str, reason: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            cycle_id: None,
            status: CycleStatus::Failed,
            reason: Some(reason.into()),
            candidates_generated: 0,
            candidates_passed: 0,
            best_candidate_id: None,
            best_improvement: None,
            promoted_candidate_id: None,
            pending_review: 0,
        }
    }

    fn from_cycle(cycle: &EvolutionCycle, pending_review: u32) -> Self {
        Self {
            subject_id: cycle.subject_id.clone(),
            cycle_id: Some(cycle.cycle_id.clone()),
            status: cycle.status,
            reason: cycle.error_message.clone(),
            candidates_generated: cycle.candidates_generated,
            candidates_passed: cycle.candidates_passed,
            best_candidate_id: cycle.best_candidate_id.clone(),
            best_improvement: cycle.best_improvement,
            promoted_candidate_id: cycle.promoted_candidate_id.clone(),
            pending_review,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == CycleStatus::Failed
    }
}

/// Totals for one pass over every enabled subject.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    /// Enabled subjects below their feedback minimum.
    pub skipped: u32,
    pub candidates_generated: u32,
    pub promoted: u32,
    pub pending_review: u32,
    pub outcomes: Vec<CycleOutcome>,
}

/// Snapshot of one subject's evolution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionStatus {
    pub subject_id: String,
    /// `None` until a cycle or config update creates one.
    pub config: Option<EvolutionConfig>,
    pub current_version: Option<InstructionVersion>,
    pub feedback_last_window: u64,
    pub cycle_in_progress: bool,
    pub recent_cycles: Vec<EvolutionCycle>,
    pub pending_candidates: Vec<PromptCandidate>,
}

/// Partial config change. Unset fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub enabled: Option<bool>,
    pub min_feedback_count: Option<u32>,
    pub min_improvement_threshold: Option<f64>,
    pub auto_promote_threshold: Option<f64>,
    pub require_human_approval: Option<bool>,
    pub max_candidates_per_cycle: Option<u32>,
    pub max_regression_allowed: Option<f64>,
    pub min_test_pass_rate: Option<f64>,
}

pub const MAX_CANDIDATES_PER_CYCLE: u32 = 10;

fn check_range(name: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if !value.is_finite() || value < min || value > max {
        return Err(EvolveError::InvalidConfig(format!(
            "{name} must be between {min} and {max}, got {value}"
        )));
    }
    Ok(())
}

impl ConfigUpdate {
    /// Validate every set field, then apply them all.
    pub fn apply(&self, config: &mut EvolutionConfig) -> Result<()> {
        if let Some(v) = self.min_improvement_threshold {
            check_range("min_improvement_threshold", v, 0.0, 5.0)?;
        }
        if let Some(v) = self.auto_promote_threshold {
            check_range("auto_promote_threshold", v, 0.0, 5.0)?;
        }
        if let Some(v) = self.max_regression_allowed {
            check_range("max_regression_allowed", v, 0.0, 5.0)?;
        }
        if let Some(v) = self.min_test_pass_rate {
            check_range("min_test_pass_rate", v, 0.0, 1.0)?;
        }
        if let Some(n) = self.max_candidates_per_cycle {
            if n == 0 || n > MAX_CANDIDATES_PER_CYCLE {
                return Err(EvolveError::InvalidConfig(format!(
                    "max_candidates_per_cycle must be between 1 and {MAX_CANDIDATES_PER_CYCLE}, got {n}"
                )));
            }
        }

        if let Some(v) = self.enabled {
            config.enabled = v;
        }
        if let Some(v) = self.min_feedback_count {
            config.min_feedback_count = v;
        }
        if let Some(v) = self.min_improvement_threshold {
            config.min_improvement_threshold = v;
        }
        if let Some(v) = self.auto_promote_threshold {
            config.auto_promote_threshold = v;
        }
        if let Some(v) = self.require_human_approval {
            config.require_human_approval = v;
        }
        if let Some(v) = self.max_candidates_per_cycle {
            config.max_candidates_per_cycle = v;
        }
        if let Some(v) = self.max_regression_allowed {
            config.max_regression_allowed = v;
        }
        if let Some(v) = self.min_test_pass_rate {
            config.min_test_pass_rate = v;
        }
        config.updated_at = Utc::now();
        Ok(())
    }
}

fn gates_for(config: &EvolutionConfig) -> QualityGates {
    QualityGates {
        min_improvement_threshold: config.min_improvement_threshold,
        max_regression_allowed: config.max_regression_allowed,
        min_test_pass_rate: config.min_test_pass_rate,
    }
}

// ---------------------------------------------------------------------------
// In-process cycle claims
// ---------------------------------------------------------------------------

/// Subjects with a cycle executing in this process.
#[derive(Clone, Default)]
struct ActiveCycles {
    subjects: Arc<Mutex<HashSet<String>>>,
}

/// Releases the subject when dropped.
struct CycleClaim {
    subject_id: String,
    subjects: Arc<Mutex<HashSet<String>>>,
}

impl ActiveCycles {
    fn claim(&self, subject_id: &str) -> Option<CycleClaim> {
        let mut subjects = self.subjects.lock().unwrap_or_else(|e| e.into_inner());
        subjects.insert(subject_id.to_string()).then(|| CycleClaim {
            subject_id: subject_id.to_string(),
            subjects: self.subjects.clone(),
        })
    }

    fn is_active(&self, subject_id: &str) -> bool {
        self.subjects
            .lock()
            .map(|s| s.contains(subject_id))
            .unwrap_or(false)
    }
}

impl Drop for CycleClaim {
    fn drop(&mut self) {
        if let Ok(mut subjects) = self.subjects.lock() {
            subjects.remove(&self.subject_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct EvolutionOrchestrator {
    stores: Stores,
    analyzer: FeedbackAnalyzer,
    generator: CandidateGenerator,
    runner: ComparativeTestRunner,
    active: ActiveCycles,
    stale_after: Duration,
}

impl EvolutionOrchestrator {
    pub fn new(stores: Stores, generation: Arc<dyn TextGeneration>) -> Self {
        Self {
            analyzer: FeedbackAnalyzer::new(stores.feedback.clone(), generation.clone()),
            generator: CandidateGenerator::new(generation.clone()),
            runner: ComparativeTestRunner::new(generation, stores.test_cases.clone()),
            stores,
            active: ActiveCycles::default(),
            stale_after: Duration::minutes(STALE_CYCLE_AFTER_MINUTES),
        }
    }

    /// How long a running cycle may go without an update before the next
    /// run for its subject fails it.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Replace the comparison runner (custom scorer or executor).
    pub fn with_runner(mut self, runner: ComparativeTestRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    async fn load_or_create_config(&self, subject_id: &str) -> Result<EvolutionConfig> {
        if let Some(config) = self.stores.evolution.get_config(subject_id).await? {
            return Ok(config);
        }
        let config = EvolutionConfig::with_defaults(subject_id);
        self.stores.evolution.save_config(&config).await?;
        info!(subject_id, "created default evolution config");
        Ok(config)
    }

    /// Run one full evolution cycle for `subject_id`.
    ///
    /// Ineligibility and in-cycle failures come back as a failed
    /// [`CycleOutcome`]. `Err` is reserved for problems before a cycle
    /// record exists: storage errors and a cycle already running.
    #[instrument(skip(self))]
    pub async fn run_evolution_cycle(
        &self,
        subject_id: &str,
        force_run: bool,
    ) -> Result<CycleOutcome> {
        let config = self.load_or_create_config(subject_id).await?;

        if !force_run {
            if !config.enabled {
                obs::emit_cycle_ineligible(subject_id, "evolution disabled");
                return Ok(CycleOutcome::ineligible(subject_id, "evolution disabled"));
            }
            if !self
                .analyzer
                .has_enough_feedback(subject_id, config.min_feedback_count)
                .await?
            {
                let reason = format!(
                    "fewer than {} feedback records in the last {DEFAULT_WINDOW_DAYS} days",
                    config.min_feedback_count
                );
                obs::emit_cycle_ineligible(subject_id, &reason);
                return Ok(CycleOutcome::ineligible(subject_id, reason));
            }
        }

        let _claim = self
            .active
            .claim(subject_id)
            .ok_or_else(|| EvolveError::CycleAlreadyRunning {
                subject_id: subject_id.to_string(),
            })?;

        // This process holds the claim, so any running record belongs to
        // another process or to one that died mid-cycle.
        let cutoff = Utc::now() - self.stale_after;
        let running = self
            .stores
            .evolution
            .list_cycles(Some(subject_id), RUNNING_SCAN_LIMIT)
            .await?
            .into_iter()
            .filter(|c| c.status.is_running());
        for mut other in running {
            if other.updated_at < cutoff {
                self.abandon(&mut other, STALE_CYCLE_MESSAGE).await?;
                continue;
            }
            if !force_run {
                return Err(EvolveError::CycleAlreadyRunning {
                    subject_id: subject_id.to_string(),
                });
            }
            warn!(cycle_id = %other.cycle_id, "forcing a cycle while another is marked running");
        }

        let mut cycle = EvolutionCycle::start(&config, force_run);
        self.stores.evolution.create_cycle(&cycle).await?;
        METRICS.inc_cycles_started();
        obs::emit_cycle_started(subject_id, &cycle.cycle_id, force_run);

        let span = CycleSpan::new(subject_id, &cycle.cycle_id);
        let started = Instant::now();
        let result = self
            .drive_cycle(&config, &mut cycle)
            .instrument(span.span())
            .await;

        let pending = match result {
            Ok(pending) => pending,
            Err(err) => {
                self.fail_cycle(&mut cycle, &err).await;
                0
            }
        };
        obs::emit_cycle_finished(
            &cycle.cycle_id,
            cycle.status,
            cycle.candidates_generated,
            cycle.candidates_passed,
            started.elapsed().as_millis() as u64,
        );
        Ok(CycleOutcome::from_cycle(&cycle, pending))
    }

    /// Steps of a cycle after its record exists. Returns the number of
    /// candidates left waiting for review.
    async fn drive_cycle(
        &self,
        config: &EvolutionConfig,
        cycle: &mut EvolutionCycle,
    ) -> Result<u32> {
        let subject_id = cycle.subject_id.clone();

        // analyzing
        let analysis = self
            .analyzer
            .analyze_agent_feedback(&subject_id, DEFAULT_WINDOW_DAYS)
            .await?;
        cycle.feedback_count = analysis.summary.total as u32;
        cycle.baseline_score =
            (analysis.summary.total > 0).then_some(analysis.summary.averages.overall);

        let current = self
            .stores
            .instructions
            .load_current(&subject_id)
            .await?
            .ok_or_else(|| EvolveError::MissingInstructions {
                subject_id: subject_id.clone(),
            })?;
        cycle.base_version_id = Some(current.version_id.clone());
        self.transition(cycle, CycleEvent::FeedbackAnalyzed).await?;

        // generating
        let batch = self
            .generator
            .generate_candidates(
                &current.instruction_set,
                &analysis,
                config.max_candidates_per_cycle as usize,
            )
            .await;
        if batch.candidates.is_empty() {
            return Err(EvolveError::NoCandidates {
                reason: batch.rationale,
            });
        }

        let mut candidates = Vec::with_capacity(batch.candidates.len());
        for generated in batch.candidates {
            let candidate = PromptCandidate::new(
                cycle,
                generated.instruction_set,
                generated.rationale,
                generated.warnings,
            );
            self.stores.evolution.insert_candidate(&candidate).await?;
            candidates.push(candidate);
        }
        cycle.candidates_generated = candidates.len() as u32;
        METRICS.add_candidates_generated(candidates.len() as u64);
        self.transition(cycle, CycleEvent::CandidatesReady).await?;

        // testing
        let suite = self.stores.test_cases.list_active(&subject_id).await?;
        let gates = gates_for(config);
        let mut best: Option<(usize, f64)> = None;

        for (index, candidate) in candidates.iter_mut().enumerate() {
            candidate.status = advance_candidate(candidate.status, CandidateEvent::StartTesting)?;
            candidate.updated_at = Utc::now();
            self.stores.evolution.update_candidate(candidate).await?;

            let ab = self
                .runner
                .run_comparison(
                    &subject_id,
                    &current.instruction_set,
                    &candidate.instruction_set,
                    Some(suite.clone()),
                )
                .await?;
            let gate = evaluate_results(&ab, &gates);
            let improvement = ab.comparison.overall_improvement();
            obs::emit_candidate_tested(
                &candidate.candidate_id,
                improvement,
                ab.comparison.regressions.len(),
                gate.recommendation,
            );
            obs::emit_gate_evaluated(&candidate.candidate_id, gate.passed, gate.confidence);

            let event = if gate.passed {
                cycle.candidates_passed += 1;
                CandidateEvent::GatesPassed
            } else {
                CandidateEvent::GatesFailed
            };
            candidate.status = advance_candidate(candidate.status, event)?;

            if gate.passed && best.map_or(true, |(_, b)| improvement > b) {
                best = Some((index, improvement));
            }

            candidate.improvement = Some(improvement);
            candidate.ab_result = Some(ab);
            candidate.gate_result = Some(gate);
            candidate.updated_at = Utc::now();
            self.stores.evolution.update_candidate(candidate).await?;
        }

        if let Some((index, improvement)) = best {
            cycle.best_candidate_id = Some(candidates[index].candidate_id.clone());
            cycle.best_improvement = Some(improvement);
        }

        // decide
        let auto_promote = best.filter(|&(_, improvement)| {
            !config.require_human_approval
                && at_least(improvement, config.auto_promote_threshold)
        });

        if let Some((winner_index, _)) = auto_promote {
            let winner_id = candidates[winner_index].candidate_id.clone();
            self.promote_candidate(
                &mut candidates[winner_index],
                SYSTEM_ACTOR,
                Some("auto-promoted".to_string()),
            )
            .await?;
            for candidate in candidates
                .iter_mut()
                .filter(|c| c.status == CandidateStatus::Passed)
            {
                self.close_candidate(
                    candidate,
                    SYSTEM_ACTOR,
                    format!("superseded by {winner_id}"),
                )
                .await?;
            }
            cycle.promoted_candidate_id = Some(winner_id);
            self.transition(cycle, CycleEvent::Complete).await?;
            return Ok(0);
        }

        let mut pending = 0;
        for candidate in candidates
            .iter_mut()
            .filter(|c| c.status == CandidateStatus::Passed)
        {
            candidate.status =
                advance_candidate(candidate.status, CandidateEvent::QueueForReview)?;
            candidate.updated_at = Utc::now();
            self.stores.evolution.update_candidate(candidate).await?;
            pending += 1;
        }

        let event = if pending > 0 {
            CycleEvent::AwaitReview
        } else {
            CycleEvent::Complete
        };
        self.transition(cycle, event).await?;
        Ok(pending)
    }

    /// Persist `cycle` in the state `event` leads to.
    ///
    /// The in-memory cycle only changes once the store accepted the update.
    async fn transition(&self, cycle: &mut EvolutionCycle, event: CycleEvent) -> Result<()> {
        let next = advance(cycle.status, event)?;
        let now = Utc::now();
        let mut updated = cycle.clone();
        updated.status = next;
        updated.updated_at = now;
        if next.is_terminal() {
            updated.completed_at = Some(now);
        }
        self.stores.evolution.update_cycle(&updated).await?;
        obs::emit_cycle_transition(&cycle.cycle_id, cycle.status, next);
        *cycle = updated;
        Ok(())
    }

    async fn fail_cycle(&self, cycle: &mut EvolutionCycle, err: &EvolveError) {
        METRICS.inc_cycles_failed();
        obs::emit_cycle_failed(&cycle.cycle_id, err);
        cycle.error_message = Some(err.to_string());
        if let Err(e) = self.transition(cycle, CycleEvent::Fail).await {
            warn!(cycle_id = %cycle.cycle_id, error = %e, "could not record cycle failure");
        }
    }

    /// Fail a cycle that is not executing here. Its candidates stay as they are.
    async fn abandon(&self, cycle: &mut EvolutionCycle, reason: &str) -> Result<()> {
        let previous = cycle.error_message.replace(reason.to_string());
        if let Err(e) = self.transition(cycle, CycleEvent::Fail).await {
            cycle.error_message = previous;
            return Err(e);
        }
        METRICS.inc_cycles_failed();
        warn!(
            cycle_id = %cycle.cycle_id,
            subject_id = %cycle.subject_id,
            reason,
            "running cycle abandoned"
        );
        Ok(())
    }

    /// Append a candidate's instruction set as the new production version.
    async fn promote_candidate(
        &self,
        candidate: &mut PromptCandidate,
        promoted_by: &str,
        notes: Option<String>,
    ) -> Result<InstructionVersion> {
        let next = advance_candidate(candidate.status, CandidateEvent::Promote)?;

        let mut change =
            ChangeMetadata::new(promoted_by).with_candidate(candidate.candidate_id.clone());
        if let Some(n) = &notes {
            change = change.with_notes(n.clone());
        }
        let version = self
            .stores
            .instructions
            .write_with_history(
                &candidate.subject_id,
                candidate.base_version_id.as_deref(),
                candidate.instruction_set.clone(),
                change,
            )
            .await?;

        let now = Utc::now();
        candidate.status = next;
        candidate.review = Some(ReviewRecord {
            reviewer: promoted_by.to_string(),
            notes,
            reviewed_at: now,
        });
        candidate.updated_at = now;
        self.stores.evolution.update_candidate(candidate).await?;

        METRICS.inc_candidates_promoted();
        obs::emit_candidate_promoted(
            &candidate.subject_id,
            &candidate.candidate_id,
            &version.version_id,
            promoted_by,
        );
        Ok(version)
    }

    async fn close_candidate(
        &self,
        candidate: &mut PromptCandidate,
        reviewer: &str,
        notes: String,
    ) -> Result<()> {
        candidate.status = advance_candidate(candidate.status, CandidateEvent::Reject)?;
        let now = Utc::now();
        candidate.review = Some(ReviewRecord {
            reviewer: reviewer.to_string(),
            notes: Some(notes),
            reviewed_at: now,
        });
        candidate.updated_at = now;
        self.stores.evolution.update_candidate(candidate).await?;
        Ok(())
    }

    /// Run a cycle for every enabled subject with enough feedback, one at a time.
    #[instrument(skip(self))]
    pub async fn run_all_eligible_agents(&self) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();
        for config in self.stores.evolution.list_configs().await? {
            if !config.enabled {
                continue;
            }
            if !self
                .analyzer
                .has_enough_feedback(&config.subject_id, config.min_feedback_count)
                .await?
            {
                summary.skipped += 1;
                continue;
            }

            summary.processed += 1;
            match self.run_evolution_cycle(&config.subject_id, false).await {
                Ok(outcome) => {
                    if outcome.is_failed() {
                        summary.failed += 1;
                    } else {
                        summary.succeeded += 1;
                    }
                    summary.candidates_generated += outcome.candidates_generated;
                    summary.pending_review += outcome.pending_review;
                    if outcome.promoted_candidate_id.is_some() {
                        summary.promoted += 1;
                    }
                    summary.outcomes.push(outcome);
                }
                Err(e) => {
                    warn!(subject_id = %config.subject_id, error = %e, "cycle could not start");
                    summary.failed += 1;
                    summary
                        .outcomes
                        .push(CycleOutcome::ineligible(&config.subject_id, e.to_string()));
                }
            }
        }
        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            promoted = summary.promoted,
            "batch finished"
        );
        Ok(summary)
    }

    pub async fn get_evolution_status(&self, subject_id: &str) -> Result<EvolutionStatus> {
        let since = Utc::now() - Duration::days(i64::from(DEFAULT_WINDOW_DAYS));
        Ok(EvolutionStatus {
            subject_id: subject_id.to_string(),
            config: self.stores.evolution.get_config(subject_id).await?,
            current_version: self.stores.instructions.load_current(subject_id).await?,
            feedback_last_window: self.stores.feedback.count(subject_id, since).await?,
            cycle_in_progress: self.active.is_active(subject_id),
            recent_cycles: self
                .stores
                .evolution
                .list_cycles(Some(subject_id), STATUS_RECENT_CYCLES)
                .await?,
            pending_candidates: self
                .stores
                .evolution
                .list_candidates_by_status(Some(subject_id), CandidateStatus::PendingReview)
                .await?,
        })
    }

    /// Promote a reviewed candidate.
    ///
    /// Production must still be at the version the candidate was tested
    /// against. Pending siblings are rejected as superseded and the cycle
    /// completes.
    #[instrument(skip(self, notes))]
    pub async fn approve_candidate(
        &self,
        candidate_id: &str,
        reviewer: &str,
        notes: Option<String>,
    ) -> Result<InstructionVersion> {
        let mut candidate = self.stores.evolution.get_candidate(candidate_id).await?;
        advance_candidate(candidate.status, CandidateEvent::Promote)?;

        let mut cycle = self.stores.evolution.get_cycle(&candidate.cycle_id).await?;
        if cycle.status.is_running() {
            return Err(EvolveError::CycleStillRunning {
                cycle_id: cycle.cycle_id,
            });
        }

        let current = self
            .stores
            .instructions
            .load_current(&candidate.subject_id)
            .await?
            .ok_or_else(|| EvolveError::MissingInstructions {
                subject_id: candidate.subject_id.clone(),
            })?;
        if candidate.base_version_id.as_deref() != Some(current.version_id.as_str()) {
            return Err(EvolveError::StaleCandidate {
                candidate_id: candidate.candidate_id.clone(),
                tested: candidate.base_version_id.clone(),
                current: Some(current.version_id),
            });
        }

        let version = self.promote_candidate(&mut candidate, reviewer, notes).await?;

        let siblings = self.stores.evolution.list_candidates(&cycle.cycle_id).await?;
        for mut sibling in siblings.into_iter().filter(|c| {
            c.candidate_id != candidate.candidate_id && c.status == CandidateStatus::PendingReview
        }) {
            self.close_candidate(
                &mut sibling,
                reviewer,
                format!("superseded by {}", candidate.candidate_id),
            )
            .await?;
        }

        if cycle.status == CycleStatus::Reviewing {
            cycle.promoted_candidate_id = Some(candidate.candidate_id.clone());
            self.transition(&mut cycle, CycleEvent::Complete).await?;
        }
        Ok(version)
    }

    /// Reject a candidate. A reviewing cycle completes once nothing is pending.
    #[instrument(skip(self, reason))]
    pub async fn reject_candidate(
        &self,
        candidate_id: &str,
        reviewer: &str,
        reason: Option<String>,
    ) -> Result<PromptCandidate> {
        let mut candidate = self.stores.evolution.get_candidate(candidate_id).await?;
        candidate.status = advance_candidate(candidate.status, CandidateEvent::Reject)?;
        let now = Utc::now();
        candidate.review = Some(ReviewRecord {
            reviewer: reviewer.to_string(),
            notes: reason,
            reviewed_at: now,
        });
        candidate.updated_at = now;
        self.stores.evolution.update_candidate(&candidate).await?;

        let mut cycle = self.stores.evolution.get_cycle(&candidate.cycle_id).await?;
        if cycle.status == CycleStatus::Reviewing {
            let still_pending = self
                .stores
                .evolution
                .list_candidates(&cycle.cycle_id)
                .await?
                .iter()
                .any(|c| c.status == CandidateStatus::PendingReview);
            if !still_pending {
                self.transition(&mut cycle, CycleEvent::Complete).await?;
            }
        }
        Ok(candidate)
    }

    pub async fn update_config(
        &self,
        subject_id: &str,
        update: ConfigUpdate,
    ) -> Result<EvolutionConfig> {
        let mut config = self.load_or_create_config(subject_id).await?;
        update.apply(&mut config)?;
        self.stores.evolution.save_config(&config).await?;
        info!(subject_id, "evolution config updated");
        Ok(config)
    }

    pub async fn list_cycles(
        &self,
        subject_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EvolutionCycle>> {
        Ok(self.stores.evolution.list_cycles(subject_id, limit).await?)
    }

    pub async fn get_pending_candidates(
        &self,
        subject_id: Option<&str>,
    ) -> Result<Vec<PromptCandidate>> {
        Ok(self
            .stores
            .evolution
            .list_candidates_by_status(subject_id, CandidateStatus::PendingReview)
            .await?)
    }

    /// Every production version of a subject, newest first.
    pub async fn instruction_history(&self, subject_id: &str) -> Result<Vec<InstructionVersion>> {
        Ok(self.stores.instructions.history(subject_id).await?)
    }

    /// Operator write of a new production instruction set.
    pub async fn set_instructions(
        &self,
        subject_id: &str,
        set: InstructionSet,
        changed_by: &str,
        notes: Option<String>,
    ) -> Result<InstructionVersion> {
        let current = self.stores.instructions.load_current(subject_id).await?;
        let mut change = ChangeMetadata::new(changed_by);
        if let Some(n) = notes {
            change = change.with_notes(n);
        }
        Ok(self
            .stores
            .instructions
            .write_with_history(
                subject_id,
                current.as_ref().map(|v| v.version_id.as_str()),
                set,
                change,
            )
            .await?)
    }

    /// Re-append the version before the current one. History is never rewritten.
    pub async fn rollback_instructions(
        &self,
        subject_id: &str,
        changed_by: &str,
    ) -> Result<InstructionVersion> {
        let history = self.stores.instructions.history(subject_id).await?;
        let (current, previous) = match history.as_slice() {
            [current, previous, ..] => (current, previous),
            _ => {
                return Err(StorageError::NoPreviousVersion {
                    subject_id: subject_id.to_string(),
                }
                .into())
            }
        };
        let change = ChangeMetadata::new(changed_by).with_notes(format!(
            "rollback to version {} ({})",
            previous.sequence, previous.version_id
        ));
        let version = self
            .stores
            .instructions
            .write_with_history(
                subject_id,
                Some(&current.version_id),
                previous.instruction_set.clone(),
                change,
            )
            .await?;
        info!(subject_id, version_id = %version.version_id, "instructions rolled back");
        Ok(version)
    }

    /// Mark a running cycle left behind by a dead process as failed.
    ///
    /// Refused while this process is executing a cycle for the same subject.
    #[instrument(skip(self))]
    pub async fn abandon_cycle(&self, cycle_id: &str, reason: &str) -> Result<EvolutionCycle> {
        let mut cycle = self.stores.evolution.get_cycle(cycle_id).await?;
        if self.active.is_active(&cycle.subject_id) {
            return Err(EvolveError::CycleStillRunning {
                cycle_id: cycle_id.to_string(),
            });
        }
        self.abandon(&mut cycle, reason).await?;
        Ok(cycle)
    }

    /// Delete a cycle and its candidates. Running cycles are refused.
    pub async fn delete_cycle(&self, cycle_id: &str) -> Result<usize> {
        let cycle = self.stores.evolution.get_cycle(cycle_id).await?;
        if cycle.status.is_running() {
            return Err(EvolveError::CycleStillRunning {
                cycle_id: cycle_id.to_string(),
            });
        }
        Ok(self.stores.evolution.delete_cycle(cycle_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_update_validates_before_applying() {
        let mut config = EvolutionConfig::with_defaults("writer");
        let update = ConfigUpdate {
            enabled: Some(false),
            min_test_pass_rate: Some(1.5),
            ..Default::default()
        };
        assert!(matches!(
            update.apply(&mut config),
            Err(EvolveError::InvalidConfig(_))
        ));
        assert!(config.enabled);
    }

    #[test]
    fn config_update_applies_set_fields_only() {
        let mut config = EvolutionConfig::with_defaults("writer");
        ConfigUpdate {
            require_human_approval: Some(false),
            max_candidates_per_cycle: Some(5),
            ..Default::default()
        }
        .apply(&mut config)
        .expect("valid update");
        assert!(!config.require_human_approval);
        assert_eq!(config.max_candidates_per_cycle, 5);
        assert_eq!(config.min_feedback_count, 10);
    }

    #[test]
    fn zero_candidates_is_invalid() {
        let mut config = EvolutionConfig::with_defaults("writer");
        let update = ConfigUpdate {
            max_candidates_per_cycle: Some(0),
            ..Default::default()
        };
        assert!(update.apply(&mut config).is_err());
    }

    #[test]
    fn claims_are_exclusive_and_released_on_drop() {
        let active = ActiveCycles::default();
        let claim = active.claim("writer").expect("first claim");
        assert!(active.claim("writer").is_none());
        assert!(active.claim("editor").is_some());
        assert!(active.is_active("writer"));
        drop(claim);
        assert!(!active.is_active("writer"));
        assert!(active.claim("writer").is_some());
    }
}
