//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryInstructionStore`, `MemoryFeedbackStore`,
//! `MemoryTestCaseStore`, and `MemoryEvolutionStore` that satisfy the trait
//! contracts without any external dependencies.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::schema::{
    CandidateStatus, ChangeMetadata, EvolutionConfig, EvolutionCycle, FeedbackRecord,
    InstructionSet, InstructionVersion, PromptCandidate, TestCase,
};
use crate::storage_traits::*;

fn lock<T>(m: &Mutex<T>) -> StorageResult<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|e| StorageError::Backend(format!("lock poisoned: {e}")))
}

// ---------------------------------------------------------------------------
// MemoryInstructionStore
// ---------------------------------------------------------------------------

/// In-memory instruction store backed by `HashMap<subject, Vec<version>>`
/// (oldest first internally).
#[derive(Debug, Default)]
pub struct MemoryInstructionStore {
    versions: Mutex<HashMap<String, Vec<InstructionVersion>>>,
}

impl MemoryInstructionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstructionStore for MemoryInstructionStore {
    async fn load_current(&self, subject_id: &str) -> StorageResult<Option<InstructionVersion>> {
        let versions = lock(&self.versions)?;
        Ok(versions.get(subject_id).and_then(|h| h.last().cloned()))
    }

    async fn write_with_history(
        &self,
        subject_id: &str,
        expected_previous: Option<&str>,
        set: InstructionSet,
        change: ChangeMetadata,
    ) -> StorageResult<InstructionVersion> {
        let mut versions = lock(&self.versions)?;
        let history = versions.entry(subject_id.to_string()).or_default();
        let head = history.last();
        let head_id = head.map(|v| v.version_id.as_str());
        if head_id != expected_previous {
            return Err(StorageError::VersionConflict {
                subject_id: subject_id.to_string(),
                expected: expected_previous.map(str::to_string),
                actual: head_id.map(str::to_string),
            });
        }
        let version = InstructionVersion::next(subject_id, head, set, change);
        history.push(version.clone());
        Ok(version)
    }

    async fn history(&self, subject_id: &str) -> StorageResult<Vec<InstructionVersion>> {
        let versions = lock(&self.versions)?;
        let mut history = versions.get(subject_id).cloned().unwrap_or_default();
        history.reverse();
        Ok(history)
    }
}

// ---------------------------------------------------------------------------
// MemoryFeedbackStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryFeedbackStore {
    records: Mutex<Vec<FeedbackRecord>>,
}

impl MemoryFeedbackStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeedbackStore for MemoryFeedbackStore {
    async fn query(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<FeedbackRecord>> {
        let records = lock(&self.records)?;
        let mut out: Vec<FeedbackRecord> = records
            .iter()
            .filter(|r| r.subject_id == subject_id && r.created_at >= since)
            .cloned()
            .collect();
        // Stable sort keeps later inserts first among equal timestamps.
        out.reverse();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn count(&self, subject_id: &str, since: DateTime<Utc>) -> StorageResult<u64> {
        let records = lock(&self.records)?;
        Ok(records
            .iter()
            .filter(|r| r.subject_id == subject_id && r.created_at >= since)
            .count() as u64)
    }

    async fn record(&self, feedback: FeedbackRecord) -> StorageResult<()> {
        lock(&self.records)?.push(feedback);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryTestCaseStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryTestCaseStore {
    cases: Mutex<Vec<TestCase>>,
}

impl MemoryTestCaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TestCaseStore for MemoryTestCaseStore {
    async fn list_active(&self, subject_id: &str) -> StorageResult<Vec<TestCase>> {
        let cases = lock(&self.cases)?;
        let mut out: Vec<TestCase> = cases
            .iter()
            .filter(|c| c.subject_id == subject_id && c.active)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(out)
    }

    async fn upsert(&self, case: TestCase) -> StorageResult<()> {
        let mut cases = lock(&self.cases)?;
        match cases.iter_mut().find(|c| c.case_id == case.case_id) {
            Some(existing) => *existing = case,
            None => cases.push(case),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryEvolutionStore
// ---------------------------------------------------------------------------

/// Configs keyed by subject, cycles and candidates in insertion order.
#[derive(Debug, Default)]
pub struct MemoryEvolutionStore {
    configs: Mutex<HashMap<String, EvolutionConfig>>,
    cycles: Mutex<Vec<EvolutionCycle>>,
    candidates: Mutex<Vec<PromptCandidate>>,
}

impl MemoryEvolutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EvolutionStore for MemoryEvolutionStore {
    async fn get_config(&self, subject_id: &str) -> StorageResult<Option<EvolutionConfig>> {
        Ok(lock(&self.configs)?.get(subject_id).cloned())
    }

    async fn save_config(&self, config: &EvolutionConfig) -> StorageResult<()> {
        lock(&self.configs)?.insert(config.subject_id.clone(), config.clone());
        Ok(())
    }

    async fn list_configs(&self) -> StorageResult<Vec<EvolutionConfig>> {
        let configs = lock(&self.configs)?;
        let mut out: Vec<EvolutionConfig> = configs.values().cloned().collect();
        out.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));
        Ok(out)
    }

    async fn create_cycle(&self, cycle: &EvolutionCycle) -> StorageResult<()> {
        let mut cycles = lock(&self.cycles)?;
        if cycles.iter().any(|c| c.cycle_id == cycle.cycle_id) {
            return Err(StorageError::Duplicate {
                id: cycle.cycle_id.clone(),
            });
        }
        cycles.push(cycle.clone());
        Ok(())
    }

    async fn update_cycle(&self, cycle: &EvolutionCycle) -> StorageResult<()> {
        let mut cycles = lock(&self.cycles)?;
        let stored = cycles
            .iter_mut()
            .find(|c| c.cycle_id == cycle.cycle_id)
            .ok_or_else(|| StorageError::CycleNotFound {
                cycle_id: cycle.cycle_id.clone(),
            })?;
        if stored.status.is_terminal() {
            return Err(StorageError::InvalidCycleState {
                cycle_id: cycle.cycle_id.clone(),
                status: stored.status.to_string(),
                expected: "non-terminal".to_string(),
            });
        }
        *stored = cycle.clone();
        Ok(())
    }

    async fn get_cycle(&self, cycle_id: &str) -> StorageResult<EvolutionCycle> {
        lock(&self.cycles)?
            .iter()
            .find(|c| c.cycle_id == cycle_id)
            .cloned()
            .ok_or_else(|| StorageError::CycleNotFound {
                cycle_id: cycle_id.to_string(),
            })
    }

    async fn list_cycles(
        &self,
        subject_id: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<EvolutionCycle>> {
        let cycles = lock(&self.cycles)?;
        Ok(cycles
            .iter()
            .rev()
            .filter(|c| subject_id.map(|s| c.subject_id == s).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_cycle(&self, cycle_id: &str) -> StorageResult<usize> {
        let mut cycles = lock(&self.cycles)?;
        let before = cycles.len();
        cycles.retain(|c| c.cycle_id != cycle_id);
        if cycles.len() == before {
            return Err(StorageError::CycleNotFound {
                cycle_id: cycle_id.to_string(),
            });
        }
        let mut candidates = lock(&self.candidates)?;
        let before = candidates.len();
        candidates.retain(|c| c.cycle_id != cycle_id);
        Ok(before - candidates.len())
    }

    async fn insert_candidate(&self, candidate: &PromptCandidate) -> StorageResult<()> {
        let mut candidates = lock(&self.candidates)?;
        if candidates
            .iter()
            .any(|c| c.candidate_id == candidate.candidate_id)
        {
            return Err(StorageError::Duplicate {
                id: candidate.candidate_id.clone(),
            });
        }
        candidates.push(candidate.clone());
        Ok(())
    }

    async fn update_candidate(&self, candidate: &PromptCandidate) -> StorageResult<()> {
        let mut candidates = lock(&self.candidates)?;
        let stored = candidates
            .iter_mut()
            .find(|c| c.candidate_id == candidate.candidate_id)
            .ok_or_else(|| StorageError::CandidateNotFound {
                candidate_id: candidate.candidate_id.clone(),
            })?;
        *stored = candidate.clone();
        Ok(())
    }

    async fn get_candidate(&self, candidate_id: &str) -> StorageResult<PromptCandidate> {
        lock(&self.candidates)?
            .iter()
            .find(|c| c.candidate_id == candidate_id)
            .cloned()
            .ok_or_else(|| StorageError::CandidateNotFound {
                candidate_id: candidate_id.to_string(),
            })
    }

    async fn list_candidates(&self, cycle_id: &str) -> StorageResult<Vec<PromptCandidate>> {
        Ok(lock(&self.candidates)?
            .iter()
            .filter(|c| c.cycle_id == cycle_id)
            .cloned()
            .collect())
    }

    async fn list_candidates_by_status(
        &self,
        subject_id: Option<&str>,
        status: CandidateStatus,
    ) -> StorageResult<Vec<PromptCandidate>> {
        Ok(lock(&self.candidates)?
            .iter()
            .filter(|c| c.status == status)
            .filter(|c| subject_id.map(|s| c.subject_id == s).unwrap_or(true))
            .cloned()
            .collect())
    }
}
