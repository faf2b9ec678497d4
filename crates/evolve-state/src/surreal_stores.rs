//! SurrealDB-backed implementations of the storage traits
//!
//! One `SurrealEvolutionStore` implements all four traits over a shared
//! `SurrealHandle`, converting records to and from `handle::Row` at the
//! boundary.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::error::StorageError;
use crate::handle::{Row, SurrealHandle, Table};
use crate::schema::{
    CandidateStatus, ChangeMetadata, EvolutionConfig, EvolutionCycle, FeedbackRecord,
    InstructionSet, InstructionVersion, PromptCandidate, TestCase,
};
use crate::storage_traits::{
    EvolutionStore, FeedbackStore, InstructionStore, StorageResult, TestCaseStore,
};

/// SurrealDB-backed implementation of every pipeline store.
#[derive(Clone)]
pub struct SurrealEvolutionStore {
    handle: Arc<SurrealHandle>,
}

impl SurrealEvolutionStore {
    pub fn new(handle: Arc<SurrealHandle>) -> Self {
        Self { handle }
    }

    /// Fresh in-memory database, for tests.
    pub async fn in_memory() -> crate::Result<Self> {
        Ok(Self::new(Arc::new(SurrealHandle::setup_db().await?)))
    }

    fn decode_all<T: serde::de::DeserializeOwned>(rows: Vec<Row>) -> StorageResult<Vec<T>> {
        rows.iter().map(Row::decode).collect()
    }

    fn cycle_row(cycle: &EvolutionCycle) -> StorageResult<Row> {
        Ok(
            Row::new(&cycle.cycle_id, &cycle.subject_id, cycle.created_at, cycle)?
                .with_status(cycle.status.as_str()),
        )
    }

    fn candidate_row(candidate: &PromptCandidate) -> StorageResult<Row> {
        Ok(Row::new(
            &candidate.candidate_id,
            &candidate.subject_id,
            candidate.created_at,
            candidate,
        )?
        .with_parent(Some(candidate.cycle_id.clone()))
        .with_status(candidate.status.as_str()))
    }
}

#[async_trait]
impl InstructionStore for SurrealEvolutionStore {
    async fn load_current(&self, subject_id: &str) -> StorageResult<Option<InstructionVersion>> {
        let rows = self
            .handle
            .select_rows(
                Table::InstructionVersions,
                "WHERE subject_id = $subject ORDER BY rank DESC LIMIT 1",
                vec![("subject", json!(subject_id))],
            )
            .await?;
        rows.first().map(Row::decode).transpose()
    }

    async fn write_with_history(
        &self,
        subject_id: &str,
        expected_previous: Option<&str>,
        set: InstructionSet,
        change: ChangeMetadata,
    ) -> StorageResult<InstructionVersion> {
        let head = self.load_current(subject_id).await?;
        let head_id = head.as_ref().map(|v| v.version_id.clone());
        let conflict = |actual: Option<String>| StorageError::VersionConflict {
            subject_id: subject_id.to_string(),
            expected: expected_previous.map(str::to_string),
            actual,
        };
        if head_id.as_deref() != expected_previous {
            return Err(conflict(head_id));
        }

        let version = InstructionVersion::next(subject_id, head.as_ref(), set, change);
        let row = Row::new(&version.version_id, subject_id, version.created_at, &version)?
            .with_parent(version.previous_version_id.clone())
            .with_rank(version.sequence as i64);

        if self.handle.append_version_row(head_id, row).await? {
            Ok(version)
        } else {
            let actual = self
                .load_current(subject_id)
                .await?
                .map(|v| v.version_id);
            Err(conflict(actual))
        }
    }

    async fn history(&self, subject_id: &str) -> StorageResult<Vec<InstructionVersion>> {
        let rows = self
            .handle
            .select_rows(
                Table::InstructionVersions,
                "WHERE subject_id = $subject ORDER BY rank DESC",
                vec![("subject", json!(subject_id))],
            )
            .await?;
        Self::decode_all(rows)
    }
}

#[async_trait]
impl FeedbackStore for SurrealEvolutionStore {
    async fn query(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<FeedbackRecord>> {
        let rows = self
            .handle
            .rows_since(Table::Feedback, subject_id, since)
            .await?;
        Self::decode_all(rows)
    }

    async fn count(&self, subject_id: &str, since: DateTime<Utc>) -> StorageResult<u64> {
        self.handle
            .count_since(Table::Feedback, subject_id, since)
            .await
    }

    async fn record(&self, feedback: FeedbackRecord) -> StorageResult<()> {
        let row = Row::new(
            &feedback.feedback_id,
            &feedback.subject_id,
            feedback.created_at,
            &feedback,
        )?;
        self.handle.insert_row(Table::Feedback, row).await
    }
}

#[async_trait]
impl TestCaseStore for SurrealEvolutionStore {
    async fn list_active(&self, subject_id: &str) -> StorageResult<Vec<TestCase>> {
        let rows = self
            .handle
            .select_rows(
                Table::TestCases,
                "WHERE subject_id = $subject AND status = 'active' ORDER BY rank DESC",
                vec![("subject", json!(subject_id))],
            )
            .await?;
        Self::decode_all(rows)
    }

    async fn upsert(&self, case: TestCase) -> StorageResult<()> {
        let status = if case.active { "active" } else { "inactive" };
        let row = Row::new(&case.case_id, &case.subject_id, Utc::now(), &case)?
            .with_status(status)
            .with_rank(i64::from(case.priority));
        self.handle.upsert_row(Table::TestCases, row).await
    }
}

#[async_trait]
impl EvolutionStore for SurrealEvolutionStore {
    async fn get_config(&self, subject_id: &str) -> StorageResult<Option<EvolutionConfig>> {
        self.handle
            .get_row(Table::Configs, subject_id)
            .await?
            .as_ref()
            .map(Row::decode)
            .transpose()
    }

    async fn save_config(&self, config: &EvolutionConfig) -> StorageResult<()> {
        let row = Row::new(&config.subject_id, &config.subject_id, config.updated_at, config)?
            .with_status(if config.enabled { "enabled" } else { "disabled" });
        self.handle.upsert_row(Table::Configs, row).await
    }

    async fn list_configs(&self) -> StorageResult<Vec<EvolutionConfig>> {
        let rows = self
            .handle
            .select_rows(Table::Configs, "ORDER BY record_key ASC", Vec::new())
            .await?;
        Self::decode_all(rows)
    }

    async fn create_cycle(&self, cycle: &EvolutionCycle) -> StorageResult<()> {
        self.handle
            .insert_row(Table::Cycles, Self::cycle_row(cycle)?)
            .await
    }

    async fn update_cycle(&self, cycle: &EvolutionCycle) -> StorageResult<()> {
        let stored = self.get_cycle(&cycle.cycle_id).await?;
        if stored.status.is_terminal() {
            return Err(StorageError::InvalidCycleState {
                cycle_id: cycle.cycle_id.clone(),
                status: stored.status.to_string(),
                expected: "non-terminal".to_string(),
            });
        }
        self.handle
            .update_row(Table::Cycles, Self::cycle_row(cycle)?)
            .await?;
        Ok(())
    }

    async fn get_cycle(&self, cycle_id: &str) -> StorageResult<EvolutionCycle> {
        self.handle
            .get_row(Table::Cycles, cycle_id)
            .await?
            .ok_or_else(|| StorageError::CycleNotFound {
                cycle_id: cycle_id.to_string(),
            })?
            .decode()
    }

    async fn list_cycles(
        &self,
        subject_id: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<EvolutionCycle>> {
        let rows = match subject_id {
            Some(subject) => {
                self.handle
                    .select_rows(
                        Table::Cycles,
                        "WHERE subject_id = $subject ORDER BY ts DESC LIMIT $limit",
                        vec![("subject", json!(subject)), ("limit", json!(limit))],
                    )
                    .await?
            }
            None => {
                self.handle
                    .select_rows(
                        Table::Cycles,
                        "ORDER BY ts DESC LIMIT $limit",
                        vec![("limit", json!(limit))],
                    )
                    .await?
            }
        };
        Self::decode_all(rows)
    }

    async fn delete_cycle(&self, cycle_id: &str) -> StorageResult<usize> {
        self.get_cycle(cycle_id).await?;
        let removed = self.list_candidates(cycle_id).await?.len();
        self.handle.delete_cycle_rows(cycle_id).await?;
        Ok(removed)
    }

    async fn insert_candidate(&self, candidate: &PromptCandidate) -> StorageResult<()> {
        self.handle
            .insert_row(Table::Candidates, Self::candidate_row(candidate)?)
            .await
    }

    async fn update_candidate(&self, candidate: &PromptCandidate) -> StorageResult<()> {
        let existed = self
            .handle
            .update_row(Table::Candidates, Self::candidate_row(candidate)?)
            .await?;
        if existed {
            Ok(())
        } else {
            Err(StorageError::CandidateNotFound {
                candidate_id: candidate.candidate_id.clone(),
            })
        }
    }

    async fn get_candidate(&self, candidate_id: &str) -> StorageResult<PromptCandidate> {
        self.handle
            .get_row(Table::Candidates, candidate_id)
            .await?
            .ok_or_else(|| StorageError::CandidateNotFound {
                candidate_id: candidate_id.to_string(),
            })?
            .decode()
    }

    async fn list_candidates(&self, cycle_id: &str) -> StorageResult<Vec<PromptCandidate>> {
        let rows = self
            .handle
            .select_rows(
                Table::Candidates,
                "WHERE parent = $cycle ORDER BY ts ASC",
                vec![("cycle", json!(cycle_id))],
            )
            .await?;
        Self::decode_all(rows)
    }

    async fn list_candidates_by_status(
        &self,
        subject_id: Option<&str>,
        status: CandidateStatus,
    ) -> StorageResult<Vec<PromptCandidate>> {
        let rows = match subject_id {
            Some(subject) => {
                self.handle
                    .select_rows(
                        Table::Candidates,
                        "WHERE subject_id = $subject AND status = $status ORDER BY ts ASC",
                        vec![
                            ("subject", json!(subject)),
                            ("status", json!(status.as_str())),
                        ],
                    )
                    .await?
            }
            None => {
                self.handle
                    .select_rows(
                        Table::Candidates,
                        "WHERE status = $status ORDER BY ts ASC",
                        vec![("status", json!(status.as_str()))],
                    )
                    .await?
            }
        };
        Self::decode_all(rows)
    }
}
