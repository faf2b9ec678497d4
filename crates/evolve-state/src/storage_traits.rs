//! Storage trait definitions for the evolution pipeline
//!
//! These traits define the storage abstractions the pipeline consumes:
//! - `InstructionStore`: versioned production instruction sets (append-only)
//! - `FeedbackStore`: per-execution feedback
//! - `TestCaseStore`: comparison suites
//! - `EvolutionStore`: configs, cycles, and candidates
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;
use crate::schema::{
    CandidateStatus, ChangeMetadata, EvolutionConfig, EvolutionCycle, FeedbackRecord,
    InstructionSet, InstructionVersion, PromptCandidate, TestCase,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Content digest (SHA-256 hex string).
///
/// The inner field is private so the string is always lowercase hex produced
/// by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// InstructionStore
// ---------------------------------------------------------------------------

/// Versioned production instruction sets.
///
/// Semantics:
/// - `write_with_history` appends a new version as the current one. The
///   caller names the version it believes is current; if another writer got
///   there first the write fails with `StorageError::VersionConflict` and
///   nothing is stored.
/// - A version record is its own audit entry, so the write and the audit
///   trail can never diverge.
/// - `history` returns every version, newest first.
#[async_trait]
pub trait InstructionStore: Send + Sync {
    /// Current (newest) version for a subject, if any.
    async fn load_current(&self, subject_id: &str) -> StorageResult<Option<InstructionVersion>>;

    /// Append `set` as the new current version.
    ///
    /// `expected_previous` must equal the current version id (`None` when the
    /// subject has no instructions yet).
    async fn write_with_history(
        &self,
        subject_id: &str,
        expected_previous: Option<&str>,
        set: InstructionSet,
        change: ChangeMetadata,
    ) -> StorageResult<InstructionVersion>;

    /// Full history for a subject (newest first).
    async fn history(&self, subject_id: &str) -> StorageResult<Vec<InstructionVersion>>;
}

// ---------------------------------------------------------------------------
// FeedbackStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait FeedbackStore: Send + Sync {
    /// Records created at or after `since`, newest first.
    async fn query(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<FeedbackRecord>>;

    /// Number of records created at or after `since`.
    async fn count(&self, subject_id: &str, since: DateTime<Utc>) -> StorageResult<u64>;

    async fn record(&self, feedback: FeedbackRecord) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// TestCaseStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TestCaseStore: Send + Sync {
    /// Active cases for a subject, priority descending.
    async fn list_active(&self, subject_id: &str) -> StorageResult<Vec<TestCase>>;

    /// Insert or replace a case by `case_id`.
    async fn upsert(&self, case: TestCase) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// EvolutionStore
// ---------------------------------------------------------------------------

/// Configs, cycles, and candidates.
///
/// Semantics:
/// - One config per subject; `save_config` replaces it.
/// - `update_cycle` refuses to modify a cycle that is already terminal.
/// - `delete_cycle` removes the cycle and every candidate it owns.
#[async_trait]
pub trait EvolutionStore: Send + Sync {
    async fn get_config(&self, subject_id: &str) -> StorageResult<Option<EvolutionConfig>>;

    async fn save_config(&self, config: &EvolutionConfig) -> StorageResult<()>;

    async fn list_configs(&self) -> StorageResult<Vec<EvolutionConfig>>;

    /// Store a new cycle. Fails with `Duplicate` if the id exists.
    async fn create_cycle(&self, cycle: &EvolutionCycle) -> StorageResult<()>;

    /// Replace a stored cycle. Fails if it is missing or terminal.
    async fn update_cycle(&self, cycle: &EvolutionCycle) -> StorageResult<()>;

    async fn get_cycle(&self, cycle_id: &str) -> StorageResult<EvolutionCycle>;

    /// Cycles newest first, optionally for one subject, at most `limit`.
    async fn list_cycles(
        &self,
        subject_id: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<EvolutionCycle>>;

    /// Delete a cycle and its candidates; returns the number of candidates removed.
    async fn delete_cycle(&self, cycle_id: &str) -> StorageResult<usize>;

    async fn insert_candidate(&self, candidate: &PromptCandidate) -> StorageResult<()>;

    async fn update_candidate(&self, candidate: &PromptCandidate) -> StorageResult<()>;

    async fn get_candidate(&self, candidate_id: &str) -> StorageResult<PromptCandidate>;

    /// Candidates of a cycle in creation order.
    async fn list_candidates(&self, cycle_id: &str) -> StorageResult<Vec<PromptCandidate>>;

    /// Candidates in a given status, optionally for one subject, oldest first.
    async fn list_candidates_by_status(
        &self,
        subject_id: Option<&str>,
        status: CandidateStatus,
    ) -> StorageResult<Vec<PromptCandidate>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_hex() {
        let d = ContentDigest::from_bytes(b"hello");
        assert_eq!(d.as_str().len(), 64);
        assert_eq!(d.short().len(), 12);
        assert_eq!(d, ContentDigest::from_bytes(b"hello"));
    }

    #[test]
    fn digest_rejects_garbage_on_deserialize() {
        let bad: Result<ContentDigest, _> = serde_json::from_str("\"not-a-digest\"");
        assert!(bad.is_err());

        let good = ContentDigest::from_bytes(b"x");
        let json = serde_json::to_string(&good).expect("serialize");
        let back: ContentDigest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, good);
    }
}
