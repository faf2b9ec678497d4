//! Error types for evolve-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the backing database
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors surfaced through the storage traits.
///
/// Every backend (in-memory fakes and SurrealDB) maps its failures onto
/// these variants so callers can match on them without knowing the backend.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No instruction set has ever been written for the subject
    #[error("no instruction set for subject '{subject_id}'")]
    InstructionsNotFound { subject_id: String },

    /// Optimistic concurrency check failed on an instruction write
    #[error(
        "version conflict for subject '{subject_id}': expected head {expected:?}, found {actual:?}"
    )]
    VersionConflict {
        subject_id: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// Rollback requested without an earlier version to return to
    #[error("no previous instruction version for subject '{subject_id}'")]
    NoPreviousVersion { subject_id: String },

    /// Cycle record missing
    #[error("cycle not found: {cycle_id}")]
    CycleNotFound { cycle_id: String },

    /// Cycle record exists but cannot accept the requested change
    #[error("cycle {cycle_id} is {status}; expected {expected}")]
    InvalidCycleState {
        cycle_id: String,
        status: String,
        expected: String,
    },

    /// Candidate record missing
    #[error("candidate not found: {candidate_id}")]
    CandidateNotFound { candidate_id: String },

    /// Stored digest is not a 64-char hex string
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Record with the same id already stored
    #[error("duplicate record: {id}")]
    Duplicate { id: String },

    /// Backend failure (database, lock poisoning, encoding)
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}
