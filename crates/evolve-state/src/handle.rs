//! SurrealDB Handle - Connection and Schema
//!
//! Manages the connection and provides row-level helpers used by the
//! SurrealDB store implementations. Every table stores the same `Row` shape:
//! a few indexed columns used in `WHERE`/`ORDER BY` plus the full record
//! serialized as JSON in `body`.
//!
//! Supports both local (in-memory) and cloud (WebSocket) connections.

use crate::error::StateError;
use crate::storage_traits::StorageResult;
use crate::Result;
use crate::StorageError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

const DEFAULT_NAMESPACE: &str = "evolve";
const DEFAULT_DATABASE: &str = "main";

/// Configuration for SurrealDB Cloud connection
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// WebSocket endpoint URL (e.g., "wss://xxx.aws-use1.surrealdb.cloud")
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// Namespace (default: "evolve")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Root user (true) or database user (false)
    pub is_root: bool,
}

impl CloudConfig {
    /// Configuration for a database user
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            is_root: false,
        }
    }

    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    pub fn with_root(mut self, is_root: bool) -> Self {
        self.is_root = is_root;
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - SURREALDB_ENDPOINT (required)
    /// - SURREALDB_USERNAME (required)
    /// - SURREALDB_PASSWORD (required)
    /// - SURREALDB_NAMESPACE (optional, default: "evolve")
    /// - SURREALDB_DATABASE (optional, default: "main")
    /// - SURREALDB_ROOT (optional, default: "false")
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint =
            std::env::var("SURREALDB_ENDPOINT").map_err(|_| "SURREALDB_ENDPOINT not set")?;
        let username =
            std::env::var("SURREALDB_USERNAME").map_err(|_| "SURREALDB_USERNAME not set")?;
        let password =
            std::env::var("SURREALDB_PASSWORD").map_err(|_| "SURREALDB_PASSWORD not set")?;
        let namespace = std::env::var("SURREALDB_NAMESPACE")
            .unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        let database =
            std::env::var("SURREALDB_DATABASE").unwrap_or_else(|_| DEFAULT_DATABASE.to_string());
        let is_root = std::env::var("SURREALDB_ROOT")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            endpoint,
            username,
            password,
            namespace,
            database,
            is_root,
        })
    }
}

/// Tables managed by the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Table {
    InstructionVersions,
    Feedback,
    TestCases,
    Configs,
    Cycles,
    Candidates,
}

impl Table {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Table::InstructionVersions => "instruction_versions",
            Table::Feedback => "feedback",
            Table::TestCases => "test_cases",
            Table::Configs => "evolution_configs",
            Table::Cycles => "evolution_cycles",
            Table::Candidates => "prompt_candidates",
        }
    }
}

/// Stored row shape shared by every table.
///
/// `parent` holds the owning cycle for candidates and the previous version
/// for instruction versions. `rank` is the version sequence for instruction
/// versions and the priority for test cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Row {
    pub record_key: String,
    pub subject_id: String,
    pub parent: Option<String>,
    pub status: Option<String>,
    pub rank: i64,
    pub ts: SurrealDatetime,
    pub body: String,
}

impl Row {
    pub fn new<T: Serialize>(
        key: &str,
        subject_id: &str,
        ts: DateTime<Utc>,
        record: &T,
    ) -> StorageResult<Self> {
        let body =
            serde_json::to_string(record).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self {
            record_key: key.to_string(),
            subject_id: subject_id.to_string(),
            parent: None,
            status: None,
            rank: 0,
            ts: SurrealDatetime::from(ts),
            body,
        })
    }

    pub fn with_parent(mut self, parent: Option<String>) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_rank(mut self, rank: i64) -> Self {
        self.rank = rank;
        self
    }

    pub fn decode<T: DeserializeOwned>(&self) -> StorageResult<T> {
        serde_json::from_str(&self.body).map_err(|e| {
            StorageError::Backend(format!("corrupt row {}: {e}", self.record_key))
        })
    }
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: u64,
}

/// SurrealDB connection handle
#[derive(Clone)]
pub struct SurrealHandle {
    db: Surreal<Any>,
}

impl SurrealHandle {
    /// Connect to SurrealDB in-memory and set up schema
    #[instrument(skip_all)]
    pub async fn setup_db() -> Result<Self> {
        info!("Connecting to SurrealDB (in-memory)");
        Self::connect_url("mem://").await
    }

    /// Connect to SurrealDB Cloud
    #[instrument(skip(config), fields(endpoint = %config.endpoint, namespace = %config.namespace, database = %config.database))]
    pub async fn setup_cloud(config: CloudConfig) -> Result<Self> {
        info!("Connecting to SurrealDB Cloud (root={})", config.is_root);

        let db = surrealdb::engine::any::connect(&config.endpoint)
            .await
            .map_err(|e| {
                StateError::Connection(format!("Failed to connect to {}: {}", config.endpoint, e))
            })?;

        if config.is_root {
            db.signin(Root {
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StateError::Connection(format!("Root authentication failed: {}", e)))?;
        } else {
            db.signin(Database {
                namespace: &config.namespace,
                database: &config.database,
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| {
                StateError::Connection(format!("Database authentication failed: {}", e))
            })?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| {
                StateError::Connection(format!("Failed to select namespace/database: {}", e))
            })?;

        let handle = SurrealHandle { db };
        handle.init_schema().await?;

        info!("SurrealDB Cloud connected and schema initialized");
        Ok(handle)
    }

    /// Connect using environment variables
    ///
    /// If SURREALDB_ENDPOINT is set, connects to cloud.
    /// If SURREALDB_URL is set, connects to that URL (e.g. `surrealkv://.evolve/db`).
    /// Otherwise, falls back to in-memory.
    #[instrument(skip_all)]
    pub async fn setup_from_env() -> Result<Self> {
        if let Ok(config) = CloudConfig::from_env() {
            info!("Cloud config found, connecting to SurrealDB Cloud");
            return Self::setup_cloud(config).await;
        }

        if let Ok(url) = std::env::var("SURREALDB_URL") {
            info!("SURREALDB_URL found, connecting to {}", url);
            return Self::connect_url(&url).await;
        }

        info!("No cloud config found, using in-memory database");
        Self::setup_db().await
    }

    async fn connect_url(url: &str) -> Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        db.use_ns(DEFAULT_NAMESPACE)
            .use_db(DEFAULT_DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        let handle = SurrealHandle { db };
        handle.init_schema().await?;
        debug!("SurrealDB connected to {}", url);
        Ok(handle)
    }

    /// Initialize the database schema
    async fn init_schema(&self) -> Result<()> {
        debug!("Initializing evolution schema");

        let mut schema = String::new();
        for table in [
            Table::InstructionVersions,
            Table::Feedback,
            Table::TestCases,
            Table::Configs,
            Table::Cycles,
            Table::Candidates,
        ] {
            let t = table.name();
            schema.push_str(&format!(
                r#"
                DEFINE TABLE {t} SCHEMAFULL;
                DEFINE FIELD record_key ON {t} TYPE string;
                DEFINE FIELD subject_id ON {t} TYPE string;
                DEFINE FIELD parent ON {t} TYPE option<string>;
                DEFINE FIELD status ON {t} TYPE option<string>;
                DEFINE FIELD rank ON {t} TYPE int;
                DEFINE FIELD ts ON {t} TYPE datetime;
                DEFINE FIELD body ON {t} TYPE string;
                DEFINE INDEX idx_{t}_key ON {t} FIELDS record_key UNIQUE;
                DEFINE INDEX idx_{t}_subject ON {t} FIELDS subject_id;
                "#
            ));
        }
        // A second writer racing on the same predecessor hits this index.
        schema.push_str(
            "DEFINE INDEX idx_instruction_versions_seq ON instruction_versions FIELDS subject_id, rank UNIQUE;\n",
        );
        schema.push_str("DEFINE INDEX idx_prompt_candidates_cycle ON prompt_candidates FIELDS parent;\n");

        self.db
            .query(schema)
            .await
            .map_err(|e| StateError::SchemaSetup(e.to_string()))?
            .check()
            .map_err(|e| StateError::SchemaSetup(e.to_string()))?;

        debug!("Schema initialized successfully");
        Ok(())
    }

    // ========== Row Operations ==========

    /// Insert a row; fails with `Duplicate` when the key already exists.
    #[instrument(skip(self, table, row), fields(table = table.name(), key = %row.record_key))]
    pub(crate) async fn insert_row(&self, table: Table, row: Row) -> StorageResult<()> {
        let key = row.record_key.clone();
        let created: Option<Row> = self
            .db
            .create(table.name())
            .content(row)
            .await
            .map_err(|e| {
                if e.to_string().contains("already contains") {
                    StorageError::Duplicate { id: key.clone() }
                } else {
                    StorageError::Backend(e.to_string())
                }
            })?;
        created
            .map(|_| ())
            .ok_or_else(|| StorageError::Backend(format!("failed to create row {key}")))
    }

    /// Replace the row with the same key, creating it if absent.
    #[instrument(skip(self, table, row), fields(table = table.name(), key = %row.record_key))]
    pub(crate) async fn upsert_row(&self, table: Table, row: Row) -> StorageResult<()> {
        let key = row.record_key.clone();
        let t = table.name();
        self.db
            .query(format!(
                "BEGIN TRANSACTION; DELETE {t} WHERE record_key = $key; CREATE {t} CONTENT $row; COMMIT TRANSACTION;"
            ))
            .bind(("key", key))
            .bind(("row", row))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .check()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Overwrite status and body of an existing row; returns whether it existed.
    #[instrument(skip(self, table, row), fields(table = table.name(), key = %row.record_key))]
    pub(crate) async fn update_row(&self, table: Table, row: Row) -> StorageResult<bool> {
        let mut result = self
            .db
            .query(format!(
                "UPDATE {} SET status = $status, ts = $ts, body = $body WHERE record_key = $key RETURN AFTER",
                table.name()
            ))
            .bind(("key", row.record_key))
            .bind(("status", row.status))
            .bind(("ts", row.ts))
            .bind(("body", row.body))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let rows: Vec<Row> = result
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(!rows.is_empty())
    }

    #[instrument(skip(self, table), fields(table = table.name()))]
    pub(crate) async fn get_row(&self, table: Table, key: &str) -> StorageResult<Option<Row>> {
        let mut result = self
            .db
            .query(format!(
                "SELECT * FROM {} WHERE record_key = $key LIMIT 1",
                table.name()
            ))
            .bind(("key", key.to_string()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let rows: Vec<Row> = result
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(rows.into_iter().next())
    }

    /// Run `SELECT * FROM <table> <clause>` with extra bindings.
    #[instrument(skip(self, table, bindings), fields(table = table.name()))]
    pub(crate) async fn select_rows(
        &self,
        table: Table,
        clause: &str,
        bindings: Vec<(&'static str, serde_json::Value)>,
    ) -> StorageResult<Vec<Row>> {
        let sql = format!("SELECT * FROM {} {clause}", table.name());
        let mut query = self.db.query(sql);
        for binding in bindings {
            query = query.bind(binding);
        }
        let mut result = query
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        result
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    /// Rows in `table` created at or after `since` for a subject.
    pub(crate) async fn count_since(
        &self,
        table: Table,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<u64> {
        let mut result = self
            .db
            .query(format!(
                "SELECT count() FROM {} WHERE subject_id = $subject AND ts >= $since GROUP ALL",
                table.name()
            ))
            .bind(("subject", subject_id.to_string()))
            .bind(("since", SurrealDatetime::from(since)))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let rows: Vec<CountRow> = result
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(rows.first().map(|r| r.count).unwrap_or(0))
    }

    /// Rows in `table` created at or after `since` for a subject, newest first.
    pub(crate) async fn rows_since(
        &self,
        table: Table,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<Row>> {
        let mut result = self
            .db
            .query(format!(
                "SELECT * FROM {} WHERE subject_id = $subject AND ts >= $since ORDER BY ts DESC",
                table.name()
            ))
            .bind(("subject", subject_id.to_string()))
            .bind(("since", SurrealDatetime::from(since)))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        result
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    /// Append an instruction version row if the subject's head is still
    /// `expected_head`. Returns `false` when the head moved.
    ///
    /// The head check and the insert run in one transaction.
    #[instrument(skip(self, row), fields(subject = %row.subject_id))]
    pub(crate) async fn append_version_row(
        &self,
        expected_head: Option<String>,
        row: Row,
    ) -> StorageResult<bool> {
        let response = self
            .db
            .query(
                r#"
                BEGIN TRANSACTION;
                LET $head = (SELECT record_key, rank FROM instruction_versions WHERE subject_id = $subject ORDER BY rank DESC LIMIT 1)[0].record_key;
                IF $head != $expected { THROW "version conflict"; };
                CREATE instruction_versions CONTENT $row;
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("subject", row.subject_id.clone()))
            .bind(("expected", expected_head))
            .bind(("row", row))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        match response.check() {
            Ok(_) => Ok(true),
            Err(e) => {
                let msg = e.to_string();
                // Losing a race surfaces either as our THROW or as the unique
                // (subject_id, rank) index rejecting the insert.
                if msg.contains("version conflict") || msg.contains("already contains") {
                    debug!("instruction head moved: {}", msg);
                    Ok(false)
                } else {
                    Err(StorageError::Backend(msg))
                }
            }
        }
    }

    /// Delete a cycle row and its candidate rows in one transaction.
    #[instrument(skip(self))]
    pub(crate) async fn delete_cycle_rows(&self, cycle_id: &str) -> StorageResult<()> {
        self.db
            .query("BEGIN TRANSACTION; DELETE prompt_candidates WHERE parent = $cycle; DELETE evolution_cycles WHERE record_key = $cycle; COMMIT TRANSACTION;")
            .bind(("cycle", cycle_id.to_string()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .check()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Health check (used by `evolvectl` before running commands).
    pub async fn health_check(&self) -> Result<()> {
        self.db
            .query("INFO FOR DB")
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloud_config_builder() {
        let config = CloudConfig::new("wss://db.example", "user", "pw")
            .with_namespace("ns")
            .with_database("db")
            .with_root(true);
        assert_eq!(config.namespace, "ns");
        assert_eq!(config.database, "db");
        assert!(config.is_root);
    }

    #[test]
    fn cloud_config_defaults() {
        let config = CloudConfig::new("wss://db.example", "user", "pw");
        assert_eq!(config.namespace, "evolve");
        assert_eq!(config.database, "main");
        assert!(!config.is_root);
    }

    #[tokio::test]
    async fn setup_db_initializes_schema() {
        let handle = SurrealHandle::setup_db().await.expect("setup");
        handle.health_check().await.expect("health");
    }
}
