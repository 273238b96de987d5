//! # Relational store
//!
//! SQLite in WAL mode behind a sqlx pool. The schema is created idempotently
//! at startup; one pool per process, constructed from config — no lazy
//! global caches. A unit of work is a sqlx transaction: committed atomically
//! or rolled back entirely.

use chrono::{DateTime, Utc};
use pipeline_core::error::PipelineError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::time::Duration;

/// Pool sizing and acquisition behavior.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Owns the connection pool; repositories borrow it per unit of work.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connects, enables WAL + foreign keys, and initializes the schema.
    pub async fn connect(db_path: &str, settings: PoolSettings) -> Result<Self, PipelineError> {
        use std::str::FromStr;
        let options = SqliteConnectOptions::from_str(db_path)
            .map_err(|e| PipelineError::Storage { reason: format!("invalid db path {}: {}", db_path, e) })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(5000));

        let pool = SqlitePoolOptions::new()
            .min_connections(settings.min_connections)
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(|e| PipelineError::Storage { reason: format!("failed to connect to {}: {}", db_path, e) })?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Liveness probe for the health endpoint.
    pub async fn ping(&self) -> Result<(), PipelineError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(PipelineError::storage)?;
        Ok(())
    }

    /// Idempotent DDL. `CREATE TABLE IF NOT EXISTS` everywhere so a restart
    /// never loses data; additive migrations run with errors ignored.
    async fn init_schema(&self) -> Result<(), PipelineError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS amr_jobs (
                id TEXT PRIMARY KEY,
                user_id TEXT,
                job_name TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'predict'
                    CHECK(kind IN ('predict', 'aggregate', 'sequence', 'visualize')),
                status TEXT NOT NULL
                    CHECK(status IN ('Submitted', 'Running', 'Completed', 'Error', 'Cancelled')),
                progress REAL NOT NULL DEFAULT 0.0 CHECK(progress BETWEEN 0.0 AND 100.0),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                error TEXT,
                input_file_path TEXT,
                result_file_path TEXT,
                aggregated_result_file_path TEXT,
                worker_id TEXT
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::Storage { reason: format!("failed to create amr_jobs: {}", e) })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS amr_job_params (
                job_id TEXT PRIMARY KEY REFERENCES amr_jobs(id) ON DELETE CASCADE,
                model_name TEXT NOT NULL,
                batch_size INTEGER NOT NULL CHECK(batch_size >= 1),
                segment_length INTEGER NOT NULL CHECK(segment_length >= 0),
                segment_overlap INTEGER NOT NULL CHECK(segment_overlap >= 0),
                use_cpu INTEGER NOT NULL DEFAULT 0,
                resistance_threshold REAL NOT NULL
                    CHECK(resistance_threshold BETWEEN 0.0 AND 1.0),
                enable_sequence_aggregation INTEGER NOT NULL DEFAULT 0,
                extra_json TEXT NOT NULL DEFAULT '{}' CHECK(json_valid(extra_json))
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::Storage { reason: format!("failed to create amr_job_params: {}", e) })?;

        // Shared by both pipelines; job_id references either jobs table, so
        // cascade is handled by the repositories inside the delete tx.
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS job_status_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                status TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                message TEXT
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::Storage { reason: format!("failed to create job_status_history: {}", e) })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS bakta_jobs (
                id TEXT PRIMARY KEY,
                remote_id TEXT,
                secret TEXT,
                name TEXT NOT NULL,
                status TEXT NOT NULL CHECK(status IN ('Init', 'Running', 'Successful', 'Error')),
                fasta_path TEXT NOT NULL,
                config_json TEXT NOT NULL CHECK(json_valid(config_json)),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                error TEXT
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::Storage { reason: format!("failed to create bakta_jobs: {}", e) })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS bakta_sequences (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL REFERENCES bakta_jobs(id) ON DELETE CASCADE,
                header TEXT NOT NULL,
                sequence TEXT NOT NULL,
                length INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::Storage { reason: format!("failed to create bakta_sequences: {}", e) })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS bakta_result_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL REFERENCES bakta_jobs(id) ON DELETE CASCADE,
                file_type TEXT NOT NULL,
                file_path TEXT NOT NULL,
                download_url TEXT,
                downloaded_at TEXT NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::Storage { reason: format!("failed to create bakta_result_files: {}", e) })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS bakta_annotations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL REFERENCES bakta_jobs(id) ON DELETE CASCADE,
                feature_id TEXT NOT NULL,
                feature_type TEXT NOT NULL,
                contig TEXT NOT NULL,
                start_pos INTEGER NOT NULL CHECK(start_pos >= 1),
                end_pos INTEGER NOT NULL CHECK(end_pos >= start_pos),
                strand TEXT NOT NULL CHECK(strand IN ('+', '-', '.')),
                attributes_json TEXT NOT NULL CHECK(json_valid(attributes_json))
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::Storage { reason: format!("failed to create bakta_annotations: {}", e) })?;

        // Archive table mirrors amr_jobs plus the move timestamp.
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS amr_jobs_archive (
                id TEXT PRIMARY KEY,
                user_id TEXT,
                job_name TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                progress REAL NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                error TEXT,
                input_file_path TEXT,
                result_file_path TEXT,
                aggregated_result_file_path TEXT,
                worker_id TEXT,
                archived_at TEXT NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::Storage { reason: format!("failed to create amr_jobs_archive: {}", e) })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS idempotency_keys (
                key_hash TEXT PRIMARY KEY,
                body_hash TEXT NOT NULL,
                job_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::Storage { reason: format!("failed to create idempotency_keys: {}", e) })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS system_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::Storage { reason: format!("failed to create system_state: {}", e) })?;

        // Indexes backing the hot queries; failures here are non-fatal.
        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_amr_jobs_status ON amr_jobs(status);",
            "CREATE INDEX IF NOT EXISTS idx_amr_jobs_created ON amr_jobs(created_at);",
            "CREATE INDEX IF NOT EXISTS idx_amr_jobs_updated ON amr_jobs(updated_at);",
            "CREATE INDEX IF NOT EXISTS idx_amr_jobs_user ON amr_jobs(user_id);",
            "CREATE INDEX IF NOT EXISTS idx_bakta_jobs_status ON bakta_jobs(status);",
            "CREATE INDEX IF NOT EXISTS idx_bakta_jobs_created ON bakta_jobs(created_at);",
            "CREATE INDEX IF NOT EXISTS idx_bakta_jobs_updated ON bakta_jobs(updated_at);",
            "CREATE INDEX IF NOT EXISTS idx_annotations_job ON bakta_annotations(job_id);",
            "CREATE INDEX IF NOT EXISTS idx_annotations_job_type ON bakta_annotations(job_id, feature_type);",
            "CREATE INDEX IF NOT EXISTS idx_annotations_job_contig ON bakta_annotations(job_id, contig);",
            "CREATE INDEX IF NOT EXISTS idx_annotations_job_range ON bakta_annotations(job_id, start_pos, end_pos);",
            "CREATE INDEX IF NOT EXISTS idx_annotations_feature ON bakta_annotations(feature_id);",
            "CREATE INDEX IF NOT EXISTS idx_sequences_job ON bakta_sequences(job_id);",
            "CREATE INDEX IF NOT EXISTS idx_sequences_header ON bakta_sequences(header);",
            "CREATE INDEX IF NOT EXISTS idx_result_files_job ON bakta_result_files(job_id);",
            "CREATE INDEX IF NOT EXISTS idx_result_files_job_type ON bakta_result_files(job_id, file_type);",
            "CREATE INDEX IF NOT EXISTS idx_history_job ON job_status_history(job_id);",
            "CREATE INDEX IF NOT EXISTS idx_idempotency_created ON idempotency_keys(created_at);",
        ] {
            sqlx::query(ddl).execute(&self.pool).await.ok();
        }

        Ok(())
    }
}

/// RFC-3339 helpers; all timestamps are stored as UTC text.
pub(crate) fn now_str() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().and_then(parse_ts)
}
