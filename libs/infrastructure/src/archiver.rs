//! # Archiver / retention sweep
//!
//! Periodic sweep over terminal jobs: old ones move to the archive table,
//! archived ones past the delete window are removed together with their
//! result files. Non-terminal jobs are never touched, regardless of age.
//! A single-row advisory lock in `system_state` prevents concurrent sweeps;
//! each moved job is its own transaction so an interrupt loses nothing.

use chrono::{Duration as ChronoDuration, Utc};
use pipeline_core::error::PipelineError;
use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::store::{now_str, Store};

const LOCK_KEY: &str = "archiver.running";
/// A lock older than this is considered abandoned by a crashed sweep.
const LOCK_STALE_SECS: i64 = 3600;

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub archive_after_days: i64,
    pub delete_after_days: i64,
}

#[derive(Debug, Default, PartialEq)]
pub struct SweepStats {
    pub archived: u64,
    pub deleted: u64,
    pub bakta_deleted: u64,
}

pub struct Archiver {
    pool: SqlitePool,
    policy: RetentionPolicy,
    results_dir: String,
}

impl Archiver {
    pub fn new(store: &Store, policy: RetentionPolicy, results_dir: impl Into<String>) -> Self {
        Self {
            pool: store.pool().clone(),
            policy,
            results_dir: results_dir.into(),
        }
    }

    /// One full sweep. Returns zeroed stats when another sweep holds the
    /// advisory lock.
    pub async fn run_sweep(&self) -> Result<SweepStats, PipelineError> {
        if !self.try_acquire_lock().await? {
            tracing::info!("[Archiver] another sweep is running; skipping");
            return Ok(SweepStats::default());
        }

        let result = self.sweep_inner().await;
        // Always release, even when the sweep itself failed.
        if let Err(e) = self.release_lock().await {
            tracing::warn!("[Archiver] failed to release sweep lock: {}", e);
        }
        result
    }

    async fn sweep_inner(&self) -> Result<SweepStats, PipelineError> {
        let mut stats = SweepStats::default();
        let archive_cutoff =
            (Utc::now() - ChronoDuration::days(self.policy.archive_after_days)).to_rfc3339();
        let delete_cutoff =
            (Utc::now() - ChronoDuration::days(self.policy.delete_after_days)).to_rfc3339();

        // 1. Move old terminal AMR jobs into the archive table.
        let candidates = sqlx::query(
            "SELECT id FROM amr_jobs \
             WHERE status IN ('Completed', 'Error', 'Cancelled') \
             AND COALESCE(completed_at, updated_at) < ?",
        )
        .bind(&archive_cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::storage)?;

        for row in candidates {
            let id: String = row.get("id");
            self.archive_one(&id).await?;
            stats.archived += 1;
            self.heartbeat().await?;
        }

        // 2. Drop archived jobs past the delete window, files included.
        let doomed = sqlx::query(
            "SELECT id, result_file_path, aggregated_result_file_path, input_file_path \
             FROM amr_jobs_archive WHERE archived_at < ?",
        )
        .bind(&delete_cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::storage)?;

        for row in doomed {
            let id: String = row.get("id");
            for col in ["result_file_path", "aggregated_result_file_path", "input_file_path"] {
                if let Some(path) = row.try_get::<Option<String>, _>(col).ok().flatten() {
                    remove_file_best_effort(&path).await;
                }
            }
            self.delete_archived(&id).await?;
            stats.deleted += 1;
            self.heartbeat().await?;
        }

        // 3. Terminal Bakta jobs past the delete window go outright; their
        //    sequences, annotations and result-file rows cascade.
        let bakta_doomed = sqlx::query(
            "SELECT id FROM bakta_jobs \
             WHERE status IN ('Successful', 'Error') \
             AND COALESCE(completed_at, updated_at) < ?",
        )
        .bind(&delete_cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::storage)?;

        for row in bakta_doomed {
            let id: String = row.get("id");
            let dir = Path::new(&self.results_dir).join("bakta").join(&id);
            if tokio::fs::remove_dir_all(&dir).await.is_err() {
                tracing::debug!("[Archiver] no result directory to remove for bakta job {}", id);
            }
            self.delete_bakta(&id).await?;
            stats.bakta_deleted += 1;
            self.heartbeat().await?;
        }

        if stats != SweepStats::default() {
            tracing::info!(
                "[Archiver] sweep done: {} archived, {} deleted, {} bakta jobs removed",
                stats.archived,
                stats.deleted,
                stats.bakta_deleted
            );
        }
        Ok(stats)
    }

    /// Moves one job row in its own transaction; safe to interrupt and
    /// safe to re-run (the archive insert ignores duplicates).
    async fn archive_one(&self, id: &str) -> Result<(), PipelineError> {
        let mut tx = self.pool.begin().await.map_err(PipelineError::storage)?;

        sqlx::query(
            "INSERT OR IGNORE INTO amr_jobs_archive \
             (id, user_id, job_name, kind, status, progress, created_at, updated_at, \
              started_at, completed_at, error, input_file_path, result_file_path, \
              aggregated_result_file_path, worker_id, archived_at) \
             SELECT id, user_id, job_name, kind, status, progress, created_at, updated_at, \
                    started_at, completed_at, error, input_file_path, result_file_path, \
                    aggregated_result_file_path, worker_id, ? \
             FROM amr_jobs WHERE id = ?",
        )
        .bind(now_str())
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(PipelineError::storage)?;

        sqlx::query("DELETE FROM amr_jobs WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(PipelineError::storage)?;

        tx.commit().await.map_err(PipelineError::storage)?;
        Ok(())
    }

    async fn delete_archived(&self, id: &str) -> Result<(), PipelineError> {
        let mut tx = self.pool.begin().await.map_err(PipelineError::storage)?;
        sqlx::query("DELETE FROM job_status_history WHERE job_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(PipelineError::storage)?;
        sqlx::query("DELETE FROM amr_jobs_archive WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(PipelineError::storage)?;
        tx.commit().await.map_err(PipelineError::storage)?;
        Ok(())
    }

    async fn delete_bakta(&self, id: &str) -> Result<(), PipelineError> {
        let mut tx = self.pool.begin().await.map_err(PipelineError::storage)?;
        sqlx::query("DELETE FROM job_status_history WHERE job_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(PipelineError::storage)?;
        sqlx::query("DELETE FROM bakta_jobs WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(PipelineError::storage)?;
        tx.commit().await.map_err(PipelineError::storage)?;
        Ok(())
    }

    /// Atomic lock grab: wins only when no fresh lock row exists.
    async fn try_acquire_lock(&self) -> Result<bool, PipelineError> {
        let stale = (Utc::now() - ChronoDuration::seconds(LOCK_STALE_SECS)).to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO system_state (key, value, updated_at) VALUES (?, 'true', ?) \
             ON CONFLICT(key) DO UPDATE SET value = 'true', updated_at = excluded.updated_at \
             WHERE system_state.value != 'true' OR system_state.updated_at < ?",
        )
        .bind(LOCK_KEY)
        .bind(now_str())
        .bind(&stale)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::storage)?;
        Ok(result.rows_affected() > 0)
    }

    /// Refreshes the lock heartbeat between per-job transactions.
    async fn heartbeat(&self) -> Result<(), PipelineError> {
        sqlx::query("UPDATE system_state SET updated_at = ? WHERE key = ?")
            .bind(now_str())
            .bind(LOCK_KEY)
            .execute(&self.pool)
            .await
            .map_err(PipelineError::storage)?;
        Ok(())
    }

    async fn release_lock(&self) -> Result<(), PipelineError> {
        sqlx::query("UPDATE system_state SET value = 'false', updated_at = ? WHERE key = ?")
            .bind(now_str())
            .bind(LOCK_KEY)
            .execute(&self.pool)
            .await
            .map_err(PipelineError::storage)?;
        Ok(())
    }
}

async fn remove_file_best_effort(path: &str) {
    if tokio::fs::remove_file(path).await.is_err() {
        tracing::debug!("[Archiver] result file {} already gone", path);
    }
}
