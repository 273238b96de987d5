//! # AMR job repository
//!
//! Domain CRUD over the store; hides SQL from everything above it. Status
//! writes and their history rows share one transaction, and the state
//! machine is enforced here — a terminal row never moves again.

use chrono::{DateTime, Utc};
use pipeline_core::error::PipelineError;
use pipeline_core::models::{AmrJob, AmrJobParams, JobKind, JobStatus, StatusHistoryEntry};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::store::{now_str, parse_opt_ts, parse_ts, Store};

/// Partial update; only supplied fields land in the UPDATE.
#[derive(Debug, Default, Clone)]
pub struct StatusUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<f64>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_file: Option<String>,
    pub aggregated_result_file: Option<String>,
    /// Free-text note attached to the history row on a status change.
    pub message: Option<String>,
    /// Identity of the caller; transitions from a non-owning worker are
    /// refused (cancellation excepted — that right stays with the owner
    /// of the job, not the worker).
    pub worker_id: Option<String>,
}

#[derive(Clone)]
pub struct JobRepository {
    pool: SqlitePool,
}

const JOB_COLUMNS: &str = "j.id, j.user_id, j.job_name, j.kind, j.status, j.progress, \
     j.created_at, j.started_at, j.completed_at, j.error, \
     j.input_file_path, j.result_file_path, j.aggregated_result_file_path, j.worker_id, \
     p.model_name, p.batch_size, p.segment_length, p.segment_overlap, \
     p.use_cpu, p.resistance_threshold, p.enable_sequence_aggregation";

impl JobRepository {
    pub fn new(store: &Store) -> Self {
        Self { pool: store.pool().clone() }
    }

    /// Writes the job row, its params row and the initial `Submitted`
    /// history row in one transaction. Fails on id collision.
    pub async fn create(&self, job: &AmrJob, params: &AmrJobParams) -> Result<AmrJob, PipelineError> {
        params
            .validate()
            .map_err(|reason| PipelineError::InvalidInput { reason })?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(PipelineError::storage)?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO amr_jobs \
             (id, user_id, job_name, kind, status, progress, created_at, updated_at, input_file_path) \
             VALUES (?, ?, ?, ?, ?, 0.0, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(&job.user_id)
        .bind(&job.job_name)
        .bind(job.kind.as_str())
        .bind(JobStatus::Submitted.as_str())
        .bind(job.created_at.to_rfc3339())
        .bind(job.created_at.to_rfc3339())
        .bind(&job.input_file_path)
        .execute(&mut *tx)
        .await
        .map_err(PipelineError::storage)?;

        if inserted.rows_affected() == 0 {
            return Err(PipelineError::Conflict {
                reason: format!("job id {} already exists", job.id),
            });
        }

        sqlx::query(
            "INSERT INTO amr_job_params \
             (job_id, model_name, batch_size, segment_length, segment_overlap, \
              use_cpu, resistance_threshold, enable_sequence_aggregation) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(&params.model_name)
        .bind(params.batch_size)
        .bind(params.segment_length)
        .bind(params.segment_overlap)
        .bind(params.use_cpu as i64)
        .bind(params.resistance_threshold)
        .bind(params.enable_sequence_aggregation as i64)
        .execute(&mut *tx)
        .await
        .map_err(PipelineError::storage)?;

        sqlx::query(
            "INSERT INTO job_status_history (job_id, status, timestamp, message) VALUES (?, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(JobStatus::Submitted.as_str())
        .bind(job.created_at.to_rfc3339())
        .bind("job accepted")
        .execute(&mut *tx)
        .await
        .map_err(PipelineError::storage)?;

        tx.commit().await.map_err(PipelineError::storage)?;

        let mut created = job.clone();
        created.status = JobStatus::Submitted;
        created.progress = 0.0;
        created.params = Some(params.clone());
        Ok(created)
    }

    /// Fetches one job, params joined eagerly.
    pub async fn get(&self, id: Uuid) -> Result<Option<AmrJob>, PipelineError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM amr_jobs j \
             LEFT JOIN amr_job_params p ON p.job_id = j.id WHERE j.id = ?"
        );
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(PipelineError::storage)?;
        row.map(|r| row_to_job(&r)).transpose()
    }

    /// Lists jobs ordered by `created_at DESC`. `limit` is clamped to
    /// `[1, 1000]`, default 100.
    pub async fn list(
        &self,
        status: Option<JobStatus>,
        limit: Option<i64>,
        offset: i64,
        user_id: Option<&str>,
    ) -> Result<Vec<AmrJob>, PipelineError> {
        let limit = limit.unwrap_or(100).clamp(1, 1000);
        let offset = offset.max(0);

        let mut qb = sqlx::QueryBuilder::new(format!(
            "SELECT {JOB_COLUMNS} FROM amr_jobs j \
             LEFT JOIN amr_job_params p ON p.job_id = j.id WHERE 1 = 1"
        ));
        if let Some(status) = status {
            qb.push(" AND j.status = ").push_bind(status.as_str());
        }
        if let Some(user_id) = user_id {
            qb.push(" AND j.user_id = ").push_bind(user_id.to_string());
        }
        qb.push(" ORDER BY j.created_at DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(PipelineError::storage)?;
        rows.iter().map(row_to_job).collect()
    }

    /// Applies a partial update. One UPDATE over only the supplied fields,
    /// plus a history row when the status actually changes. Returns `false`
    /// for an unknown id; illegal transitions are a `Conflict`.
    pub async fn update_status(&self, id: Uuid, update: StatusUpdate) -> Result<bool, PipelineError> {
        let mut tx = self.pool.begin().await.map_err(PipelineError::storage)?;

        let row = sqlx::query("SELECT status, progress, worker_id FROM amr_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(PipelineError::storage)?;

        let Some(row) = row else {
            return Ok(false);
        };

        let current_status = JobStatus::parse(&row.get::<String, _>("status"))
            .ok_or_else(|| PipelineError::Fatal {
                reason: format!("job {} carries an unknown status", id),
            })?;
        let current_progress: f64 = row.get("progress");
        let owner: Option<String> = row.try_get("worker_id").ok().flatten();

        // Single-writer discipline: the row's worker_id is the lock-holder
        // of record. Only that worker advances the job; a cancel may come
        // from outside it.
        if let Some(new_status) = update.status {
            let caller_owns = match (&owner, &update.worker_id) {
                (Some(own), Some(caller)) => own == caller,
                (Some(_), None) => false,
                (None, _) => true,
            };
            if !caller_owns && new_status != JobStatus::Cancelled {
                return Err(PipelineError::Conflict {
                    reason: format!("job {} is owned by another worker", id),
                });
            }
            if !current_status.can_transition_to(new_status) {
                return Err(PipelineError::Conflict {
                    reason: format!(
                        "illegal status transition {} -> {} for job {}",
                        current_status, new_status, id
                    ),
                });
            }
        }

        // Terminal finality: re-applying the same terminal status is a
        // no-op; nothing else may touch status or progress afterwards.
        if current_status.is_terminal() {
            return Ok(true);
        }

        let status_changed = update
            .status
            .map(|s| s != current_status)
            .unwrap_or(false);

        // Progress is monotonic while Running; a lower reading is clamped
        // upward and logged at debug, never an error.
        let effective_progress = update.progress.map(|p| {
            let p = p.clamp(0.0, 100.0);
            if p < current_progress {
                tracing::debug!(job_id = %id, incoming = p, stored = current_progress,
                    "progress moved backwards; clamping upward");
                current_progress
            } else {
                p
            }
        });

        let mut qb = sqlx::QueryBuilder::new("UPDATE amr_jobs SET updated_at = ");
        qb.push_bind(now_str());
        if let Some(status) = update.status {
            qb.push(", status = ").push_bind(status.as_str());
        }
        if let Some(progress) = effective_progress {
            qb.push(", progress = ").push_bind(progress);
        }
        if let Some(error) = &update.error {
            qb.push(", error = ").push_bind(error.clone());
        }
        if let Some(started_at) = update.started_at {
            qb.push(", started_at = ").push_bind(started_at.to_rfc3339());
        }
        if let Some(completed_at) = update.completed_at {
            qb.push(", completed_at = ").push_bind(completed_at.to_rfc3339());
        }
        if let Some(result_file) = &update.result_file {
            qb.push(", result_file_path = ").push_bind(result_file.clone());
        }
        if let Some(aggregated) = &update.aggregated_result_file {
            qb.push(", aggregated_result_file_path = ").push_bind(aggregated.clone());
        }
        qb.push(" WHERE id = ").push_bind(id.to_string());

        qb.build()
            .execute(&mut *tx)
            .await
            .map_err(PipelineError::storage)?;

        if status_changed {
            sqlx::query(
                "INSERT INTO job_status_history (job_id, status, timestamp, message) VALUES (?, ?, ?, ?)",
            )
            .bind(id.to_string())
            .bind(update.status.map(|s| s.as_str()).unwrap_or(""))
            .bind(now_str())
            .bind(&update.message)
            .execute(&mut *tx)
            .await
            .map_err(PipelineError::storage)?;
        }

        tx.commit().await.map_err(PipelineError::storage)?;
        Ok(true)
    }

    /// Claims the oldest `Submitted` job for `worker_id`, transitioning it
    /// to `Running` in the same transaction. At most one worker wins.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<AmrJob>, PipelineError> {
        let mut tx = self.pool.begin().await.map_err(PipelineError::storage)?;

        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM amr_jobs j \
             LEFT JOIN amr_job_params p ON p.job_id = j.id \
             WHERE j.status = 'Submitted' ORDER BY j.created_at ASC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .fetch_optional(&mut *tx)
            .await
            .map_err(PipelineError::storage)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = row_to_job(&row)?;

        let now = Utc::now();
        let claimed = sqlx::query(
            "UPDATE amr_jobs SET status = 'Running', worker_id = ?, started_at = ?, updated_at = ? \
             WHERE id = ? AND status = 'Submitted'",
        )
        .bind(worker_id)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(job.id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(PipelineError::storage)?;

        if claimed.rows_affected() == 0 {
            // Raced by another worker between SELECT and UPDATE.
            return Ok(None);
        }

        sqlx::query(
            "INSERT INTO job_status_history (job_id, status, timestamp, message) VALUES (?, 'Running', ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(now.to_rfc3339())
        .bind(format!("claimed by {}", worker_id))
        .execute(&mut *tx)
        .await
        .map_err(PipelineError::storage)?;

        tx.commit().await.map_err(PipelineError::storage)?;

        job.status = JobStatus::Running;
        job.worker_id = Some(worker_id.to_string());
        job.started_at = Some(now);
        Ok(Some(job))
    }

    /// Merges a free-form side-parameters map into the params row.
    pub async fn add_parameters(
        &self,
        id: Uuid,
        extra: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<bool, PipelineError> {
        let patch = serde_json::Value::Object(extra.clone()).to_string();
        let result = sqlx::query(
            "UPDATE amr_job_params SET extra_json = json_patch(extra_json, ?) WHERE job_id = ?",
        )
        .bind(patch)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(PipelineError::storage)?;
        Ok(result.rows_affected() > 0)
    }

    /// Jobs currently queued or executing; backs the submission back-pressure
    /// guard.
    pub async fn count_active(&self) -> Result<i64, PipelineError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM amr_jobs WHERE status IN ('Submitted', 'Running')")
            .fetch_one(&self.pool)
            .await
            .map_err(PipelineError::storage)?;
        Ok(row.get("n"))
    }

    /// Reads back the merged side-parameters map.
    pub async fn extra_parameters(&self, id: Uuid) -> Result<serde_json::Value, PipelineError> {
        let row = sqlx::query("SELECT extra_json FROM amr_job_params WHERE job_id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(PipelineError::storage)?;
        let Some(row) = row else {
            return Ok(serde_json::json!({}));
        };
        let raw: String = row.get("extra_json");
        serde_json::from_str(&raw).map_err(|e| PipelineError::Fatal {
            reason: format!("corrupt extra_json for job {}: {}", id, e),
        })
    }

    /// Deletes the job and everything it owns. Params cascade via FK; the
    /// shared history table is cleared in the same transaction.
    pub async fn delete(&self, id: Uuid) -> Result<bool, PipelineError> {
        let mut tx = self.pool.begin().await.map_err(PipelineError::storage)?;

        sqlx::query("DELETE FROM job_status_history WHERE job_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(PipelineError::storage)?;

        let result = sqlx::query("DELETE FROM amr_jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(PipelineError::storage)?;

        tx.commit().await.map_err(PipelineError::storage)?;
        Ok(result.rows_affected() > 0)
    }

    /// Full audit trail, oldest first.
    pub async fn history(&self, id: Uuid) -> Result<Vec<StatusHistoryEntry>, PipelineError> {
        let rows = sqlx::query(
            "SELECT job_id, status, timestamp, message FROM job_status_history \
             WHERE job_id = ? ORDER BY id ASC",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::storage)?;

        rows.into_iter()
            .map(|r| {
                let job_id: String = r.get("job_id");
                let ts: String = r.get("timestamp");
                Ok(StatusHistoryEntry {
                    job_id: Uuid::parse_str(&job_id).map_err(|e| PipelineError::Fatal {
                        reason: format!("corrupt job_id in history: {}", e),
                    })?,
                    status: r.get("status"),
                    timestamp: parse_ts(&ts).unwrap_or_else(Utc::now),
                    message: r.try_get("message").ok().flatten(),
                })
            })
            .collect()
    }

    // --- Idempotent submission (Idempotency-Key header) ---

    /// Looks up a prior submission under this key. Returns the stored
    /// `(body_hash, job_id)` pair; the caller compares body hashes and maps
    /// a mismatch to `Conflict`.
    pub async fn lookup_idempotent(
        &self,
        key_hash: &str,
        ttl_hours: i64,
    ) -> Result<Option<(String, Uuid)>, PipelineError> {
        let cutoff = (Utc::now() - chrono::Duration::hours(ttl_hours)).to_rfc3339();
        let row = sqlx::query(
            "SELECT body_hash, job_id FROM idempotency_keys WHERE key_hash = ? AND created_at >= ?",
        )
        .bind(key_hash)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await
        .map_err(PipelineError::storage)?;

        row.map(|r| {
            let body_hash: String = r.get("body_hash");
            let job_id: String = r.get("job_id");
            Uuid::parse_str(&job_id)
                .map(|id| (body_hash, id))
                .map_err(|e| PipelineError::Fatal { reason: format!("corrupt idempotency row: {}", e) })
        })
        .transpose()
    }

    pub async fn remember_idempotent(
        &self,
        key_hash: &str,
        body_hash: &str,
        job_id: Uuid,
    ) -> Result<(), PipelineError> {
        sqlx::query(
            "INSERT INTO idempotency_keys (key_hash, body_hash, job_id, created_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(key_hash) DO NOTHING",
        )
        .bind(key_hash)
        .bind(body_hash)
        .bind(job_id.to_string())
        .bind(now_str())
        .execute(&self.pool)
        .await
        .map_err(PipelineError::storage)?;
        Ok(())
    }

    /// Drops idempotency rows past their TTL.
    pub async fn purge_idempotency(&self, ttl_hours: i64) -> Result<u64, PipelineError> {
        let cutoff = (Utc::now() - chrono::Duration::hours(ttl_hours)).to_rfc3339();
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(PipelineError::storage)?;
        Ok(result.rows_affected())
    }
}

/// Stable content hash for idempotency keys and request bodies.
pub fn content_hash(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<AmrJob, PipelineError> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let kind: String = row.get("kind");
    let created_at: String = row.get("created_at");

    let params = row
        .try_get::<Option<String>, _>("model_name")
        .ok()
        .flatten()
        .map(|model_name| AmrJobParams {
            model_name,
            batch_size: row.try_get("batch_size").unwrap_or(1),
            segment_length: row.try_get("segment_length").unwrap_or(0),
            segment_overlap: row.try_get("segment_overlap").unwrap_or(0),
            use_cpu: row.try_get::<i64, _>("use_cpu").unwrap_or(0) != 0,
            resistance_threshold: row.try_get("resistance_threshold").unwrap_or(0.5),
            enable_sequence_aggregation: row
                .try_get::<i64, _>("enable_sequence_aggregation")
                .unwrap_or(0)
                != 0,
        });

    Ok(AmrJob {
        id: Uuid::parse_str(&id).map_err(|e| PipelineError::Fatal {
            reason: format!("corrupt job id {}: {}", id, e),
        })?,
        user_id: row.try_get("user_id").ok().flatten(),
        job_name: row.get("job_name"),
        kind: JobKind::parse(&kind).ok_or_else(|| PipelineError::Fatal {
            reason: format!("unknown job kind {}", kind),
        })?,
        status: JobStatus::parse(&status).ok_or_else(|| PipelineError::Fatal {
            reason: format!("unknown job status {}", status),
        })?,
        progress: row.get("progress"),
        created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
        started_at: parse_opt_ts(row.try_get("started_at").ok().flatten()),
        completed_at: parse_opt_ts(row.try_get("completed_at").ok().flatten()),
        error: row.try_get("error").ok().flatten(),
        input_file_path: row.try_get("input_file_path").ok().flatten(),
        result_file_path: row.try_get("result_file_path").ok().flatten(),
        aggregated_result_file_path: row.try_get("aggregated_result_file_path").ok().flatten(),
        worker_id: row.try_get("worker_id").ok().flatten(),
        params,
    })
}
