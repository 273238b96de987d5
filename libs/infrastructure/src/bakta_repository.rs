//! # Bakta job repository
//!
//! Local persistence for jobs delegated to the remote annotation service:
//! the job row with its remote credentials, the parsed input sequences,
//! downloaded result-file metadata and the annotation table with its
//! range-query support.

use chrono::Utc;
use pipeline_core::error::PipelineError;
use pipeline_core::models::{
    BaktaAnnotation, BaktaFileType, BaktaJob, BaktaJobStatus, BaktaResultFile, BaktaSequence,
    Strand,
};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::store::{now_str, parse_opt_ts, parse_ts, Store};

/// Filters for the annotation listing. Range filtering returns every
/// feature overlapping `[start, end]`.
#[derive(Debug, Default, Clone)]
pub struct AnnotationQuery {
    pub feature_type: Option<String>,
    pub contig: Option<String>,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub limit: Option<i64>,
    pub offset: i64,
    pub order_by: Option<String>,
}

#[derive(Clone)]
pub struct BaktaRepository {
    pool: SqlitePool,
}

impl BaktaRepository {
    pub fn new(store: &Store) -> Self {
        Self { pool: store.pool().clone() }
    }

    /// Persists the job row, its parsed sequences and the initial `Init`
    /// history row in one transaction.
    pub async fn create(
        &self,
        job: &BaktaJob,
        sequences: &[(String, String)],
    ) -> Result<(), PipelineError> {
        let mut tx = self.pool.begin().await.map_err(PipelineError::storage)?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO bakta_jobs \
             (id, remote_id, secret, name, status, fasta_path, config_json, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(job.remote_id.map(|id| id.to_string()))
        .bind(&job.secret)
        .bind(&job.name)
        .bind(job.status.as_str())
        .bind(&job.fasta_path)
        .bind(&job.config_json)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(PipelineError::storage)?;

        if inserted.rows_affected() == 0 {
            return Err(PipelineError::Conflict {
                reason: format!("bakta job id {} already exists", job.id),
            });
        }

        for (header, sequence) in sequences {
            sqlx::query(
                "INSERT INTO bakta_sequences (job_id, header, sequence, length) VALUES (?, ?, ?, ?)",
            )
            .bind(job.id.to_string())
            .bind(header)
            .bind(sequence)
            .bind(sequence.len() as i64)
            .execute(&mut *tx)
            .await
            .map_err(PipelineError::storage)?;
        }

        sqlx::query(
            "INSERT INTO job_status_history (job_id, status, timestamp, message) VALUES (?, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(BaktaJobStatus::Init.as_str())
        .bind(job.created_at.to_rfc3339())
        .bind("annotation job accepted")
        .execute(&mut *tx)
        .await
        .map_err(PipelineError::storage)?;

        tx.commit().await.map_err(PipelineError::storage)?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<BaktaJob>, PipelineError> {
        let row = sqlx::query("SELECT * FROM bakta_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(PipelineError::storage)?;
        row.map(|r| row_to_bakta_job(&r)).transpose()
    }

    pub async fn list(
        &self,
        status: Option<BaktaJobStatus>,
        limit: Option<i64>,
        offset: i64,
    ) -> Result<Vec<BaktaJob>, PipelineError> {
        let limit = limit.unwrap_or(100).clamp(1, 1000);
        let mut qb = sqlx::QueryBuilder::new("SELECT * FROM bakta_jobs WHERE 1 = 1");
        if let Some(status) = status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset.max(0));

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(PipelineError::storage)?;
        rows.iter().map(row_to_bakta_job).collect()
    }

    /// Jobs to resume after a restart: anything not yet terminal.
    pub async fn non_terminal(&self) -> Result<Vec<BaktaJob>, PipelineError> {
        let rows = sqlx::query(
            "SELECT * FROM bakta_jobs WHERE status IN ('Init', 'Running') ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::storage)?;
        rows.iter().map(row_to_bakta_job).collect()
    }

    /// Stores the credentials returned by the remote `init` call.
    pub async fn set_remote_ref(
        &self,
        id: Uuid,
        remote_id: Uuid,
        secret: &str,
    ) -> Result<bool, PipelineError> {
        let result = sqlx::query(
            "UPDATE bakta_jobs SET remote_id = ?, secret = ?, updated_at = ? WHERE id = ?",
        )
        .bind(remote_id.to_string())
        .bind(secret)
        .bind(now_str())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(PipelineError::storage)?;
        Ok(result.rows_affected() > 0)
    }

    /// Moves the local status, appending a history row in the same
    /// transaction. Terminal rows never move again.
    pub async fn update_status(
        &self,
        id: Uuid,
        status: BaktaJobStatus,
        message: Option<&str>,
    ) -> Result<bool, PipelineError> {
        let mut tx = self.pool.begin().await.map_err(PipelineError::storage)?;

        let row = sqlx::query("SELECT status FROM bakta_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(PipelineError::storage)?;
        let Some(row) = row else {
            return Ok(false);
        };
        let current = BaktaJobStatus::parse(&row.get::<String, _>("status")).ok_or_else(|| {
            PipelineError::Fatal { reason: format!("bakta job {} carries an unknown status", id) }
        })?;

        if current == status {
            return Ok(true);
        }
        if current.is_terminal() {
            return Err(PipelineError::Conflict {
                reason: format!(
                    "illegal status transition {} -> {} for bakta job {}",
                    current, status, id
                ),
            });
        }

        let now = now_str();
        let mut qb = sqlx::QueryBuilder::new("UPDATE bakta_jobs SET status = ");
        qb.push_bind(status.as_str());
        qb.push(", updated_at = ").push_bind(now.clone());
        if status == BaktaJobStatus::Running {
            qb.push(", started_at = ").push_bind(now.clone());
        }
        if status.is_terminal() {
            qb.push(", completed_at = ").push_bind(now.clone());
        }
        if status == BaktaJobStatus::Error {
            if let Some(message) = message {
                qb.push(", error = ").push_bind(message.to_string());
            }
        }
        qb.push(" WHERE id = ").push_bind(id.to_string());
        qb.build()
            .execute(&mut *tx)
            .await
            .map_err(PipelineError::storage)?;

        sqlx::query(
            "INSERT INTO job_status_history (job_id, status, timestamp, message) VALUES (?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(status.as_str())
        .bind(now)
        .bind(message)
        .execute(&mut *tx)
        .await
        .map_err(PipelineError::storage)?;

        tx.commit().await.map_err(PipelineError::storage)?;
        Ok(true)
    }

    /// Appends an observed remote status to the audit trail without moving
    /// the local state machine.
    pub async fn append_history(
        &self,
        id: Uuid,
        status: &str,
        message: Option<&str>,
    ) -> Result<(), PipelineError> {
        sqlx::query(
            "INSERT INTO job_status_history (job_id, status, timestamp, message) VALUES (?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(status)
        .bind(now_str())
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::storage)?;
        Ok(())
    }

    pub async fn sequences(&self, job_id: Uuid) -> Result<Vec<BaktaSequence>, PipelineError> {
        let rows = sqlx::query(
            "SELECT id, job_id, header, sequence, length FROM bakta_sequences \
             WHERE job_id = ? ORDER BY id ASC",
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::storage)?;

        rows.into_iter()
            .map(|r| {
                Ok(BaktaSequence {
                    id: r.get("id"),
                    job_id,
                    header: r.get("header"),
                    sequence: r.get("sequence"),
                    length: r.get("length"),
                })
            })
            .collect()
    }

    pub async fn sequence_count(&self, job_id: Uuid) -> Result<i64, PipelineError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM bakta_sequences WHERE job_id = ?")
            .bind(job_id.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(PipelineError::storage)?;
        Ok(row.get("n"))
    }

    pub async fn add_result_file(
        &self,
        job_id: Uuid,
        file_type: &BaktaFileType,
        file_path: &str,
        download_url: Option<&str>,
    ) -> Result<(), PipelineError> {
        sqlx::query(
            "INSERT INTO bakta_result_files (job_id, file_type, file_path, download_url, downloaded_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(job_id.to_string())
        .bind(file_type.as_str())
        .bind(file_path)
        .bind(download_url)
        .bind(now_str())
        .execute(&self.pool)
        .await
        .map_err(PipelineError::storage)?;
        Ok(())
    }

    pub async fn result_files(&self, job_id: Uuid) -> Result<Vec<BaktaResultFile>, PipelineError> {
        let rows = sqlx::query(
            "SELECT id, file_type, file_path, download_url, downloaded_at \
             FROM bakta_result_files WHERE job_id = ? ORDER BY file_type ASC",
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::storage)?;

        rows.into_iter()
            .map(|r| {
                let file_type: String = r.get("file_type");
                let downloaded_at: String = r.get("downloaded_at");
                Ok(BaktaResultFile {
                    id: r.get("id"),
                    job_id,
                    file_type: BaktaFileType::from_key(&file_type),
                    file_path: r.get("file_path"),
                    download_url: r.try_get("download_url").ok().flatten(),
                    downloaded_at: parse_ts(&downloaded_at).unwrap_or_else(Utc::now),
                })
            })
            .collect()
    }

    pub async fn result_file(
        &self,
        job_id: Uuid,
        file_type: &BaktaFileType,
    ) -> Result<Option<BaktaResultFile>, PipelineError> {
        Ok(self
            .result_files(job_id)
            .await?
            .into_iter()
            .find(|f| &f.file_type == file_type))
    }

    /// Batched insert of parsed annotations in a single transaction.
    pub async fn save_annotations(
        &self,
        job_id: Uuid,
        annotations: &[BaktaAnnotation],
    ) -> Result<u64, PipelineError> {
        let mut tx = self.pool.begin().await.map_err(PipelineError::storage)?;
        let mut written = 0u64;

        for annotation in annotations {
            sqlx::query(
                "INSERT INTO bakta_annotations \
                 (job_id, feature_id, feature_type, contig, start_pos, end_pos, strand, attributes_json) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(job_id.to_string())
            .bind(&annotation.feature_id)
            .bind(&annotation.feature_type)
            .bind(&annotation.contig)
            .bind(annotation.start)
            .bind(annotation.end)
            .bind(annotation.strand.as_str())
            .bind(&annotation.attributes_json)
            .execute(&mut *tx)
            .await
            .map_err(PipelineError::storage)?;
            written += 1;
        }

        tx.commit().await.map_err(PipelineError::storage)?;
        Ok(written)
    }

    /// Annotation listing with filters. A range filter returns exactly the
    /// features with `NOT (end < range_start OR start > range_end)`. Equal
    /// coordinates tie-break deterministically by `feature_id`.
    pub async fn annotations(
        &self,
        job_id: Uuid,
        query: &AnnotationQuery,
    ) -> Result<Vec<BaktaAnnotation>, PipelineError> {
        let limit = query.limit.unwrap_or(100).clamp(1, 1000);

        let mut qb = sqlx::QueryBuilder::new(
            "SELECT id, feature_id, feature_type, contig, start_pos, end_pos, strand, attributes_json \
             FROM bakta_annotations WHERE job_id = ",
        );
        qb.push_bind(job_id.to_string());

        if let Some(feature_type) = &query.feature_type {
            qb.push(" AND feature_type = ").push_bind(feature_type.clone());
        }
        if let Some(contig) = &query.contig {
            qb.push(" AND contig = ").push_bind(contig.clone());
        }
        if let Some(start) = query.start {
            qb.push(" AND end_pos >= ").push_bind(start);
        }
        if let Some(end) = query.end {
            qb.push(" AND start_pos <= ").push_bind(end);
        }

        match query.order_by.as_deref() {
            Some("feature_id") => qb.push(" ORDER BY feature_id ASC"),
            Some("feature_type") => qb.push(" ORDER BY feature_type ASC, start_pos ASC, feature_id ASC"),
            _ => qb.push(" ORDER BY start_pos ASC, end_pos ASC, feature_id ASC"),
        };

        qb.push(" LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(query.offset.max(0));

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(PipelineError::storage)?;

        rows.into_iter()
            .map(|r| {
                let strand: String = r.get("strand");
                Ok(BaktaAnnotation {
                    id: r.get("id"),
                    job_id,
                    feature_id: r.get("feature_id"),
                    feature_type: r.get("feature_type"),
                    contig: r.get("contig"),
                    start: r.get("start_pos"),
                    end: r.get("end_pos"),
                    strand: Strand::parse(&strand),
                    attributes_json: r.get("attributes_json"),
                })
            })
            .collect()
    }

    pub async fn annotation_count(&self, job_id: Uuid) -> Result<i64, PipelineError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM bakta_annotations WHERE job_id = ?")
            .bind(job_id.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(PipelineError::storage)?;
        Ok(row.get("n"))
    }

    /// Deletes the job; sequences, result files and annotations cascade,
    /// the shared history table is cleared in the same transaction.
    pub async fn delete(&self, id: Uuid) -> Result<bool, PipelineError> {
        let mut tx = self.pool.begin().await.map_err(PipelineError::storage)?;

        sqlx::query("DELETE FROM job_status_history WHERE job_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(PipelineError::storage)?;

        let result = sqlx::query("DELETE FROM bakta_jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(PipelineError::storage)?;

        tx.commit().await.map_err(PipelineError::storage)?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_bakta_job(row: &sqlx::sqlite::SqliteRow) -> Result<BaktaJob, PipelineError> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    let remote_id: Option<String> = row.try_get("remote_id").ok().flatten();

    Ok(BaktaJob {
        id: Uuid::parse_str(&id).map_err(|e| PipelineError::Fatal {
            reason: format!("corrupt bakta job id {}: {}", id, e),
        })?,
        remote_id: remote_id.as_deref().and_then(|s| Uuid::parse_str(s).ok()),
        secret: row.try_get("secret").ok().flatten(),
        name: row.get("name"),
        status: BaktaJobStatus::parse(&status).ok_or_else(|| PipelineError::Fatal {
            reason: format!("unknown bakta status {}", status),
        })?,
        fasta_path: row.get("fasta_path"),
        config_json: row.get("config_json"),
        created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
        updated_at: parse_ts(&updated_at).unwrap_or_else(Utc::now),
        started_at: parse_opt_ts(row.try_get("started_at").ok().flatten()),
        completed_at: parse_opt_ts(row.try_get("completed_at").ok().flatten()),
        error: row.try_get("error").ok().flatten(),
    })
}
