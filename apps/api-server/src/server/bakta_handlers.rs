//! # Bakta endpoint handlers
//!
//! Submission validates the FASTA and the merged config up front, persists
//! the local job with its sequences, then hands the remote protocol to the
//! orchestrator task.

use axum::extract::{Multipart, Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use infrastructure::bakta_repository::AnnotationQuery;
use pipeline_core::bakta_config::BaktaConfig;
use pipeline_core::contracts::{BaktaJobResponse, RemoteJobRef};
use pipeline_core::error::PipelineError;
use pipeline_core::models::{BaktaFileType, BaktaJob, BaktaJobStatus};
use serde::Deserialize;
use shared::fasta::parse_fasta;
use std::sync::Arc;
use uuid::Uuid;

use super::error::{validation_error, ApiError};
use super::handlers::{read_multipart, stream_file};
use super::router::AppState;
use crate::bakta_orchestrator::{PRODIGAL_SIBLING, REPLICONS_SIBLING};

async fn job_to_response(state: &AppState, job: &BaktaJob) -> Result<BaktaJobResponse, PipelineError> {
    let sequence_count = state.bakta.sequence_count(job.id).await?;
    let result_files = state
        .bakta
        .result_files(job.id)
        .await?
        .into_iter()
        .map(|f| f.file_type.as_str().to_string())
        .collect();
    Ok(BaktaJobResponse {
        job_id: job.id,
        name: job.name.clone(),
        status: job.status.as_str().to_string(),
        created_at: job.created_at,
        updated_at: job.updated_at,
        started_at: job.started_at,
        completed_at: job.completed_at,
        error: job.error.clone(),
        sequence_count,
        result_files,
    })
}

/// Preset < environment overrides < request config, then validated.
fn merge_config(
    preset: Option<&str>,
    request_config: Option<&str>,
) -> Result<BaktaConfig, Vec<String>> {
    let base = match preset {
        Some(name) => {
            BaktaConfig::preset(name).ok_or_else(|| vec![format!("unknown preset '{}'", name)])?
        }
        None => BaktaConfig::default(),
    };
    let mut merged = match serde_json::to_value(&base) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => return Err(vec!["config serialization failed".to_string()]),
    };

    for (key, value) in shared::config::bakta_env_overrides() {
        merged.insert(key, value);
    }

    if let Some(raw) = request_config {
        let requested: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| vec![format!("'config' is not valid JSON: {}", e)])?;
        let serde_json::Value::Object(requested) = requested else {
            return Err(vec!["'config' must be a JSON object".to_string()]);
        };
        for (key, value) in requested {
            merged.insert(key, value);
        }
    }

    let config: BaktaConfig = serde_json::from_value(serde_json::Value::Object(merged))
        .map_err(|e| vec![format!("config does not match the expected schema: {}", e)])?;
    config.validate().map_err(|reason| vec![reason])?;
    Ok(config)
}

pub async fn submit(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let form = read_multipart(multipart).await?;
    let Some(fasta) = form.files.iter().find(|f| f.field == "file") else {
        return Ok(validation_error(vec!["a 'file' upload is required".to_string()]));
    };

    let config = match merge_config(
        form.fields.get("preset").map(String::as_str),
        form.fields.get("config").map(String::as_str),
    ) {
        Ok(config) => config,
        Err(detail) => return Ok(validation_error(detail)),
    };

    let text = match std::str::from_utf8(&fasta.bytes) {
        Ok(text) => text,
        Err(_) => return Ok(validation_error(vec!["FASTA upload is not valid UTF-8".to_string()])),
    };
    let records = match parse_fasta(text) {
        Ok(records) => records,
        Err(e) => return Ok(validation_error(vec![e.to_string()])),
    };

    let job_id = Uuid::new_v4();
    tokio::fs::create_dir_all(&state.config.upload_dir)
        .await
        .map_err(PipelineError::storage)?;
    let fasta_path = format!("{}/{}_{}", state.config.upload_dir, job_id, sanitize(&fasta.filename));
    tokio::fs::write(&fasta_path, &fasta.bytes)
        .await
        .map_err(PipelineError::storage)?;

    // Optional companion uploads land beside the FASTA under fixed names
    // the orchestrator knows to look for.
    for (field, sibling) in [("prodigal", PRODIGAL_SIBLING), ("replicons", REPLICONS_SIBLING)] {
        if let Some(upload) = form.files.iter().find(|f| f.field == field) {
            let path = format!("{}/{}_{}", state.config.upload_dir, job_id, sibling);
            tokio::fs::write(&path, &upload.bytes)
                .await
                .map_err(PipelineError::storage)?;
        }
    }

    let config_json = serde_json::to_string(&config).map_err(|e| PipelineError::Fatal {
        reason: format!("config reserialization failed: {}", e),
    })?;
    let name = form
        .fields
        .get("name")
        .cloned()
        .unwrap_or_else(|| fasta.filename.clone());

    let job = BaktaJob {
        id: job_id,
        remote_id: None,
        secret: None,
        name,
        status: BaktaJobStatus::Init,
        fasta_path,
        config_json,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        started_at: None,
        completed_at: None,
        error: None,
    };
    let sequences: Vec<(String, String)> = records
        .iter()
        .map(|r| (r.header.clone(), r.bases.clone()))
        .collect();
    state.bakta.create(&job, &sequences).await?;

    tokio::spawn(state.orchestrator.clone().run(job_id));
    tracing::info!("[Api] accepted bakta job {} ({} sequences)", job_id, sequences.len());

    let body = job_to_response(&state, &job).await?;
    Ok(Json(body).into_response())
}

fn sanitize(filename: &str) -> String {
    std::path::Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload.fasta".to_string())
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: i64,
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => match BaktaJobStatus::parse(raw) {
            Some(status) => Some(status),
            None => return Ok(validation_error(vec![format!("unknown status '{}'", raw)])),
        },
    };
    let jobs = state.bakta.list(status, query.limit, query.offset).await?;
    let mut body = Vec::with_capacity(jobs.len());
    for job in &jobs {
        body.push(job_to_response(&state, job).await?);
    }
    Ok(Json(body).into_response())
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<BaktaJobResponse>, ApiError> {
    let job = state
        .bakta
        .get(id)
        .await?
        .ok_or_else(|| PipelineError::not_found(format!("bakta job {}", id)))?;
    Ok(Json(job_to_response(&state, &job).await?))
}

pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let deleted = state.orchestrator.delete(id).await?;
    if !deleted {
        return Err(ApiError(PipelineError::not_found(format!("bakta job {}", id))));
    }
    Ok(Json(serde_json::json!({ "deleted": true, "job_id": id })).into_response())
}

pub async fn download_file(
    State(state): State<Arc<AppState>>,
    Path((id, file_type)): Path<(Uuid, String)>,
) -> Result<Response, ApiError> {
    let wanted = BaktaFileType::from_key(&file_type);
    let record = state
        .bakta
        .result_file(id, &wanted)
        .await?
        .ok_or_else(|| PipelineError::not_found(format!("{} result for bakta job {}", file_type, id)))?;
    stream_file(&record.file_path).await
}

#[derive(Debug, Deserialize)]
pub struct AnnotationsQueryParams {
    pub feature_type: Option<String>,
    pub contig: Option<String>,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: i64,
    pub order_by: Option<String>,
}

pub async fn annotations(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<AnnotationsQueryParams>,
) -> Result<Response, ApiError> {
    if state.bakta.get(id).await?.is_none() {
        return Err(ApiError(PipelineError::not_found(format!("bakta job {}", id))));
    }
    let query = AnnotationQuery {
        feature_type: params.feature_type,
        contig: params.contig,
        start: params.start,
        end: params.end,
        limit: params.limit,
        offset: params.offset,
        order_by: params.order_by,
    };
    let annotations = state.bakta.annotations(id, &query).await?;
    Ok(Json(annotations).into_response())
}

pub async fn logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let job = state
        .bakta
        .get(id)
        .await?
        .ok_or_else(|| PipelineError::not_found(format!("bakta job {}", id)))?;
    let (Some(remote_id), Some(secret)) = (job.remote_id, job.secret) else {
        return Err(ApiError(PipelineError::not_found(format!(
            "remote logs for bakta job {} (not yet started)",
            id
        ))));
    };
    let logs = state
        .bakta_api
        .job_logs(&RemoteJobRef { job_id: remote_id, secret })
        .await?;
    Ok(logs.into_response())
}

pub async fn version(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let version = state.bakta_api.version().await?;
    Ok(Json(version).into_response())
}
