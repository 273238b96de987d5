//! # AMR endpoint handlers
//!
//! Submission endpoints accept multipart forms, validate, persist a
//! `Submitted` job and return immediately; execution happens on the worker
//! pool. All mutating endpoints honor a client `Idempotency-Key` header.

use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use infrastructure::job_repository::{content_hash, StatusUpdate};
use pipeline_core::contracts::JobResponse;
use pipeline_core::error::PipelineError;
use pipeline_core::models::{AmrJob, AmrJobParams, JobKind, JobStatus, MAX_JOB_NAME_LEN};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use super::error::{too_many_jobs, validation_error, ApiError};
use super::router::AppState;

/// Back-pressure guard; submissions beyond this get a 429.
const MAX_ACTIVE_JOBS: i64 = 256;
const IDEMPOTENCY_TTL_HOURS: i64 = 24;

const KNOWN_PARAM_FIELDS: &[&str] = &[
    "job_name",
    "model_name",
    "batch_size",
    "segment_length",
    "segment_overlap",
    "use_cpu",
    "resistance_threshold",
    "enable_sequence_aggregation",
    "model_suffix",
    "file_pattern",
    "step_size",
];

pub struct UploadedFile {
    pub field: String,
    pub filename: String,
    pub bytes: Vec<u8>,
}

pub struct SubmissionForm {
    pub fields: std::collections::BTreeMap<String, String>,
    pub files: Vec<UploadedFile>,
}

/// Drains a multipart body into text fields and file parts.
pub async fn read_multipart(mut multipart: Multipart) -> Result<SubmissionForm, ApiError> {
    let mut form = SubmissionForm { fields: Default::default(), files: Vec::new() };
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError(PipelineError::InvalidInput { reason: format!("malformed multipart body: {}", e) })
    })? {
        let name = field.name().unwrap_or_default().to_string();
        if let Some(filename) = field.file_name().map(String::from) {
            let bytes = field.bytes().await.map_err(|e| {
                ApiError(PipelineError::InvalidInput { reason: format!("upload truncated: {}", e) })
            })?;
            form.files.push(UploadedFile { field: name, filename, bytes: bytes.to_vec() });
        } else {
            let value = field.text().await.map_err(|e| {
                ApiError(PipelineError::InvalidInput { reason: format!("unreadable form field: {}", e) })
            })?;
            form.fields.insert(name, value);
        }
    }
    Ok(form)
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        other => Err(format!("expected a boolean, got '{}'", other)),
    }
}

/// Typed params from the form. Unknown keys are rejected outright.
fn parse_amr_params(
    fields: &std::collections::BTreeMap<String, String>,
) -> Result<AmrJobParams, Vec<String>> {
    let mut detail = Vec::new();
    for key in fields.keys() {
        if !KNOWN_PARAM_FIELDS.contains(&key.as_str()) {
            detail.push(format!("unknown parameter '{}'", key));
        }
    }

    let mut params = AmrJobParams::default();
    let mut parse_int = |key: &str, target: &mut i64| {
        if let Some(raw) = fields.get(key) {
            match raw.trim().parse::<i64>() {
                Ok(v) => *target = v,
                Err(_) => detail.push(format!("'{}' must be an integer, got '{}'", key, raw)),
            }
        }
    };
    parse_int("batch_size", &mut params.batch_size);
    parse_int("segment_length", &mut params.segment_length);
    parse_int("segment_overlap", &mut params.segment_overlap);

    if let Some(raw) = fields.get("model_name") {
        params.model_name = raw.trim().to_string();
    }
    if let Some(raw) = fields.get("use_cpu") {
        match parse_bool(raw) {
            Ok(v) => params.use_cpu = v,
            Err(e) => detail.push(format!("'use_cpu': {}", e)),
        }
    }
    if let Some(raw) = fields.get("enable_sequence_aggregation") {
        match parse_bool(raw) {
            Ok(v) => params.enable_sequence_aggregation = v,
            Err(e) => detail.push(format!("'enable_sequence_aggregation': {}", e)),
        }
    }
    if let Some(raw) = fields.get("resistance_threshold") {
        match raw.trim().parse::<f64>() {
            Ok(v) => params.resistance_threshold = v,
            Err(_) => detail.push(format!("'resistance_threshold' must be a number, got '{}'", raw)),
        }
    }

    if let Err(reason) = params.validate() {
        detail.push(reason);
    }
    if detail.is_empty() {
        Ok(params)
    } else {
        Err(detail)
    }
}

pub fn job_to_response(job: &AmrJob) -> JobResponse {
    JobResponse {
        job_id: job.id,
        status: job.status.as_str().to_string(),
        progress: job.progress,
        start_time: job.started_at,
        end_time: job.completed_at,
        result_file: job.result_file_path.clone(),
        aggregated_result_file: job.aggregated_result_file_path.clone(),
        error: job.error.clone(),
        additional_info: Some(serde_json::json!({ "kind": job.kind.as_str() })),
    }
}

fn user_id_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get("X-User-Id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

async fn save_upload(
    upload_dir: &str,
    job_id: Uuid,
    filename: &str,
    bytes: &[u8],
) -> Result<String, PipelineError> {
    tokio::fs::create_dir_all(upload_dir)
        .await
        .map_err(PipelineError::storage)?;
    // Keep only the final path component of whatever the client sent.
    let safe_name = std::path::Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload.fasta".to_string());
    let path = format!("{}/{}_{}", upload_dir, job_id, safe_name);
    tokio::fs::write(&path, bytes)
        .await
        .map_err(PipelineError::storage)?;
    Ok(path)
}

struct Submission {
    kind: JobKind,
    params: AmrJobParams,
    extra: serde_json::Map<String, serde_json::Value>,
}

/// Shared submission tail: idempotency, back-pressure, upload persistence,
/// job creation.
async fn submit_job(
    state: &AppState,
    headers: &HeaderMap,
    form: &SubmissionForm,
    submission: Submission,
) -> Result<Response, ApiError> {
    let files: Vec<&UploadedFile> = form
        .files
        .iter()
        .filter(|f| f.field == "file" || f.field == "files" || f.field == "files[]")
        .collect();
    if files.is_empty() {
        return Ok(validation_error(vec!["a 'file' upload is required".to_string()]));
    }
    for file in &files {
        if file.bytes.is_empty() {
            return Ok(validation_error(vec![format!("uploaded file '{}' is empty", file.filename)]));
        }
    }

    if state.jobs.count_active().await? > MAX_ACTIVE_JOBS {
        return Ok(too_many_jobs(30));
    }

    // hash(key, body): same key + same payload returns the original job,
    // same key + different payload is a conflict.
    let mut body_parts: Vec<&[u8]> = files.iter().map(|f| f.bytes.as_slice()).collect();
    let fields_fingerprint = serde_json::to_string(&form.fields).unwrap_or_default();
    body_parts.push(fields_fingerprint.as_bytes());
    let body_hash = content_hash(&body_parts);

    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|key| content_hash(&[key.as_bytes()]));

    if let Some(key_hash) = &idempotency_key {
        if let Some((stored_body, job_id)) = state
            .jobs
            .lookup_idempotent(key_hash, IDEMPOTENCY_TTL_HOURS)
            .await?
        {
            if stored_body != body_hash {
                return Err(ApiError(PipelineError::Conflict {
                    reason: "idempotency key reused with a different request body".to_string(),
                }));
            }
            let job = state
                .jobs
                .get(job_id)
                .await?
                .ok_or_else(|| PipelineError::not_found(format!("job {}", job_id)))?;
            return Ok(Json(job_to_response(&job)).into_response());
        }
    }

    let job_id = Uuid::new_v4();
    let mut saved_paths = Vec::with_capacity(files.len());
    for file in &files {
        saved_paths.push(save_upload(&state.config.upload_dir, job_id, &file.filename, &file.bytes).await?);
    }

    let job_name = form
        .fields
        .get("job_name")
        .cloned()
        .unwrap_or_else(|| files[0].filename.clone());
    if job_name.len() > MAX_JOB_NAME_LEN {
        return Ok(validation_error(vec![format!(
            "job_name exceeds {} characters",
            MAX_JOB_NAME_LEN
        )]));
    }

    let job = AmrJob {
        id: job_id,
        user_id: user_id_from(headers),
        job_name,
        kind: submission.kind,
        status: JobStatus::Submitted,
        progress: 0.0,
        created_at: chrono::Utc::now(),
        started_at: None,
        completed_at: None,
        error: None,
        input_file_path: saved_paths.first().cloned(),
        result_file_path: None,
        aggregated_result_file_path: None,
        worker_id: None,
        params: None,
    };
    let created = state.jobs.create(&job, &submission.params).await?;

    let mut extra = submission.extra;
    if saved_paths.len() > 1 {
        extra.insert("input_files".to_string(), serde_json::json!(saved_paths));
    }
    if !extra.is_empty() {
        state.jobs.add_parameters(job_id, &extra).await?;
    }
    if let Some(key_hash) = &idempotency_key {
        state.jobs.remember_idempotent(key_hash, &body_hash, job_id).await?;
    }

    tracing::info!("[Api] accepted {} job {}", submission.kind.as_str(), job_id);
    Ok(Json(job_to_response(&created)).into_response())
}

// --- submission endpoints ---

pub async fn predict(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let form = read_multipart(multipart).await?;
    let params = match parse_amr_params(&form.fields) {
        Ok(params) => params,
        Err(detail) => return Ok(validation_error(detail)),
    };
    submit_job(
        &state,
        &headers,
        &form,
        Submission { kind: JobKind::Predict, params, extra: Default::default() },
    )
    .await
}

pub async fn aggregate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let form = read_multipart(multipart).await?;
    let params = match parse_amr_params(&form.fields) {
        Ok(params) => params,
        Err(detail) => return Ok(validation_error(detail)),
    };
    let mut extra = serde_json::Map::new();
    if let Some(suffix) = form.fields.get("model_suffix") {
        extra.insert("model_suffix".to_string(), serde_json::json!(suffix));
    }
    if let Some(pattern) = form.fields.get("file_pattern") {
        extra.insert("file_pattern".to_string(), serde_json::json!(pattern));
    }
    submit_job(
        &state,
        &headers,
        &form,
        Submission { kind: JobKind::Aggregate, params, extra },
    )
    .await
}

pub async fn sequence(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let form = read_multipart(multipart).await?;
    let params = match parse_amr_params(&form.fields) {
        Ok(params) => params,
        Err(detail) => return Ok(validation_error(detail)),
    };
    submit_job(
        &state,
        &headers,
        &form,
        Submission { kind: JobKind::Sequence, params, extra: Default::default() },
    )
    .await
}

pub async fn visualize(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let form = read_multipart(multipart).await?;
    let params = match parse_amr_params(&form.fields) {
        Ok(params) => params,
        Err(detail) => return Ok(validation_error(detail)),
    };
    let mut extra = serde_json::Map::new();
    if let Some(raw) = form.fields.get("step_size") {
        match raw.trim().parse::<u64>() {
            Ok(step) if step >= 1 => {
                extra.insert("step_size".to_string(), serde_json::json!(step));
            }
            _ => {
                return Ok(validation_error(vec![format!(
                    "'step_size' must be a positive integer, got '{}'",
                    raw
                )]))
            }
        }
    }
    submit_job(
        &state,
        &headers,
        &form,
        Submission { kind: JobKind::Visualize, params, extra },
    )
    .await
}

// --- job index & lifecycle ---

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: i64,
    pub user_id: Option<String>,
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Response, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => match JobStatus::parse(raw) {
            Some(status) => Some(status),
            None => {
                return Ok(validation_error(vec![format!("unknown status '{}'", raw)]));
            }
        },
    };
    let jobs = state
        .jobs
        .list(status, query.limit, query.offset, query.user_id.as_deref())
        .await?;
    let body: Vec<JobResponse> = jobs.iter().map(job_to_response).collect();
    Ok(Json(body).into_response())
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state
        .jobs
        .get(id)
        .await?
        .ok_or_else(|| PipelineError::not_found(format!("job {}", id)))?;
    Ok(Json(job_to_response(&job)))
}

#[derive(Debug, Deserialize)]
pub struct PatchJobBody {
    pub status: String,
}

/// The one client-writable transition: cancel.
pub async fn patch_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<PatchJobBody>,
) -> Result<Response, ApiError> {
    if JobStatus::parse(&body.status) != Some(JobStatus::Cancelled) {
        return Ok(validation_error(vec![format!(
            "only a 'Cancelled' status may be requested, got '{}'",
            body.status
        )]));
    }
    let found = state
        .jobs
        .update_status(
            id,
            StatusUpdate {
                status: Some(JobStatus::Cancelled),
                message: Some("cancelled by owner".to_string()),
                ..Default::default()
            },
        )
        .await?;
    if !found {
        return Err(ApiError(PipelineError::not_found(format!("job {}", id))));
    }
    let job = state
        .jobs
        .get(id)
        .await?
        .ok_or_else(|| PipelineError::not_found(format!("job {}", id)))?;
    Ok(Json(job_to_response(&job)).into_response())
}

pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let Some(job) = state.jobs.get(id).await? else {
        return Err(ApiError(PipelineError::not_found(format!("job {}", id))));
    };
    for path in [&job.input_file_path, &job.result_file_path, &job.aggregated_result_file_path]
        .into_iter()
        .flatten()
    {
        if tokio::fs::remove_file(path).await.is_err() {
            tracing::debug!("[Api] file {} already gone", path);
        }
    }
    state.jobs.delete(id).await?;
    Ok(Json(serde_json::json!({ "deleted": true, "job_id": id })).into_response())
}

// --- downloads ---

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub file_type: Option<String>,
}

pub async fn download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let job = state
        .jobs
        .get(id)
        .await?
        .ok_or_else(|| PipelineError::not_found(format!("job {}", id)))?;

    let path = match query.file_type.as_deref().unwrap_or("regular") {
        "regular" => job.result_file_path.clone(),
        "aggregated" => job.aggregated_result_file_path.clone(),
        other => {
            let body = serde_json::json!({
                "error": {
                    "code": "invalid_input",
                    "message": format!("file_type must be 'regular' or 'aggregated', got '{}'", other),
                }
            });
            return Ok((StatusCode::BAD_REQUEST, Json(body)).into_response());
        }
    };
    let path = path.ok_or_else(|| PipelineError::not_found(format!("result file for job {}", id)))?;

    stream_file(&path).await
}

/// Streams a file from disk without buffering it whole.
pub async fn stream_file(path: &str) -> Result<Response, ApiError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|_| PipelineError::not_found(format!("file {}", path)))?;
    let name = std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());

    let stream = ReaderStream::new(file);
    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", name),
        ),
    ];
    Ok((headers, Body::from_stream(stream)).into_response())
}

// --- health ---

pub async fn health(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    state.store.ping().await?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "environment": state.config.environment,
    }))
    .into_response())
}
