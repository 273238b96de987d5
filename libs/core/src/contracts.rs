//! # Wire contracts
//!
//! Typed payloads for the public HTTP API and for the remote Bakta protocol.
//! The API layer is the only place that turns `PipelineError` into HTTP.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bakta_config::BaktaConfig;

// --- Public API: job views ---

/// Canonical job view returned by every AMR-side endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub job_id: Uuid,
    pub status: String,
    pub progress: f64,
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregated_result_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<serde_json::Value>,
}

/// Bakta job view, local state plus the last observed remote status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaktaJobResponse {
    pub job_id: Uuid,
    pub name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub sequence_count: i64,
    pub result_files: Vec<String>,
}

// --- Public API: error envelopes ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// `{error: {code, message, details?}}` — every non-422 error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorDetail,
}

/// `422` body for malformed submissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationErrorBody {
    pub detail: Vec<String>,
    pub message: String,
}

impl ValidationErrorBody {
    pub fn new(detail: Vec<String>) -> Self {
        Self {
            detail,
            message: "Validation error - check your request format".to_string(),
        }
    }
}

// --- Bakta remote protocol ---

/// `remote_id` + `secret`; authorizes every call on that remote job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteJobRef {
    #[serde(rename = "jobID")]
    pub job_id: Uuid,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitJobRequest {
    pub name: String,
    pub replicon_table_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitJobResponse {
    pub job: RemoteJobRef,
    pub upload_link_fasta: String,
    pub upload_link_prodigal: String,
    pub upload_link_replicons: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartJobRequest {
    pub config: BaktaConfig,
    pub job: RemoteJobRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListJobsRequest {
    pub jobs: Vec<RemoteJobRef>,
}

/// Per-job status entry of a `list` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteJobStatus {
    #[serde(rename = "jobID")]
    pub job_id: Uuid,
    pub job_status: String,
    pub started: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub name: Option<String>,
}

/// Jobs the remote refused to report on (`UNAUTHORIZED` / `NOT_FOUND`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedRemoteJob {
    #[serde(rename = "jobID")]
    pub job_id: Uuid,
    pub job_status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsResponse {
    pub jobs: Vec<RemoteJobStatus>,
    #[serde(default)]
    pub failed_jobs: Vec<FailedRemoteJob>,
}

/// `result` response: a map of file-type key to pre-signed download URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResultResponse {
    #[serde(rename = "ResultFiles")]
    pub result_files: std::collections::BTreeMap<String, String>,
    #[serde(rename = "jobID")]
    pub job_id: Uuid,
    pub name: Option<String>,
    pub started: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteVersion {
    #[serde(default)]
    pub tool_version: Option<String>,
    #[serde(default)]
    pub db_version: Option<String>,
    #[serde(default)]
    pub backend_version: Option<String>,
}
