//! # HTTP error translation
//!
//! The only place `PipelineError` becomes a status code. Validation errors
//! use the flat `{detail, message}` shape; everything else wraps in
//! `{error: {code, message}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pipeline_core::contracts::{ErrorDetail, ErrorEnvelope, ValidationErrorBody};
use pipeline_core::error::PipelineError;

pub struct ApiError(pub PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let e = self.0;
        match &e {
            PipelineError::InvalidInput { reason } => {
                let body = ValidationErrorBody::new(vec![reason.clone()]);
                (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response()
            }
            _ => {
                let status = match &e {
                    PipelineError::NotFound { .. } => StatusCode::NOT_FOUND,
                    PipelineError::Conflict { .. } => StatusCode::CONFLICT,
                    PipelineError::Auth { .. } => StatusCode::UNAUTHORIZED,
                    PipelineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    PipelineError::RemoteTransient { .. }
                    | PipelineError::RemotePermanent { .. } => StatusCode::BAD_GATEWAY,
                    // Storage is retried once at the unit-of-work boundary
                    // before it ever reaches this translation.
                    PipelineError::Storage { .. } | PipelineError::Fatal { .. } => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                    PipelineError::InvalidInput { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                };
                // Opaque message for server faults; detail stays in the logs.
                let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
                    tracing::error!("internal error surfaced to client: {}", e);
                    "internal error".to_string()
                } else {
                    e.to_string()
                };
                let body = ErrorEnvelope {
                    error: ErrorDetail { code: e.code().to_string(), message, details: None },
                };
                (status, Json(body)).into_response()
            }
        }
    }
}

/// `422` helper for handler-side validation with several findings.
pub fn validation_error(detail: Vec<String>) -> Response {
    (StatusCode::UNPROCESSABLE_ENTITY, Json(ValidationErrorBody::new(detail))).into_response()
}

/// `429` with a `Retry-After` hint when the submission queue is saturated.
pub fn too_many_jobs(retry_after_secs: u64) -> Response {
    let body = ErrorEnvelope {
        error: ErrorDetail {
            code: "rate_limited".to_string(),
            message: "job queue is saturated; retry later".to_string(),
            details: None,
        },
    };
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(axum::http::header::RETRY_AFTER, retry_after_secs.to_string())],
        Json(body),
    )
        .into_response()
}
