//! # Collaborator traits
//!
//! Seams for the two external services the pipeline drives: the ML inference
//! backend and the Bakta annotation API. Concrete implementations live in
//! `libs/infrastructure`; tests inject fakes. Production never substitutes a
//! mock — if a backend is unreachable the job fails closed.

use crate::contracts::{
    InitJobRequest, InitJobResponse, JobResultResponse, ListJobsRequest, ListJobsResponse,
    RemoteJobRef, RemoteVersion, StartJobRequest,
};
use crate::error::PipelineError;
use async_trait::async_trait;
use shared::fasta::Segment;
use std::path::Path;

/// Per-segment output of the AMR model.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SegmentPrediction {
    pub sequence_id: String,
    /// Probability of the resistant class, [0.0, 1.0].
    pub resistant: f64,
    pub susceptible: f64,
}

/// Per-job inference knobs forwarded to the model backend.
#[derive(Debug, Clone)]
pub struct PredictOptions {
    pub model_name: String,
    pub use_cpu: bool,
}

/// Black-box AMR predictor: a batch of segments in, one probability pair per
/// segment out, in input order.
#[async_trait]
pub trait AmrPredictor: Send + Sync {
    async fn predict(
        &self,
        batch: &[Segment],
        opts: &PredictOptions,
    ) -> Result<Vec<SegmentPrediction>, PipelineError>;
}

/// The remote Bakta protocol, one method per wire operation.
///
/// Implementations own retry/backoff; callers treat each method as a single
/// logical attempt that either succeeds or returns a classified error.
#[async_trait]
pub trait BaktaApi: Send + Sync {
    async fn init_job(&self, req: &InitJobRequest) -> Result<InitJobResponse, PipelineError>;

    /// PUT a local file to a pre-signed upload link.
    async fn upload_file(&self, url: &str, path: &Path) -> Result<(), PipelineError>;

    async fn start_job(&self, req: &StartJobRequest) -> Result<(), PipelineError>;

    async fn list_jobs(&self, req: &ListJobsRequest) -> Result<ListJobsResponse, PipelineError>;

    async fn job_logs(&self, job: &RemoteJobRef) -> Result<String, PipelineError>;

    async fn job_result(&self, job: &RemoteJobRef) -> Result<JobResultResponse, PipelineError>;

    /// Stream a pre-signed result URL to `dest`; returns bytes written.
    async fn download_file(&self, url: &str, dest: &Path) -> Result<u64, PipelineError>;

    async fn delete_job(&self, job: &RemoteJobRef) -> Result<(), PipelineError>;

    async fn version(&self) -> Result<RemoteVersion, PipelineError>;
}
