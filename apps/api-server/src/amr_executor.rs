//! # AMR executor
//!
//! Runs one claimed job from `Running` to a terminal state: parse and
//! validate the FASTA, window it, stream batches through the predictor,
//! append results with a flush per batch, then aggregate. Cancellation is
//! observed between batches; failures leave partial output on disk for
//! debugging but never reference it from the job row.

use infrastructure::job_repository::{JobRepository, StatusUpdate};
use pipeline_core::error::{truncate_error, PipelineError};
use pipeline_core::models::{AmrJob, AmrJobParams, JobKind, JobStatus};
use pipeline_core::traits::{AmrPredictor, PredictOptions};
use shared::fasta::{parse_fasta, segment_records};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::aggregation::{
    aggregate_rows, parse_prediction_tsv, render_aggregated_tsv, render_wig, SegmentRow,
    PREDICTION_HEADER,
};

/// Progress ceiling before aggregation and final bookkeeping.
const PREDICTION_PROGRESS_CAP: f64 = 95.0;
/// Updates below this delta are coalesced away to avoid DB write storms.
const PROGRESS_GRANULARITY: f64 = 1.0;

enum Outcome {
    Completed,
    Cancelled,
}

pub struct AmrExecutor {
    jobs: JobRepository,
    predictor: Arc<dyn AmrPredictor>,
    results_dir: PathBuf,
}

impl AmrExecutor {
    pub fn new(jobs: JobRepository, predictor: Arc<dyn AmrPredictor>, results_dir: impl Into<PathBuf>) -> Self {
        Self {
            jobs,
            predictor,
            results_dir: results_dir.into(),
        }
    }

    /// Drives a claimed job to a terminal state. Never returns an error —
    /// every failure is recorded on the job row.
    pub async fn execute(&self, job: AmrJob) {
        let job_id = job.id;
        let worker_id = job.worker_id.clone().unwrap_or_default();

        match self.run(&job, &worker_id).await {
            Ok(Outcome::Completed) => {
                tracing::info!("[AmrExecutor] job {} completed", job_id);
            }
            Ok(Outcome::Cancelled) => {
                tracing::info!("[AmrExecutor] job {} cancelled; partial outputs removed", job_id);
            }
            Err(e) => {
                tracing::error!("[AmrExecutor] job {} failed: {}", job_id, e);
                let update = StatusUpdate {
                    status: Some(JobStatus::Error),
                    error: Some(truncate_error(&e.to_string())),
                    completed_at: Some(chrono::Utc::now()),
                    worker_id: Some(worker_id),
                    ..Default::default()
                };
                if let Err(store_err) = self.jobs.update_status(job_id, update).await {
                    tracing::error!("[AmrExecutor] could not record failure of {}: {}", job_id, store_err);
                }
            }
        }
    }

    async fn run(&self, job: &AmrJob, worker_id: &str) -> Result<Outcome, PipelineError> {
        let params = job.params.clone().ok_or_else(|| PipelineError::Fatal {
            reason: format!("job {} has no params row", job.id),
        })?;

        tokio::fs::create_dir_all(&self.results_dir)
            .await
            .map_err(PipelineError::storage)?;

        match job.kind {
            JobKind::Predict => self.run_predict(job, &params, worker_id).await,
            JobKind::Aggregate | JobKind::Sequence => self.run_aggregate(job, &params, worker_id).await,
            JobKind::Visualize => self.run_visualize(job, worker_id).await,
        }
    }

    // --- full prediction pipeline ---

    async fn run_predict(
        &self,
        job: &AmrJob,
        params: &AmrJobParams,
        worker_id: &str,
    ) -> Result<Outcome, PipelineError> {
        let input_path = job.input_file_path.as_deref().ok_or_else(|| {
            PipelineError::InvalidInput { reason: "job has no input file".to_string() }
        })?;
        let text = tokio::fs::read_to_string(input_path)
            .await
            .map_err(|e| PipelineError::InvalidInput {
                reason: format!("cannot read input file: {}", e),
            })?;

        let records = parse_fasta(&text)
            .map_err(|e| PipelineError::InvalidInput { reason: e.to_string() })?;
        let segments = segment_records(
            &records,
            params.segment_length.max(0) as u64,
            params.segment_overlap.max(0) as u64,
        );
        if segments.is_empty() {
            return Err(PipelineError::InvalidInput {
                reason: "no prediction windows produced; every sequence is shorter than the minimum window".to_string(),
            });
        }

        let result_path = self.results_dir.join(format!("amr_predictions_{}.tsv", job.id));
        let mut out = tokio::fs::File::create(&result_path)
            .await
            .map_err(PipelineError::storage)?;
        out.write_all(format!("{}\n", PREDICTION_HEADER).as_bytes())
            .await
            .map_err(PipelineError::storage)?;

        let opts = PredictOptions {
            model_name: params.model_name.clone(),
            use_cpu: params.use_cpu,
        };
        let batch_size = params.batch_size.max(1) as usize;
        let total_batches = segments.len().div_ceil(batch_size);

        let mut rows: Vec<SegmentRow> = Vec::with_capacity(segments.len());
        let mut last_reported = 0.0f64;
        let mut cancelled = false;

        for (batch_no, batch) in segments.chunks(batch_size).enumerate() {
            if self.is_cancelled(job.id).await? {
                cancelled = true;
                break;
            }

            let predictions = self.predictor.predict(batch, &opts).await?;
            if predictions.len() != batch.len() {
                return Err(PipelineError::RemotePermanent {
                    reason: format!(
                        "predictor returned {} results for a batch of {}",
                        predictions.len(),
                        batch.len()
                    ),
                });
            }

            let mut chunk = String::new();
            for (segment, prediction) in batch.iter().zip(predictions.iter()) {
                chunk.push_str(&format!(
                    "{}\t{}\t{}\t{:.6}\t{:.6}\n",
                    segment.id, segment.start, segment.end, prediction.resistant, prediction.susceptible
                ));
                rows.push(SegmentRow {
                    sequence_id: segment.id.clone(),
                    start: segment.start,
                    end: segment.end,
                    resistant: prediction.resistant,
                    susceptible: prediction.susceptible,
                });
            }
            out.write_all(chunk.as_bytes()).await.map_err(PipelineError::storage)?;
            out.flush().await.map_err(PipelineError::storage)?;

            let progress = ((batch_no + 1) as f64 / total_batches as f64) * PREDICTION_PROGRESS_CAP;
            if progress - last_reported >= PROGRESS_GRANULARITY {
                self.report_progress(job.id, worker_id, progress).await;
                last_reported = progress;
            }
        }
        drop(out);

        if cancelled {
            remove_outputs(&[&result_path]).await;
            return Ok(Outcome::Cancelled);
        }

        let aggregated_path = if params.enable_sequence_aggregation {
            let aggregates = aggregate_rows(&rows, params.resistance_threshold);
            let path = self
                .results_dir
                .join(format!("amr_predictions_{}_aggregated.tsv", job.id));
            tokio::fs::write(&path, render_aggregated_tsv(&aggregates))
                .await
                .map_err(PipelineError::storage)?;
            Some(path)
        } else {
            None
        };

        self.finish(
            job.id,
            worker_id,
            &result_path,
            aggregated_path.as_deref(),
            &[Some(result_path.as_path()), aggregated_path.as_deref()],
        )
        .await
    }

    // --- aggregation over previously produced prediction TSVs ---

    async fn run_aggregate(
        &self,
        job: &AmrJob,
        params: &AmrJobParams,
        worker_id: &str,
    ) -> Result<Outcome, PipelineError> {
        if self.is_cancelled(job.id).await? {
            return Ok(Outcome::Cancelled);
        }

        let mut inputs: Vec<String> = Vec::new();
        let extra = self.jobs.extra_parameters(job.id).await?;
        if let Some(files) = extra.get("input_files").and_then(|v| v.as_array()) {
            inputs.extend(files.iter().filter_map(|v| v.as_str().map(String::from)));
        }
        if inputs.is_empty() {
            if let Some(path) = &job.input_file_path {
                inputs.push(path.clone());
            }
        }
        if inputs.is_empty() {
            return Err(PipelineError::InvalidInput {
                reason: "aggregation job has no input prediction files".to_string(),
            });
        }

        let mut rows = Vec::new();
        for input in &inputs {
            let text = tokio::fs::read_to_string(input).await.map_err(|e| {
                PipelineError::InvalidInput { reason: format!("cannot read {}: {}", input, e) }
            })?;
            rows.extend(parse_prediction_tsv(&text)?);
        }

        let aggregates = aggregate_rows(&rows, params.resistance_threshold);
        let path = self
            .results_dir
            .join(format!("amr_predictions_{}_aggregated.tsv", job.id));
        tokio::fs::write(&path, render_aggregated_tsv(&aggregates))
            .await
            .map_err(PipelineError::storage)?;

        self.finish(job.id, worker_id, &path, Some(path.as_path()), &[Some(path.as_path())])
            .await
    }

    // --- WIG track rendering ---

    async fn run_visualize(&self, job: &AmrJob, worker_id: &str) -> Result<Outcome, PipelineError> {
        if self.is_cancelled(job.id).await? {
            return Ok(Outcome::Cancelled);
        }

        let input_path = job.input_file_path.as_deref().ok_or_else(|| {
            PipelineError::InvalidInput { reason: "visualization job has no input file".to_string() }
        })?;
        let text = tokio::fs::read_to_string(input_path).await.map_err(|e| {
            PipelineError::InvalidInput { reason: format!("cannot read {}: {}", input_path, e) }
        })?;
        let rows = parse_prediction_tsv(&text)?;

        let extra = self.jobs.extra_parameters(job.id).await?;
        let step_size = extra.get("step_size").and_then(|v| v.as_u64()).unwrap_or(100);

        let path = self.results_dir.join(format!("amr_visualization_{}.wig", job.id));
        tokio::fs::write(&path, render_wig(&rows, step_size))
            .await
            .map_err(PipelineError::storage)?;

        let mut extra = serde_json::Map::new();
        extra.insert("wig_file".to_string(), serde_json::json!(path.to_string_lossy()));
        self.jobs.add_parameters(job.id, &extra).await?;

        self.finish(job.id, worker_id, &path, None, &[Some(path.as_path())]).await
    }

    // --- shared tail ---

    /// Final transition. A cancel that slipped in while we were writing
    /// output surfaces here as a `Conflict`; the outputs are removed and
    /// nothing further is transitioned.
    async fn finish(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result_file: &Path,
        aggregated: Option<&Path>,
        cleanup_on_cancel: &[Option<&Path>],
    ) -> Result<Outcome, PipelineError> {
        let update = StatusUpdate {
            status: Some(JobStatus::Completed),
            progress: Some(100.0),
            completed_at: Some(chrono::Utc::now()),
            result_file: Some(result_file.to_string_lossy().to_string()),
            aggregated_result_file: aggregated.map(|p| p.to_string_lossy().to_string()),
            worker_id: Some(worker_id.to_string()),
            ..Default::default()
        };

        match self.jobs.update_status(job_id, update).await {
            Ok(_) => Ok(Outcome::Completed),
            Err(PipelineError::Conflict { .. }) => {
                let paths: Vec<&Path> = cleanup_on_cancel.iter().flatten().copied().collect();
                remove_outputs(&paths).await;
                Ok(Outcome::Cancelled)
            }
            Err(e) => Err(e),
        }
    }

    async fn is_cancelled(&self, job_id: Uuid) -> Result<bool, PipelineError> {
        let job = self.jobs.get(job_id).await?;
        Ok(matches!(job, Some(j) if j.status == JobStatus::Cancelled))
    }

    /// Progress write; coalescing already happened at the call site, and a
    /// failed write never kills the run.
    async fn report_progress(&self, job_id: Uuid, worker_id: &str, progress: f64) {
        let update = StatusUpdate {
            progress: Some(progress.min(PREDICTION_PROGRESS_CAP)),
            worker_id: Some(worker_id.to_string()),
            ..Default::default()
        };
        if let Err(e) = self.jobs.update_status(job_id, update).await {
            tracing::warn!("[AmrExecutor] progress update for {} failed: {}", job_id, e);
        }
    }
}

async fn remove_outputs(paths: &[impl AsRef<Path>]) {
    for path in paths {
        if tokio::fs::remove_file(path.as_ref()).await.is_err() {
            tracing::debug!("[AmrExecutor] no partial output at {}", path.as_ref().display());
        }
    }
}
