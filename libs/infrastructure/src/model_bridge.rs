//! # Model bridge
//!
//! HTTP client for the AMR inference sidecar. The model itself is a black
//! box: segments go in, per-segment class probabilities come out, in input
//! order. There is no fallback implementation — an unreachable backend
//! fails the job.

use async_trait::async_trait;
use pipeline_core::error::PipelineError;
use pipeline_core::traits::{AmrPredictor, PredictOptions, SegmentPrediction};
use serde::{Deserialize, Serialize};
use shared::fasta::Segment;
use std::time::Duration;

#[derive(Clone)]
pub struct ModelBridgeClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    model: &'a str,
    use_cpu: bool,
    segments: Vec<WireSegment<'a>>,
}

#[derive(Serialize)]
struct WireSegment<'a> {
    id: &'a str,
    sequence: &'a str,
}

#[derive(Deserialize)]
struct PredictResponse {
    predictions: Vec<WirePrediction>,
}

#[derive(Deserialize)]
struct WirePrediction {
    sequence_id: String,
    resistant: f64,
    susceptible: f64,
}

impl ModelBridgeClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Fatal { reason: format!("http client build failed: {}", e) })?;
        let base_url: String = base_url.into();
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl AmrPredictor for ModelBridgeClient {
    async fn predict(
        &self,
        batch: &[Segment],
        opts: &PredictOptions,
    ) -> Result<Vec<SegmentPrediction>, PipelineError> {
        let request = PredictRequest {
            model: &opts.model_name,
            use_cpu: opts.use_cpu,
            segments: batch
                .iter()
                .map(|s| WireSegment { id: &s.id, sequence: &s.bases })
                .collect(),
        };

        let url = format!("{}/predict", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::RemoteTransient {
                reason: format!("model backend unreachable: {}", e.without_url()),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let reason = format!("model backend returned status {}", status.as_u16());
            return if status.is_server_error() {
                Err(PipelineError::RemoteTransient { reason })
            } else {
                Err(PipelineError::RemotePermanent { reason })
            };
        }

        let parsed: PredictResponse = resp.json().await.map_err(|e| PipelineError::RemotePermanent {
            reason: format!("model response did not match the expected shape: {}", e.without_url()),
        })?;

        if parsed.predictions.len() != batch.len() {
            return Err(PipelineError::RemotePermanent {
                reason: format!(
                    "model returned {} predictions for {} segments",
                    parsed.predictions.len(),
                    batch.len()
                ),
            });
        }

        Ok(parsed
            .predictions
            .into_iter()
            .map(|p| SegmentPrediction {
                sequence_id: p.sequence_id,
                resistant: p.resistant,
                susceptible: p.susceptible,
            })
            .collect())
    }
}
