//! # Bakta API client
//!
//! Stateless HTTP client for the remote annotation service. Every call is
//! retried on transient failures with exponential backoff; responses are
//! validated against the expected field set before acceptance. Job secrets
//! ride in requests only — error messages and logs carry the operation name
//! and status code, never URLs or credentials.

use async_trait::async_trait;
use futures_util::StreamExt;
use pipeline_core::contracts::{
    InitJobRequest, InitJobResponse, JobResultResponse, ListJobsRequest, ListJobsResponse,
    RemoteJobRef, RemoteVersion, StartJobRequest,
};
use pipeline_core::error::PipelineError;
use pipeline_core::traits::BaktaApi;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 5;

/// Exponential backoff: `base * 2^attempt`, capped.
pub(crate) fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    base.saturating_mul(factor).min(BACKOFF_CAP)
}

/// Parses a `Retry-After` seconds hint, capped to the backoff ceiling.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs).min(BACKOFF_CAP))
}

// No Debug derive: the api key must never reach a log line.
#[derive(Clone)]
pub struct BaktaClientSettings {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout: Duration,
    pub upload_timeout: Duration,
    pub idle_timeout: Duration,
}

#[derive(Clone)]
pub struct BaktaClient {
    /// Short-deadline client for protocol calls.
    http: reqwest::Client,
    /// No overall deadline; used for uploads and result downloads.
    transfer: reqwest::Client,
    base_url: String,
    api_key: String,
    upload_timeout: Duration,
}

impl BaktaClient {
    pub fn new(settings: BaktaClientSettings) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .connect_timeout(settings.request_timeout)
            .pool_idle_timeout(settings.idle_timeout)
            .build()
            .map_err(|e| PipelineError::Fatal { reason: format!("http client build failed: {}", e) })?;
        let transfer = reqwest::Client::builder()
            .connect_timeout(settings.request_timeout)
            .pool_idle_timeout(settings.idle_timeout)
            .build()
            .map_err(|e| PipelineError::Fatal { reason: format!("http client build failed: {}", e) })?;

        Ok(Self {
            http,
            transfer,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key,
            upload_timeout: settings.upload_timeout,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.api_key)
        }
    }

    /// Sends a request built by `make`, retrying transient failures.
    /// 5xx/429/408 and transport errors retry with exponential backoff
    /// (429 honors `Retry-After`); any other 4xx is permanent.
    async fn send_with_retry<F>(
        &self,
        op: &'static str,
        make: F,
    ) -> Result<reqwest::Response, PipelineError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            match make().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    let code = status.as_u16();
                    let retryable = status.is_server_error() || code == 429 || code == 408;
                    if !retryable {
                        return Err(PipelineError::RemotePermanent {
                            reason: format!("bakta {} failed with status {}", op, code),
                        });
                    }
                    if attempt >= MAX_RETRIES {
                        return Err(PipelineError::RemoteTransient {
                            reason: format!(
                                "bakta {} still failing with status {} after {} retries",
                                op, code, attempt
                            ),
                        });
                    }
                    let delay = if code == 429 {
                        resp.headers()
                            .get(reqwest::header::RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(parse_retry_after)
                            .unwrap_or_else(|| backoff_delay(attempt, BACKOFF_BASE))
                    } else {
                        backoff_delay(attempt, BACKOFF_BASE)
                    };
                    tracing::warn!("[BaktaClient] {} returned {}; retry {} in {:?}", op, code, attempt + 1, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if attempt >= MAX_RETRIES {
                        return Err(PipelineError::RemoteTransient {
                            reason: format!("bakta {} transport error: {}", op, e.without_url()),
                        });
                    }
                    let delay = backoff_delay(attempt, BACKOFF_BASE);
                    tracing::warn!("[BaktaClient] {} transport error; retry {} in {:?}", op, attempt + 1, delay);
                    tokio::time::sleep(delay).await;
                }
            }
            attempt += 1;
        }
    }

    async fn parse_json<T: serde::de::DeserializeOwned>(
        op: &'static str,
        resp: reqwest::Response,
    ) -> Result<T, PipelineError> {
        resp.json::<T>().await.map_err(|e| PipelineError::RemotePermanent {
            reason: format!("bakta {} response did not match the expected shape: {}", op, e.without_url()),
        })
    }
}

#[async_trait]
impl BaktaApi for BaktaClient {
    async fn init_job(&self, req: &InitJobRequest) -> Result<InitJobResponse, PipelineError> {
        let url = self.endpoint("job/init");
        let resp = self
            .send_with_retry("init", || self.authorize(self.http.post(&url)).json(req))
            .await?;
        Self::parse_json("init", resp).await
    }

    async fn upload_file(&self, url: &str, path: &Path) -> Result<(), PipelineError> {
        // Pre-signed links carry their own auth; bytes are held in memory so
        // the request stays cloneable across retries.
        let bytes = tokio::fs::read(path).await.map_err(|e| PipelineError::InvalidInput {
            reason: format!("cannot read upload file {}: {}", path.display(), e),
        })?;
        let url = url.to_string();
        let timeout = self.upload_timeout;
        self.send_with_retry("upload", || {
            self.transfer
                .put(&url)
                .timeout(timeout)
                .body(bytes.clone())
        })
        .await?;
        Ok(())
    }

    async fn start_job(&self, req: &StartJobRequest) -> Result<(), PipelineError> {
        let url = self.endpoint("job/start");
        self.send_with_retry("start", || self.authorize(self.http.post(&url)).json(req))
            .await?;
        Ok(())
    }

    async fn list_jobs(&self, req: &ListJobsRequest) -> Result<ListJobsResponse, PipelineError> {
        let url = self.endpoint("job/list");
        let resp = self
            .send_with_retry("list", || self.authorize(self.http.post(&url)).json(req))
            .await?;
        Self::parse_json("list", resp).await
    }

    async fn job_logs(&self, job: &RemoteJobRef) -> Result<String, PipelineError> {
        let url = self.endpoint("job/logs");
        let job_id = job.job_id.to_string();
        let secret = job.secret.clone();
        let resp = self
            .send_with_retry("logs", || {
                self.authorize(self.http.get(&url))
                    .query(&[("jobId", job_id.as_str()), ("secret", secret.as_str())])
            })
            .await?;
        resp.text().await.map_err(|e| PipelineError::RemotePermanent {
            reason: format!("bakta logs body unreadable: {}", e.without_url()),
        })
    }

    async fn job_result(&self, job: &RemoteJobRef) -> Result<JobResultResponse, PipelineError> {
        let url = self.endpoint("job/result");
        let resp = self
            .send_with_retry("result", || self.authorize(self.http.post(&url)).json(job))
            .await?;
        Self::parse_json("result", resp).await
    }

    async fn download_file(&self, url: &str, dest: &Path) -> Result<u64, PipelineError> {
        let url_owned = url.to_string();
        let resp = self
            .send_with_retry("download", || self.transfer.get(&url_owned))
            .await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| PipelineError::Storage {
                reason: format!("cannot create result directory {}: {}", parent.display(), e),
            })?;
        }
        let mut file = tokio::fs::File::create(dest).await.map_err(|e| PipelineError::Storage {
            reason: format!("cannot create result file {}: {}", dest.display(), e),
        })?;

        let mut written = 0u64;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PipelineError::RemoteTransient {
                reason: format!("bakta download stream broke: {}", e.without_url()),
            })?;
            file.write_all(&chunk).await.map_err(|e| PipelineError::Storage {
                reason: format!("cannot write result file {}: {}", dest.display(), e),
            })?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| PipelineError::Storage {
            reason: format!("cannot flush result file {}: {}", dest.display(), e),
        })?;
        Ok(written)
    }

    async fn delete_job(&self, job: &RemoteJobRef) -> Result<(), PipelineError> {
        let url = self.endpoint("job/delete");
        let job_id = job.job_id.to_string();
        let secret = job.secret.clone();
        let result = self
            .send_with_retry("delete", || {
                self.authorize(self.http.delete(&url))
                    .query(&[("jobID", job_id.as_str()), ("secret", secret.as_str())])
            })
            .await;
        match result {
            Ok(_) => Ok(()),
            // A vanished remote job is an acceptable outcome of delete.
            Err(PipelineError::RemotePermanent { reason }) if reason.contains("404") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn version(&self) -> Result<RemoteVersion, PipelineError> {
        let url = self.endpoint("version");
        let resp = self
            .send_with_retry("version", || self.authorize(self.http.get(&url)))
            .await?;
        Self::parse_json("version", resp).await
    }
}
