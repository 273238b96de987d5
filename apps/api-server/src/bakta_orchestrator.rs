//! # Bakta orchestrator
//!
//! One task per delegated job: init → upload → start, then a jittered poll
//! loop against the remote API until a terminal status or the poll deadline.
//! Results are streamed to disk, recorded, and parsed into annotations.
//! Crash-safe: on startup every non-terminal local job re-enters the loop
//! with its stored credentials.

use infrastructure::bakta_repository::BaktaRepository;
use pipeline_core::bakta_config::BaktaConfig;
use pipeline_core::contracts::{InitJobRequest, ListJobsRequest, RemoteJobRef, StartJobRequest};
use pipeline_core::error::{truncate_error, PipelineError};
use pipeline_core::models::{BaktaFileType, BaktaJob, BaktaJobStatus};
use pipeline_core::traits::BaktaApi;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::annotation_parsers::{
    parse_gff3_annotations, parse_json_annotations, parse_tsv_annotations,
};

/// Sibling file names the submission handler places next to the FASTA when
/// the caller supplied optional uploads.
pub const PRODIGAL_SIBLING: &str = "prodigal.tf";
pub const REPLICONS_SIBLING: &str = "replicons.csv";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub results_dir: PathBuf,
    pub poll_interval: Duration,
    pub poll_deadline: Duration,
}

pub struct BaktaOrchestrator {
    repo: BaktaRepository,
    api: Arc<dyn BaktaApi>,
    settings: OrchestratorSettings,
    /// Caps how many jobs hit the remote status endpoint at once.
    poll_permits: Semaphore,
}

impl BaktaOrchestrator {
    pub fn new(
        repo: BaktaRepository,
        api: Arc<dyn BaktaApi>,
        settings: OrchestratorSettings,
        max_concurrent_polls: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            api,
            settings,
            poll_permits: Semaphore::new(max_concurrent_polls.max(1)),
        })
    }

    /// Drives one job to a terminal local state; every failure lands on the
    /// job row, never on the caller.
    pub async fn run(self: Arc<Self>, job_id: Uuid) {
        if let Err(e) = self.drive(job_id).await {
            tracing::error!("[BaktaOrchestrator] job {} failed: {}", job_id, e);
            let message = truncate_error(&e.to_string());
            if let Err(store_err) = self
                .repo
                .update_status(job_id, BaktaJobStatus::Error, Some(&message))
                .await
            {
                tracing::error!(
                    "[BaktaOrchestrator] could not record failure of {}: {}",
                    job_id,
                    store_err
                );
            }
        }
    }

    /// Re-enters the loop for every non-terminal job found at startup.
    pub async fn resume_pending(self: &Arc<Self>) -> Result<usize, PipelineError> {
        let jobs = self.repo.non_terminal().await?;
        let count = jobs.len();
        if count > 0 {
            tracing::info!("[BaktaOrchestrator] resuming {} unfinished job(s)", count);
        }
        for job in jobs {
            let orchestrator = self.clone();
            tokio::spawn(orchestrator.run(job.id));
        }
        Ok(count)
    }

    /// Local delete cascading a best-effort remote delete (404 acceptable).
    pub async fn delete(&self, job_id: Uuid) -> Result<bool, PipelineError> {
        let Some(job) = self.repo.get(job_id).await? else {
            return Ok(false);
        };
        if let (Some(remote_id), Some(secret)) = (job.remote_id, job.secret.clone()) {
            let remote = RemoteJobRef { job_id: remote_id, secret };
            if let Err(e) = self.api.delete_job(&remote).await {
                tracing::warn!("[BaktaOrchestrator] remote delete of {} failed: {}", job_id, e);
            }
        }
        let dir = self.job_results_dir(job_id);
        if tokio::fs::remove_dir_all(&dir).await.is_err() {
            tracing::debug!("[BaktaOrchestrator] no result directory for {}", job_id);
        }
        self.repo.delete(job_id).await
    }

    async fn drive(&self, job_id: Uuid) -> Result<(), PipelineError> {
        let job = self
            .repo
            .get(job_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("bakta job {}", job_id)))?;

        match job.status {
            BaktaJobStatus::Init => {
                let job = self.submit_remote(job).await?;
                self.poll_loop(job).await
            }
            BaktaJobStatus::Running => self.poll_loop(job).await,
            _ => Ok(()),
        }
    }

    /// Steps 1–3 of the remote protocol. The local job only becomes
    /// `Running` after a successful `start`.
    async fn submit_remote(&self, job: BaktaJob) -> Result<BaktaJob, PipelineError> {
        let config: BaktaConfig = serde_json::from_str(&job.config_json).map_err(|e| {
            PipelineError::InvalidInput { reason: format!("stored bakta config is invalid: {}", e) }
        })?;
        config
            .validate()
            .map_err(|reason| PipelineError::InvalidInput { reason })?;

        let init = self
            .api
            .init_job(&InitJobRequest {
                name: job.name.clone(),
                replicon_table_type: "CSV".to_string(),
            })
            .await?;
        self.repo
            .set_remote_ref(job.id, init.job.job_id, &init.job.secret)
            .await?;

        self.api
            .upload_file(&init.upload_link_fasta, Path::new(&job.fasta_path))
            .await?;

        let fasta_dir = Path::new(&job.fasta_path)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        if config.requires_prodigal_upload() {
            let path = fasta_dir.join(format!("{}_{}", job.id, PRODIGAL_SIBLING));
            if !path.exists() {
                return Err(PipelineError::InvalidInput {
                    reason: "config names a prodigal training file but none was uploaded".to_string(),
                });
            }
            self.api.upload_file(&init.upload_link_prodigal, &path).await?;
        }
        if config.requires_replicons_upload() {
            let path = fasta_dir.join(format!("{}_{}", job.id, REPLICONS_SIBLING));
            if !path.exists() {
                return Err(PipelineError::InvalidInput {
                    reason: "config enables replicons but no replicon table was uploaded".to_string(),
                });
            }
            self.api.upload_file(&init.upload_link_replicons, &path).await?;
        }

        self.api
            .start_job(&StartJobRequest { config, job: init.job.clone() })
            .await?;
        self.repo
            .update_status(job.id, BaktaJobStatus::Running, Some("remote annotation started"))
            .await?;

        self.repo
            .get(job.id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("bakta job {}", job.id)))
    }

    async fn poll_loop(&self, job: BaktaJob) -> Result<(), PipelineError> {
        let remote = RemoteJobRef {
            job_id: job.remote_id.ok_or_else(|| PipelineError::Fatal {
                reason: format!("bakta job {} is Running without a remote id", job.id),
            })?,
            secret: job.secret.clone().ok_or_else(|| PipelineError::Fatal {
                reason: format!("bakta job {} is Running without a secret", job.id),
            })?,
        };

        // The deadline anchors at the moment the remote run started so a
        // restart never resets it.
        let anchor = job.started_at.unwrap_or(job.created_at);
        let deadline = chrono::Duration::from_std(self.settings.poll_deadline)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut last_observed: Option<String> = None;

        loop {
            if chrono::Utc::now() - anchor > deadline {
                return Err(PipelineError::Timeout {
                    reason: format!(
                        "poll deadline of {:?} exceeded",
                        self.settings.poll_deadline
                    ),
                });
            }

            tokio::time::sleep(jittered(self.settings.poll_interval)).await;

            let response = {
                let _permit = self.poll_permits.acquire().await.map_err(|_| {
                    PipelineError::Fatal { reason: "poll semaphore closed".to_string() }
                })?;
                self.api
                    .list_jobs(&ListJobsRequest { jobs: vec![remote.clone()] })
                    .await?
            };

            if let Some(failed) = response.failed_jobs.iter().find(|f| f.job_id == remote.job_id) {
                return Err(PipelineError::RemotePermanent {
                    reason: format!("remote rejected the job: {}", failed.job_status),
                });
            }
            let Some(entry) = response.jobs.iter().find(|j| j.job_id == remote.job_id) else {
                return Err(PipelineError::RemotePermanent {
                    reason: "status response does not mention the polled job".to_string(),
                });
            };

            let observed = normalize_remote_status(&entry.job_status);
            if last_observed.as_deref() != Some(observed.as_str()) {
                self.repo
                    .append_history(job.id, &observed, Some("observed remote status"))
                    .await?;
                last_observed = Some(observed.clone());
            }

            match observed.as_str() {
                "Successful" => {
                    self.harvest_results(&job, &remote).await?;
                    self.repo
                        .update_status(job.id, BaktaJobStatus::Successful, None)
                        .await?;
                    tracing::info!("[BaktaOrchestrator] job {} successful", job.id);
                    return Ok(());
                }
                "Error" => {
                    let logs = self.api.job_logs(&remote).await.unwrap_or_default();
                    let last_line = logs
                        .lines()
                        .rev()
                        .find(|l| !l.trim().is_empty())
                        .unwrap_or("remote annotation failed")
                        .to_string();
                    self.repo
                        .update_status(job.id, BaktaJobStatus::Error, Some(&last_line))
                        .await?;
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    /// Downloads every entry of the result map, records it, and persists
    /// annotations from the best available format.
    async fn harvest_results(&self, job: &BaktaJob, remote: &RemoteJobRef) -> Result<(), PipelineError> {
        let result = self.api.job_result(remote).await?;
        let dir = self.job_results_dir(job.id);

        let mut downloaded: Vec<(BaktaFileType, PathBuf)> = Vec::new();
        for (key, url) in &result.result_files {
            let file_type = BaktaFileType::from_key(key);
            let dest = dir.join(format!("{}.{}", file_type.as_str(), file_type.extension()));
            let bytes = self.api.download_file(url, &dest).await?;
            tracing::debug!(
                "[BaktaOrchestrator] downloaded {} ({} bytes) for {}",
                file_type,
                bytes,
                job.id
            );
            self.repo
                .add_result_file(job.id, &file_type, &dest.to_string_lossy(), Some(url))
                .await?;
            downloaded.push((file_type, dest));
        }

        self.persist_annotations(job.id, &downloaded).await
    }

    /// JSON is the canonical annotation source and its failure fails the
    /// job; GFF3 and TSV degrade to a warning and the next format is tried.
    async fn persist_annotations(
        &self,
        job_id: Uuid,
        downloaded: &[(BaktaFileType, PathBuf)],
    ) -> Result<(), PipelineError> {
        let find = |wanted: &BaktaFileType| {
            downloaded
                .iter()
                .find(|(t, _)| t == wanted)
                .map(|(_, p)| p.clone())
        };

        if let Some(path) = find(&BaktaFileType::Json) {
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(PipelineError::storage)?;
            let annotations = parse_json_annotations(job_id, &text)?;
            let saved = self.repo.save_annotations(job_id, &annotations).await?;
            tracing::info!("[BaktaOrchestrator] persisted {} annotations from JSON", saved);
            return Ok(());
        }

        type AnnotationParser =
            fn(Uuid, &str) -> Result<Vec<pipeline_core::models::BaktaAnnotation>, PipelineError>;
        for (file_type, parser) in [
            (BaktaFileType::Gff3, parse_gff3_annotations as AnnotationParser),
            (BaktaFileType::Tsv, parse_tsv_annotations as AnnotationParser),
        ] {
            let Some(path) = find(&file_type) else { continue };
            let text = match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("[BaktaOrchestrator] cannot read {} result: {}", file_type, e);
                    continue;
                }
            };
            match parser(job_id, &text) {
                Ok(annotations) => {
                    let saved = self.repo.save_annotations(job_id, &annotations).await?;
                    tracing::info!(
                        "[BaktaOrchestrator] persisted {} annotations from {}",
                        saved,
                        file_type
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        "[BaktaOrchestrator] {} parse failed, degrading: {}",
                        file_type,
                        e
                    );
                }
            }
        }

        tracing::warn!("[BaktaOrchestrator] no parseable annotation format for {}", job_id);
        Ok(())
    }

    fn job_results_dir(&self, job_id: Uuid) -> PathBuf {
        self.settings.results_dir.join("bakta").join(job_id.to_string())
    }
}

/// `RUNNING` / `running` / `Running` all map to the local spelling.
fn normalize_remote_status(raw: &str) -> String {
    match raw.to_ascii_uppercase().as_str() {
        "INIT" => "Init".to_string(),
        "RUNNING" => "Running".to_string(),
        "SUCCESSFUL" | "SUCCESSFULL" => "Successful".to_string(),
        "ERROR" => "Error".to_string(),
        other => other.to_string(),
    }
}

/// ±10% so a fleet of pollers never fires in lockstep.
fn jittered(interval: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    interval.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use infrastructure::store::{PoolSettings, Store};
    use pipeline_core::contracts::{InitJobResponse, JobResultResponse, ListJobsResponse, RemoteJobStatus, RemoteVersion};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const GFF3_BODY: &str = "##gff-version 3\n\
        c1\tBakta\tCDS\t100\t400\t.\t+\t0\tID=CDS_1\n\
        c1\tBakta\tCDS\t500\t900\t.\t-\t0\tID=CDS_2\n\
        c1\tBakta\ttRNA\t950\t1020\t.\t+\t.\tID=TRNA_1\n";

    struct FakeBakta {
        remote_id: Uuid,
        /// Remote statuses handed out per poll, last one repeating.
        list_script: Mutex<Vec<&'static str>>,
        list_calls: AtomicUsize,
        logs: &'static str,
        uploads: Mutex<Vec<String>>,
        result_files: BTreeMap<String, String>,
        downloads: BTreeMap<String, &'static str>,
    }

    impl FakeBakta {
        fn new(script: Vec<&'static str>) -> Self {
            let mut result_files = BTreeMap::new();
            result_files.insert("GFF3".to_string(), "mem://gff3".to_string());
            let mut downloads = BTreeMap::new();
            downloads.insert("mem://gff3".to_string(), GFF3_BODY);
            Self {
                remote_id: Uuid::new_v4(),
                list_script: Mutex::new(script),
                list_calls: AtomicUsize::new(0),
                logs: "step 1 ok\nstep 2 ok\nannotation pipeline exploded\n",
                uploads: Mutex::new(Vec::new()),
                result_files,
                downloads,
            }
        }
    }

    #[async_trait]
    impl BaktaApi for FakeBakta {
        async fn init_job(&self, req: &InitJobRequest) -> Result<InitJobResponse, PipelineError> {
            assert!(!req.name.is_empty());
            Ok(InitJobResponse {
                job: RemoteJobRef { job_id: self.remote_id, secret: "s".to_string() },
                upload_link_fasta: "mem://up/fasta".to_string(),
                upload_link_prodigal: "mem://up/prodigal".to_string(),
                upload_link_replicons: "mem://up/replicons".to_string(),
            })
        }

        async fn upload_file(&self, url: &str, path: &Path) -> Result<(), PipelineError> {
            assert!(path.exists(), "upload source must exist");
            self.uploads.lock().unwrap().push(url.to_string());
            Ok(())
        }

        async fn start_job(&self, req: &StartJobRequest) -> Result<(), PipelineError> {
            assert_eq!(req.job.job_id, self.remote_id);
            Ok(())
        }

        async fn list_jobs(&self, req: &ListJobsRequest) -> Result<ListJobsResponse, PipelineError> {
            assert_eq!(req.jobs.len(), 1);
            let call = self.list_calls.fetch_add(1, Ordering::SeqCst);
            let script = self.list_script.lock().unwrap();
            let status = script[call.min(script.len() - 1)];
            Ok(ListJobsResponse {
                jobs: vec![RemoteJobStatus {
                    job_id: self.remote_id,
                    job_status: status.to_string(),
                    started: None,
                    updated: None,
                    name: Some("fake".to_string()),
                }],
                failed_jobs: Vec::new(),
            })
        }

        async fn job_logs(&self, _job: &RemoteJobRef) -> Result<String, PipelineError> {
            Ok(self.logs.to_string())
        }

        async fn job_result(&self, _job: &RemoteJobRef) -> Result<JobResultResponse, PipelineError> {
            Ok(JobResultResponse {
                result_files: self.result_files.clone(),
                job_id: self.remote_id,
                name: None,
                started: None,
                updated: None,
            })
        }

        async fn download_file(&self, url: &str, dest: &Path) -> Result<u64, PipelineError> {
            let body = self.downloads.get(url).expect("unknown download url");
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await.unwrap();
            }
            tokio::fs::write(dest, body).await.unwrap();
            Ok(body.len() as u64)
        }

        async fn delete_job(&self, _job: &RemoteJobRef) -> Result<(), PipelineError> {
            Ok(())
        }

        async fn version(&self) -> Result<RemoteVersion, PipelineError> {
            Ok(RemoteVersion { tool_version: None, db_version: None, backend_version: None })
        }
    }

    async fn setup(
        tmp: &tempfile::TempDir,
        api: Arc<dyn BaktaApi>,
        deadline: Duration,
    ) -> (BaktaRepository, Arc<BaktaOrchestrator>) {
        let store = Store::connect(
            tmp.path().join("test.db").to_str().unwrap(),
            PoolSettings::default(),
        )
        .await
        .unwrap();
        let repo = BaktaRepository::new(&store);
        let orchestrator = BaktaOrchestrator::new(
            repo.clone(),
            api,
            OrchestratorSettings {
                results_dir: tmp.path().join("results"),
                poll_interval: Duration::from_millis(5),
                poll_deadline: deadline,
            },
            4,
        );
        (repo, orchestrator)
    }

    async fn seed_job(repo: &BaktaRepository, tmp: &tempfile::TempDir, config: &str) -> BaktaJob {
        let fasta = tmp.path().join("in.fasta");
        tokio::fs::write(&fasta, ">c1\nACGT\n").await.unwrap();
        let job = BaktaJob {
            id: Uuid::new_v4(),
            remote_id: None,
            secret: None,
            name: "genome".to_string(),
            status: BaktaJobStatus::Init,
            fasta_path: fasta.to_string_lossy().to_string(),
            config_json: config.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        };
        repo.create(&job, &[("c1".to_string(), "ACGT".to_string())])
            .await
            .unwrap();
        job
    }

    #[tokio::test]
    async fn happy_path_polls_to_success_and_persists_annotations() {
        let tmp = tempfile::TempDir::new().unwrap();
        let fake = Arc::new(FakeBakta::new(vec!["RUNNING", "RUNNING", "SUCCESSFUL"]));
        let (repo, orchestrator) = setup(&tmp, fake.clone(), Duration::from_secs(10)).await;
        let job = seed_job(&repo, &tmp, "{}").await;

        orchestrator.clone().run(job.id).await;

        let done = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, BaktaJobStatus::Successful);
        assert_eq!(done.remote_id, Some(fake.remote_id));
        assert!(done.completed_at.is_some());

        assert_eq!(repo.annotation_count(job.id).await.unwrap(), 3);
        let files = repo.result_files(job.id).await.unwrap();
        assert_eq!(files.len(), 1);
        assert!(std::path::Path::new(&files[0].file_path).exists());

        let sequences = repo.sequences(job.id).await.unwrap();
        assert_eq!(sequences.len(), 1);
        assert_eq!(*fake.uploads.lock().unwrap(), vec!["mem://up/fasta".to_string()]);
        assert!(fake.list_calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn remote_error_copies_last_log_line_without_extra_polls() {
        let tmp = tempfile::TempDir::new().unwrap();
        let fake = Arc::new(FakeBakta::new(vec!["ERROR"]));
        let (repo, orchestrator) = setup(&tmp, fake.clone(), Duration::from_secs(10)).await;
        let job = seed_job(&repo, &tmp, "{}").await;

        orchestrator.clone().run(job.id).await;

        let failed = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, BaktaJobStatus::Error);
        assert_eq!(failed.error.as_deref(), Some("annotation pipeline exploded"));
        assert_eq!(repo.annotation_count(job.id).await.unwrap(), 0);
        assert_eq!(fake.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn poll_deadline_fails_the_job_with_timeout() {
        let tmp = tempfile::TempDir::new().unwrap();
        let fake = Arc::new(FakeBakta::new(vec!["RUNNING"]));
        let (repo, orchestrator) = setup(&tmp, fake, Duration::ZERO).await;
        let job = seed_job(&repo, &tmp, "{}").await;

        orchestrator.clone().run(job.id).await;

        let failed = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, BaktaJobStatus::Error);
        assert!(failed.error.unwrap().contains("deadline"));
    }

    #[tokio::test]
    async fn missing_required_prodigal_upload_fails_closed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let fake = Arc::new(FakeBakta::new(vec!["RUNNING"]));
        let (repo, orchestrator) = setup(&tmp, fake, Duration::from_secs(10)).await;
        let config = r#"{"prodigalTrainingFile": "training.tf"}"#;
        let job = seed_job(&repo, &tmp, config).await;

        orchestrator.clone().run(job.id).await;

        let failed = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, BaktaJobStatus::Error);
        assert!(failed.error.unwrap().contains("prodigal"));
    }

    #[tokio::test]
    async fn resume_picks_up_non_terminal_jobs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let fake = Arc::new(FakeBakta::new(vec!["SUCCESSFUL"]));
        let (repo, orchestrator) = setup(&tmp, fake.clone(), Duration::from_secs(10)).await;
        let job = seed_job(&repo, &tmp, "{}").await;
        // Simulate a crash after start: Running with stored credentials.
        repo.set_remote_ref(job.id, fake.remote_id, "s").await.unwrap();
        repo.update_status(job.id, BaktaJobStatus::Running, None).await.unwrap();

        let resumed = orchestrator.resume_pending().await.unwrap();
        assert_eq!(resumed, 1);

        // Wait for the spawned poll loop to finish.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let current = repo.get(job.id).await.unwrap().unwrap();
            if current.status.is_terminal() {
                break;
            }
        }
        let done = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, BaktaJobStatus::Successful);
        assert_eq!(repo.annotation_count(job.id).await.unwrap(), 3);
    }
}
