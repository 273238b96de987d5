//! # AMR job worker
//!
//! Claims `Submitted` jobs and runs them on a bounded pool. The claim is a
//! single transaction that marks the row `Running` under this worker's id,
//! so two workers can never own the same job.

use infrastructure::job_repository::JobRepository;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info};
use uuid::Uuid;

use crate::amr_executor::AmrExecutor;

const IDLE_POLL: Duration = Duration::from_secs(2);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub struct JobWorker {
    jobs: JobRepository,
    executor: Arc<AmrExecutor>,
    permits: Arc<Semaphore>,
}

impl JobWorker {
    pub fn new(jobs: JobRepository, executor: Arc<AmrExecutor>, pool_size: usize) -> Arc<Self> {
        Arc::new(Self {
            jobs,
            executor,
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
        })
    }

    pub async fn start_loop(self: Arc<Self>) {
        info!("[JobWorker] starting with {} execution slot(s)", self.permits.available_permits());

        loop {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let worker_id = format!("amr-worker-{}", &Uuid::new_v4().simple().to_string()[..8]);
            match self.jobs.claim_next(&worker_id).await {
                Ok(Some(job)) => {
                    info!("[JobWorker] claimed job {} ({})", job.id, job.job_name);
                    let executor = self.executor.clone();
                    tokio::spawn(async move {
                        executor.execute(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::time::sleep(IDLE_POLL).await;
                }
                Err(e) => {
                    error!("[JobWorker] failed to claim next job: {}", e);
                    drop(permit);
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }
}
