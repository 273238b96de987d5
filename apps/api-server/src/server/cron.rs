//! # Scheduled maintenance
//!
//! The retention sweep and the idempotency-key purge run on the in-process
//! cron scheduler; both are safe to fire while the API serves traffic.

use infrastructure::archiver::Archiver;
use infrastructure::job_repository::JobRepository;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub async fn start_cron_scheduler(
    archiver: Arc<Archiver>,
    jobs: JobRepository,
    sweep_interval_hours: u64,
) -> Result<JobScheduler, Box<dyn std::error::Error>> {
    let mut sched = JobScheduler::new().await?;

    // sec min hour day month day-of-week
    let sweep_cron = format!("0 0 */{} * * *", sweep_interval_hours.clamp(1, 23));
    sched
        .add(Job::new_async(sweep_cron.as_str(), move |_uuid, _lock| {
            let archiver = archiver.clone();
            Box::pin(async move {
                info!("[Cron] retention sweep starting");
                match archiver.run_sweep().await {
                    Ok(stats) => info!(
                        "[Cron] retention sweep finished: {} archived, {} deleted",
                        stats.archived, stats.deleted
                    ),
                    Err(e) => error!("[Cron] retention sweep failed: {}", e),
                }
            })
        })?)
        .await?;

    sched
        .add(Job::new_async("0 41 * * * *", move |_uuid, _lock| {
            let jobs = jobs.clone();
            Box::pin(async move {
                match jobs.purge_idempotency(24).await {
                    Ok(purged) if purged > 0 => {
                        info!("[Cron] purged {} expired idempotency key(s)", purged)
                    }
                    Ok(_) => {}
                    Err(e) => error!("[Cron] idempotency purge failed: {}", e),
                }
            })
        })?)
        .await?;

    sched.start().await?;
    info!("[Cron] scheduler started (sweep every {}h)", sweep_interval_hours);
    Ok(sched)
}
