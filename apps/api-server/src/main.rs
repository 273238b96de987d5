//! # Service bootstrap
//!
//! Wires config → store → repositories → clients → workers → HTTP. One pool
//! per process, constructed here; background loops are spawned before the
//! listener starts accepting.

mod aggregation;
mod amr_executor;
mod annotation_parsers;
mod bakta_orchestrator;
mod job_worker;
mod server;

use clap::Parser;
use infrastructure::archiver::{Archiver, RetentionPolicy};
use infrastructure::bakta_client::{BaktaClient, BaktaClientSettings};
use infrastructure::bakta_repository::BaktaRepository;
use infrastructure::job_repository::JobRepository;
use infrastructure::model_bridge::ModelBridgeClient;
use infrastructure::store::{PoolSettings, Store};
use shared::config::AppConfig;
use std::sync::Arc;
use std::time::Duration;

use crate::amr_executor::AmrExecutor;
use crate::bakta_orchestrator::{BaktaOrchestrator, OrchestratorSettings};
use crate::job_worker::JobWorker;
use crate::server::router::{create_router, AppState};

#[derive(Parser, Debug)]
#[command(name = "api-server", about = "Genomic analysis job-orchestration service")]
struct Args {
    /// Override the configured bind port.
    #[arg(long)]
    port: Option<u16>,
    /// Mount prefix for all routes.
    #[arg(long, default_value = "/")]
    prefix: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = AppConfig::load()?;
    tracing::info!("⚙️  Config loaded: {:?}", config);

    for dir in [&config.data_dir, &config.upload_dir, &config.results_dir] {
        tokio::fs::create_dir_all(dir).await?;
    }

    let store = Store::connect(
        &config.database_path(),
        PoolSettings {
            min_connections: config.db_min_connections,
            max_connections: config.db_max_connections,
            acquire_timeout: Duration::from_secs(config.db_acquire_timeout_secs),
        },
    )
    .await?;
    let jobs = JobRepository::new(&store);
    let bakta = BaktaRepository::new(&store);

    let bakta_api = Arc::new(BaktaClient::new(BaktaClientSettings {
        base_url: config.bakta_api_url().to_string(),
        api_key: config.bakta_api_key.clone(),
        request_timeout: Duration::from_secs(config.http_timeout_secs),
        upload_timeout: Duration::from_secs(config.upload_timeout_secs),
        idle_timeout: Duration::from_secs(config.idle_timeout_secs),
    })?);

    let predictor = Arc::new(ModelBridgeClient::new(
        config.model_api_url.clone(),
        Duration::from_secs(config.http_timeout_secs),
    )?);

    // Bakta orchestration: resume anything a previous process left running.
    let orchestrator = BaktaOrchestrator::new(
        bakta.clone(),
        bakta_api.clone(),
        OrchestratorSettings {
            results_dir: config.results_dir.clone().into(),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            poll_deadline: Duration::from_secs(config.poll_deadline_secs),
        },
        config.bakta_workers,
    );
    let resumed = orchestrator.resume_pending().await?;
    if resumed > 0 {
        tracing::info!("🔄 resumed {} bakta job(s) from a previous run", resumed);
    }

    // AMR execution pool, sized by cores unless configured lower.
    let executor = Arc::new(AmrExecutor::new(
        jobs.clone(),
        predictor,
        config.results_dir.clone(),
    ));
    let worker = JobWorker::new(jobs.clone(), executor, config.effective_amr_workers());
    tokio::spawn(worker.start_loop());

    let archiver = Arc::new(Archiver::new(
        &store,
        RetentionPolicy {
            archive_after_days: config.archive_after_days,
            delete_after_days: config.delete_after_days,
        },
        config.results_dir.clone(),
    ));
    let _scheduler = server::cron::start_cron_scheduler(
        archiver,
        jobs.clone(),
        config.archive_sweep_interval_hours,
    )
    .await
    .map_err(|e| anyhow::anyhow!("cron scheduler failed to start: {}", e))?;

    let port = args.port.unwrap_or(config.http_port);
    let addr = format!("{}:{}", config.http_host, port);
    let state = Arc::new(AppState {
        config,
        store,
        jobs,
        bakta,
        bakta_api,
        orchestrator,
    });
    let router = create_router(state, &args.prefix);

    tracing::info!("🚀 listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
