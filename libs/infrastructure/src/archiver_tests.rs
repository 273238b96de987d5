//! # Archiver tests
//!
//! Jobs are aged by rewriting their timestamps directly, then the sweep
//! runs against the real schema.

#[cfg(test)]
mod tests {
    use crate::archiver::{Archiver, RetentionPolicy, SweepStats};
    use crate::bakta_repository::BaktaRepository;
    use crate::job_repository::{JobRepository, StatusUpdate};
    use crate::store::{PoolSettings, Store};
    use chrono::Utc;
    use pipeline_core::models::{AmrJob, AmrJobParams, BaktaJob, BaktaJobStatus, JobKind, JobStatus};
    use uuid::Uuid;

    async fn setup() -> (Archiver, JobRepository, BaktaRepository, Store, tempfile::TempDir) {
        let tmp_dir = tempfile::TempDir::new().expect("failed to create temp dir");
        let db_path = tmp_dir.path().join("test.db");
        let store = Store::connect(db_path.to_str().expect("invalid path"), PoolSettings::default())
            .await
            .expect("failed to open store");
        let policy = RetentionPolicy { archive_after_days: 30, delete_after_days: 90 };
        let results_dir = tmp_dir.path().join("results");
        let archiver = Archiver::new(&store, policy, results_dir.to_string_lossy().to_string());
        let jobs = JobRepository::new(&store);
        let bakta = BaktaRepository::new(&store);
        (archiver, jobs, bakta, store, tmp_dir)
    }

    fn make_job(name: &str) -> AmrJob {
        AmrJob {
            id: Uuid::new_v4(),
            user_id: None,
            job_name: name.to_string(),
            kind: JobKind::Predict,
            status: JobStatus::Submitted,
            progress: 0.0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            input_file_path: None,
            result_file_path: None,
            aggregated_result_file_path: None,
            worker_id: None,
            params: None,
        }
    }

    async fn complete_job(repo: &JobRepository, id: Uuid) {
        repo.claim_next("w").await.unwrap();
        repo.update_status(
            id,
            StatusUpdate {
                status: Some(JobStatus::Completed),
                progress: Some(100.0),
                completed_at: Some(Utc::now()),
                result_file: Some("/tmp/out.tsv".to_string()),
                worker_id: Some("w".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }

    async fn age_job(store: &Store, id: Uuid, days: i64) {
        let old = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();
        sqlx::query("UPDATE amr_jobs SET completed_at = ?, updated_at = ? WHERE id = ?")
            .bind(&old)
            .bind(&old)
            .bind(id.to_string())
            .execute(store.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweep_archives_old_terminal_jobs_only() {
        let (archiver, jobs, _bakta, store, _tmp) = setup().await;

        let old_done = make_job("old-done");
        jobs.create(&old_done, &AmrJobParams::default()).await.unwrap();
        complete_job(&jobs, old_done.id).await;
        age_job(&store, old_done.id, 60).await;

        let fresh_done = make_job("fresh-done");
        jobs.create(&fresh_done, &AmrJobParams::default()).await.unwrap();
        complete_job(&jobs, fresh_done.id).await;

        // Ancient but still running: retention must never touch it.
        let ancient_running = make_job("ancient-running");
        jobs.create(&ancient_running, &AmrJobParams::default()).await.unwrap();
        jobs.claim_next("w2").await.unwrap();
        age_job(&store, ancient_running.id, 400).await;

        let stats = archiver.run_sweep().await.unwrap();
        assert_eq!(stats.archived, 1);
        assert_eq!(stats.deleted, 0);

        assert!(jobs.get(old_done.id).await.unwrap().is_none());
        assert!(jobs.get(fresh_done.id).await.unwrap().is_some());
        assert!(jobs.get(ancient_running.id).await.unwrap().is_some());

        let archived: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM amr_jobs_archive")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(archived, 1);
    }

    #[tokio::test]
    async fn test_sweep_deletes_expired_archive_rows() {
        let (archiver, jobs, _bakta, store, _tmp) = setup().await;

        let job = make_job("ancient");
        jobs.create(&job, &AmrJobParams::default()).await.unwrap();
        complete_job(&jobs, job.id).await;
        age_job(&store, job.id, 60).await;

        // First sweep moves it to the archive; age the archive row past
        // the delete window and sweep again.
        archiver.run_sweep().await.unwrap();
        let old = (Utc::now() - chrono::Duration::days(120)).to_rfc3339();
        sqlx::query("UPDATE amr_jobs_archive SET archived_at = ? WHERE id = ?")
            .bind(&old)
            .bind(job.id.to_string())
            .execute(store.pool())
            .await
            .unwrap();

        let stats = archiver.run_sweep().await.unwrap();
        assert_eq!(stats.deleted, 1);

        let archived: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM amr_jobs_archive")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(archived, 0);
        let history: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_status_history WHERE job_id = ?")
            .bind(job.id.to_string())
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(history, 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_bakta_jobs() {
        let (archiver, _jobs, bakta, store, _tmp) = setup().await;

        let job = BaktaJob {
            id: Uuid::new_v4(),
            remote_id: None,
            secret: None,
            name: "old-annotation".to_string(),
            status: BaktaJobStatus::Init,
            fasta_path: "/tmp/in.fasta".to_string(),
            config_json: "{}".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        };
        bakta.create(&job, &[("c1".to_string(), "ACGT".to_string())]).await.unwrap();
        bakta.update_status(job.id, BaktaJobStatus::Running, None).await.unwrap();
        bakta.update_status(job.id, BaktaJobStatus::Successful, None).await.unwrap();

        let old = (Utc::now() - chrono::Duration::days(120)).to_rfc3339();
        sqlx::query("UPDATE bakta_jobs SET completed_at = ?, updated_at = ? WHERE id = ?")
            .bind(&old)
            .bind(&old)
            .bind(job.id.to_string())
            .execute(store.pool())
            .await
            .unwrap();

        let stats = archiver.run_sweep().await.unwrap();
        assert_eq!(stats.bakta_deleted, 1);
        assert!(bakta.get(job.id).await.unwrap().is_none());
        assert!(bakta.sequences(job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_sweep_is_skipped_by_advisory_lock() {
        let (archiver, jobs, _bakta, store, _tmp) = setup().await;

        let job = make_job("locked-out");
        jobs.create(&job, &AmrJobParams::default()).await.unwrap();
        complete_job(&jobs, job.id).await;
        age_job(&store, job.id, 60).await;

        // Simulate a live sweep elsewhere: fresh lock row set to running.
        sqlx::query(
            "INSERT INTO system_state (key, value, updated_at) VALUES ('archiver.running', 'true', ?)",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(store.pool())
        .await
        .unwrap();

        let stats = archiver.run_sweep().await.unwrap();
        assert_eq!(stats, SweepStats::default());
        assert!(jobs.get(job.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let (archiver, jobs, _bakta, store, _tmp) = setup().await;

        let job = make_job("reclaimed");
        jobs.create(&job, &AmrJobParams::default()).await.unwrap();
        complete_job(&jobs, job.id).await;
        age_job(&store, job.id, 60).await;

        // A lock left behind by a crashed sweep two hours ago.
        let stale = (Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
        sqlx::query(
            "INSERT INTO system_state (key, value, updated_at) VALUES ('archiver.running', 'true', ?)",
        )
        .bind(&stale)
        .execute(store.pool())
        .await
        .unwrap();

        let stats = archiver.run_sweep().await.unwrap();
        assert_eq!(stats.archived, 1);
    }
}
