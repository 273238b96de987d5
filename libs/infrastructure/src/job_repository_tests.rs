//! # AMR job repository tests
//!
//! File-backed temporary SQLite per test; every invariant of the status
//! state machine is exercised against the real schema.

#[cfg(test)]
mod tests {
    use crate::job_repository::{content_hash, JobRepository, StatusUpdate};
    use crate::store::{PoolSettings, Store};
    use chrono::{Duration as ChronoDuration, Utc};
    use pipeline_core::error::PipelineError;
    use pipeline_core::models::{AmrJob, AmrJobParams, JobKind, JobStatus};
    use uuid::Uuid;

    /// Each test gets its own DB file so WAL locking never crosses tests.
    async fn create_test_repo() -> (JobRepository, Store, tempfile::TempDir) {
        let tmp_dir = tempfile::TempDir::new().expect("failed to create temp dir");
        let db_path = tmp_dir.path().join("test.db");
        let store = Store::connect(db_path.to_str().expect("invalid path"), PoolSettings::default())
            .await
            .expect("failed to open store");
        let repo = JobRepository::new(&store);
        (repo, store, tmp_dir)
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
            input_file_path: Some("/tmp/in.fasta".to_string()),
            result_file_path: None,
            aggregated_result_file_path: None,
            worker_id: None,
            params: None,
        }
    }

    // ===== 1. Create / get =====

    #[tokio::test]
    async fn test_create_and_get_joins_params() {
        let (repo, _store, _tmp) = create_test_repo().await;

        let job = make_job("genome-1");
        let params = AmrJobParams { batch_size: 4, ..Default::default() };
        repo.create(&job, &params).await.unwrap();

        let fetched = repo.get(job.id).await.unwrap().expect("job should exist");
        assert_eq!(fetched.job_name, "genome-1");
        assert_eq!(fetched.status, JobStatus::Submitted);
        assert_eq!(fetched.progress, 0.0);
        let fetched_params = fetched.params.expect("params joined eagerly");
        assert_eq!(fetched_params.batch_size, 4);
    }

    #[tokio::test]
    async fn test_create_rejects_id_collision() {
        let (repo, _store, _tmp) = create_test_repo().await;

        let job = make_job("dup");
        repo.create(&job, &AmrJobParams::default()).await.unwrap();
        let result = repo.create(&job, &AmrJobParams::default()).await;
        assert!(matches!(result, Err(PipelineError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_params() {
        let (repo, _store, _tmp) = create_test_repo().await;

        let params = AmrJobParams { segment_length: 50, segment_overlap: 60, ..Default::default() };
        let result = repo.create(&make_job("bad"), &params).await;
        assert!(matches!(result, Err(PipelineError::InvalidInput { .. })));
    }

    // ===== 2. Listing & pagination =====

    #[tokio::test]
    async fn test_list_paginates_created_desc() {
        let (repo, _store, _tmp) = create_test_repo().await;

        let base = Utc::now();
        for i in 0..250 {
            let mut job = make_job(&format!("job-{:03}", i));
            job.created_at = base + ChronoDuration::milliseconds(i);
            repo.create(&job, &AmrJobParams::default()).await.unwrap();
        }

        let page = repo.list(None, Some(100), 100, None).await.unwrap();
        assert_eq!(page.len(), 100);
        // newest first: offset 100 starts at job-149 and walks down
        assert_eq!(page[0].job_name, "job-149");
        assert_eq!(page[99].job_name, "job-050");
    }

    #[tokio::test]
    async fn test_list_filters_status_and_user() {
        let (repo, _store, _tmp) = create_test_repo().await;

        let mut mine = make_job("mine");
        mine.user_id = Some("alice".to_string());
        repo.create(&mine, &AmrJobParams::default()).await.unwrap();

        let theirs = make_job("theirs");
        repo.create(&theirs, &AmrJobParams::default()).await.unwrap();

        repo.claim_next("w1").await.unwrap();

        let submitted = repo.list(Some(JobStatus::Submitted), None, 0, None).await.unwrap();
        assert_eq!(submitted.len(), 1);

        let alices = repo.list(None, None, 0, Some("alice")).await.unwrap();
        assert_eq!(alices.len(), 1);
        assert_eq!(alices[0].job_name, "mine");
    }

    #[tokio::test]
    async fn test_list_clamps_limit() {
        let (repo, _store, _tmp) = create_test_repo().await;
        repo.create(&make_job("only"), &AmrJobParams::default()).await.unwrap();

        // limit 0 clamps up to 1, absurd limits clamp down to 1000
        let page = repo.list(None, Some(0), 0, None).await.unwrap();
        assert_eq!(page.len(), 1);
        let page = repo.list(None, Some(1_000_000), 0, None).await.unwrap();
        assert_eq!(page.len(), 1);
    }

    // ===== 3. Status machine =====

    #[tokio::test]
    async fn test_claim_next_transitions_to_running() {
        let (repo, _store, _tmp) = create_test_repo().await;

        let job = make_job("claimable");
        repo.create(&job, &AmrJobParams::default()).await.unwrap();

        let claimed = repo.claim_next("worker-a").await.unwrap().expect("should claim");
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at.is_some());

        // No second claim of the same row.
        assert!(repo.claim_next("worker-b").await.unwrap().is_none());

        let history = repo.history(job.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.last().unwrap().status, "Running");
    }

    #[tokio::test]
    async fn test_terminal_states_are_final() {
        let (repo, _store, _tmp) = create_test_repo().await;

        let job = make_job("finishing");
        repo.create(&job, &AmrJobParams::default()).await.unwrap();
        repo.claim_next("w").await.unwrap();

        repo.update_status(
            job.id,
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

        // Re-applying the terminal status is an idempotent no-op.
        let ok = repo
            .update_status(
                job.id,
                StatusUpdate {
                    status: Some(JobStatus::Completed),
                    worker_id: Some("w".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(ok);

        // Moving out of a terminal state is a conflict.
        let result = repo
            .update_status(
                job.id,
                StatusUpdate {
                    status: Some(JobStatus::Running),
                    worker_id: Some("w".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(PipelineError::Conflict { .. })));

        // Progress is frozen too.
        repo.update_status(
            job.id,
            StatusUpdate { progress: Some(1.0), worker_id: Some("w".to_string()), ..Default::default() },
        )
        .await
        .unwrap();
        let fetched = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.progress, 100.0);
        // One history row per actual change: Submitted, Running, Completed.
        assert_eq!(repo.history(job.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_while_running() {
        let (repo, _store, _tmp) = create_test_repo().await;

        let job = make_job("progressing");
        repo.create(&job, &AmrJobParams::default()).await.unwrap();
        repo.claim_next("w").await.unwrap();

        for p in [10.0, 35.0, 20.0, 50.0] {
            repo.update_status(
                job.id,
                StatusUpdate { progress: Some(p), worker_id: Some("w".to_string()), ..Default::default() },
            )
            .await
            .unwrap();
        }
        // 20.0 was clamped upward to the stored 35.0, then 50.0 applied
        let fetched = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.progress, 50.0);
    }

    #[tokio::test]
    async fn test_non_owner_cannot_advance_but_may_cancel() {
        let (repo, _store, _tmp) = create_test_repo().await;

        let job = make_job("owned");
        repo.create(&job, &AmrJobParams::default()).await.unwrap();
        repo.claim_next("owner").await.unwrap();

        let hijack = repo
            .update_status(
                job.id,
                StatusUpdate {
                    status: Some(JobStatus::Completed),
                    worker_id: Some("intruder".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(hijack, Err(PipelineError::Conflict { .. })));

        // User-initiated cancel carries no worker identity and is allowed.
        let cancelled = repo
            .update_status(
                job.id,
                StatusUpdate { status: Some(JobStatus::Cancelled), ..Default::default() },
            )
            .await
            .unwrap();
        assert!(cancelled);
        let fetched = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_submitted_can_fail_directly() {
        let (repo, _store, _tmp) = create_test_repo().await;

        let job = make_job("doa");
        repo.create(&job, &AmrJobParams::default()).await.unwrap();
        repo.update_status(
            job.id,
            StatusUpdate {
                status: Some(JobStatus::Error),
                error: Some("invalid character 'X'".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let fetched = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Error);
        assert!(fetched.error.unwrap().contains("invalid character"));
    }

    #[tokio::test]
    async fn test_update_unknown_job_returns_false() {
        let (repo, _store, _tmp) = create_test_repo().await;
        let ok = repo
            .update_status(Uuid::new_v4(), StatusUpdate { progress: Some(5.0), ..Default::default() })
            .await
            .unwrap();
        assert!(!ok);
    }

    // ===== 4. History completeness =====

    #[tokio::test]
    async fn test_latest_history_row_matches_job_status() {
        let (repo, _store, _tmp) = create_test_repo().await;

        let job = make_job("audited");
        repo.create(&job, &AmrJobParams::default()).await.unwrap();
        repo.claim_next("w").await.unwrap();
        repo.update_status(
            job.id,
            StatusUpdate {
                status: Some(JobStatus::Error),
                error: Some("boom".to_string()),
                worker_id: Some("w".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let fetched = repo.get(job.id).await.unwrap().unwrap();
        let history = repo.history(job.id).await.unwrap();
        assert!(!history.is_empty());
        assert_eq!(history.last().unwrap().status, fetched.status.as_str());
    }

    // ===== 5. Cascade delete =====

    #[tokio::test]
    async fn test_delete_cascades_and_spares_others() {
        let (repo, store, _tmp) = create_test_repo().await;

        let victim = make_job("victim");
        let survivor = make_job("survivor");
        repo.create(&victim, &AmrJobParams::default()).await.unwrap();
        repo.create(&survivor, &AmrJobParams::default()).await.unwrap();

        assert!(repo.delete(victim.id).await.unwrap());
        assert!(repo.get(victim.id).await.unwrap().is_none());
        assert!(repo.history(victim.id).await.unwrap().is_empty());

        // Params row cascaded via FK.
        let params_left: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM amr_job_params")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(params_left, 1);

        assert!(repo.get(survivor.id).await.unwrap().is_some());
        assert_eq!(repo.history(survivor.id).await.unwrap().len(), 1);
    }

    // ===== 6. Side parameters =====

    #[tokio::test]
    async fn test_add_parameters_merges_json() {
        let (repo, store, _tmp) = create_test_repo().await;

        let job = make_job("extras");
        repo.create(&job, &AmrJobParams::default()).await.unwrap();

        let mut extra = serde_json::Map::new();
        extra.insert("wig_file".to_string(), serde_json::json!("/tmp/a.wig"));
        assert!(repo.add_parameters(job.id, &extra).await.unwrap());

        let mut more = serde_json::Map::new();
        more.insert("step_size".to_string(), serde_json::json!(5));
        assert!(repo.add_parameters(job.id, &more).await.unwrap());

        let stored: String =
            sqlx::query_scalar("SELECT extra_json FROM amr_job_params WHERE job_id = ?")
                .bind(job.id.to_string())
                .fetch_one(store.pool())
                .await
                .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&stored).unwrap();
        assert_eq!(parsed["wig_file"], "/tmp/a.wig");
        assert_eq!(parsed["step_size"], 5);
    }

    // ===== 7. Idempotency keys =====

    #[tokio::test]
    async fn test_idempotency_roundtrip() {
        let (repo, _store, _tmp) = create_test_repo().await;

        let job = make_job("idem");
        repo.create(&job, &AmrJobParams::default()).await.unwrap();

        let key_hash = content_hash(&[b"client-key-1"]);
        let body_hash = content_hash(&[b"fasta-bytes"]);
        repo.remember_idempotent(&key_hash, &body_hash, job.id).await.unwrap();

        let hit = repo.lookup_idempotent(&key_hash, 24).await.unwrap();
        assert_eq!(hit, Some((body_hash.clone(), job.id)));

        // Remembering again under the same key keeps the original mapping.
        repo.remember_idempotent(&key_hash, &content_hash(&[b"other"]), Uuid::new_v4())
            .await
            .unwrap();
        let hit = repo.lookup_idempotent(&key_hash, 24).await.unwrap();
        assert_eq!(hit, Some((body_hash, job.id)));

        assert!(repo.lookup_idempotent(&content_hash(&[b"unseen"]), 24).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_idempotency_purge_spares_fresh_rows() {
        let (repo, _store, _tmp) = create_test_repo().await;
        let job = make_job("fresh");
        repo.create(&job, &AmrJobParams::default()).await.unwrap();
        repo.remember_idempotent("k", "b", job.id).await.unwrap();

        let purged = repo.purge_idempotency(24).await.unwrap();
        assert_eq!(purged, 0);
        assert!(repo.lookup_idempotent("k", 24).await.unwrap().is_some());
    }
}
