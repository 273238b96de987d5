//! # Bakta repository tests
//!
//! Covers the local job lifecycle, sequence and result-file bookkeeping,
//! and the annotation range queries.

#[cfg(test)]
mod tests {
    use crate::bakta_repository::{AnnotationQuery, BaktaRepository};
    use crate::store::{PoolSettings, Store};
    use chrono::Utc;
    use pipeline_core::error::PipelineError;
    use pipeline_core::models::{
        BaktaAnnotation, BaktaFileType, BaktaJob, BaktaJobStatus, Strand,
    };
    use uuid::Uuid;

    async fn create_test_repo() -> (BaktaRepository, Store, tempfile::TempDir) {
        let tmp_dir = tempfile::TempDir::new().expect("failed to create temp dir");
        let db_path = tmp_dir.path().join("test.db");
        let store = Store::connect(db_path.to_str().expect("invalid path"), PoolSettings::default())
            .await
            .expect("failed to open store");
        let repo = BaktaRepository::new(&store);
        (repo, store, tmp_dir)
    }

    fn make_job(name: &str) -> BaktaJob {
        BaktaJob {
            id: Uuid::new_v4(),
            remote_id: None,
            secret: None,
            name: name.to_string(),
            status: BaktaJobStatus::Init,
            fasta_path: "/tmp/in.fasta".to_string(),
            config_json: "{}".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    fn make_annotation(job_id: Uuid, feature_id: &str, contig: &str, start: i64, end: i64) -> BaktaAnnotation {
        BaktaAnnotation {
            id: 0,
            job_id,
            feature_id: feature_id.to_string(),
            feature_type: "CDS".to_string(),
            contig: contig.to_string(),
            start,
            end,
            strand: Strand::Forward,
            attributes_json: "{}".to_string(),
        }
    }

    // ===== 1. Job lifecycle =====

    #[tokio::test]
    async fn test_create_persists_sequences_and_history() {
        let (repo, _store, _tmp) = create_test_repo().await;

        let job = make_job("annotate-1");
        let sequences = vec![
            ("contig_1".to_string(), "ACGT".repeat(100)),
            ("contig_2".to_string(), "N".repeat(50)),
        ];
        repo.create(&job, &sequences).await.unwrap();

        let fetched = repo.get(job.id).await.unwrap().expect("job exists");
        assert_eq!(fetched.status, BaktaJobStatus::Init);

        let stored = repo.sequences(job.id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].header, "contig_1");
        assert_eq!(stored[0].length, 400);
        assert_eq!(repo.sequence_count(job.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let (repo, _store, _tmp) = create_test_repo().await;
        let job = make_job("dup");
        repo.create(&job, &[]).await.unwrap();
        assert!(matches!(
            repo.create(&job, &[]).await,
            Err(PipelineError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_remote_ref_roundtrip() {
        let (repo, _store, _tmp) = create_test_repo().await;
        let job = make_job("credentialed");
        repo.create(&job, &[]).await.unwrap();

        let remote_id = Uuid::new_v4();
        assert!(repo.set_remote_ref(job.id, remote_id, "s3cr3t").await.unwrap());

        let fetched = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.remote_id, Some(remote_id));
        assert_eq!(fetched.secret.as_deref(), Some("s3cr3t"));
    }

    #[tokio::test]
    async fn test_status_machine_and_error_message() {
        let (repo, _store, _tmp) = create_test_repo().await;
        let job = make_job("failing");
        repo.create(&job, &[]).await.unwrap();

        assert!(repo.update_status(job.id, BaktaJobStatus::Running, None).await.unwrap());
        let running = repo.get(job.id).await.unwrap().unwrap();
        assert!(running.started_at.is_some());

        assert!(repo
            .update_status(job.id, BaktaJobStatus::Error, Some("annotation pipeline died"))
            .await
            .unwrap());
        let failed = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, BaktaJobStatus::Error);
        assert_eq!(failed.error.as_deref(), Some("annotation pipeline died"));
        assert!(failed.completed_at.is_some());

        // Terminal is final.
        assert!(matches!(
            repo.update_status(job.id, BaktaJobStatus::Running, None).await,
            Err(PipelineError::Conflict { .. })
        ));
        // Same-status re-apply is a no-op.
        assert!(repo.update_status(job.id, BaktaJobStatus::Error, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_observed_remote_statuses_append_to_history() {
        let (repo, store, _tmp) = create_test_repo().await;
        let job = make_job("polled");
        repo.create(&job, &[]).await.unwrap();
        repo.update_status(job.id, BaktaJobStatus::Running, None).await.unwrap();
        repo.append_history(job.id, "Running", Some("remote poll")).await.unwrap();
        repo.update_status(job.id, BaktaJobStatus::Successful, None).await.unwrap();

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_status_history WHERE job_id = ?")
            .bind(job.id.to_string())
            .fetch_one(store.pool())
            .await
            .unwrap();
        // Init + Running + observed poll + Successful
        assert_eq!(rows, 4);
    }

    #[tokio::test]
    async fn test_non_terminal_listing_for_resume() {
        let (repo, _store, _tmp) = create_test_repo().await;

        let pending = make_job("pending");
        let running = make_job("running");
        let done = make_job("done");
        for job in [&pending, &running, &done] {
            repo.create(job, &[]).await.unwrap();
        }
        repo.update_status(running.id, BaktaJobStatus::Running, None).await.unwrap();
        repo.update_status(done.id, BaktaJobStatus::Running, None).await.unwrap();
        repo.update_status(done.id, BaktaJobStatus::Successful, None).await.unwrap();

        let resumable = repo.non_terminal().await.unwrap();
        let ids: Vec<Uuid> = resumable.iter().map(|j| j.id).collect();
        assert!(ids.contains(&pending.id));
        assert!(ids.contains(&running.id));
        assert!(!ids.contains(&done.id));
    }

    // ===== 2. Result files =====

    #[tokio::test]
    async fn test_result_files_typed_and_opaque() {
        let (repo, _store, _tmp) = create_test_repo().await;
        let job = make_job("results");
        repo.create(&job, &[]).await.unwrap();

        repo.add_result_file(job.id, &BaktaFileType::Gff3, "/r/a.gff3", Some("https://signed/a"))
            .await
            .unwrap();
        repo.add_result_file(job.id, &BaktaFileType::from_key("PNGCircular"), "/r/a.bin", None)
            .await
            .unwrap();

        let files = repo.result_files(job.id).await.unwrap();
        assert_eq!(files.len(), 2);

        let gff = repo.result_file(job.id, &BaktaFileType::Gff3).await.unwrap().unwrap();
        assert_eq!(gff.file_path, "/r/a.gff3");
        assert_eq!(gff.download_url.as_deref(), Some("https://signed/a"));

        let opaque = repo
            .result_file(job.id, &BaktaFileType::Other("PNGCircular".to_string()))
            .await
            .unwrap();
        assert!(opaque.is_some());
    }

    // ===== 3. Annotations =====

    #[tokio::test]
    async fn test_range_query_returns_exact_overlap_set() {
        let (repo, _store, _tmp) = create_test_repo().await;
        let job = make_job("ranged");
        repo.create(&job, &[]).await.unwrap();

        let annotations = vec![
            make_annotation(job.id, "f1", "c1", 10, 20),
            make_annotation(job.id, "f2", "c1", 15, 30),
            make_annotation(job.id, "f3", "c1", 40, 50),
            make_annotation(job.id, "f4", "c1", 5, 9),
            make_annotation(job.id, "f5", "c1", 21, 39),
            make_annotation(job.id, "f6", "c2", 12, 18),
        ];
        assert_eq!(repo.save_annotations(job.id, &annotations).await.unwrap(), 6);

        let query = AnnotationQuery {
            contig: Some("c1".to_string()),
            start: Some(12),
            end: Some(25),
            ..Default::default()
        };
        let hits = repo.annotations(job.id, &query).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|a| a.feature_id.as_str()).collect();
        // exactly { a | a.contig=c1 AND NOT (a.end < 12 OR a.start > 25) }
        assert_eq!(ids, vec!["f1", "f2", "f5"]);
    }

    #[tokio::test]
    async fn test_equal_coordinates_tie_break_by_feature_id() {
        let (repo, _store, _tmp) = create_test_repo().await;
        let job = make_job("ties");
        repo.create(&job, &[]).await.unwrap();

        let annotations = vec![
            make_annotation(job.id, "zzz", "c1", 100, 200),
            make_annotation(job.id, "aaa", "c1", 100, 200),
            make_annotation(job.id, "mmm", "c1", 100, 200),
        ];
        repo.save_annotations(job.id, &annotations).await.unwrap();

        let hits = repo.annotations(job.id, &AnnotationQuery::default()).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|a| a.feature_id.as_str()).collect();
        assert_eq!(ids, vec!["aaa", "mmm", "zzz"]);
    }

    #[tokio::test]
    async fn test_annotation_filters_and_pagination() {
        let (repo, _store, _tmp) = create_test_repo().await;
        let job = make_job("filtered");
        repo.create(&job, &[]).await.unwrap();

        let mut annotations = Vec::new();
        for i in 0..10 {
            let mut a = make_annotation(job.id, &format!("cds-{}", i), "c1", 100 * (i + 1), 100 * (i + 1) + 50);
            if i % 2 == 0 {
                a.feature_type = "tRNA".to_string();
            }
            annotations.push(a);
        }
        repo.save_annotations(job.id, &annotations).await.unwrap();
        assert_eq!(repo.annotation_count(job.id).await.unwrap(), 10);

        let trnas = repo
            .annotations(
                job.id,
                &AnnotationQuery { feature_type: Some("tRNA".to_string()), ..Default::default() },
            )
            .await
            .unwrap();
        assert_eq!(trnas.len(), 5);

        let page = repo
            .annotations(job.id, &AnnotationQuery { limit: Some(3), offset: 3, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].start, 400);
    }

    // ===== 4. Cascade =====

    #[tokio::test]
    async fn test_delete_cascades_everything_and_spares_others() {
        let (repo, store, _tmp) = create_test_repo().await;

        let victim = make_job("victim");
        let survivor = make_job("survivor");
        repo.create(&victim, &[("c1".to_string(), "ACGT".to_string())]).await.unwrap();
        repo.create(&survivor, &[("c9".to_string(), "ACGT".to_string())]).await.unwrap();

        repo.add_result_file(victim.id, &BaktaFileType::Json, "/r/v.json", None).await.unwrap();
        repo.save_annotations(victim.id, &[make_annotation(victim.id, "f", "c1", 1, 10)])
            .await
            .unwrap();
        repo.save_annotations(survivor.id, &[make_annotation(survivor.id, "g", "c9", 1, 10)])
            .await
            .unwrap();

        assert!(repo.delete(victim.id).await.unwrap());

        assert!(repo.get(victim.id).await.unwrap().is_none());
        assert!(repo.sequences(victim.id).await.unwrap().is_empty());
        assert!(repo.result_files(victim.id).await.unwrap().is_empty());
        assert_eq!(repo.annotation_count(victim.id).await.unwrap(), 0);

        let history: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_status_history WHERE job_id = ?")
            .bind(victim.id.to_string())
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(history, 0);

        // The neighbor is untouched.
        assert!(repo.get(survivor.id).await.unwrap().is_some());
        assert_eq!(repo.annotation_count(survivor.id).await.unwrap(), 1);
        assert_eq!(repo.sequences(survivor.id).await.unwrap().len(), 1);
    }
}
