mod common;

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::json;

use payslip_pipeline::db::{self, NewJob};
use payslip_pipeline::inference::InferenceError;
use payslip_pipeline::jobs;
use payslip_pipeline::meta::JobMeta;
use payslip_pipeline::model::{Currency, JobKind, JobStatus, PeriodType};
use payslip_pipeline::storage::FsPreviewStore;
use payslip_pipeline::worker::{JobOutcome, Worker, WorkerSettings, UNHANDLED_KIND_ERROR};

use common::{payload, setup_pool, worker, FakeInference, FakePreviews, USER};

fn extraction(confidence: f64, gross: f64) -> serde_json::Value {
    json!({
        "fields": {"gross": format!("£{}", gross), "net": gross * 0.8, "pension_employer": 40},
        "highlights": [{"x": 0.1, "y": 0.2, "w": 0.3, "h": 0.04, "label": "gross"}],
        "confidence": confidence,
        "employer_name": "Acme",
        "pay_date": "2024-01-31",
        "period_start": "2024-01-01",
        "period_end": "2024-01-31",
        "country": "UK",
        "notes": "Regular pay"
    })
}

async fn enqueue(pool: &db::Pool, file_id: &str) -> String {
    jobs::enqueue(pool, &NewJob::extract(USER, file_id, None))
        .await
        .unwrap()
}

async fn jobs_of_kind(pool: &db::Pool, kind: JobKind) -> Vec<payslip_pipeline::model::Job> {
    db::list_jobs(pool, USER)
        .await
        .unwrap()
        .into_iter()
        .filter(|j| j.kind == kind)
        .collect()
}

#[tokio::test]
async fn low_confidence_needs_review() {
    let pool = setup_pool().await;
    let previews = Arc::new(FakePreviews::with(USER, &["file-1"]));
    let inference = Arc::new(FakeInference::replying(vec![Ok(payload(extraction(0.85, 3100.0)))]));
    let worker = worker(&pool, previews, inference.clone());
    let id = enqueue(&pool, "file-1").await;

    let outcome = worker.run_job(&id).await.unwrap();
    assert!(matches!(outcome, JobOutcome::NeedsReview { .. }));
    assert_eq!(inference.call_count(), 1);
    assert_eq!(inference.calls.lock().unwrap()[0], b"\x89PNG fake".to_vec());

    let job = db::fetch_job(&pool, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::NeedsReview);
    assert_eq!(job.error, None);
    let meta = job.meta.as_extract().unwrap();
    assert_eq!(meta.confidence, Some(0.85));
    assert_eq!(meta.review_required, Some(true));
    assert_eq!(meta.image_url.as_deref(), Some("user-1/file-1_preview.png"));
    assert_eq!(meta.highlights.as_ref().unwrap()[0].w, 30.0);
    assert_eq!(meta.fields.as_ref().unwrap().gross, Some(3100.0));

    let payslip = db::fetch_payslip_by_file(&pool, "file-1").await.unwrap().unwrap();
    assert!(payslip.review_required);
    assert_eq!(payslip.currency, Currency::Gbp);
    assert_eq!(payslip.period_type, Some(PeriodType::Monthly));
    assert_eq!(payslip.explainer_text.as_deref(), Some("Regular pay"));
    assert!(jobs_of_kind(&pool, JobKind::DetectAnomalies).await.is_empty());
}

#[tokio::test]
async fn high_confidence_is_done_and_queues_detection_once() {
    let pool = setup_pool().await;
    let previews = Arc::new(FakePreviews::with(USER, &["file-1"]));
    let inference = Arc::new(FakeInference::replying(vec![Ok(payload(extraction(0.95, 3100.0)))]));
    let worker = worker(&pool, previews, inference);
    let id = enqueue(&pool, "file-1").await;

    let outcome = worker.run_job(&id).await.unwrap();
    let JobOutcome::Done { payslip_id: Some(payslip_id), .. } = outcome.clone() else {
        panic!("unexpected {:?}", outcome);
    };
    let job = db::fetch_job(&pool, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);

    let follow_ups = jobs_of_kind(&pool, JobKind::DetectAnomalies).await;
    assert_eq!(follow_ups.len(), 1);
    assert_eq!(follow_ups[0].status, JobStatus::Queued);
    match &follow_ups[0].meta {
        JobMeta::DetectAnomalies(m) => {
            assert_eq!(m.payslip_id.as_deref(), Some(payslip_id.as_str()));
            assert_eq!(m.source_job_id.as_deref(), Some(id.as_str()));
        }
        other => panic!("unexpected meta {:?}", other),
    }

    // Running the same job again is a no-op.
    let again = worker.run_job(&id).await.unwrap();
    assert!(matches!(again, JobOutcome::Skipped { status: JobStatus::Done, .. }));
    assert_eq!(jobs_of_kind(&pool, JobKind::DetectAnomalies).await.len(), 1);

    // The follow-up runs next and finds nothing without history.
    let next = worker.process_next_job().await.unwrap();
    assert!(matches!(next, JobOutcome::Done { .. }));
    let detection = db::fetch_job(&pool, &follow_ups[0].id).await.unwrap().unwrap();
    assert_eq!(detection.status, JobStatus::Done);
    match detection.meta {
        JobMeta::DetectAnomalies(m) => assert_eq!(m.count, Some(0)),
        other => panic!("unexpected meta {:?}", other),
    }
    assert_eq!(worker.process_next_job().await.unwrap(), JobOutcome::Idle);
}

#[tokio::test]
async fn missing_confidence_forces_review() {
    let pool = setup_pool().await;
    let previews = Arc::new(FakePreviews::with(USER, &["file-1"]));
    let inference = Arc::new(FakeInference::replying(vec![Ok(payload(
        json!({"fields": {"gross": 1000}}),
    ))]));
    let worker = worker(&pool, previews, inference);
    let id = enqueue(&pool, "file-1").await;

    worker.run_job(&id).await.unwrap();
    let job = db::fetch_job(&pool, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::NeedsReview);
}

#[tokio::test]
async fn rescan_overwrites_single_payslip() {
    let pool = setup_pool().await;
    let previews = Arc::new(FakePreviews::with(USER, &["file-1"]));
    let inference = Arc::new(FakeInference::replying(vec![
        Ok(payload(extraction(0.95, 1000.0))),
        Ok(payload(extraction(0.97, 2000.0))),
    ]));
    let worker = worker(&pool, previews, inference);

    let first = enqueue(&pool, "file-1").await;
    worker.run_job(&first).await.unwrap();
    let first_row = db::fetch_payslip_by_file(&pool, "file-1").await.unwrap().unwrap();
    let second = enqueue(&pool, "file-1").await;
    worker.run_job(&second).await.unwrap();

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM payslips WHERE file_id = 'file-1'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
    let row = db::fetch_payslip_by_file(&pool, "file-1").await.unwrap().unwrap();
    assert_eq!(row.id, first_row.id);
    assert_eq!(row.gross, Some(2000.0));
    assert_eq!(row.confidence_overall, Some(0.97));
}

#[tokio::test]
async fn missing_preview_fails_without_payslip() {
    let pool = setup_pool().await;
    let previews = Arc::new(FakePreviews::default());
    let inference = Arc::new(FakeInference::default());
    let worker = worker(&pool, previews, inference.clone());
    let id = enqueue(&pool, "file-1").await;

    let outcome = worker.run_job(&id).await.unwrap();
    assert_eq!(
        outcome,
        JobOutcome::Failed {
            job_id: id.clone(),
            error: "Preview image not found".into()
        }
    );
    assert_eq!(inference.call_count(), 0);
    let job = db::fetch_job(&pool, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("Preview image not found"));
    assert!(db::fetch_payslip_by_file(&pool, "file-1").await.unwrap().is_none());
}

#[tokio::test]
async fn inference_errors_fail_the_job() {
    let pool = setup_pool().await;
    let previews = Arc::new(FakePreviews::with(USER, &["file-1", "file-2"]));
    let inference = Arc::new(FakeInference::replying(vec![
        Err(InferenceError::Status {
            status: StatusCode::BAD_GATEWAY,
            body: "upstream".into(),
        }),
        Err(InferenceError::Malformed("expected value".into())),
    ]));
    let worker = worker(&pool, previews, inference);

    let a = enqueue(&pool, "file-1").await;
    let b = enqueue(&pool, "file-2").await;
    worker.run_job(&a).await.unwrap();
    worker.run_job(&b).await.unwrap();

    let a = db::fetch_job(&pool, &a).await.unwrap().unwrap();
    assert_eq!(a.status, JobStatus::Failed);
    assert!(a.error.unwrap().contains("502"));
    let b = db::fetch_job(&pool, &b).await.unwrap().unwrap();
    assert_eq!(b.status, JobStatus::Failed);
    assert!(b.error.unwrap().contains("not a valid extraction"));
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM payslips")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn slow_inference_times_out() {
    let pool = setup_pool().await;
    let previews = Arc::new(FakePreviews::with(USER, &["file-1"]));
    let inference = Arc::new(FakeInference {
        delay: Some(Duration::from_millis(200)),
        ..FakeInference::replying(vec![Ok(payload(extraction(0.95, 1.0)))])
    });
    let settings = WorkerSettings {
        inference_timeout: Duration::from_millis(20),
        ..Default::default()
    };
    let worker = Worker::new(pool.clone(), previews, inference, settings);
    let id = enqueue(&pool, "file-1").await;

    worker.run_job(&id).await.unwrap();
    let job = db::fetch_job(&pool, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("Inference request timed out"));
}

#[tokio::test]
async fn job_without_file_is_failed() {
    let pool = setup_pool().await;
    let worker = worker(
        &pool,
        Arc::new(FakePreviews::default()),
        Arc::new(FakeInference::default()),
    );
    let id = jobs::enqueue(
        &pool,
        &NewJob {
            user_id: USER.into(),
            file_id: None,
            kind: JobKind::Extract,
            meta: JobMeta::empty_for(JobKind::Extract),
        },
    )
    .await
    .unwrap();

    worker.run_job(&id).await.unwrap();
    let job = db::fetch_job(&pool, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("Job is missing file reference"));
}

#[tokio::test]
async fn unhandled_kinds_are_failed() {
    let pool = setup_pool().await;
    let worker = worker(
        &pool,
        Arc::new(FakePreviews::default()),
        Arc::new(FakeInference::default()),
    );
    let id = jobs::enqueue(
        &pool,
        &NewJob {
            user_id: USER.into(),
            file_id: None,
            kind: JobKind::Dossier,
            meta: JobMeta::default(),
        },
    )
    .await
    .unwrap();

    let outcome = worker.process_next_job().await.unwrap();
    assert!(matches!(outcome, JobOutcome::Failed { ref error, .. } if error == UNHANDLED_KIND_ERROR));
    let job = db::fetch_job(&pool, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test]
async fn reads_previews_from_disk() {
    let td = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(td.path().join(USER)).unwrap();
    std::fs::write(td.path().join(USER).join("file-1_preview.png"), b"disk png").unwrap();

    let pool = setup_pool().await;
    let inference = Arc::new(FakeInference::replying(vec![Ok(payload(extraction(0.95, 10.0)))]));
    let worker = Worker::new(
        pool.clone(),
        Arc::new(FsPreviewStore::new(td.path())),
        inference.clone(),
        WorkerSettings::default(),
    );
    let id = enqueue(&pool, "file-1").await;

    worker.run_job(&id).await.unwrap();
    assert_eq!(inference.calls.lock().unwrap()[0], b"disk png".to_vec());
}

fn slow_worker(pool: &db::Pool, step: Duration) -> Worker {
    let previews = Arc::new(FakePreviews {
        delay: Some(step),
        ..FakePreviews::with(USER, &["file-1"])
    });
    let inference = Arc::new(FakeInference {
        delay: Some(step),
        ..FakeInference::replying(vec![Ok(payload(extraction(0.95, 3000.0)))])
    });
    let settings = WorkerSettings {
        fetch_timeout: Duration::from_secs(2),
        inference_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    Worker::new(pool.clone(), previews, inference, settings)
}

#[tokio::test]
async fn live_extraction_survives_stale_sweep() {
    let pool = setup_pool().await;
    let worker = slow_worker(&pool, Duration::from_millis(150));
    let id = enqueue(&pool, "file-1").await;

    // Without a refresh after the fetch the job would be 250ms old here.
    let sweep = async {
        tokio::time::sleep(Duration::from_millis(250)).await;
        jobs::fail_stale_running(&pool, Duration::from_millis(180))
            .await
            .unwrap()
    };
    let (outcome, swept) = tokio::join!(worker.run_job(&id), sweep);

    assert!(swept.is_empty());
    assert!(matches!(outcome.unwrap(), JobOutcome::Done { .. }));
    let job = db::fetch_job(&pool, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
}

#[tokio::test]
async fn swept_job_discards_late_result() {
    let pool = setup_pool().await;
    let worker = slow_worker(&pool, Duration::from_millis(150));
    let id = enqueue(&pool, "file-1").await;

    let sweep = async {
        tokio::time::sleep(Duration::from_millis(250)).await;
        jobs::fail_stale_running(&pool, Duration::from_millis(30))
            .await
            .unwrap()
    };
    let (outcome, swept) = tokio::join!(worker.run_job(&id), sweep);

    assert_eq!(swept, vec![id.clone()]);
    assert_eq!(
        outcome.unwrap(),
        JobOutcome::Skipped {
            job_id: id.clone(),
            status: JobStatus::Failed
        }
    );
    let job = db::fetch_job(&pool, &id).await.unwrap().unwrap();
    assert_eq!(job.error.as_deref(), Some(jobs::STALE_JOB_ERROR));
    assert!(db::fetch_payslip_by_file(&pool, "file-1").await.unwrap().is_none());
}

fn month(pay_date: &str, net: f64, pension: f64) -> serde_json::Value {
    json!({
        "fields": {"gross": 3000, "net": net, "pension_employee": pension},
        "employer_name": "Acme",
        "pay_date": pay_date,
        "confidence": 0.95
    })
}

#[tokio::test]
async fn failed_detection_leaves_no_anomalies() {
    let pool = setup_pool().await;
    sqlx::query(
        "CREATE TRIGGER hold_detection BEFORE UPDATE OF status ON jobs \
         WHEN NEW.status = 'done' AND NEW.kind = 'detect_anomalies' \
         BEGIN SELECT RAISE(ABORT, 'detection held'); END",
    )
    .execute(&pool)
    .await
    .unwrap();

    let files = ["jan", "feb", "mar"];
    let previews = Arc::new(FakePreviews::with(USER, &files));
    let inference = Arc::new(FakeInference::replying(vec![
        Ok(payload(month("2024-01-31", 2200.0, 100.0))),
        Ok(payload(month("2024-02-29", 2200.0, 100.0))),
        Ok(payload(month("2024-03-31", 1900.0, 0.0))),
    ]));
    for file in files {
        enqueue(&pool, file).await;
    }
    let worker = worker(&pool, previews, inference);
    while worker.process_next_job().await.unwrap() != JobOutcome::Idle {}

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM anomalies")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
    let detections = jobs_of_kind(&pool, JobKind::DetectAnomalies).await;
    assert_eq!(detections.len(), 3);
    for job in detections {
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().starts_with("Failed to save results"));
    }
}
