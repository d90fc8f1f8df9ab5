mod common;

use std::sync::Arc;

use serde_json::json;

use payslip_pipeline::db::{self, NewJob};
use payslip_pipeline::jobs;
use payslip_pipeline::model::JobStatus;
use payslip_pipeline::review::{self, ReviewContext, ReviewError, ReviewFields};

use common::{payload, setup_pool, worker, FakeInference, FakePreviews, USER};

/// Queue and run one extraction that lands in `needs_review`.
async fn job_awaiting_review(pool: &db::Pool) -> String {
    let previews = Arc::new(FakePreviews::with(USER, &["file-1"]));
    let inference = Arc::new(FakeInference::replying(vec![Ok(payload(json!({
        "fields": {"gross": "3,100", "net": "2,400", "pension_employer": 90},
        "highlights": [{"x": 10, "y": 20, "w": 30, "h": 4, "label": "gross"}],
        "confidence": 0.85,
        "employer_name": "Acme",
        "notes": "Overtime unclear"
    })))]));
    let id = jobs::enqueue(pool, &NewJob::extract(USER, "file-1", None))
        .await
        .unwrap();
    worker(pool, previews, inference).run_job(&id).await.unwrap();
    id
}

#[tokio::test]
async fn confirm_overwrites_payslip_and_finishes_job() {
    let pool = setup_pool().await;
    let id = job_awaiting_review(&pool).await;

    let before = db::fetch_job(&pool, &id).await.unwrap().unwrap();
    let context = ReviewContext::from_job(&before, 0.9);
    assert!(context.review_required);
    assert!(!context.is_dismissible());
    assert_eq!(context.fields.gross, Some(3100.0));

    let fields = ReviewFields {
        gross: Some(3150.0),
        net: Some(2410.0),
        tax_income: Some(420.0),
        ni_prsi: None,
        pension_employee: Some(120.0),
    };
    review::confirm_review(&pool, &id, &fields).await.unwrap();

    let payslip = db::fetch_payslip_by_file(&pool, "file-1").await.unwrap().unwrap();
    assert_eq!(payslip.gross, Some(3150.0));
    assert_eq!(payslip.net, Some(2410.0));
    assert_eq!(payslip.tax_income, Some(420.0));
    assert_eq!(payslip.ni_prsi, None);
    assert_eq!(payslip.pension_employee, Some(120.0));
    assert!(!payslip.review_required);
    assert_eq!(payslip.confidence_overall, Some(0.85));

    let job = db::fetch_job(&pool, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
    let meta = job.meta.as_extract().unwrap();
    assert_eq!(meta.review_required, Some(false));
    assert_eq!(meta.confidence, Some(0.85));
    assert_eq!(meta.highlights.as_ref().unwrap().len(), 1);
    assert_eq!(meta.notes.as_deref(), Some("Overtime unclear"));
    let stored = meta.fields.as_ref().unwrap();
    assert_eq!(stored.gross, Some(3150.0));
    assert_eq!(stored.pension_employer, Some(90.0));
}

#[tokio::test]
async fn confirm_twice_is_rejected() {
    let pool = setup_pool().await;
    let id = job_awaiting_review(&pool).await;
    review::confirm_review(&pool, &id, &ReviewFields::default())
        .await
        .unwrap();

    let err = review::confirm_review(&pool, &id, &ReviewFields::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ReviewError::NotAwaitingReview(JobStatus::Done)));
}

#[tokio::test]
async fn invalid_fields_leave_state_untouched() {
    let pool = setup_pool().await;
    let id = job_awaiting_review(&pool).await;

    let fields = ReviewFields {
        gross: Some(f64::INFINITY),
        ..Default::default()
    };
    let err = review::confirm_review(&pool, &id, &fields).await.unwrap_err();
    assert!(matches!(err, ReviewError::InvalidField("gross")));

    let job = db::fetch_job(&pool, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::NeedsReview);
    let payslip = db::fetch_payslip_by_file(&pool, "file-1").await.unwrap().unwrap();
    assert_eq!(payslip.gross, Some(3100.0));
}

#[tokio::test]
async fn missing_payslip_is_a_precondition_error() {
    let pool = setup_pool().await;
    let id = jobs::enqueue(&pool, &NewJob::extract(USER, "orphan", None))
        .await
        .unwrap();
    jobs::claim(&pool, &id).await.unwrap();
    jobs::transition(&pool, &id, JobStatus::Running, JobStatus::NeedsReview, None, None)
        .await
        .unwrap();

    let err = review::confirm_review(&pool, &id, &ReviewFields::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ReviewError::PayslipMissing(ref f) if f == "orphan"));
    let job = db::fetch_job(&pool, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::NeedsReview);
}

#[tokio::test]
async fn reject_fails_the_job_with_reason() {
    let pool = setup_pool().await;
    let id = job_awaiting_review(&pool).await;

    review::reject_review(&pool, &id, "Not my payslip").await.unwrap();
    let job = db::fetch_job(&pool, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("Not my payslip"));

    let err = review::reject_review(&pool, &id, "again").await.unwrap_err();
    assert!(matches!(err, ReviewError::NotAwaitingReview(JobStatus::Failed)));
    assert!(matches!(
        review::reject_review(&pool, "missing", "x").await,
        Err(ReviewError::JobNotFound(_))
    ));
}
