//! End-to-end tests for the job controller against in-memory stores.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::sync::{Notify, watch};

use retype_engine::{
    CursorStrategy, FileStateStore, JobController, JobId, JobPhase, MemoryRecordStore, MemoryStateStore,
    MigrateError, MigrationJob, NoopReason, RecordId, RecordStore, RunEnd, StartRequest, StepOutcome,
    StoreError, ValidationError,
};

fn services_request(batch_size: i64) -> StartRequest {
    StartRequest {
        source_type: "ex_service".to_string(),
        destination_type: "service".to_string(),
        batch_size,
        ..StartRequest::default()
    }
}

fn controller(records: &Arc<MemoryRecordStore>) -> JobController {
    JobController::new(records.clone(), Arc::new(MemoryStateStore::new()))
}

#[tokio::test]
async fn test_four_hundred_fifty_records_in_batches_of_two_hundred() {
    let records = Arc::new(MemoryRecordStore::new());
    records.seed("ex_service", 1, 450).await;
    let controller = controller(&records);
    let id = JobId::default();

    let started = controller.start_job(&id, services_request(200)).await.unwrap();
    assert_eq!(started.job.total_count, 450);
    assert_eq!(started.job.processed_count, 0);
    assert_eq!(started.notice, None);

    for expected in [200, 400, 450] {
        match controller.step_job(&id).await.unwrap() {
            StepOutcome::Progress(report) => {
                assert_eq!(report.processed, expected);
                assert_eq!(report.total, 450);
                assert!(!report.done);
            }
            other => panic!("expected progress, got {other:?}"),
        }
    }
    assert_eq!(records.index_refreshes(), 0);

    match controller.step_job(&id).await.unwrap() {
        StepOutcome::Completed(report) => {
            assert!(report.done);
            assert_eq!(report.processed, 450);
            assert!(report.index_refreshed);
        }
        other => panic!("expected completion, got {other:?}"),
    }
    assert_eq!(records.index_refreshes(), 1);

    assert_eq!(
        controller.step_job(&id).await.unwrap(),
        StepOutcome::Noop(NoopReason::AlreadyDone)
    );
    assert_eq!(records.index_refreshes(), 1);
    assert_eq!(records.count_by_type("service").await.unwrap(), 450);
    assert_eq!(records.count_by_type("ex_service").await.unwrap(), 0);

    let job = controller.status(&id).await.unwrap();
    assert_eq!(job.phase(), JobPhase::Completed);
    assert_eq!(job.counters.reclassified, 450);
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn test_last_batch_ids_track_the_most_recent_step() {
    let records = Arc::new(MemoryRecordStore::new());
    records.seed("ex_service", 100, 15).await;
    let controller = controller(&records);
    let id = JobId::default();
    controller.start_job(&id, services_request(10)).await.unwrap();

    controller.step_job(&id).await.unwrap();
    controller.step_job(&id).await.unwrap();

    let job = controller.status(&id).await.unwrap();
    assert_eq!(job.last_batch_ids, (110..115).map(RecordId).collect::<Vec<_>>());
    assert_eq!(job.last_seen_id, Some(RecordId(114)));
}

#[tokio::test]
async fn test_reset_returns_to_defaults() {
    let records = Arc::new(MemoryRecordStore::new());
    records.seed("ex_service", 1, 30).await;
    let controller = controller(&records);
    let id = JobId::new("services");

    controller.start_job(&id, services_request(10)).await.unwrap();
    controller.step_job(&id).await.unwrap();
    controller.reset_job(&id).await.unwrap();

    assert_eq!(controller.status(&id).await.unwrap(), MigrationJob::empty(id.clone()));
    assert_eq!(
        controller.step_job(&id).await.unwrap(),
        StepOutcome::Noop(NoopReason::NoActiveJob)
    );
}

#[tokio::test]
async fn test_rejected_start_leaves_state_unchanged() {
    let records = Arc::new(MemoryRecordStore::new());
    records.seed("ex_service", 1, 30).await;
    let controller = controller(&records);
    let id = JobId::default();

    controller.start_job(&id, services_request(10)).await.unwrap();
    controller.step_job(&id).await.unwrap();
    let before = controller.status(&id).await.unwrap();

    let err = controller
        .start_job(&id, StartRequest {
            destination_type: "EX_SERVICE".to_string(),
            ..services_request(10)
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MigrateError::Validation(ValidationError::SameSourceAndDestination(_))
    ));
    assert_eq!(controller.status(&id).await.unwrap(), before);
}

#[tokio::test]
async fn test_start_replaces_previous_job() {
    let records = Arc::new(MemoryRecordStore::new());
    records.seed("ex_service", 1, 30).await;
    records.seed("legacy_page", 100, 5).await;
    let controller = controller(&records);
    let id = JobId::default();

    controller.start_job(&id, services_request(10)).await.unwrap();
    controller.step_job(&id).await.unwrap();

    let report = controller
        .start_job(&id, StartRequest {
            source_type: "legacy_page".to_string(),
            destination_type: "page".to_string(),
            ..StartRequest::default()
        })
        .await
        .unwrap();

    let job = controller.status(&id).await.unwrap();
    assert_eq!(job, report.job);
    assert_eq!(job.source_type, "legacy_page");
    assert_eq!(job.total_count, 5);
    assert_eq!(job.processed_count, 0);
    assert_eq!(job.last_seen_id, None);
    assert!(job.last_batch_ids.is_empty());
}

#[tokio::test]
async fn test_empty_source_type_completes_on_first_step() {
    let records = Arc::new(MemoryRecordStore::new());
    let controller = controller(&records);
    let id = JobId::default();

    let started = controller.start_job(&id, services_request(200)).await.unwrap();
    assert!(started.notice.is_some());
    assert!(!started.job.is_running());

    assert!(matches!(
        controller.step_job(&id).await.unwrap(),
        StepOutcome::Completed(_)
    ));
    assert_eq!(records.index_refreshes(), 1);
}

#[tokio::test]
async fn test_failed_fetch_does_not_advance_cursor() {
    let records = Arc::new(MemoryRecordStore::new());
    records.seed("ex_service", 1, 25).await;
    let controller = controller(&records);
    let id = JobId::default();
    controller.start_job(&id, services_request(10)).await.unwrap();
    controller.step_job(&id).await.unwrap();

    records.set_listing_unavailable(true);
    let err = controller.step_job(&id).await.unwrap_err();
    assert!(matches!(err, MigrateError::Store(StoreError::Unavailable(_))));
    assert_eq!(controller.status(&id).await.unwrap().processed_count, 10);

    records.set_listing_unavailable(false);
    match controller.step_job(&id).await.unwrap() {
        StepOutcome::Progress(report) => assert_eq!(report.processed, 20),
        other => panic!("expected progress, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reclassify_failures_are_counted_and_do_not_stall() {
    let records = Arc::new(MemoryRecordStore::new());
    records.seed("ex_service", 1, 20).await;
    records.fail_reclassify(RecordId(3)).await;
    records.fail_reclassify(RecordId(15)).await;
    let controller = controller(&records);
    let id = JobId::default();
    controller.start_job(&id, services_request(10)).await.unwrap();

    let first = match controller.step_job(&id).await.unwrap() {
        StepOutcome::Progress(report) => report,
        other => panic!("expected progress, got {other:?}"),
    };
    assert_eq!(first.counters.reclassified, 9);
    assert_eq!(first.counters.reclassify_failures, 1);
    assert_eq!(first.errors.len(), 1);
    assert_eq!(first.errors[0].record, RecordId(3));

    controller.step_job(&id).await.unwrap();
    assert!(matches!(
        controller.step_job(&id).await.unwrap(),
        StepOutcome::Completed(_)
    ));

    let job = controller.status(&id).await.unwrap();
    assert_eq!(job.processed_count, 20);
    assert_eq!(job.counters.reclassify_failures, 2);
    assert_eq!(records.count_by_type("ex_service").await.unwrap(), 2);
}

#[tokio::test]
async fn test_unregistered_destination_fails_every_record() {
    let records = Arc::new(MemoryRecordStore::new());
    records.seed("ex_service", 1, 12).await;
    records.register_types(["page", "post"]).await;
    let controller = controller(&records);
    let id = JobId::default();
    controller.start_job(&id, services_request(10)).await.unwrap();

    let summary = controller
        .run_until_done(&id, Duration::ZERO, watch::channel(false).1, |_| {})
        .await
        .unwrap();

    assert_eq!(summary.end, RunEnd::Completed);
    assert_eq!(summary.job.counters.reclassify_failures, 12);
    assert_eq!(summary.job.counters.reclassified, 0);
}

#[tokio::test]
async fn test_attributes_only_with_offset_cursor() {
    let records = Arc::new(MemoryRecordStore::new());
    records.seed("product", 1, 35).await;
    for id in 1..=35 {
        records
            .add_attribute_value(RecordId(id), "old_price", &id.to_string())
            .await
            .unwrap();
    }
    let controller = controller(&records);
    let id = JobId::new("prices");

    controller
        .start_job(&id, StartRequest {
            source_type: "product".to_string(),
            meta_only: true,
            rename_rules: "old_price => price".to_string(),
            delete_old: true,
            cursor: CursorStrategy::Offset,
            batch_size: 10,
            ..StartRequest::default()
        })
        .await
        .unwrap();

    let summary = controller
        .run_until_done(&id, Duration::ZERO, watch::channel(false).1, |_| {})
        .await
        .unwrap();

    assert_eq!(summary.end, RunEnd::Completed);
    assert_eq!(summary.steps, 5);
    assert_eq!(summary.job.processed_count, 35);
    assert_eq!(records.count_by_type("product").await.unwrap(), 35);
    for id in 1..=35u64 {
        assert_eq!(
            records.get_attribute_values(RecordId(id), "price").await.unwrap(),
            vec![id.to_string()]
        );
        assert!(!records.attribute_exists(RecordId(id), "old_price").await.unwrap());
    }
}

#[tokio::test]
async fn test_records_added_after_start_are_still_migrated() {
    let records = Arc::new(MemoryRecordStore::new());
    records.seed("ex_service", 1, 20).await;
    let controller = controller(&records);
    let id = JobId::default();
    controller.start_job(&id, services_request(10)).await.unwrap();

    controller.step_job(&id).await.unwrap();
    records.seed("ex_service", 100, 5).await;
    let summary = controller
        .run_until_done(&id, Duration::ZERO, watch::channel(false).1, |_| {})
        .await
        .unwrap();

    assert_eq!(summary.job.total_count, 20);
    assert_eq!(summary.job.processed_count, 25);
    assert!(summary.job.percent_complete().unwrap() > 100.0);
    assert_eq!(records.count_by_type("ex_service").await.unwrap(), 0);
}

#[tokio::test]
async fn test_run_until_done_reports_each_step() {
    let records = Arc::new(MemoryRecordStore::new());
    records.seed("ex_service", 1, 45).await;
    let controller = controller(&records);
    let id = JobId::default();
    controller.start_job(&id, services_request(20)).await.unwrap();

    let mut seen = Vec::new();
    let summary = controller
        .run_until_done(&id, Duration::from_millis(1), watch::channel(false).1, |report| {
            seen.push((report.processed, report.done))
        })
        .await
        .unwrap();

    assert_eq!(summary.end, RunEnd::Completed);
    assert_eq!(summary.steps, 4);
    assert_eq!(seen, vec![(20, false), (40, false), (45, false), (45, true)]);

    let again = controller
        .run_until_done(&id, Duration::ZERO, watch::channel(false).1, |_| {})
        .await
        .unwrap();
    assert_eq!(again.end, RunEnd::AlreadyDone);
    assert_eq!(again.steps, 0);
}

#[tokio::test]
async fn test_run_until_done_stops_on_shutdown() {
    let records = Arc::new(MemoryRecordStore::new());
    records.seed("ex_service", 1, 45).await;
    let controller = controller(&records);
    let id = JobId::default();
    controller.start_job(&id, services_request(10)).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let summary = controller
        .run_until_done(&id, Duration::from_secs(3600), shutdown_rx, |_| {
            let _ = shutdown_tx.send(true);
        })
        .await
        .unwrap();

    assert_eq!(summary.end, RunEnd::Interrupted);
    assert_eq!(summary.steps, 1);
    assert_eq!(summary.job.processed_count, 10);
    assert!(!summary.job.done);
}

#[tokio::test]
async fn test_run_without_job() {
    let records = Arc::new(MemoryRecordStore::new());
    let controller = controller(&records);

    let summary = controller
        .run_until_done(&JobId::default(), Duration::ZERO, watch::channel(false).1, |_| {})
        .await
        .unwrap();
    assert_eq!(summary.end, RunEnd::NoActiveJob);
}

#[tokio::test]
async fn test_jobs_are_independent_per_id() {
    let records = Arc::new(MemoryRecordStore::new());
    records.seed("ex_service", 1, 10).await;
    records.seed("legacy_page", 100, 10).await;
    let controller = controller(&records);
    let services = JobId::new("services");
    let pages = JobId::new("pages");

    controller.start_job(&services, services_request(10)).await.unwrap();
    controller
        .start_job(&pages, StartRequest {
            source_type: "legacy_page".to_string(),
            destination_type: "page".to_string(),
            batch_size: 10,
            ..StartRequest::default()
        })
        .await
        .unwrap();

    controller.step_job(&services).await.unwrap();
    controller.reset_job(&pages).await.unwrap();

    assert_eq!(controller.status(&services).await.unwrap().processed_count, 10);
    assert!(!controller.status(&pages).await.unwrap().exists());
}

#[tokio::test]
async fn test_progress_survives_a_new_controller() {
    let dir = tempfile::tempdir().unwrap();
    let records = Arc::new(MemoryRecordStore::new());
    records.seed("ex_service", 1, 25).await;
    let id = JobId::default();

    {
        let first = JobController::new(records.clone(), Arc::new(FileStateStore::new(dir.path())));
        first.start_job(&id, services_request(10)).await.unwrap();
        first.step_job(&id).await.unwrap();
    }

    let second = JobController::new(records.clone(), Arc::new(FileStateStore::new(dir.path())));
    assert_eq!(second.status(&id).await.unwrap().processed_count, 10);
    let summary = second
        .run_until_done(&id, Duration::ZERO, watch::channel(false).1, |_| {})
        .await
        .unwrap();

    assert_eq!(summary.job.processed_count, 25);
    assert_eq!(records.count_by_type("service").await.unwrap(), 25);
    assert_eq!(records.index_refreshes(), 1);
}

/// Record store that parks the first listing call until released.
struct GatedStore {
    inner: MemoryRecordStore,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl RecordStore for GatedStore {
    async fn count_by_type(&self, record_type: &str) -> Result<u64, StoreError> {
        self.inner.count_by_type(record_type).await
    }

    async fn list_ids_by_type(
        &self,
        record_type: &str,
        limit: usize,
        offset: u64,
    ) -> Result<Vec<RecordId>, StoreError> {
        self.inner.list_ids_by_type(record_type, limit, offset).await
    }

    async fn list_ids_after(
        &self,
        record_type: &str,
        limit: usize,
        after: Option<RecordId>,
    ) -> Result<Vec<RecordId>, StoreError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.list_ids_after(record_type, limit, after).await
    }

    async fn reclassify(&self, id: RecordId, new_type: &str) -> Result<(), StoreError> {
        self.inner.reclassify(id, new_type).await
    }

    async fn get_attribute_values(&self, id: RecordId, key: &str) -> Result<Vec<String>, StoreError> {
        self.inner.get_attribute_values(id, key).await
    }

    async fn add_attribute_value(&self, id: RecordId, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.add_attribute_value(id, key, value).await
    }

    async fn delete_attribute_values(&self, id: RecordId, key: &str) -> Result<(), StoreError> {
        self.inner.delete_attribute_values(id, key).await
    }

    async fn attribute_exists(&self, id: RecordId, key: &str) -> Result<bool, StoreError> {
        self.inner.attribute_exists(id, key).await
    }

    async fn refresh_serving_index(&self) -> Result<(), StoreError> {
        self.inner.refresh_serving_index().await
    }
}

#[tokio::test]
async fn test_concurrent_step_is_rejected_while_one_is_in_flight() {
    let inner = MemoryRecordStore::new();
    inner.seed("ex_service", 1, 30).await;
    let records = Arc::new(GatedStore {
        inner,
        entered: Notify::new(),
        release: Notify::new(),
    });
    let controller = Arc::new(JobController::new(records.clone(), Arc::new(MemoryStateStore::new())));
    let id = JobId::default();
    controller.start_job(&id, services_request(10)).await.unwrap();

    let in_flight = {
        let controller = Arc::clone(&controller);
        let id = id.clone();
        tokio::spawn(async move { controller.step_job(&id).await })
    };
    records.entered.notified().await;

    assert_eq!(
        controller.step_job(&id).await.unwrap(),
        StepOutcome::Noop(NoopReason::InFlight)
    );

    records.release.notify_one();
    let first = in_flight.await.unwrap().unwrap();
    assert!(matches!(first, StepOutcome::Progress(ref r) if r.processed == 10));
    assert_eq!(controller.status(&id).await.unwrap().processed_count, 10);
    assert_eq!(records.inner.count_by_type("ex_service").await.unwrap(), 20);
}
