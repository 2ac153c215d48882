use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use katze_common::evaluator::heuristic;
use katze_common::evaluator::{
    Evaluation, EvaluationError, Evaluator, EvaluatorAction, FallbackEvaluator,
    HeuristicEvaluator,
};
use katze_common::export::{
    DatasetExporter, DisabledExporter, ExportError, ExportRefresher, ExportSummary,
};
use katze_common::queue::{
    ApplicationRecord, ApplicationStatus, ApplicationStore, FALLBACK_FEEDBACK, FALLBACK_SCORE,
    InMemoryApplicationStore, QueueMaintenance, SYSTEM_ERROR_FLAG,
};
use katze_queue_worker::{
    ApplicationOutcome, CycleReport, QueueWorker, RunMode, WorkerError, WorkerSettings,
    WorkerState,
};
use serde_json::{Value, json};

const WORKER_ID: &str = "katze-queue-worker-test";

/// Answers according to the form's `script` key: `reject`, `error`, or anything else for
/// manual review.
#[derive(Default)]
struct ScriptedEvaluator {
    calls: AtomicUsize,
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn evaluate(&self, form_responses: &Value) -> Result<Evaluation, EvaluationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match form_responses.get("script").and_then(Value::as_str) {
            Some("reject") => Ok(Evaluation {
                action: EvaluatorAction::AutoReject,
                score: 10,
                short_reason: "No acepta esterilización".into(),
                flags: vec!["Rechaza Esterilización".into()],
            }),
            Some("error") => Err(EvaluationError::Upstream {
                status: 503,
                body: "model overloaded".into(),
            }),
            _ => Ok(Evaluation {
                action: EvaluatorAction::ManualReview,
                score: 82,
                short_reason: "Hogar adecuado y experiencia previa".into(),
                flags: vec!["Casa".into(), "Experiencia Previa".into()],
            }),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Simulates the recovery tool and a second worker taking the row over while the model
/// is still answering.
struct TakeoverEvaluator {
    store: Arc<InMemoryApplicationStore>,
}

#[async_trait]
impl Evaluator for TakeoverEvaluator {
    async fn evaluate(&self, _form_responses: &Value) -> Result<Evaluation, EvaluationError> {
        let later = Utc::now() + chrono::Duration::hours(1);
        self.store
            .release_expired_claims(later, chrono::Duration::minutes(5))
            .await
            .unwrap();
        self.store
            .claim_batch("katze-queue-worker-other", 5, later, chrono::Duration::minutes(5))
            .await
            .unwrap();
        Ok(Evaluation {
            action: EvaluatorAction::AutoReject,
            score: 5,
            short_reason: "late verdict".into(),
            flags: vec![],
        })
    }

    fn name(&self) -> &'static str {
        "takeover"
    }
}

#[derive(Default)]
struct CountingExporter {
    refreshes: AtomicUsize,
}

#[async_trait]
impl DatasetExporter for CountingExporter {
    async fn refresh(&self) -> Result<ExportSummary, ExportError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(ExportSummary { rows: 0, bytes: 0 })
    }
}

struct Harness {
    store: Arc<InMemoryApplicationStore>,
    evaluator: Arc<ScriptedEvaluator>,
    worker: QueueWorker,
    refresher: ExportRefresher,
}

fn settings(batch_size: usize) -> WorkerSettings {
    WorkerSettings {
        worker_id: WORKER_ID.to_string(),
        batch_size,
        claim_ttl: chrono::Duration::minutes(5),
    }
}

fn harness_with_exporter(batch_size: usize, exporter: Arc<dyn DatasetExporter>) -> Harness {
    let store = Arc::new(InMemoryApplicationStore::default());
    let evaluator = Arc::new(ScriptedEvaluator::default());
    let refresher = ExportRefresher::spawn(exporter);
    let worker = QueueWorker::new(
        store.clone(),
        evaluator.clone(),
        refresher.trigger(),
        settings(batch_size),
    );
    Harness {
        store,
        evaluator,
        worker,
        refresher,
    }
}

fn harness(batch_size: usize) -> Harness {
    harness_with_exporter(batch_size, Arc::new(DisabledExporter))
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
}

fn minutes(n: i64) -> DateTime<Utc> {
    base_time() + chrono::Duration::minutes(n)
}

fn status_of(store: &InMemoryApplicationStore, id: i64) -> ApplicationStatus {
    store.get(id).unwrap().status
}

fn processed_ids(report: &CycleReport) -> Vec<i64> {
    match report {
        CycleReport::Completed { outcomes } => outcomes.iter().map(|(id, _)| *id).collect(),
        other => panic!("expected a completed cycle, got {other:?}"),
    }
}

#[tokio::test]
async fn one_cycle_takes_the_oldest_rows_up_to_batch_size() {
    let h = harness(5);
    // Inserted out of creation order; ids are 1..=7.
    let ids: Vec<i64> = [6, 2, 0, 4, 1, 5, 3]
        .into_iter()
        .map(|minute| h.store.insert(json!({ "minute": minute }), minutes(minute)))
        .collect();

    let mut state = WorkerState::default();
    let report = h.worker.run_cycle(&mut state).await;

    assert_eq!(processed_ids(&report), vec![ids[2], ids[4], ids[1], ids[6], ids[3]]);
    assert_eq!(h.evaluator.calls.load(Ordering::SeqCst), 5);
    assert_eq!(state.evaluated, 5);

    for id in [ids[2], ids[4], ids[1], ids[6], ids[3]] {
        assert_eq!(status_of(&h.store, id), ApplicationStatus::ManualReview);
    }
    for id in [ids[0], ids[5]] {
        let untouched = h.store.get(id).unwrap();
        assert_eq!(untouched.status, ApplicationStatus::Processing);
        assert_eq!(untouched.ai_claimed_by, None);
        assert_eq!(untouched.ai_score, None);
    }
}

#[tokio::test]
async fn empty_queue_makes_no_writes_or_calls() {
    let exporter = Arc::new(CountingExporter::default());
    let Harness {
        store,
        evaluator,
        worker,
        refresher,
    } = harness_with_exporter(5, exporter.clone());

    let mut state = WorkerState::default();
    assert_eq!(worker.run_cycle(&mut state).await, CycleReport::Idle);
    assert_eq!(state.cycles, 1);
    assert_eq!(store.write_attempts(), 0);
    assert_eq!(evaluator.calls.load(Ordering::SeqCst), 0);

    drop(worker);
    let stats = refresher.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(stats.completed, 0);
    assert_eq!(exporter.refreshes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn verdicts_map_to_review_or_auto_rejection() {
    let h = harness(5);
    let review = h.store.insert(json!({ "script": "review" }), minutes(0));
    let reject = h.store.insert(json!({ "script": "reject" }), minutes(1));

    let mut state = WorkerState::default();
    h.worker.run_cycle(&mut state).await;

    let reviewed = h.store.get(review).unwrap();
    assert_eq!(reviewed.status, ApplicationStatus::ManualReview);
    assert_eq!(reviewed.ai_score, Some(82));
    assert_eq!(
        reviewed.ai_flags,
        Some(vec!["Casa".to_string(), "Experiencia Previa".to_string()])
    );
    assert_eq!(reviewed.ai_error, None);
    assert!(reviewed.ai_evaluated_at.is_some());

    let rejected = h.store.get(reject).unwrap();
    assert_eq!(rejected.status, ApplicationStatus::AutoRejected);
    assert_eq!(rejected.ai_score, Some(10));
    assert_eq!(rejected.ai_feedback.as_deref(), Some("No acepta esterilización"));
    assert_eq!(rejected.ai_claimed_by, None);
}

#[tokio::test]
async fn evaluator_error_writes_the_fixed_fallback() {
    let h = harness(5);
    let failing = h.store.insert(json!({ "script": "error" }), minutes(0));
    let healthy = h.store.insert(json!({}), minutes(1));

    let mut state = WorkerState::default();
    let report = h.worker.run_cycle(&mut state).await;

    assert_eq!(
        report,
        CycleReport::Completed {
            outcomes: vec![
                (failing, ApplicationOutcome::Fallback),
                (healthy, ApplicationOutcome::Evaluated(ApplicationStatus::ManualReview)),
            ]
        }
    );

    let record = h.store.get(failing).unwrap();
    assert_eq!(record.status, ApplicationStatus::ErrorFallback);
    assert_eq!(record.ai_score, Some(FALLBACK_SCORE));
    assert_eq!(record.ai_feedback.as_deref(), Some(FALLBACK_FEEDBACK));
    assert_eq!(record.ai_flags, Some(vec![SYSTEM_ERROR_FLAG.to_string()]));
    let error = record.ai_error.unwrap();
    assert!(error.contains("503"), "{error}");
    assert!(error.contains("model overloaded"), "{error}");

    assert_eq!(state.fallbacks, 1);
    assert_eq!(state.evaluated, 1);
}

#[tokio::test]
async fn failed_verdict_write_falls_back() {
    let h = harness(5);
    let id = h.store.insert(json!({ "script": "reject" }), minutes(0));
    h.store.fail_writes(id, 1);

    let mut state = WorkerState::default();
    let report = h.worker.run_cycle(&mut state).await;

    assert_eq!(processed_ids(&report), vec![id]);
    let record = h.store.get(id).unwrap();
    assert_eq!(record.status, ApplicationStatus::ErrorFallback);
    assert!(
        record
            .ai_error
            .as_deref()
            .unwrap()
            .contains("write rejected for application")
    );
    assert_eq!(h.store.write_attempts(), 2);
    assert_eq!(state.fallbacks, 1);
    assert_eq!(state.persist_failures, 0);
}

#[tokio::test]
async fn unwritable_row_stays_claimed_for_a_later_cycle() {
    let h = harness(5);
    let id = h.store.insert(json!({}), minutes(0));
    h.store.fail_writes(id, 2);

    let mut state = WorkerState::default();
    let report = h.worker.run_cycle(&mut state).await;

    assert_eq!(
        report,
        CycleReport::Completed {
            outcomes: vec![(id, ApplicationOutcome::PersistFailed)]
        }
    );
    let record = h.store.get(id).unwrap();
    assert_eq!(record.status, ApplicationStatus::Processing);
    assert_eq!(record.ai_claimed_by.as_deref(), Some(WORKER_ID));
    assert_eq!(state.persist_failures, 1);

    // The claim is still live, so an immediate second cycle leaves it alone.
    assert_eq!(h.worker.run_cycle(&mut state).await, CycleReport::Idle);
}

#[tokio::test]
async fn failed_fallback_write_is_not_retried_within_the_cycle() {
    let h = harness(5);
    let id = h.store.insert(json!({ "script": "error" }), minutes(0));
    h.store.fail_writes(id, 1);

    let mut state = WorkerState::default();
    h.worker.run_cycle(&mut state).await;

    assert_eq!(h.store.write_attempts(), 1);
    assert_eq!(state.persist_failures, 1);
    assert_eq!(status_of(&h.store, id), ApplicationStatus::Processing);
}

#[tokio::test]
async fn fetch_failure_only_skips_that_cycle() {
    let h = harness(5);
    let id = h.store.insert(json!({}), minutes(0));
    h.store.fail_next_claim("connection reset");

    let mut state = WorkerState::default();
    let first = h.worker.run_cycle(&mut state).await;
    assert!(matches!(first, CycleReport::FetchFailed(ref msg) if msg.contains("connection reset")));
    assert_eq!(h.evaluator.calls.load(Ordering::SeqCst), 0);
    assert_eq!(state.fetch_failures, 1);

    let second = h.worker.run_cycle(&mut state).await;
    assert_eq!(processed_ids(&second), vec![id]);
    assert_eq!(state.cycles, 2);
    assert_eq!(status_of(&h.store, id), ApplicationStatus::ManualReview);
}

#[tokio::test]
async fn live_claims_of_other_workers_are_skipped_and_stale_ones_taken_over() {
    let h = harness(5);

    let mut live = ApplicationRecord::new(10, json!({}), minutes(0));
    live.ai_claimed_by = Some("katze-queue-worker-other".into());
    live.ai_claimed_at = Some(Utc::now());
    h.store.insert_record(live);

    let mut stale = ApplicationRecord::new(11, json!({}), minutes(1));
    stale.ai_claimed_by = Some("katze-queue-worker-crashed".into());
    stale.ai_claimed_at = Some(Utc::now() - chrono::Duration::hours(1));
    h.store.insert_record(stale);

    let mut state = WorkerState::default();
    let report = h.worker.run_cycle(&mut state).await;

    assert_eq!(processed_ids(&report), vec![11]);
    let untouched = h.store.get(10).unwrap();
    assert_eq!(untouched.status, ApplicationStatus::Processing);
    assert_eq!(
        untouched.ai_claimed_by.as_deref(),
        Some("katze-queue-worker-other")
    );
    assert_eq!(status_of(&h.store, 11), ApplicationStatus::ManualReview);
}

#[tokio::test]
async fn once_mode_runs_exactly_one_batch() {
    let h = harness(5);
    for minute in 0..7 {
        h.store.insert(json!({}), minutes(minute));
    }

    let mut state = WorkerState::default();
    h.worker
        .drive(RunMode::Once, &mut state, std::future::pending())
        .await
        .unwrap();

    assert_eq!(state.cycles, 1);
    let remaining = h
        .store
        .records()
        .into_iter()
        .filter(|r| r.status == ApplicationStatus::Processing)
        .count();
    assert_eq!(remaining, 2);
}

#[tokio::test]
async fn once_mode_reports_a_failed_fetch() {
    let h = harness(5);
    h.store.fail_next_claim("database is starting up");

    let mut state = WorkerState::default();
    let err = h
        .worker
        .drive(RunMode::Once, &mut state, std::future::pending())
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::Fetch(ref msg) if msg.contains("starting up")));
}

#[tokio::test(start_paused = true)]
async fn loop_mode_ticks_until_shutdown() {
    let h = harness(5);
    for minute in 0..7 {
        h.store.insert(json!({}), minutes(minute));
    }

    let mut state = WorkerState::default();
    let shutdown = tokio::time::sleep(Duration::from_millis(35));
    h.worker
        .drive(
            RunMode::Loop {
                interval: Duration::from_millis(20),
            },
            &mut state,
            shutdown,
        )
        .await
        .unwrap();

    // Ticks at 0 ms and 20 ms; the shutdown at 35 ms wins over the 40 ms tick.
    assert_eq!(state.cycles, 2);
    assert_eq!(state.evaluated, 7);
    assert!(
        h.store
            .records()
            .iter()
            .all(|r| r.status == ApplicationStatus::ManualReview)
    );
}

#[tokio::test]
async fn pending_shutdown_wins_before_the_first_tick() {
    let h = harness(5);
    h.store.insert(json!({}), minutes(0));

    let mut state = WorkerState::default();
    h.worker
        .run_until(Duration::from_millis(10), &mut state, std::future::ready(()))
        .await;

    assert_eq!(state.cycles, 0);
    assert_eq!(h.evaluator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn processed_rows_request_a_dataset_refresh() {
    let exporter = Arc::new(CountingExporter::default());
    let Harness {
        store,
        worker,
        refresher,
        ..
    } = harness_with_exporter(5, exporter.clone());
    for minute in 0..3 {
        store.insert(json!({ "script": "error" }), minutes(minute));
    }

    let mut state = WorkerState::default();
    worker.run_cycle(&mut state).await;
    drop(worker);

    let stats = refresher.shutdown(Duration::from_secs(5)).await.unwrap();
    assert!((1..=3).contains(&stats.completed), "{stats:?}");
    assert_eq!(
        exporter.refreshes.load(Ordering::SeqCst) as u64,
        stats.completed
    );
}

#[tokio::test]
async fn write_after_takeover_is_superseded_not_failed() {
    let store = Arc::new(InMemoryApplicationStore::default());
    let refresher = ExportRefresher::spawn(Arc::new(DisabledExporter));
    let worker = QueueWorker::new(
        store.clone(),
        Arc::new(TakeoverEvaluator {
            store: store.clone(),
        }),
        refresher.trigger(),
        settings(5),
    );
    let id = store.insert(json!({}), minutes(0));

    let mut state = WorkerState::default();
    let report = worker.run_cycle(&mut state).await;

    assert_eq!(
        report,
        CycleReport::Completed {
            outcomes: vec![(id, ApplicationOutcome::Superseded)]
        }
    );
    assert_eq!(state.superseded, 1);
    assert_eq!(state.persist_failures, 0);
    assert_eq!(state.evaluated, 0);
    assert_eq!(state.fallbacks, 0);

    let record = store.get(id).unwrap();
    assert_eq!(record.status, ApplicationStatus::Processing);
    assert_eq!(record.ai_score, None);
    assert_eq!(
        record.ai_claimed_by.as_deref(),
        Some("katze-queue-worker-other")
    );
    // Zero rows matched, so no fallback write was attempted.
    assert_eq!(store.write_attempts(), 1);
}

#[tokio::test]
async fn model_outage_is_scored_by_the_heuristic() {
    let store = Arc::new(InMemoryApplicationStore::default());
    let refresher = ExportRefresher::spawn(Arc::new(DisabledExporter));
    let evaluator = FallbackEvaluator::new(
        Arc::new(ScriptedEvaluator::default()),
        Arc::new(HeuristicEvaluator),
    );
    let worker = QueueWorker::new(
        store.clone(),
        Arc::new(evaluator),
        refresher.trigger(),
        settings(5),
    );
    let form = json!({
        "script": "error",
        "acceptsSterilization": true,
        "hasSpace": true,
        "hasTime": true,
        "hasExperience": true,
    });
    let id = store.insert(form.clone(), minutes(0));

    let mut state = WorkerState::default();
    let report = worker.run_cycle(&mut state).await;

    assert_eq!(
        report,
        CycleReport::Completed {
            outcomes: vec![(id, ApplicationOutcome::Evaluated(ApplicationStatus::ManualReview))]
        }
    );
    let expected = heuristic::analyze(&form);
    let record = store.get(id).unwrap();
    assert_eq!(record.status, ApplicationStatus::ManualReview);
    assert_eq!(record.ai_score, Some(expected.score));
    assert_eq!(record.ai_flags, Some(expected.flags));
    assert_eq!(record.ai_error, None);
    assert_eq!(state.fallbacks, 0);
}
