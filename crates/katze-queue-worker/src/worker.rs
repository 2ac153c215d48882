//! The evaluation cycle: claim a batch, evaluate each application, persist the verdict.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use katze_common::evaluator::Evaluator;
use katze_common::export::{ExportTrigger, RefreshRequest};
use katze_common::queue::{ApplicationStatus, ApplicationStore, ClaimedApplication, EvaluationUpdate};
use katze_metrics::{WORKER_APPLICATIONS_TOTAL, WORKER_CYCLES_TOTAL, WORKER_FETCH_ERRORS_TOTAL};
use metrics::counter;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::error::WorkerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub worker_id: String,
    pub batch_size: usize,
    pub claim_ttl: chrono::Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Once,
    Loop { interval: Duration },
}

/// Running totals for one worker process. Owned by the driver and lent to each cycle, so
/// only one batch can be in flight at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerState {
    pub cycles: u64,
    pub evaluated: u64,
    pub fallbacks: u64,
    pub superseded: u64,
    pub persist_failures: u64,
    pub fetch_failures: u64,
}

impl WorkerState {
    fn record(&mut self, outcome: ApplicationOutcome) {
        match outcome {
            ApplicationOutcome::Evaluated(_) => self.evaluated += 1,
            ApplicationOutcome::Fallback => self.fallbacks += 1,
            ApplicationOutcome::Superseded => self.superseded += 1,
            ApplicationOutcome::PersistFailed => self.persist_failures += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationOutcome {
    /// The evaluator's verdict was written with this status.
    Evaluated(ApplicationStatus),
    /// The fallback status was written.
    Fallback,
    /// The row left `procesando` or changed owner before the write.
    Superseded,
    /// Nothing could be written; the claim lease will hand the row to a later cycle.
    PersistFailed,
}

impl ApplicationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ApplicationOutcome::Evaluated(ApplicationStatus::AutoRejected) => "auto_rejected",
            ApplicationOutcome::Evaluated(_) => "manual_review",
            ApplicationOutcome::Fallback => "fallback",
            ApplicationOutcome::Superseded => "superseded",
            ApplicationOutcome::PersistFailed => "persist_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleReport {
    Idle,
    Completed { outcomes: Vec<(i64, ApplicationOutcome)> },
    FetchFailed(String),
}

pub struct QueueWorker {
    store: Arc<dyn ApplicationStore>,
    evaluator: Arc<dyn Evaluator>,
    export: ExportTrigger,
    settings: WorkerSettings,
}

impl QueueWorker {
    pub fn new(
        store: Arc<dyn ApplicationStore>,
        evaluator: Arc<dyn Evaluator>,
        export: ExportTrigger,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            evaluator,
            export,
            settings,
        }
    }

    /// Run one batch. Never fails: fetch errors are reported, per-application errors become
    /// the fallback status.
    #[instrument(skip_all, fields(worker_id = %self.settings.worker_id, cycle = state.cycles + 1))]
    pub async fn run_cycle(&self, state: &mut WorkerState) -> CycleReport {
        state.cycles += 1;
        counter!(WORKER_CYCLES_TOTAL).increment(1);

        let batch = match self
            .store
            .claim_batch(
                &self.settings.worker_id,
                self.settings.batch_size,
                Utc::now(),
                self.settings.claim_ttl,
            )
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                state.fetch_failures += 1;
                counter!(WORKER_FETCH_ERRORS_TOTAL).increment(1);
                error!(error = %err, "failed to claim application batch; skipping cycle");
                return CycleReport::FetchFailed(err.to_string());
            }
        };

        if batch.is_empty() {
            info!("no applications awaiting evaluation");
            return CycleReport::Idle;
        }

        info!(count = batch.len(), "claimed applications for evaluation");

        let mut outcomes = Vec::with_capacity(batch.len());
        for claim in &batch {
            let outcome = self.process(claim).await;
            state.record(outcome);
            counter!(WORKER_APPLICATIONS_TOTAL, "outcome" => outcome.label()).increment(1);
            outcomes.push((claim.id, outcome));
            self.request_export(claim.id);
        }

        info!(
            processed = outcomes.len(),
            evaluated_total = state.evaluated,
            fallbacks_total = state.fallbacks,
            persist_failures_total = state.persist_failures,
            "batch finished"
        );
        CycleReport::Completed { outcomes }
    }

    async fn process(&self, claim: &ClaimedApplication) -> ApplicationOutcome {
        let update = match self.evaluator.evaluate(&claim.form_responses).await {
            Ok(evaluation) => {
                info!(
                    application_id = claim.id,
                    action = evaluation.action.as_str(),
                    score = evaluation.score,
                    "evaluation received"
                );
                EvaluationUpdate::from_evaluation(&evaluation, Utc::now())
            }
            Err(err) => {
                warn!(
                    application_id = claim.id,
                    evaluator = self.evaluator.name(),
                    error = %err,
                    "evaluation failed; writing fallback"
                );
                EvaluationUpdate::fallback(err.to_string(), Utc::now())
            }
        };

        match self.store.record_outcome(claim, &update).await {
            Ok(rows) => self.written(claim, &update, rows),
            Err(err) if update.status != ApplicationStatus::ErrorFallback => {
                warn!(
                    application_id = claim.id,
                    error = %err,
                    "failed to persist evaluation; writing fallback"
                );
                let fallback = EvaluationUpdate::fallback(err.to_string(), Utc::now());
                match self.store.record_outcome(claim, &fallback).await {
                    Ok(rows) => self.written(claim, &fallback, rows),
                    Err(err) => self.persist_failed(claim, &err),
                }
            }
            Err(err) => self.persist_failed(claim, &err),
        }
    }

    fn written(
        &self,
        claim: &ClaimedApplication,
        update: &EvaluationUpdate,
        rows: u64,
    ) -> ApplicationOutcome {
        if rows == 0 {
            warn!(
                application_id = claim.id,
                "application changed while it was being evaluated; result discarded (superseded)"
            );
            return ApplicationOutcome::Superseded;
        }

        info!(
            application_id = claim.id,
            status = update.status.as_str(),
            score = update.ai_score,
            "application updated"
        );
        if update.status == ApplicationStatus::ErrorFallback {
            ApplicationOutcome::Fallback
        } else {
            ApplicationOutcome::Evaluated(update.status)
        }
    }

    fn persist_failed(
        &self,
        claim: &ClaimedApplication,
        err: &dyn std::error::Error,
    ) -> ApplicationOutcome {
        error!(
            application_id = claim.id,
            error = %err,
            "could not persist any outcome; row stays claimed until the lease expires"
        );
        ApplicationOutcome::PersistFailed
    }

    fn request_export(&self, application_id: i64) {
        match self.export.request() {
            RefreshRequest::Queued => debug!(application_id, "dataset refresh queued"),
            RefreshRequest::Coalesced => {
                debug!(application_id, "dataset refresh already pending")
            }
            RefreshRequest::Closed => {
                warn!(application_id, "dataset refresh queue closed; skipping refresh")
            }
        }
    }

    /// Tick every `interval` until `shutdown` resolves. The first cycle starts immediately,
    /// ticks missed while a cycle runs are skipped, and a cycle in progress is allowed to finish.
    pub async fn run_until<F>(&self, interval: Duration, state: &mut WorkerState, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(cycles = state.cycles, "shutdown requested; stopping worker loop");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_cycle(state).await;
                }
            }
        }
    }

    /// Once mode fails when its only batch could not be claimed.
    pub async fn drive<F>(
        &self,
        mode: RunMode,
        state: &mut WorkerState,
        shutdown: F,
    ) -> Result<(), WorkerError>
    where
        F: Future<Output = ()>,
    {
        match mode {
            RunMode::Once => match self.run_cycle(state).await {
                CycleReport::FetchFailed(message) => Err(WorkerError::Fetch(message)),
                CycleReport::Idle | CycleReport::Completed { .. } => Ok(()),
            },
            RunMode::Loop { interval } => {
                self.run_until(interval, state, shutdown).await;
                Ok(())
            }
        }
    }
}
