use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::db::QueueStorageError;
use crate::evaluator::Evaluation;
use crate::export::{ApplicationExportRow, DatasetSource};

pub const FALLBACK_SCORE: i32 = 50;
pub const FALLBACK_FEEDBACK: &str = "Error en evaluación automática. Requiere revisión manual.";
pub const SYSTEM_ERROR_FLAG: &str = "Error de Sistema";

/// Lifecycle of an adoption application. Persisted values match the existing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ApplicationStatus {
    Pending,
    Processing,
    ManualReview,
    AutoRejected,
    ErrorFallback,
    Approved,
    Rejected,
}

impl ApplicationStatus {
    pub const ALL: [ApplicationStatus; 7] = [
        ApplicationStatus::Pending,
        ApplicationStatus::Processing,
        ApplicationStatus::ManualReview,
        ApplicationStatus::AutoRejected,
        ApplicationStatus::ErrorFallback,
        ApplicationStatus::Approved,
        ApplicationStatus::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Pending => "pendiente",
            ApplicationStatus::Processing => "procesando",
            ApplicationStatus::ManualReview => "revision_pendiente",
            ApplicationStatus::AutoRejected => "rechazada_automaticamente",
            ApplicationStatus::ErrorFallback => "pending_review",
            ApplicationStatus::Approved => "aprobada",
            ApplicationStatus::Rejected => "rechazada",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == raw)
    }
}

/// A row the worker owns until it writes an outcome or the claim expires.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedApplication {
    pub id: i64,
    pub form_responses: Value,
    pub created_at: DateTime<Utc>,
    pub claimed_by: String,
    pub claimed_at: DateTime<Utc>,
}

/// Column values written back after evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationUpdate {
    pub status: ApplicationStatus,
    pub ai_score: i32,
    pub ai_feedback: String,
    pub ai_flags: Vec<String>,
    pub ai_evaluated_at: DateTime<Utc>,
    pub ai_error: Option<String>,
}

impl EvaluationUpdate {
    pub fn from_evaluation(evaluation: &Evaluation, evaluated_at: DateTime<Utc>) -> Self {
        let status = if evaluation.action.is_rejection() {
            ApplicationStatus::AutoRejected
        } else {
            ApplicationStatus::ManualReview
        };

        Self {
            status,
            ai_score: evaluation.score,
            ai_feedback: evaluation.short_reason.clone(),
            ai_flags: evaluation.flags.clone(),
            ai_evaluated_at: evaluated_at,
            ai_error: None,
        }
    }

    pub fn fallback(error: impl Into<String>, evaluated_at: DateTime<Utc>) -> Self {
        Self {
            status: ApplicationStatus::ErrorFallback,
            ai_score: FALLBACK_SCORE,
            ai_feedback: FALLBACK_FEEDBACK.to_string(),
            ai_flags: vec![SYSTEM_ERROR_FLAG.to_string()],
            ai_evaluated_at: evaluated_at,
            ai_error: Some(error.into()),
        }
    }
}

/// Full application row as the worker sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationRecord {
    pub id: i64,
    pub form_responses: Value,
    pub status: ApplicationStatus,
    pub created_at: DateTime<Utc>,
    pub ai_score: Option<i32>,
    pub ai_feedback: Option<String>,
    pub ai_flags: Option<Vec<String>>,
    pub ai_evaluated_at: Option<DateTime<Utc>>,
    pub ai_error: Option<String>,
    pub ai_claimed_by: Option<String>,
    pub ai_claimed_at: Option<DateTime<Utc>>,
}

impl ApplicationRecord {
    pub fn new(id: i64, form_responses: Value, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            form_responses,
            status: ApplicationStatus::Processing,
            created_at,
            ai_score: None,
            ai_feedback: None,
            ai_flags: None,
            ai_evaluated_at: None,
            ai_error: None,
            ai_claimed_by: None,
            ai_claimed_at: None,
        }
    }

    fn claimable(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == ApplicationStatus::Processing
            && self.ai_claimed_at.map(|at| at <= cutoff).unwrap_or(true)
    }

    fn apply(&mut self, update: &EvaluationUpdate) {
        self.status = update.status;
        self.ai_score = Some(update.ai_score);
        self.ai_feedback = Some(update.ai_feedback.clone());
        self.ai_flags = Some(update.ai_flags.clone());
        self.ai_evaluated_at = Some(update.ai_evaluated_at);
        self.ai_error = update.ai_error.clone();
        self.ai_claimed_by = None;
        self.ai_claimed_at = None;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub status_counts: BTreeMap<String, i64>,
    pub error_count: i64,
    pub claimed_count: i64,
    pub stale_claim_count: i64,
}

/// Storage the worker needs: claim a batch, write an outcome.
#[async_trait]
pub trait ApplicationStore: Send + Sync {
    /// Claim up to `limit` processing rows, oldest first. Rows with a claim younger than
    /// `claim_ttl` are skipped.
    async fn claim_batch(
        &self,
        worker_id: &str,
        limit: usize,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> Result<Vec<ClaimedApplication>, QueueStorageError>;

    /// Write the outcome if the row is still processing and still claimed by this worker.
    /// Returns the number of rows updated (0 or 1).
    async fn record_outcome(
        &self,
        claim: &ClaimedApplication,
        update: &EvaluationUpdate,
    ) -> Result<u64, QueueStorageError>;
}

/// Operator-side maintenance used by the recovery tool.
#[async_trait]
pub trait QueueMaintenance: Send + Sync {
    async fn release_expired_claims(
        &self,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> Result<u64, QueueStorageError>;

    async fn promote_unevaluated_pending(&self) -> Result<u64, QueueStorageError>;

    async fn queue_summary(
        &self,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> Result<QueueSummary, QueueStorageError>;
}

#[derive(Default)]
struct InMemoryState {
    records: Vec<ApplicationRecord>,
    next_id: i64,
    claim_failures: Vec<String>,
    write_failures: HashMap<i64, u32>,
    write_attempts: u64,
}

/// In-process store with the same claim semantics as the Postgres one.
#[derive(Default)]
pub struct InMemoryApplicationStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryApplicationStore {
    fn lock(&self) -> MutexGuard<'_, InMemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a row in `procesando` and return its id.
    pub fn insert(&self, form_responses: Value, created_at: DateTime<Utc>) -> i64 {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state
            .records
            .push(ApplicationRecord::new(id, form_responses, created_at));
        id
    }

    pub fn insert_record(&self, record: ApplicationRecord) {
        let mut state = self.lock();
        state.next_id = state.next_id.max(record.id);
        state.records.push(record);
    }

    pub fn get(&self, id: i64) -> Option<ApplicationRecord> {
        self.lock().records.iter().find(|r| r.id == id).cloned()
    }

    pub fn records(&self) -> Vec<ApplicationRecord> {
        self.lock().records.clone()
    }

    /// Number of `record_outcome` calls seen, successful or not.
    pub fn write_attempts(&self) -> u64 {
        self.lock().write_attempts
    }

    /// Make the next `claim_batch` call fail with `message`.
    pub fn fail_next_claim(&self, message: impl Into<String>) {
        self.lock().claim_failures.push(message.into());
    }

    /// Make the next `times` writes for `id` fail.
    pub fn fail_writes(&self, id: i64, times: u32) {
        self.lock().write_failures.insert(id, times);
    }
}

#[async_trait]
impl ApplicationStore for InMemoryApplicationStore {
    async fn claim_batch(
        &self,
        worker_id: &str,
        limit: usize,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> Result<Vec<ClaimedApplication>, QueueStorageError> {
        let mut state = self.lock();
        if !state.claim_failures.is_empty() {
            let message = state.claim_failures.remove(0);
            return Err(QueueStorageError::Unavailable(message));
        }

        let cutoff = now - claim_ttl;
        let mut candidates: Vec<usize> = state
            .records
            .iter()
            .enumerate()
            .filter(|(_, record)| record.claimable(cutoff))
            .map(|(idx, _)| idx)
            .collect();
        candidates.sort_by_key(|idx| (state.records[*idx].created_at, state.records[*idx].id));
        candidates.truncate(limit);

        let claimed = candidates
            .into_iter()
            .map(|idx| {
                let record = &mut state.records[idx];
                record.ai_claimed_by = Some(worker_id.to_string());
                record.ai_claimed_at = Some(now);
                ClaimedApplication {
                    id: record.id,
                    form_responses: record.form_responses.clone(),
                    created_at: record.created_at,
                    claimed_by: worker_id.to_string(),
                    claimed_at: now,
                }
            })
            .collect();

        Ok(claimed)
    }

    async fn record_outcome(
        &self,
        claim: &ClaimedApplication,
        update: &EvaluationUpdate,
    ) -> Result<u64, QueueStorageError> {
        let mut state = self.lock();
        state.write_attempts += 1;

        if let Some(remaining) = state.write_failures.get_mut(&claim.id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(QueueStorageError::Unavailable(format!(
                    "write rejected for application {}",
                    claim.id
                )));
            }
        }

        let Some(record) = state.records.iter_mut().find(|record| {
            record.id == claim.id
                && record.status == ApplicationStatus::Processing
                && record.ai_claimed_by.as_deref() == Some(claim.claimed_by.as_str())
        }) else {
            return Ok(0);
        };

        record.apply(update);
        Ok(1)
    }
}

#[async_trait]
impl QueueMaintenance for InMemoryApplicationStore {
    async fn release_expired_claims(
        &self,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> Result<u64, QueueStorageError> {
        let cutoff = now - claim_ttl;
        let mut state = self.lock();
        let mut released = 0;
        for record in state.records.iter_mut() {
            let expired = record.ai_claimed_at.map(|at| at <= cutoff).unwrap_or(false);
            if record.status == ApplicationStatus::Processing && expired {
                record.ai_claimed_by = None;
                record.ai_claimed_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn promote_unevaluated_pending(&self) -> Result<u64, QueueStorageError> {
        let mut state = self.lock();
        let mut promoted = 0;
        for record in state.records.iter_mut() {
            if record.status == ApplicationStatus::Pending && record.ai_score.is_none() {
                record.status = ApplicationStatus::Processing;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn queue_summary(
        &self,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> Result<QueueSummary, QueueStorageError> {
        let cutoff = now - claim_ttl;
        let state = self.lock();
        let mut summary = QueueSummary::default();
        for record in state.records.iter() {
            *summary
                .status_counts
                .entry(record.status.as_str().to_string())
                .or_default() += 1;
            if record.ai_error.is_some() {
                summary.error_count += 1;
            }
            if let Some(claimed_at) = record.ai_claimed_at {
                summary.claimed_count += 1;
                if claimed_at <= cutoff {
                    summary.stale_claim_count += 1;
                }
            }
        }
        Ok(summary)
    }
}

#[async_trait]
impl DatasetSource for InMemoryApplicationStore {
    async fn application_rows(&self) -> Result<Vec<ApplicationExportRow>, QueueStorageError> {
        let mut records = self.records();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(records
            .into_iter()
            .map(ApplicationExportRow::from_record)
            .collect())
    }
}
