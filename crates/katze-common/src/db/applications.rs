use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio_postgres::Row;
use tracing::instrument;

use crate::db::util::{timed_execute, timed_query, timed_query_one};
use crate::db::{PgPool, QueueStorageError};
use crate::export::{ApplicationExportRow, DatasetSource};
use crate::queue::{
    ApplicationStore, ClaimedApplication, EvaluationUpdate, QueueMaintenance, QueueSummary,
};

// Column types vary between deployments of the application table, so values are cast on
// both sides of the wire.
const CLAIM_BATCH_SQL: &str = "UPDATE adoption_applications
SET
    ai_claimed_by = $1,
    ai_claimed_at = $2::TIMESTAMPTZ
WHERE id IN (
    SELECT id
    FROM adoption_applications
    WHERE status = 'procesando'
      AND (ai_claimed_at IS NULL OR ai_claimed_at <= $3::TIMESTAMPTZ)
    ORDER BY created_at, id
    LIMIT $4
    FOR UPDATE SKIP LOCKED
)
RETURNING
    id::BIGINT AS id,
    COALESCE(form_responses::jsonb, '{}'::jsonb) AS form_responses,
    created_at::TIMESTAMPTZ AS created_at";

const RECORD_OUTCOME_SQL: &str = "UPDATE adoption_applications
SET
    status = $1,
    ai_score = $2::INTEGER,
    ai_feedback = $3::TEXT,
    ai_flags = $4::TEXT[],
    ai_evaluated_at = $5::TIMESTAMPTZ,
    ai_error = $6::TEXT,
    ai_claimed_by = NULL,
    ai_claimed_at = NULL
WHERE id = $7::BIGINT
  AND status = 'procesando'
  AND ai_claimed_by = $8";

const RELEASE_EXPIRED_SQL: &str = "UPDATE adoption_applications
SET ai_claimed_by = NULL, ai_claimed_at = NULL
WHERE status = 'procesando'
  AND ai_claimed_at IS NOT NULL
  AND ai_claimed_at <= $1::TIMESTAMPTZ";

const PROMOTE_PENDING_SQL: &str = "UPDATE adoption_applications
SET status = 'procesando'
WHERE status = 'pendiente'
  AND ai_score IS NULL";

const STATUS_COUNTS_SQL: &str = "SELECT status::TEXT AS status, COUNT(*) AS count
FROM adoption_applications
GROUP BY status
ORDER BY status";

const CLAIM_COUNTS_SQL: &str = "SELECT
    COUNT(*) FILTER (WHERE ai_error IS NOT NULL) AS error_count,
    COUNT(*) FILTER (WHERE ai_claimed_at IS NOT NULL) AS claimed_count,
    COUNT(*) FILTER (WHERE ai_claimed_at <= $1::TIMESTAMPTZ) AS stale_claim_count
FROM adoption_applications";

const EXPORT_ROWS_SQL: &str = "SELECT
    a.id::BIGINT AS id,
    a.created_at::TIMESTAMPTZ AS created_at,
    a.status::TEXT AS status,
    c.id::BIGINT AS cat_id,
    c.name::TEXT AS cat_name,
    c.breed::TEXT AS cat_breed,
    c.age::TEXT AS cat_age,
    u.id::BIGINT AS applicant_id,
    u.full_name::TEXT AS applicant_name,
    u.email::TEXT AS applicant_email,
    u.phone::TEXT AS applicant_phone,
    COALESCE(a.form_responses::jsonb, '{}'::jsonb) AS form_responses,
    a.ai_score::INTEGER AS ai_score,
    a.ai_feedback::TEXT AS ai_feedback,
    a.ai_flags::TEXT[] AS ai_flags,
    a.ai_evaluated_at::TIMESTAMPTZ AS ai_evaluated_at,
    a.ai_error::TEXT AS ai_error,
    owner.full_name::TEXT AS rescuer_name,
    owner.email::TEXT AS rescuer_email
FROM adoption_applications a
LEFT JOIN cats c ON a.cat_id = c.id
LEFT JOIN users u ON a.applicant_id = u.id
LEFT JOIN users owner ON c.owner_id = owner.id
ORDER BY a.created_at DESC, a.id DESC";

/// Application queue backed by the `adoption_applications` table.
#[derive(Clone)]
pub struct PgApplicationStore {
    pool: PgPool,
}

impl PgApplicationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn claim_limit(limit: usize) -> Result<i64, QueueStorageError> {
    i64::try_from(limit)
        .map_err(|_| QueueStorageError::Mapping(format!("batch size out of range: {limit}")))
}

fn row_to_claim(
    row: &Row,
    worker_id: &str,
    claimed_at: DateTime<Utc>,
) -> Result<ClaimedApplication, QueueStorageError> {
    let created_at: Option<DateTime<Utc>> = row.try_get("created_at")?;
    let id: i64 = row.try_get("id")?;
    let created_at = created_at.ok_or_else(|| {
        QueueStorageError::Mapping(format!("application {id} has no created_at"))
    })?;

    Ok(ClaimedApplication {
        id,
        form_responses: row.try_get::<_, Value>("form_responses")?,
        created_at,
        claimed_by: worker_id.to_string(),
        claimed_at,
    })
}

fn row_to_export(row: &Row) -> Result<ApplicationExportRow, QueueStorageError> {
    Ok(ApplicationExportRow {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        status: row
            .try_get::<_, Option<String>>("status")?
            .unwrap_or_default(),
        cat_id: row.try_get("cat_id")?,
        cat_name: row.try_get("cat_name")?,
        cat_breed: row.try_get("cat_breed")?,
        cat_age: row.try_get("cat_age")?,
        applicant_id: row.try_get("applicant_id")?,
        applicant_name: row.try_get("applicant_name")?,
        applicant_email: row.try_get("applicant_email")?,
        applicant_phone: row.try_get("applicant_phone")?,
        form_responses: row.try_get("form_responses")?,
        ai_score: row.try_get("ai_score")?,
        ai_feedback: row.try_get("ai_feedback")?,
        ai_flags: row.try_get("ai_flags")?,
        ai_evaluated_at: row.try_get("ai_evaluated_at")?,
        ai_error: row.try_get("ai_error")?,
        rescuer_name: row.try_get("rescuer_name")?,
        rescuer_email: row.try_get("rescuer_email")?,
    })
}

#[async_trait]
impl ApplicationStore for PgApplicationStore {
    #[instrument(skip(self))]
    async fn claim_batch(
        &self,
        worker_id: &str,
        limit: usize,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> Result<Vec<ClaimedApplication>, QueueStorageError> {
        let client = self.pool.get().await?;
        let cutoff = now - claim_ttl;
        let limit = claim_limit(limit)?;

        let rows = timed_query(
            &client,
            CLAIM_BATCH_SQL,
            &[&worker_id, &now, &cutoff, &limit],
            "claim_application_batch",
        )
        .await?;

        // RETURNING does not preserve the subquery order.
        let mut claimed = rows
            .iter()
            .map(|row| row_to_claim(row, worker_id, now))
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by_key(|claim| (claim.created_at, claim.id));
        Ok(claimed)
    }

    #[instrument(skip(self, claim, update), fields(application_id = claim.id, status = update.status.as_str()))]
    async fn record_outcome(
        &self,
        claim: &ClaimedApplication,
        update: &EvaluationUpdate,
    ) -> Result<u64, QueueStorageError> {
        let client = self.pool.get().await?;
        let rows = timed_execute(
            &client,
            RECORD_OUTCOME_SQL,
            &[
                &update.status.as_str(),
                &update.ai_score,
                &update.ai_feedback,
                &update.ai_flags,
                &update.ai_evaluated_at,
                &update.ai_error,
                &claim.id,
                &claim.claimed_by,
            ],
            "record_application_outcome",
        )
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl QueueMaintenance for PgApplicationStore {
    #[instrument(skip(self))]
    async fn release_expired_claims(
        &self,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> Result<u64, QueueStorageError> {
        let client = self.pool.get().await?;
        let cutoff = now - claim_ttl;
        let rows = timed_execute(
            &client,
            RELEASE_EXPIRED_SQL,
            &[&cutoff],
            "release_expired_claims",
        )
        .await?;
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn promote_unevaluated_pending(&self) -> Result<u64, QueueStorageError> {
        let client = self.pool.get().await?;
        let rows = timed_execute(
            &client,
            PROMOTE_PENDING_SQL,
            &[],
            "promote_unevaluated_pending",
        )
        .await?;
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn queue_summary(
        &self,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> Result<QueueSummary, QueueStorageError> {
        let client = self.pool.get().await?;
        let cutoff = now - claim_ttl;

        let mut summary = QueueSummary::default();
        for row in timed_query(&client, STATUS_COUNTS_SQL, &[], "queue_status_counts").await? {
            let status: Option<String> = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            summary
                .status_counts
                .insert(status.unwrap_or_else(|| "(null)".to_string()), count);
        }

        let row = timed_query_one(&client, CLAIM_COUNTS_SQL, &[&cutoff], "queue_claim_counts")
            .await?;
        summary.error_count = row.try_get("error_count")?;
        summary.claimed_count = row.try_get("claimed_count")?;
        summary.stale_claim_count = row.try_get("stale_claim_count")?;
        Ok(summary)
    }
}

#[async_trait]
impl DatasetSource for PgApplicationStore {
    #[instrument(skip(self))]
    async fn application_rows(&self) -> Result<Vec<ApplicationExportRow>, QueueStorageError> {
        let client = self.pool.get().await?;
        let rows = timed_query(&client, EXPORT_ROWS_SQL, &[], "export_application_rows").await?;
        rows.iter().map(row_to_export).collect()
    }
}
