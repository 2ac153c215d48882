use deadpool_postgres::PoolError;
use thiserror::Error;
use tokio_postgres::Error as PgError;
use tracing::{info, instrument};

use crate::db::PgPool;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to get postgres connection: {0}")]
    Pool(#[from] PoolError),
    #[error("failed to run migration: {0}")]
    Postgres(#[from] PgError),
}

struct Migration {
    id: i32,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS katze_schema_migrations (
    id INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);";

const MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        description: "ai evaluation columns on adoption_applications",
        sql: r#"
ALTER TABLE adoption_applications
    ADD COLUMN IF NOT EXISTS ai_score INTEGER,
    ADD COLUMN IF NOT EXISTS ai_feedback TEXT,
    ADD COLUMN IF NOT EXISTS ai_flags TEXT[],
    ADD COLUMN IF NOT EXISTS ai_evaluated_at TIMESTAMPTZ,
    ADD COLUMN IF NOT EXISTS ai_error TEXT;
"#,
    },
    Migration {
        id: 2,
        description: "worker claim columns + processing index",
        sql: r#"
ALTER TABLE adoption_applications
    ADD COLUMN IF NOT EXISTS ai_claimed_by TEXT,
    ADD COLUMN IF NOT EXISTS ai_claimed_at TIMESTAMPTZ;

CREATE INDEX IF NOT EXISTS idx_adoption_applications_processing
    ON adoption_applications(created_at, id)
    WHERE status = 'procesando';
"#,
    },
    Migration {
        id: 3,
        description: "status check admits pending_review fallback",
        sql: r#"
ALTER TABLE adoption_applications
    DROP CONSTRAINT IF EXISTS adoption_applications_status_check;

ALTER TABLE adoption_applications
    ADD CONSTRAINT adoption_applications_status_check
    CHECK (status IN (
        'pendiente',
        'procesando',
        'revision_pendiente',
        'rechazada_automaticamente',
        'pending_review',
        'aprobada',
        'rechazada'
    ));
"#,
    },
];

#[instrument(skip(pool))]
pub async fn run_migrations(pool: &PgPool) -> Result<usize, MigrationError> {
    let mut client = pool.get().await?;
    client.batch_execute(MIGRATIONS_TABLE_SQL).await?;

    let mut applied = 0;
    for migration in MIGRATIONS {
        let already_applied: bool = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM katze_schema_migrations WHERE id = $1)",
                &[&migration.id],
            )
            .await?
            .get(0);

        if already_applied {
            continue;
        }

        let tx = client.transaction().await?;
        tx.batch_execute(migration.sql).await?;
        tx.execute(
            "INSERT INTO katze_schema_migrations (id, description) VALUES ($1, $2)",
            &[&migration.id, &migration.description],
        )
        .await?;
        tx.commit().await?;

        applied += 1;
        info!(
            id = migration.id,
            description = migration.description,
            "applied migration"
        );
    }

    Ok(applied)
}
