use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use dotenvy::dotenv;
use katze_common::db::{DbPoolError, PgApplicationStore, QueueStorageError, create_pool_from_url};
use katze_common::logging;
use katze_common::queue::{QueueMaintenance, QueueSummary};
use thiserror::Error;
use tracing::info;

const APP_NAME: &str = "katze-queue-recovery";

#[derive(Debug, Error)]
enum RecoveryError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Pool(#[from] DbPoolError),
    #[error(transparent)]
    Storage(#[from] QueueStorageError),
    #[error("failed to render summary: {0}")]
    Render(#[from] serde_json::Error),
}

#[derive(Debug, Parser)]
#[command(
    name = "katze-queue-recovery",
    about = "Inspect and repair the adoption application queue"
)]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    db_url: String,

    /// Clear worker claims older than the claim TTL on rows still in 'procesando'
    #[arg(long, default_value_t = false)]
    release_expired_claims: bool,

    /// Move 'pendiente' rows that were never scored to 'procesando'
    #[arg(long, default_value_t = false)]
    promote_pending: bool,

    #[arg(long, env = "WORKER_CLAIM_TTL_SECONDS", default_value_t = 300)]
    claim_ttl_seconds: u64,

    /// Print the summary as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct RecoveryReport {
    released_claims: Option<u64>,
    promoted_pending: Option<u64>,
    summary: QueueSummary,
}

fn claim_ttl(seconds: u64) -> Result<Duration, RecoveryError> {
    if seconds == 0 {
        return Err(RecoveryError::Config(
            "WORKER_CLAIM_TTL_SECONDS must be at least 1".into(),
        ));
    }
    i64::try_from(seconds)
        .map(Duration::seconds)
        .map_err(|_| RecoveryError::Config(format!("claim ttl out of range: {seconds}")))
}

async fn recover<M>(
    store: &M,
    cli: &Cli,
    now: DateTime<Utc>,
) -> Result<RecoveryReport, RecoveryError>
where
    M: QueueMaintenance + ?Sized,
{
    let ttl = claim_ttl(cli.claim_ttl_seconds)?;
    let mut report = RecoveryReport::default();

    if cli.release_expired_claims {
        let released = store.release_expired_claims(now, ttl).await?;
        info!(released, "released expired claims");
        report.released_claims = Some(released);
    }

    if cli.promote_pending {
        let promoted = store.promote_unevaluated_pending().await?;
        info!(promoted, "promoted unevaluated pending applications");
        report.promoted_pending = Some(promoted);
    }

    report.summary = store.queue_summary(now, ttl).await?;
    Ok(report)
}

fn render_text(report: &RecoveryReport) -> String {
    let mut lines = Vec::new();
    if let Some(released) = report.released_claims {
        lines.push(format!("released expired claims: {released}"));
    }
    if let Some(promoted) = report.promoted_pending {
        lines.push(format!("promoted pending applications: {promoted}"));
    }
    lines.push("applications by status:".to_string());
    if report.summary.status_counts.is_empty() {
        lines.push("  (none)".to_string());
    }
    for (status, count) in &report.summary.status_counts {
        lines.push(format!("  {status}: {count}"));
    }
    lines.push(format!("with ai_error: {}", report.summary.error_count));
    lines.push(format!("claimed: {}", report.summary.claimed_count));
    lines.push(format!("stale claims: {}", report.summary.stale_claim_count));
    lines.join("\n")
}

fn render_json(report: &RecoveryReport) -> Result<String, RecoveryError> {
    let value = serde_json::json!({
        "released_claims": report.released_claims,
        "promoted_pending": report.promoted_pending,
        "summary": report.summary,
    });
    Ok(serde_json::to_string_pretty(&value)?)
}

async fn run() -> Result<(), RecoveryError> {
    dotenv().ok();
    logging::init_tracing_subscriber(APP_NAME);

    let cli = Cli::parse();
    let pool = create_pool_from_url(&cli.db_url, 1)?;
    let store = PgApplicationStore::new(pool);

    let report = recover(&store, &cli, Utc::now()).await?;
    let rendered = if cli.json {
        render_json(&report)?
    } else {
        render_text(&report)
    };
    println!("{rendered}");
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("katze-queue-recovery failed: {err}");
        std::process::exit(1);
    }
}
