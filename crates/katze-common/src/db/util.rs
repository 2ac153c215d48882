//! Prepared-statement helpers that log slow queries.

use deadpool_postgres::Client;
use std::{sync::OnceLock, time::Instant};
use tokio_postgres::{Row, types::ToSql};
use tracing::warn;

pub type SqlParams<'a> = &'a [&'a (dyn ToSql + Sync)];

fn parse_threshold(raw: Option<&str>) -> Option<u64> {
    raw.and_then(|raw| raw.trim().parse::<i64>().ok())
        .map(|v| v.max(0) as u64)
        .filter(|v| *v > 0)
}

fn slow_query_threshold_ms() -> Option<u64> {
    static CACHE: OnceLock<Option<u64>> = OnceLock::new();

    *CACHE.get_or_init(|| {
        parse_threshold(std::env::var("KATZE_DB_LOG_MIN_DURATION_MS").ok().as_deref())
    })
}

fn maybe_log_slow_query(label: &str, started_at: Instant) {
    if let Some(threshold_ms) = slow_query_threshold_ms() {
        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        if elapsed_ms >= threshold_ms {
            warn!(query = label, elapsed_ms, "slow_query_detected");
        }
    }
}

pub async fn timed_query(
    client: &Client,
    statement: &str,
    params: SqlParams<'_>,
    label: &str,
) -> Result<Vec<Row>, tokio_postgres::Error> {
    let started = Instant::now();
    let prepared = client.prepare_cached(statement).await?;
    let result = client.query(&prepared, params).await;
    maybe_log_slow_query(label, started);
    result
}

pub async fn timed_query_one(
    client: &Client,
    statement: &str,
    params: SqlParams<'_>,
    label: &str,
) -> Result<Row, tokio_postgres::Error> {
    let started = Instant::now();
    let prepared = client.prepare_cached(statement).await?;
    let result = client.query_one(&prepared, params).await;
    maybe_log_slow_query(label, started);
    result
}

pub async fn timed_execute(
    client: &Client,
    statement: &str,
    params: SqlParams<'_>,
    label: &str,
) -> Result<u64, tokio_postgres::Error> {
    let started = Instant::now();
    let prepared = client.prepare_cached(statement).await?;
    let result = client.execute(&prepared, params).await;
    maybe_log_slow_query(label, started);
    result
}
