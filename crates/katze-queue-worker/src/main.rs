use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;
use katze_common::db::{PgApplicationStore, create_pool_from_url, run_migrations};
use katze_common::export::{CsvDatasetExporter, DatasetExporter, DisabledExporter, ExportRefresher};
use katze_common::logging;
use katze_queue_worker::config::APP_NAME;
use katze_queue_worker::{
    Cli, EvaluatorRuntimeConfig, QueueWorker, RunMode, WorkerConfig, WorkerError, WorkerState,
};
use tracing::{error, info, warn};

const DEFAULT_METRICS_PORT: u16 = 9187;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                let _ = sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn run() -> Result<(), WorkerError> {
    dotenv().ok();
    logging::init_tracing_subscriber(APP_NAME);

    let config = WorkerConfig::from_cli(Cli::parse())?;
    if config.metrics {
        katze_metrics::init_metrics("KATZE_METRICS_PORT", DEFAULT_METRICS_PORT);
    }

    let pool = create_pool_from_url(&config.db_url, config.pool_size)?;
    if config.run_migrations {
        let applied = run_migrations(&pool).await?;
        info!(applied, "schema migrations up to date");
    }
    let store = Arc::new(PgApplicationStore::new(pool));

    let evaluator_config = EvaluatorRuntimeConfig::from_env()?;
    let evaluator = evaluator_config.build()?;

    let exporter: Arc<dyn DatasetExporter> = match &config.export_dir {
        Some(dir) => {
            info!(export_dir = %dir.display(), "dataset export enabled");
            Arc::new(CsvDatasetExporter::new(store.clone(), dir.clone()))
        }
        None => Arc::new(DisabledExporter),
    };
    let refresher = ExportRefresher::spawn(exporter);

    let worker = QueueWorker::new(
        store,
        evaluator,
        refresher.trigger(),
        config.settings.clone(),
    );

    let mode = mode_label(config.mode);
    info!(
        worker_id = %config.settings.worker_id,
        batch_size = config.settings.batch_size,
        claim_ttl_secs = config.settings.claim_ttl.num_seconds(),
        evaluator = evaluator_config.provider.as_str(),
        mode,
        "starting application queue worker"
    );

    let mut state = WorkerState::default();
    let result = worker.drive(config.mode, &mut state, shutdown_signal()).await;
    drop(worker);

    if let Some(stats) = refresher.shutdown(config.settle_timeout).await {
        info!(
            completed = stats.completed,
            failed = stats.failed,
            "dataset refresh queue drained"
        );
    }

    info!(
        cycles = state.cycles,
        evaluated = state.evaluated,
        fallbacks = state.fallbacks,
        superseded = state.superseded,
        persist_failures = state.persist_failures,
        fetch_failures = state.fetch_failures,
        "worker stopped"
    );
    result
}

fn mode_label(mode: RunMode) -> &'static str {
    match mode {
        RunMode::Once => "once",
        RunMode::Loop { .. } => "loop",
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(error = %err, "katze-queue-worker failed");
        eprintln!("katze-queue-worker failed: {err}");
        std::process::exit(1);
    }
}
