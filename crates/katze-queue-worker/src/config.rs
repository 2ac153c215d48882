use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use katze_common::evaluator::{
    EvaluationError, Evaluator, FallbackEvaluator, GeminiConfig, GeminiEvaluator,
    HeuristicEvaluator,
};
use katze_common::run_id;
use tracing::{info, warn};

use crate::error::WorkerError;
use crate::worker::{RunMode, WorkerSettings};

pub const APP_NAME: &str = "katze-queue-worker";

#[derive(Debug, Parser)]
#[command(
    name = "katze-queue-worker",
    about = "Evaluate adoption applications waiting in 'procesando'"
)]
pub struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    pub db_url: String,

    /// Run a single batch and exit (for cron-style scheduling)
    #[arg(long, default_value_t = false)]
    pub once: bool,

    /// Worker id stamped on claimed rows (default: katze-queue-worker-<run id>)
    #[arg(long, env = "WORKER_ID")]
    pub worker_id: Option<String>,

    /// Applications claimed per cycle
    #[arg(long, env = "WORKER_BATCH_SIZE", default_value_t = 5)]
    pub batch_size: usize,

    /// Delay between cycle starts in loop mode
    #[arg(long, env = "WORKER_INTERVAL_MS", default_value_t = 10_000)]
    pub interval_ms: u64,

    /// Age after which another worker may take over a claim
    #[arg(long, env = "WORKER_CLAIM_TTL_SECONDS", default_value_t = 300)]
    pub claim_ttl_seconds: u64,

    /// How long to wait for the dataset refresh queue at shutdown
    #[arg(long, env = "WORKER_SETTLE_TIMEOUT_MS", default_value_t = 2_000)]
    pub settle_timeout_ms: u64,

    /// Directory for the applications CSV dataset; unset disables the export
    #[arg(long, env = "DATASET_EXPORT_DIR")]
    pub export_dir: Option<PathBuf>,

    #[arg(long, env = "DB_POOL_MAX_SIZE", default_value_t = 4)]
    pub pool_size: usize,

    /// Apply pending schema migrations before starting
    #[arg(long, default_value_t = false)]
    pub run_migrations: bool,

    /// Serve Prometheus metrics on KATZE_METRICS_PORT
    #[arg(long, default_value_t = false)]
    pub metrics: bool,
}

/// Validated runtime settings for the worker binary.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub db_url: String,
    pub pool_size: usize,
    pub settings: WorkerSettings,
    pub mode: RunMode,
    pub settle_timeout: Duration,
    pub export_dir: Option<PathBuf>,
    pub run_migrations: bool,
    pub metrics: bool,
}

impl WorkerConfig {
    pub fn from_cli(cli: Cli) -> Result<Self, WorkerError> {
        if cli.batch_size == 0 {
            return Err(WorkerError::Config(
                "WORKER_BATCH_SIZE must be at least 1".into(),
            ));
        }
        if cli.interval_ms == 0 && !cli.once {
            return Err(WorkerError::Config(
                "WORKER_INTERVAL_MS must be at least 1".into(),
            ));
        }
        if cli.claim_ttl_seconds == 0 {
            return Err(WorkerError::Config(
                "WORKER_CLAIM_TTL_SECONDS must be at least 1".into(),
            ));
        }
        let claim_ttl_seconds = i64::try_from(cli.claim_ttl_seconds).map_err(|_| {
            WorkerError::Config(format!(
                "WORKER_CLAIM_TTL_SECONDS out of range: {}",
                cli.claim_ttl_seconds
            ))
        })?;

        let worker_id = match cli.worker_id.map(|id| id.trim().to_string()) {
            Some(id) if !id.is_empty() => id,
            _ => run_id::worker_id(APP_NAME),
        };

        let mode = if cli.once {
            RunMode::Once
        } else {
            RunMode::Loop {
                interval: Duration::from_millis(cli.interval_ms),
            }
        };

        Ok(Self {
            db_url: cli.db_url,
            pool_size: cli.pool_size,
            settings: WorkerSettings {
                worker_id,
                batch_size: cli.batch_size,
                claim_ttl: chrono::Duration::seconds(claim_ttl_seconds),
            },
            mode,
            settle_timeout: Duration::from_millis(cli.settle_timeout_ms),
            export_dir: cli.export_dir,
            run_migrations: cli.run_migrations,
            metrics: cli.metrics,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorProvider {
    Gemini,
    Heuristic,
}

impl EvaluatorProvider {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "gemini" => Some(EvaluatorProvider::Gemini),
            "heuristic" | "offline" | "basic" => Some(EvaluatorProvider::Heuristic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluatorProvider::Gemini => "gemini",
            EvaluatorProvider::Heuristic => "heuristic",
        }
    }
}

#[derive(Clone)]
pub struct EvaluatorRuntimeConfig {
    pub provider: EvaluatorProvider,
    pub api_key: String,
    pub model: String,
    pub endpoint: String,
    pub timeout_secs: u64,
    /// Gemini was requested but no key was found.
    pub key_missing: bool,
}

impl fmt::Debug for EvaluatorRuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluatorRuntimeConfig")
            .field("provider", &self.provider)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "***" })
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("timeout_secs", &self.timeout_secs)
            .field("key_missing", &self.key_missing)
            .finish()
    }
}

impl Default for EvaluatorRuntimeConfig {
    fn default() -> Self {
        Self {
            provider: EvaluatorProvider::Heuristic,
            api_key: String::new(),
            model: "gemini-1.5-flash".into(),
            endpoint: "https://generativelanguage.googleapis.com/v1beta".into(),
            timeout_secs: 30,
            key_missing: false,
        }
    }
}

impl EvaluatorRuntimeConfig {
    pub fn from_env() -> Result<Self, WorkerError> {
        fn non_empty(key: &str) -> Option<String> {
            std::env::var(key)
                .ok()
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        }

        fn parse_u64(key: &str, default: u64) -> u64 {
            std::env::var(key)
                .ok()
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        }

        let defaults = Self::default();
        let api_key = non_empty("GEMINI_API_KEY")
            .or_else(|| non_empty("GOOGLE_API_KEY"))
            .unwrap_or_default();

        let requested = match non_empty("EVALUATOR_PROVIDER") {
            Some(raw) => EvaluatorProvider::parse(&raw).ok_or_else(|| {
                WorkerError::Config(format!(
                    "EVALUATOR_PROVIDER must be 'gemini' or 'heuristic', got '{raw}'"
                ))
            })?,
            None => EvaluatorProvider::Gemini,
        };
        let wants_gemini = requested == EvaluatorProvider::Gemini;

        let provider = if wants_gemini && !api_key.is_empty() {
            EvaluatorProvider::Gemini
        } else {
            EvaluatorProvider::Heuristic
        };

        Ok(Self {
            provider,
            key_missing: wants_gemini && api_key.is_empty(),
            api_key,
            model: non_empty("GEMINI_MODEL").unwrap_or(defaults.model),
            endpoint: non_empty("GEMINI_ENDPOINT").unwrap_or(defaults.endpoint),
            timeout_secs: parse_u64("EVALUATOR_TIMEOUT_SECONDS", defaults.timeout_secs),
        })
    }

    /// A Gemini failure is answered by the heuristic before it reaches the worker.
    pub fn build(&self) -> Result<Arc<dyn Evaluator>, EvaluationError> {
        match self.provider {
            EvaluatorProvider::Gemini => {
                let gemini = GeminiEvaluator::new(GeminiConfig {
                    api_key: self.api_key.clone(),
                    model: self.model.clone(),
                    endpoint: self.endpoint.clone(),
                    timeout: Duration::from_secs(self.timeout_secs),
                })?;
                info!(
                    model = %self.model,
                    endpoint = %self.endpoint,
                    timeout_secs = self.timeout_secs,
                    "using gemini evaluator with heuristic fallback"
                );
                Ok(Arc::new(FallbackEvaluator::new(
                    Arc::new(gemini),
                    Arc::new(HeuristicEvaluator),
                )))
            }
            EvaluatorProvider::Heuristic => {
                if self.key_missing {
                    warn!("GEMINI_API_KEY not set; falling back to offline heuristic evaluator");
                } else {
                    info!("using offline heuristic evaluator");
                }
                Ok(Arc::new(HeuristicEvaluator))
            }
        }
    }
}
