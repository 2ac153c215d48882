pub mod config;
pub mod error;
pub mod worker;

pub use config::{Cli, EvaluatorProvider, EvaluatorRuntimeConfig, WorkerConfig};
pub use error::WorkerError;
pub use worker::{
    ApplicationOutcome, CycleReport, QueueWorker, RunMode, WorkerSettings, WorkerState,
};
