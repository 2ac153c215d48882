use katze_common::db::{DbPoolError, MigrationError};
use katze_common::evaluator::EvaluationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Pool(#[from] DbPoolError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error("failed to build evaluator: {0}")]
    Evaluator(#[from] EvaluationError),
    #[error("could not claim an application batch: {0}")]
    Fetch(String),
}
