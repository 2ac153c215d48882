pub mod applications;
pub mod migrations;
pub mod pool;
pub mod util;

use deadpool_postgres::PoolError;
use tokio_postgres::Error as PgError;

pub use applications::PgApplicationStore;
pub use migrations::{MigrationError, run_migrations};
pub use pool::{DbPoolError, PgPool, create_pool_from_url};

/// Errors from any application queue backend.
#[derive(Debug, thiserror::Error)]
pub enum QueueStorageError {
    #[error("failed to get postgres connection: {0}")]
    Pool(#[from] PoolError),
    #[error("postgres error: {0}")]
    Postgres(#[from] PgError),
    #[error("failed to map application row: {0}")]
    Mapping(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
