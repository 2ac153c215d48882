pub mod csv;
pub mod refresher;

use async_trait::async_trait;
use thiserror::Error;

use crate::db::QueueStorageError;

pub use csv::{
    APPLICATIONS_DATASET_FILE, ApplicationExportRow, CsvDatasetExporter, DatasetSource,
    escape_field, render_applications_csv,
};
pub use refresher::{ExportRefresher, ExportTrigger, RefreshRequest, RefreshStats};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to read dataset rows: {0}")]
    Source(#[from] QueueStorageError),
    #[error("failed to write dataset file: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub rows: usize,
    pub bytes: usize,
}

/// Rebuilds a derived dataset artifact. Called from the background refresh queue only.
#[async_trait]
pub trait DatasetExporter: Send + Sync {
    async fn refresh(&self) -> Result<ExportSummary, ExportError>;
}

/// Used when no export directory is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledExporter;

#[async_trait]
impl DatasetExporter for DisabledExporter {
    async fn refresh(&self) -> Result<ExportSummary, ExportError> {
        tracing::debug!("dataset export disabled; skipping refresh");
        Ok(ExportSummary { rows: 0, bytes: 0 })
    }
}
