//! Background queue for dataset refreshes.
//!
//! Requests are best effort and at most once: the channel holds a single pending
//! request, further requests coalesce into it, and exporter failures are logged and
//! counted but never reach the caller.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::DatasetExporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshRequest {
    Queued,
    /// A refresh was already waiting; this request is folded into it.
    Coalesced,
    /// The refresh task has stopped.
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub completed: u64,
    pub failed: u64,
}

/// Cheap handle the worker uses to ask for a refresh.
#[derive(Debug, Clone)]
pub struct ExportTrigger {
    tx: mpsc::Sender<()>,
}

impl ExportTrigger {
    pub fn request(&self) -> RefreshRequest {
        match self.tx.try_send(()) {
            Ok(()) => RefreshRequest::Queued,
            Err(TrySendError::Full(())) => RefreshRequest::Coalesced,
            Err(TrySendError::Closed(())) => RefreshRequest::Closed,
        }
    }
}

pub struct ExportRefresher {
    trigger: ExportTrigger,
    handle: JoinHandle<RefreshStats>,
}

impl ExportRefresher {
    pub fn spawn(exporter: Arc<dyn DatasetExporter>) -> Self {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let handle = tokio::spawn(async move {
            let mut stats = RefreshStats::default();
            while rx.recv().await.is_some() {
                match exporter.refresh().await {
                    Ok(summary) => {
                        stats.completed += 1;
                        debug!(rows = summary.rows, bytes = summary.bytes, "dataset refresh done");
                    }
                    Err(err) => {
                        stats.failed += 1;
                        warn!(error = %err, "dataset refresh failed; worker continues");
                    }
                }
            }
            stats
        });

        Self {
            trigger: ExportTrigger { tx },
            handle,
        }
    }

    pub fn trigger(&self) -> ExportTrigger {
        self.trigger.clone()
    }

    /// Close the queue and wait up to `settle` for the pending refresh to finish.
    ///
    /// Every [`ExportTrigger`] clone must be dropped first, otherwise this waits out the
    /// full `settle` period. Returns `None` when the task had to be abandoned.
    pub async fn shutdown(self, settle: Duration) -> Option<RefreshStats> {
        let Self { trigger, mut handle } = self;
        drop(trigger);

        match tokio::time::timeout(settle, &mut handle).await {
            Ok(Ok(stats)) => Some(stats),
            Ok(Err(err)) => {
                warn!(error = %err, "dataset refresh task ended abnormally");
                None
            }
            Err(_) => {
                warn!(
                    settle_ms = settle.as_millis() as u64,
                    "dataset refresh still running at shutdown; abandoning it"
                );
                handle.abort();
                None
            }
        }
    }
}
