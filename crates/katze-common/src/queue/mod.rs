pub mod application_queue;

pub use application_queue::{
    ApplicationRecord, ApplicationStatus, ApplicationStore, ClaimedApplication,
    EvaluationUpdate, FALLBACK_FEEDBACK, FALLBACK_SCORE, InMemoryApplicationStore,
    QueueMaintenance, QueueSummary, SYSTEM_ERROR_FLAG,
};
