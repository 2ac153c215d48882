//! Process-level run ID.
//!
//! Each worker process gets one ULID at first access. It is stamped into
//! `ai_claimed_by` (through the default worker id) so a claim can be traced back
//! to the process that made it.

use once_cell::sync::Lazy;
use ulid::Ulid;

static RUN_ID: Lazy<String> = Lazy::new(|| Ulid::new().to_string());

/// Returns the process-level run ID (26 chars, time-ordered).
#[inline]
pub fn get() -> &'static str {
    &RUN_ID
}

/// Default worker identity: `<app>-<run id>`.
pub fn worker_id(app_name: &str) -> String {
    format!("{app_name}-{}", get())
}
