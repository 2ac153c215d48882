use std::env;
use std::sync::OnceLock;

use metrics::{Unit, describe_counter};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};

pub const WORKER_CYCLES_TOTAL: &str = "katze_worker_cycles_total";
pub const WORKER_APPLICATIONS_TOTAL: &str = "katze_worker_applications_total";
pub const WORKER_FETCH_ERRORS_TOTAL: &str = "katze_worker_fetch_errors_total";

static EXPORTER_PORT: OnceLock<u16> = OnceLock::new();

fn resolve_port(raw: Option<&str>, default_port: u16) -> u16 {
    raw.and_then(|raw| raw.trim().parse::<u16>().ok())
        .unwrap_or(default_port)
}

/// Start a Prometheus exporter listening on `0.0.0.0:<port>`.
///
/// The port is resolved from the provided environment variable name or the
/// supplied `default_port`. Must be called from inside a tokio runtime. Returns the
/// port the exporter listens on, or `None` if it could not be started.
pub fn init_metrics(port_env: &str, default_port: u16) -> Option<u16> {
    if let Some(existing) = EXPORTER_PORT.get() {
        return Some(*existing);
    }

    let port = resolve_port(env::var(port_env).ok().as_deref(), default_port);
    match PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
    {
        Ok(()) => {
            let _ = EXPORTER_PORT.set(port);
            info!(metrics_port = port, "started prometheus exporter");
            describe_worker_metrics();
            Some(port)
        }
        Err(err) => {
            warn!(error = %err, metrics_port = port, "failed to start prometheus exporter");
            None
        }
    }
}

pub fn describe_worker_metrics() {
    describe_counter!(
        WORKER_CYCLES_TOTAL,
        Unit::Count,
        "Worker cycles that claimed a batch, including empty ones"
    );
    describe_counter!(
        WORKER_APPLICATIONS_TOTAL,
        Unit::Count,
        "Applications finished by the worker, labelled by outcome"
    );
    describe_counter!(
        WORKER_FETCH_ERRORS_TOTAL,
        Unit::Count,
        "Cycles aborted because the batch could not be claimed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_falls_back_to_default() {
        assert_eq!(resolve_port(None, 9187), 9187);
        assert_eq!(resolve_port(Some("not-a-port"), 9187), 9187);
        assert_eq!(resolve_port(Some(" 9300 "), 9187), 9300);
    }
}
