use tracing_subscriber::{fmt, EnvFilter};

/// Installs the process-wide JSON subscriber on stderr. An invalid filter
/// falls back to `info`. Returns false if a subscriber was already set.
pub fn init_logging(log_level: &str) -> bool {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

/// Background analysis gave up on a run. The import itself stays committed.
pub fn log_analysis_failure(suite: &str, run_id: i64, attempts: u32, error: &anyhow::Error) {
    tracing::error!(
        event = "perfwatch.analysis.failed",
        suite = %suite,
        run_id,
        attempts,
        error = %format!("{:#}", error),
        "analysis of run {} failed after {} attempts", run_id, attempts
    );
}

pub fn log_analysis_retry(suite: &str, run_id: i64, attempt: u32, error: &anyhow::Error) {
    tracing::warn!(
        event = "perfwatch.analysis.retry",
        suite = %suite,
        run_id,
        attempt,
        error = %format!("{:#}", error),
    );
}
