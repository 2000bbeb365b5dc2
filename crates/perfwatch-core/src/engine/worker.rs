//! Background change detection with bounded retries.

use crate::logging::{log_analysis_failure, log_analysis_retry};
use crate::metrics_api::Comparator;
use crate::model::RowId;
use crate::regression::{Analysis, AnalysisMode};
use crate::storage::SuiteDb;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Wait before attempt `n + 1` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Clone)]
pub struct AnalysisJob {
    pub suite: SuiteDb,
    pub run_id: RowId,
    pub comparator: Arc<dyn Comparator>,
    pub mode: AnalysisMode,
    pub retry: RetryPolicy,
}

/// Runs the analysis on the blocking pool, retrying failed passes. Each pass
/// is its own transaction, so a failed pass leaves nothing behind.
pub async fn run_analysis(job: AnalysisJob) -> anyhow::Result<Analysis> {
    let max_attempts = job.retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let suite = job.suite.clone();
        let comparator = job.comparator.clone();
        let mode = job.mode.clone();
        let run_id = job.run_id;
        let result = tokio::task::spawn_blocking(move || {
            suite.analyze_run(run_id, comparator.as_ref(), &mode)
        })
        .await
        .map_err(anyhow::Error::from)
        .and_then(|r| r);

        match result {
            Ok(analysis) => return Ok(analysis),
            Err(e) if attempt < max_attempts => {
                log_analysis_retry(job.suite.schema().name(), job.run_id, attempt, &e);
                sleep(job.retry.backoff.checked_mul(attempt).unwrap_or(Duration::MAX)).await;
                attempt += 1;
            }
            Err(e) => {
                log_analysis_failure(job.suite.schema().name(), job.run_id, attempt, &e);
                return Err(e);
            }
        }
    }
}

/// Fire-and-forget: the returned handle may be dropped.
pub fn spawn_analysis(job: AnalysisJob) -> JoinHandle<anyhow::Result<Analysis>> {
    tokio::spawn(run_analysis(job))
}
