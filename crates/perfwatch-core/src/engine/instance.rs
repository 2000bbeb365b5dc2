use crate::config::{AnalysisSettings, InstanceConfig};
use crate::engine::worker::{spawn_analysis, AnalysisJob, RetryPolicy};
use crate::errors::{ConfigError, ImportError};
use crate::ingest::ImportResult;
use crate::metrics_api::Comparator;
use crate::regression::{Analysis, TriagePolicy};
use crate::report::Report;
use crate::schema::SuiteDefinition;
use crate::storage::{Store, SuiteDb};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// A database plus its bound suites, dispatching reports by tag.
pub struct Instance {
    store: Store,
    suites: RwLock<HashMap<String, SuiteDb>>,
    comparator: Arc<dyn Comparator>,
    settings: AnalysisSettings,
}

/// An accepted report. The import is committed; analysis, if any, runs in
/// the background.
pub struct Submission {
    pub import: ImportResult,
    pub analysis: Option<JoinHandle<anyhow::Result<Analysis>>>,
}

impl Submission {
    /// Waits for the background analysis. `None` when none was started.
    pub async fn wait(self) -> Option<anyhow::Result<Analysis>> {
        let handle = self.analysis?;
        Some(handle.await.map_err(anyhow::Error::from).and_then(|r| r))
    }
}

impl Instance {
    /// Opens the configured database, registers the configured suites and
    /// binds any further suites already stored in it.
    pub fn open(cfg: &InstanceConfig, comparator: Arc<dyn Comparator>) -> anyhow::Result<Self> {
        cfg.analysis.validate()?;
        let store = match &cfg.database {
            Some(path) => Store::open(path)?,
            None => Store::memory()?,
        };
        store.init_schema()?;
        let instance = Self {
            store,
            suites: RwLock::new(HashMap::new()),
            comparator,
            settings: cfg.analysis.clone(),
        };
        for def in &cfg.suites {
            instance.register_suite(def)?;
        }
        for suite in instance.store.load_suites()? {
            let mut suites = instance.write_suites()?;
            suites
                .entry(suite.schema().name().to_string())
                .or_insert(suite);
        }
        Ok(instance)
    }

    fn write_suites(&self) -> anyhow::Result<std::sync::RwLockWriteGuard<'_, HashMap<String, SuiteDb>>> {
        self.suites
            .write()
            .map_err(|_| anyhow::anyhow!("suite registry lock poisoned"))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn settings(&self) -> &AnalysisSettings {
        &self.settings
    }

    pub fn triage_policy(&self) -> TriagePolicy {
        self.settings.triage_policy()
    }

    /// Binds (or rebinds) a suite. Live handles held elsewhere keep their
    /// old schema.
    pub fn register_suite(&self, def: &SuiteDefinition) -> anyhow::Result<SuiteDb> {
        let suite = self.store.register_suite(def)?;
        self.write_suites()?
            .insert(def.name.clone(), suite.clone());
        Ok(suite)
    }

    pub fn suite(&self, name: &str) -> anyhow::Result<SuiteDb> {
        let suites = self
            .suites
            .read()
            .map_err(|_| anyhow::anyhow!("suite registry lock poisoned"))?;
        suites
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownSuite(name.to_string()).into())
    }

    pub fn suite_names(&self) -> anyhow::Result<Vec<String>> {
        let suites = self
            .suites
            .read()
            .map_err(|_| anyhow::anyhow!("suite registry lock poisoned"))?;
        let mut names: Vec<String> = suites.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn suite_for_report(&self, report: &Report) -> anyhow::Result<SuiteDb> {
        let tag = report.tag()?;
        self.suite(&tag)
            .map_err(|_| ImportError::UnknownSuite { tag }.into())
    }

    /// Synchronous import without analysis.
    pub fn import(&self, report: &Report, imported_from: Option<&str>) -> anyhow::Result<ImportResult> {
        self.suite_for_report(report)?.import(report, imported_from)
    }

    fn analysis_job(&self, suite: SuiteDb, run_id: i64) -> AnalysisJob {
        AnalysisJob {
            suite,
            run_id,
            comparator: self.comparator.clone(),
            mode: self.settings.mode.clone(),
            retry: RetryPolicy {
                max_attempts: self.settings.max_attempts,
                backoff: Duration::from_millis(self.settings.retry_backoff_ms),
            },
        }
    }

    /// Imports on the blocking pool, then starts background analysis for
    /// newly created runs. Duplicates never trigger analysis.
    pub async fn submit(&self, report: Report, imported_from: Option<String>) -> anyhow::Result<Submission> {
        let suite = self.suite_for_report(&report)?;
        let importer = suite.clone();
        let import = tokio::task::spawn_blocking(move || {
            importer.import(&report, imported_from.as_deref())
        })
        .await??;

        let analysis = if import.created && self.settings.enabled {
            Some(spawn_analysis(self.analysis_job(suite, import.run.id)))
        } else {
            None
        };
        Ok(Submission { import, analysis })
    }

    /// Like [`Instance::submit`], but waits for the analysis. An analysis
    /// failure does not fail the submission; it is returned alongside.
    pub async fn submit_and_wait(
        &self,
        report: Report,
        imported_from: Option<String>,
    ) -> anyhow::Result<(ImportResult, Option<anyhow::Result<Analysis>>)> {
        let submission = self.submit(report, imported_from).await?;
        let import = submission.import.clone();
        Ok((import, submission.wait().await))
    }

    /// Re-runs analysis for an existing run, e.g. after a failed background pass.
    pub async fn reanalyze(&self, suite: &str, run_id: i64) -> anyhow::Result<Analysis> {
        let suite = self.suite(suite)?;
        crate::engine::worker::run_analysis(self.analysis_job(suite, run_id)).await
    }
}
