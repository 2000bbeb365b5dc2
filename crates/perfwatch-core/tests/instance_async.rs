use perfwatch_core::config::InstanceConfig;
use perfwatch_core::errors::ImportError;
use perfwatch_core::metrics_api::{ChangeKind, Comparator, Comparison, ComparisonInput};
use perfwatch_core::model::RegressionState;
use perfwatch_core::report::Report;
use perfwatch_core::Instance;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

/// Calls every non-empty comparison a regression, after failing the first
/// `failures` calls.
struct StubComparator {
    failures: u32,
    calls: AtomicU32,
}

impl StubComparator {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
        })
    }
}

impl Comparator for StubComparator {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn compare(&self, input: &ComparisonInput<'_>) -> anyhow::Result<Comparison> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            anyhow::bail!("comparator unavailable (call {})", n + 1);
        }
        Ok(Comparison::unchanged(input.previous.first().copied(), input.current.first().copied())
            .with_kind(ChangeKind::Regressed))
    }
}

/// Signals when a comparison starts and blocks until released.
struct GatedComparator {
    started: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl Comparator for GatedComparator {
    fn name(&self) -> &'static str {
        "gated"
    }

    fn compare(&self, input: &ComparisonInput<'_>) -> anyhow::Result<Comparison> {
        let _ = self.started.lock().unwrap().send(());
        let _ = self.release.lock().unwrap().recv();
        Ok(Comparison::unchanged(input.previous.first().copied(), input.current.first().copied()))
    }
}

fn config() -> InstanceConfig {
    let mut cfg = InstanceConfig::default();
    cfg.analysis.retry_backoff_ms = 1;
    cfg
}

fn report(tag: &str, order: &str, start: &str, exec: f64) -> Report {
    serde_json::from_value(json!({
        "Machine": {"Name": "bot"},
        "Run": {"Info": {"tag": tag, "run_order": order}, "Start Time": start, "End Time": start},
        "Tests": [{"Name": format!("{tag}.loop.exec"), "Data": [exec]}],
    }))
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn submissions_trigger_background_analysis() {
    let instance = Instance::open(&config(), StubComparator::new(0)).unwrap();

    let first = instance
        .submit(report("nts", "1", "2024-01-01 00:00:00", 1.0), None)
        .await
        .unwrap();
    assert!(first.import.created);
    let analysis = first.wait().await.unwrap().unwrap();
    assert!(analysis.baseline_run_ids.is_empty());

    let (import, analysis) = instance
        .submit_and_wait(report("nts", "2", "2024-01-02 00:00:00", 1.0), Some("ci".into()))
        .await
        .unwrap();
    assert_eq!(import.imported_from.as_deref(), Some("ci"));
    let analysis = analysis.unwrap().unwrap();
    assert_eq!(analysis.new_regressions.len(), 1);

    let suite = instance.suite("nts").unwrap();
    let open = suite.regressions(&[RegressionState::Detected]).unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].title, "Regression of 1 benchmarks: loop");

    let dup = instance
        .submit(report("nts", "2", "2024-01-02 00:00:00", 1.0), None)
        .await
        .unwrap();
    assert!(dup.import.is_duplicate());
    assert!(dup.analysis.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn disabled_analysis_only_imports() {
    let mut cfg = config();
    cfg.analysis.enabled = false;
    let instance = Instance::open(&cfg, StubComparator::new(0)).unwrap();
    let s = instance
        .submit(report("nts", "1", "2024-01-01 00:00:00", 1.0), None)
        .await
        .unwrap();
    assert!(s.import.created);
    assert!(s.analysis.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_passes_are_retried() {
    let instance = Instance::open(&config(), StubComparator::new(2)).unwrap();
    instance
        .import(&report("nts", "1", "2024-01-01 00:00:00", 1.0), None)
        .unwrap();
    let (_, analysis) = instance
        .submit_and_wait(report("nts", "2", "2024-01-02 00:00:00", 2.0), None)
        .await
        .unwrap();
    let analysis = analysis.unwrap().unwrap();
    assert_eq!(analysis.new_changes.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_keep_the_import() {
    let mut cfg = config();
    cfg.analysis.max_attempts = 2;
    let instance = Instance::open(&cfg, StubComparator::new(2)).unwrap();
    instance
        .import(&report("nts", "1", "2024-01-01 00:00:00", 1.0), None)
        .unwrap();
    let (import, analysis) = instance
        .submit_and_wait(report("nts", "2", "2024-01-02 00:00:00", 2.0), None)
        .await
        .unwrap();
    assert!(analysis.unwrap().is_err());

    let suite = instance.suite("nts").unwrap();
    assert_eq!(suite.get_run(import.run.id).unwrap().id, import.run.id);
    assert_eq!(suite.counts().unwrap().field_changes, 0);

    // The comparator has recovered; a manual pass picks the run up again.
    let analysis = instance.reanalyze("nts", import.run.id).await.unwrap();
    assert_eq!(analysis.new_regressions.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn imports_proceed_while_analysis_compares() {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let comparator = Arc::new(GatedComparator {
        started: Mutex::new(started_tx),
        release: Mutex::new(release_rx),
    });
    let instance = Arc::new(Instance::open(&config(), comparator).unwrap());
    instance
        .import(&report("nts", "1", "2024-01-01 00:00:00", 1.0), None)
        .unwrap();
    let pending = instance
        .submit(report("nts", "2", "2024-01-02 00:00:00", 1.0), None)
        .await
        .unwrap();
    tokio::task::spawn_blocking(move || started_rx.recv())
        .await
        .unwrap()
        .unwrap();

    // The comparator is parked mid-pass; an unrelated import must not wait on it.
    let importer = instance.clone();
    let import = tokio::task::spawn_blocking(move || {
        importer.import(&report("nts", "3", "2024-01-03 00:00:00", 1.0), None)
    });
    let waited = tokio::time::timeout(Duration::from_secs(5), import).await;
    release_tx.send(()).unwrap();
    let import = waited.expect("import blocked behind analysis").unwrap().unwrap();
    assert!(import.created);

    let analysis = pending.wait().await.unwrap().unwrap();
    assert_eq!(analysis.comparisons, 1);
    assert!(analysis.new_changes.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_tags_are_rejected() {
    let instance = Instance::open(&config(), StubComparator::new(0)).unwrap();
    let err = instance
        .submit(report("compile", "1", "2024-01-01 00:00:00", 1.0), None)
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err.downcast_ref::<ImportError>(),
        Some(ImportError::UnknownSuite { tag }) if tag == "compile"
    ));
}

#[test]
fn stored_suites_are_rebound_on_open() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cfg = config();
    cfg.database = Some(dir.path().join("perf.db"));
    {
        let instance = Instance::open(&cfg, StubComparator::new(0))?;
        instance.import(&report("nts", "1", "2024-01-01 00:00:00", 1.0), None)?;
    }

    cfg.suites.clear();
    let instance = Instance::open(&cfg, StubComparator::new(0))?;
    assert_eq!(instance.suite_names()?, vec!["nts".to_string()]);
    let again = instance.import(&report("nts", "1", "2024-01-01 00:00:00", 1.0), None)?;
    assert!(again.is_duplicate());
    Ok(())
}
