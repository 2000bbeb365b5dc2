use perfwatch_core::errors::ImportError;
use perfwatch_core::report::Report;
use perfwatch_core::schema::{FieldValue, SuiteDefinition};
use perfwatch_core::{Store, SuiteDb};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

fn suite() -> SuiteDb {
    let store = Store::memory().unwrap();
    store.init_schema().unwrap();
    store.register_suite(&SuiteDefinition::nts()).unwrap()
}

fn report(machine: Value, run_info: Value, start: &str, tests: Value) -> Report {
    serde_json::from_value(json!({
        "Machine": machine,
        "Run": {"Info": run_info, "Start Time": start, "End Time": start},
        "Tests": tests,
    }))
    .unwrap()
}

fn simple(order: &str, start: &str, compile: f64, exec: f64) -> Report {
    report(
        json!({"Name": "bot-1", "Info": {"os": "linux", "hardware": "x86_64"}}),
        json!({"tag": "nts", "run_order": order}),
        start,
        json!([
            {"Name": "nts.SingleSource/hello.compile", "Data": [compile]},
            {"Name": "nts.SingleSource/hello.exec", "Data": [exec]},
        ]),
    )
}

fn import_error(err: &anyhow::Error) -> &ImportError {
    err.downcast_ref::<ImportError>()
        .unwrap_or_else(|| panic!("expected an import error, got {err:#}"))
}

#[test]
fn two_revisions_then_duplicate() {
    let db = suite();
    let r1 = db.import(&simple("1", "2024-03-01 10:00:00", 0.5, 1.25), None).unwrap();
    let r2 = db.import(&simple("2", "2024-03-02 10:00:00", 0.6, 1.50), None).unwrap();
    assert!(r1.created && r2.created);
    assert!(r1.machine_created && !r2.machine_created);
    assert!(r1.revision_created && r2.revision_created);
    assert_eq!(r1.added_tests, 1);
    assert_eq!(r2.added_tests, 0);

    let counts = db.counts().unwrap();
    assert_eq!(counts.machines, 1);
    assert_eq!(counts.revisions, 2);
    assert_eq!(counts.runs, 2);
    assert_eq!(counts.tests, 1);
    assert_eq!(counts.samples, 2);

    let seq = db.revision_sequence().unwrap();
    assert_eq!(seq.len(), 2);
    assert_eq!(seq[0].as_ordered_string(), "1");
    assert_eq!(seq[0].next_id, Some(seq[1].id));
    assert_eq!(seq[1].previous_id, Some(seq[0].id));
    assert_eq!(r1.run.revision_id, seq[0].id);

    let samples = db.samples_for_run(r2.run.id).unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].values.get("compile_time"), Some(&FieldValue::Real(0.6)));
    assert_eq!(samples[0].values.get("execution_time"), Some(&FieldValue::Real(1.5)));
    assert_eq!(samples[0].values.get("hash"), Some(&FieldValue::Null));

    let again = db.import(&simple("1", "2024-03-01 10:00:00", 0.5, 1.25), None).unwrap();
    assert!(again.is_duplicate());
    assert_eq!(again.run.id, r1.run.id);
    assert_eq!(again.added_samples, 0);
    assert_eq!(db.counts().unwrap(), counts);
}

#[test]
fn machine_identity_covers_fields_and_parameters() {
    let db = suite();
    let with = |info: Value, start: &str| {
        report(
            json!({"Name": "bot", "Info": info}),
            json!({"tag": "nts", "run_order": "1"}),
            start,
            json!([]),
        )
    };
    let a = db.import(&with(json!({"os": "linux", "cpus": 8}), "2024-01-01 00:00:00"), None).unwrap();
    let b = db.import(&with(json!({"os": "linux", "cpus": 8}), "2024-01-02 00:00:00"), None).unwrap();
    assert_eq!(a.run.machine_id, b.run.machine_id);

    let c = db.import(&with(json!({"os": "darwin", "cpus": 8}), "2024-01-03 00:00:00"), None).unwrap();
    let d = db.import(&with(json!({"os": "linux", "cpus": 16}), "2024-01-04 00:00:00"), None).unwrap();
    assert_ne!(c.run.machine_id, a.run.machine_id);
    assert_ne!(d.run.machine_id, a.run.machine_id);
    assert_eq!(db.machines().unwrap().len(), 3);

    let m = db.get_machine(a.run.machine_id).unwrap();
    assert_eq!(m.fields.get("os").map(String::as_str), Some("linux"));
    assert_eq!(m.parameters.get("cpus"), Some(&json!(8)));
}

#[test]
fn missing_revision_field_commits_nothing() {
    let db = suite();
    for info in [
        json!({"tag": "nts"}),
        json!({"tag": "nts", "run_order": null}),
        json!({"tag": "nts", "run_order": "  "}),
    ] {
        let r = report(
            json!({"Name": "bot"}),
            info,
            "2024-01-01 00:00:00",
            json!([{"Name": "nts.foo.exec", "Data": [1.0]}]),
        );
        let err = db.import(&r, None).unwrap_err();
        assert!(matches!(
            import_error(&err),
            ImportError::MissingRequiredField { key } if key == "run_order"
        ));
    }
    let counts = db.counts().unwrap();
    assert_eq!((counts.machines, counts.revisions, counts.runs), (0, 0, 0));
}

#[test]
fn bad_test_names_reject_the_report() {
    let db = suite();
    let with_tests = |tests: Value| {
        report(
            json!({"Name": "bot"}),
            json!({"tag": "nts", "run_order": "7"}),
            "2024-01-01 00:00:00",
            tests,
        )
    };

    let err = db
        .import(&with_tests(json!([{"Name": "compile.foo.exec", "Data": [1.0]}])), None)
        .unwrap_err();
    assert!(matches!(import_error(&err), ImportError::MisnamedTest { .. }));

    let err = db
        .import(&with_tests(json!([{"Name": "nts.foo.runtime", "Data": [1.0]}])), None)
        .unwrap_err();
    assert!(matches!(import_error(&err), ImportError::UnmappedTestName { .. }));

    let err = db
        .import(&with_tests(json!([{"Name": "nts.foo.exec", "Data": ["fast"]}])), None)
        .unwrap_err();
    assert!(matches!(import_error(&err), ImportError::InvalidSampleValue { .. }));

    let err = db
        .import(&with_tests(json!([{"Name": "nts.foo.exec", "Data": ["NaN"]}])), None)
        .unwrap_err();
    assert!(matches!(
        import_error(&err),
        ImportError::InvalidSampleValue { field, .. } if field == "execution_time"
    ));

    assert_eq!(db.counts().unwrap().runs, 0);
}

#[test]
fn duplicates_return_the_original_run_before_names_are_checked() {
    let db = suite();
    let first = db
        .import(&simple("5", "2024-01-05 00:00:00", 1.0, 2.0), None)
        .unwrap();

    let mut resent = simple("5", "2024-01-05 00:00:00", 1.0, 2.0);
    resent.tests = serde_json::from_value(json!([{"Name": "bogus", "Data": [1.0]}])).unwrap();
    let again = db.import(&resent, None).unwrap();
    assert!(again.is_duplicate());
    assert_eq!(again.run.id, first.run.id);
    assert_eq!(db.counts().unwrap().runs, 1);
}

#[test]
fn report_for_another_suite_is_refused() {
    let db = suite();
    let r = report(
        json!({"Name": "bot"}),
        json!({"tag": "compile", "run_order": "1"}),
        "2024-01-01 00:00:00",
        json!([]),
    );
    let err = db.import(&r, None).unwrap_err();
    assert!(matches!(import_error(&err), ImportError::UnknownSuite { tag } if tag == "compile"));
}

#[test]
fn repeated_values_become_separate_samples() {
    let db = suite();
    let r = report(
        json!({"Name": "bot"}),
        json!({"tag": "nts", "run_order": "1", "cc": "clang"}),
        "2024-01-01 00:00:00",
        json!([
            {"Name": "nts.foo.exec", "Data": [1.0, 1.1]},
            {"Name": "nts.foo.exec", "Data": [1.2]},
            {"Name": "nts.foo.exec.status", "Data": [0, 1]},
            {"Name": "nts.foo.profile", "Data": [{"counters": {"cycles": 1200}}]},
        ]),
    );
    let res = db.import(&r, Some("lab-upload")).unwrap();
    assert_eq!(res.added_samples, 3);
    assert_eq!(res.added_profiles, 1);
    assert_eq!(res.imported_from.as_deref(), Some("lab-upload"));
    assert_eq!(res.run.parameters.get("cc"), Some(&json!("clang")));

    let samples = db.samples_for_run(res.run.id).unwrap();
    let exec: Vec<_> = samples
        .iter()
        .map(|s| s.values.get("execution_time").and_then(|v| v.as_real()))
        .collect();
    assert_eq!(exec, vec![Some(1.0), Some(1.1), Some(1.2)]);

    let profile_id = samples[0].profile_id.unwrap();
    assert!(samples[1].profile_id.is_none());
    let profile = db.get_profile(profile_id).unwrap();
    assert_eq!(profile.counters.get("cycles").map(String::as_str), Some("1200"));
    assert_eq!(profile.digest.len(), 64);

    // Provenance is kept from the first import only.
    let dup = db.import(&r, Some("mirror")).unwrap();
    assert!(dup.is_duplicate());
    assert_eq!(db.get_run(dup.run.id).unwrap().imported_from.as_deref(), Some("lab-upload"));
}

#[test]
fn duplicate_import_emits_structured_log() {
    let db = suite();
    let r = simple("3", "2024-05-01 00:00:00", 0.1, 0.2);
    db.import(&r, None).unwrap();

    let buffer = Arc::new(Mutex::new(Vec::new()));
    let buffer_clone = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_writer(move || MockWriter(buffer_clone.clone()))
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        db.import(&r, None).unwrap();
    });

    let output = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
    assert!(output.contains("\"event\":\"perfwatch.import.duplicate\""));
    assert!(output.contains("\"suite\":\"nts\""));
    assert!(!output.contains("perfwatch.import.completed"));
}

struct MockWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
