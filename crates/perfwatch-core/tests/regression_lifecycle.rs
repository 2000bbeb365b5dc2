use chrono::{Duration, NaiveDate};
use perfwatch_core::errors::TriageError;
use perfwatch_core::model::{FieldChange, RegressionState};
use perfwatch_core::regression::{ChangeFilter, NewFieldChange, TriagePolicy};
use perfwatch_core::report::Report;
use perfwatch_core::schema::SuiteDefinition;
use perfwatch_core::{Store, SuiteDb};
use serde_json::json;

struct Fixture {
    db: SuiteDb,
    machine_id: i64,
    revisions: (i64, i64),
    run_id: i64,
}

impl Fixture {
    fn new() -> Self {
        let store = Store::memory().unwrap();
        store.init_schema().unwrap();
        let db = store.register_suite(&SuiteDefinition::nts()).unwrap();
        let mut runs = Vec::new();
        for (order, start) in [("1", "2024-02-01 00:00:00"), ("2", "2024-02-02 00:00:00")] {
            let report: Report = serde_json::from_value(json!({
                "Machine": {"Name": "bot"},
                "Run": {"Info": {"tag": "nts", "run_order": order}, "Start Time": start, "End Time": start},
                "Tests": [
                    {"Name": "nts.MultiSource/A.exec", "Data": [1.0]},
                    {"Name": "nts.MultiSource/B.exec", "Data": [1.0]},
                    {"Name": "nts.C.exec", "Data": [1.0]},
                ],
            }))
            .unwrap();
            runs.push(db.import(&report, None).unwrap().run);
        }
        Self {
            machine_id: runs[0].machine_id,
            revisions: (runs[0].revision_id, runs[1].revision_id),
            run_id: runs[1].id,
            db,
        }
    }

    fn change(&self, short: &str) -> FieldChange {
        self.change_on(short, self.machine_id, self.run_id)
    }

    fn change_on(&self, short: &str, machine_id: i64, run_id: i64) -> FieldChange {
        let test_id = self
            .db
            .tests()
            .unwrap()
            .into_iter()
            .find(|t| t.name.ends_with(short))
            .unwrap()
            .id;
        self.db
            .write(|c| {
                c.insert_field_change(&NewFieldChange {
                    old_value: 1.0,
                    new_value: 2.0,
                    start_revision_id: self.revisions.0,
                    end_revision_id: self.revisions.1,
                    test_id,
                    machine_id,
                    field: "execution_time".into(),
                    run_id: Some(run_id),
                })
            })
            .unwrap()
    }
}

fn triage_error(err: &anyhow::Error) -> &TriageError {
    err.downcast_ref::<TriageError>()
        .unwrap_or_else(|| panic!("expected a triage error, got {err:#}"))
}

#[test]
fn title_tracks_indicators() {
    let f = Fixture::new();
    let a = f.change("A");
    let b = f.change("B");

    let r = f.db.new_regression(&[a.id]).unwrap();
    assert_eq!(r.state, RegressionState::Detected);
    assert_eq!(r.title, "Regression of 1 benchmarks: A");

    let r = f.db.add_indicator(r.id, b.id).unwrap();
    assert_eq!(r.title, "Regression of 2 benchmarks: A, B");
    // Linking the same change twice is a no-op.
    let r = f.db.add_indicator(r.id, b.id).unwrap();
    assert_eq!(r.title, "Regression of 2 benchmarks: A, B");

    let r = f.db.remove_indicator(r.id, a.id).unwrap();
    assert_eq!(r.title, "Regression of 1 benchmarks: B");
}

#[test]
fn manual_title_survives_new_evidence() {
    let f = Fixture::new();
    let a = f.change("A");
    let c = f.change("C");
    let r = f.db.new_regression(&[a.id]).unwrap();

    let r = f.db.set_title(r.id, "Vectorizer slowdown").unwrap();
    assert!(!r.auto_title);
    let r = f.db.add_indicator(r.id, c.id).unwrap();
    assert_eq!(r.title, "Vectorizer slowdown");

    let r = f.db.restore_auto_title(r.id).unwrap();
    assert!(r.auto_title);
    assert_eq!(r.title, "Regression of 2 benchmarks: A, C");

    let r = f.db.set_bug(r.id, Some("PR12345")).unwrap();
    assert_eq!(f.db.get_regression(r.id).unwrap().bug.as_deref(), Some("PR12345"));
}

#[test]
fn staging_cooldown_gates_activation() {
    let f = Fixture::new();
    let a = f.change("A");
    let r = f.db.new_regression(&[a.id]).unwrap();
    let policy = TriagePolicy::default();

    let staged = f.db.stage(r.id, &policy).unwrap();
    assert_eq!(staged.state, RegressionState::Staged);
    let staged_at = f.db.get_regression(r.id).unwrap().staged_at.unwrap();
    assert_eq!(staged.staged_at, Some(staged_at));

    let err = f
        .db
        .write(|c| c.transition(r.id, RegressionState::Active, &policy, staged_at + Duration::hours(1)))
        .unwrap_err();
    match triage_error(&err) {
        TriageError::CooldownPending { remaining_secs } => assert_eq!(*remaining_secs, 23 * 3600),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(f.db.get_regression(r.id).unwrap().state, RegressionState::Staged);

    let promoted = f
        .db
        .write(|c| c.promote_staged(&policy, staged_at + Duration::hours(25)))
        .unwrap();
    assert_eq!(promoted.len(), 1);
    assert_eq!(promoted[0].state, RegressionState::Active);
    assert_eq!(promoted[0].staged_at, None);
}

#[test]
fn terminal_states_are_final() {
    let f = Fixture::new();
    let a = f.change("A");
    let r = f.db.new_regression(&[a.id]).unwrap();
    let policy = TriagePolicy::from_secs(0);

    f.db.transition(r.id, RegressionState::Active, &policy).unwrap();
    f.db.transition(r.id, RegressionState::Fixed, &policy).unwrap();
    for to in [RegressionState::Active, RegressionState::Detected, RegressionState::Ignored] {
        let err = f.db.transition(r.id, to, &policy).unwrap_err();
        assert!(matches!(triage_error(&err), TriageError::InvalidTransition { .. }));
    }

    // DETECTED_FIXED is only reached by the engine.
    let b = f.change("B");
    let r2 = f.db.new_regression(&[b.id]).unwrap();
    let err = f
        .db
        .transition(r2.id, RegressionState::DetectedFixed, &policy)
        .unwrap_err();
    assert!(matches!(triage_error(&err), TriageError::InvalidTransition { .. }));
}

#[test]
fn merge_links_evidence_to_target_and_retires_sources() {
    let f = Fixture::new();
    let a = f.change("A");
    let b = f.change("B");
    let target = f.db.new_regression(&[a.id]).unwrap();
    let source = f.db.new_regression(&[b.id]).unwrap();

    let merged = f.db.merge_regressions(target.id, &[source.id]).unwrap();
    assert_eq!(merged.title, "Regression of 2 benchmarks: A, B");
    assert_eq!(f.db.regression_changes(target.id, true).unwrap().len(), 2);

    // The source is retired but keeps its own link as history.
    let retired = f.db.get_regression(source.id).unwrap();
    assert_eq!(retired.state, RegressionState::Ignored);
    assert_eq!(f.db.regression_changes(source.id, true).unwrap().len(), 1);

    let open = f.db.regressions(&[RegressionState::Detected]).unwrap();
    assert_eq!(open.iter().map(|r| r.id).collect::<Vec<_>>(), vec![target.id]);
}

#[test]
fn ignored_changes_leave_default_views() {
    let f = Fixture::new();
    let a = f.change("A");
    let b = f.change("B");
    let r = f.db.new_regression(&[a.id, b.id]).unwrap();

    f.db.ignore_change(b.id).unwrap();
    let visible = f.db.field_changes(&ChangeFilter::machine(f.machine_id)).unwrap();
    assert_eq!(visible.iter().map(|fc| fc.id).collect::<Vec<_>>(), vec![a.id]);
    let all = f
        .db
        .field_changes(&ChangeFilter {
            include_ignored: true,
            ..ChangeFilter::machine(f.machine_id)
        })
        .unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(f.db.regression_changes(r.id, false).unwrap().len(), 1);
    assert_eq!(f.db.regression_changes(r.id, true).unwrap().len(), 2);

    // Nothing is deleted.
    assert_eq!(f.db.get_field_change(b.id).unwrap().id, b.id);
    assert_eq!(f.db.get_regression(r.id).unwrap().state, RegressionState::Detected);

    assert!(f.db.unignore_change(b.id).unwrap());
    assert_eq!(f.db.field_changes(&ChangeFilter::machine(f.machine_id)).unwrap().len(), 2);
}

#[test]
fn regressions_are_queried_by_machine_and_time() {
    let f = Fixture::new();
    let report: Report = serde_json::from_value(json!({
        "Machine": {"Name": "bot-2"},
        "Run": {"Info": {"tag": "nts", "run_order": "2"}, "Start Time": "2024-03-05 12:00:00", "End Time": "2024-03-05 12:00:00"},
        "Tests": [{"Name": "nts.C.exec", "Data": [1.0]}],
    }))
    .unwrap();
    let other = f.db.import(&report, None).unwrap().run;
    assert_ne!(other.machine_id, f.machine_id);

    let a = f.change("A");
    let b = f.change("B");
    let c = f.change_on("C", other.machine_id, other.id);
    let here = f.db.new_regression(&[a.id]).unwrap();
    let there = f.db.new_regression(&[c.id]).unwrap();
    let ignored = f.db.new_regression(&[b.id]).unwrap();
    f.db.ignore_change(b.id).unwrap();
    f.db.transition(there.id, RegressionState::Active, &TriagePolicy::from_secs(0))
        .unwrap();

    let ids = |rs: Vec<perfwatch_core::model::Regression>| rs.into_iter().map(|r| r.id).collect::<Vec<_>>();
    assert_eq!(ids(f.db.regressions_for_machine(f.machine_id, &[]).unwrap()), vec![here.id]);
    assert_eq!(ids(f.db.regressions_for_machine(other.machine_id, &[]).unwrap()), vec![there.id]);
    assert!(f
        .db
        .regressions_for_machine(other.machine_id, &[RegressionState::Detected])
        .unwrap()
        .is_empty());
    assert_eq!(f.db.regressions(&[]).unwrap().len(), 3);
    assert!(ids(f.db.regressions(&[]).unwrap()).contains(&ignored.id));

    let day = |d: u32| NaiveDate::from_ymd_opt(2024, 2, d).unwrap().and_hms_opt(0, 0, 0).unwrap();
    assert_eq!(ids(f.db.regressions_between(day(1), day(3), &[]).unwrap()), vec![here.id]);
    let march = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
    let april = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
    assert_eq!(
        ids(f.db.regressions_between(march, april, &[RegressionState::Active]).unwrap()),
        vec![there.id]
    );
    assert!(f.db.regressions_between(day(10), day(20), &[]).unwrap().is_empty());
}
