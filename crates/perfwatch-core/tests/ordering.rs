use perfwatch_core::ordering::{compare_revisions, compare_values, Direction};
use perfwatch_core::report::Report;
use perfwatch_core::schema::SuiteDefinition;
use perfwatch_core::{Store, SuiteDb};
use serde_json::json;
use std::cmp::Ordering;

fn suite() -> SuiteDb {
    let store = Store::memory().unwrap();
    store.init_schema().unwrap();
    store.register_suite(&SuiteDefinition::nts()).unwrap()
}

fn revision(db: &SuiteDb, value: &str) -> i64 {
    db.write(|c| c.get_or_create_revision(&[value.to_string()]))
        .unwrap()
        .0
        .id
}

fn sequence(db: &SuiteDb) -> Vec<String> {
    db.revision_sequence()
        .unwrap()
        .iter()
        .map(|r| r.as_ordered_string())
        .collect()
}

#[test]
fn dotted_versions_compare_numerically() {
    assert_eq!(compare_values("1.2.9", "1.2.10"), Ordering::Less);
    assert_eq!(compare_values("1.2.10", "1.3"), Ordering::Less);
    assert_eq!(compare_values("1.2", "1.2.0"), Ordering::Less);
    assert_eq!(compare_values("99", "100"), Ordering::Less);
    assert_eq!(compare_values("r100", "r99"), Ordering::Less);
    assert_eq!(compare_values("1.x", "1.2"), Ordering::Greater);
    assert_eq!(compare_revisions(&["2", "a"], &["2", "b"]), Ordering::Less);
    assert_eq!(compare_revisions(&["3", "a"], &["2", "z"]), Ordering::Greater);
}

#[test]
fn out_of_order_arrival_keeps_chain_sorted() {
    let db = suite();
    for v in ["1.3", "1.2.9", "2", "1.2.10", "0.9"] {
        revision(&db, v);
    }
    assert_eq!(sequence(&db), vec!["0.9", "1.2.9", "1.2.10", "1.3", "2"]);
    assert!(db.verify_revision_chain().unwrap());

    // Re-resolving an existing revision neither duplicates nor relinks.
    let again = db
        .write(|c| c.get_or_create_revision(&["1.3".to_string()]))
        .unwrap();
    assert!(!again.1);
    assert_eq!(db.counts().unwrap().revisions, 5);
}

#[test]
fn padded_values_sort_by_their_content() {
    assert_eq!(compare_values("1.3 ", "1.10"), Ordering::Less);
    assert_eq!(compare_values(" 3", "10"), Ordering::Less);

    let db = suite();
    for v in ["10", " 3", "2"] {
        revision(&db, v);
    }
    assert_eq!(sequence(&db), vec!["2", " 3", "10"]);
    assert!(db.verify_revision_chain().unwrap());
}

#[test]
fn chain_ends_are_open() {
    let db = suite();
    let a = revision(&db, "10");
    let b = revision(&db, "5");
    let (first, last) = db
        .read(|c| Ok((c.get_revision(b)?, c.get_revision(a)?)))
        .unwrap();
    assert_eq!(first.previous_id, None);
    assert_eq!(first.next_id, Some(a));
    assert_eq!(last.previous_id, Some(b));
    assert_eq!(last.next_id, None);
}

fn submit(db: &SuiteDb, machine: &str, order: &str, start: &str) -> i64 {
    let report: Report = serde_json::from_value(json!({
        "Machine": {"Name": machine},
        "Run": {
            "Info": {"tag": "nts", "run_order": order},
            "Start Time": start,
            "End Time": start,
        },
        "Tests": [],
    }))
    .unwrap();
    db.import(&report, None).unwrap().run.id
}

#[test]
fn adjacent_runs_follow_machine_revisions() {
    let db = suite();
    let r1 = submit(&db, "m1", "1", "2024-01-01 00:00:00");
    let r3 = submit(&db, "m1", "3", "2024-01-03 00:00:00");
    let r5 = submit(&db, "m1", "5", "2024-01-05 00:00:00");
    // Another machine's revision sits between but is not adjacent for m1.
    submit(&db, "m2", "4", "2024-01-04 00:00:00");
    let r5b = submit(&db, "m1", "5", "2024-01-05 01:00:00");

    let run5 = db.get_run(r5).unwrap();
    let ids = |runs: Vec<perfwatch_core::model::Run>| runs.iter().map(|r| r.id).collect::<Vec<_>>();

    assert!(db.adjacent_runs(&run5, 0, Direction::Back).unwrap().is_empty());
    assert_eq!(ids(db.adjacent_runs(&run5, 1, Direction::Back).unwrap()), vec![r3]);
    assert_eq!(ids(db.adjacent_runs(&run5, 5, Direction::Back).unwrap()), vec![r3, r1]);

    let run1 = db.get_run(r1).unwrap();
    assert!(db.adjacent_runs(&run1, 3, Direction::Back).unwrap().is_empty());
    assert_eq!(ids(db.adjacent_runs(&run1, 1, Direction::Forward).unwrap()), vec![r3]);
    assert_eq!(
        ids(db.adjacent_runs(&run1, 2, Direction::Forward).unwrap()),
        vec![r3, r5, r5b]
    );
    assert!(db.adjacent_runs(&run5, 2, Direction::Forward).unwrap().is_empty());
}

#[test]
fn closest_reported_run_rounds_up() {
    let db = suite();
    submit(&db, "m1", "100", "2024-01-01 00:00:00");
    let r110 = submit(&db, "m1", "110", "2024-01-02 00:00:00");
    let r110b = submit(&db, "m1", "110", "2024-01-02 06:00:00");
    let machine_id = db.get_run(r110).unwrap().machine_id;

    let found = db
        .read(|c| c.closest_previously_reported_run(machine_id, &["105".to_string()]))
        .unwrap()
        .unwrap();
    assert_eq!(found.id, r110b);
    let none = db
        .read(|c| c.closest_previously_reported_run(machine_id, &["200".to_string()]))
        .unwrap();
    assert!(none.is_none());
}
