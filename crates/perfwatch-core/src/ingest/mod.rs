//! Report ingestion.
//!
//! One report is imported in one write transaction: machine, revision and run
//! are resolved first, and a run that already existed short-circuits the
//! import before any sample is touched.

use crate::errors::{closest_match, ImportError};
use crate::model::{Machine, Revision, RowId, Run};
use crate::report::{parse_timestamp, Report, TestReport, TAG_KEY};
use crate::schema::{FieldValue, SampleField, SuiteSchema, PROFILE_SUFFIX};
use crate::storage::{SuiteConn, SuiteDb};
use serde::Serialize;
use std::collections::HashMap;

/// What a reported test-name suffix addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldTarget<'s> {
    Field(&'s SampleField),
    Profile,
}

/// Splits a tag-stripped reported name into the test name and the field it
/// reports. The longest matching external key wins.
pub fn resolve_test_name<'s>(
    schema: &'s SuiteSchema,
    name: &str,
) -> Result<(String, FieldTarget<'s>), ImportError> {
    let mut best: Option<(usize, FieldTarget<'s>)> = None;
    if name.ends_with(PROFILE_SUFFIX) {
        best = Some((PROFILE_SUFFIX.len(), FieldTarget::Profile));
    }
    for f in schema.sample_fields() {
        let key = f.external_key.as_str();
        if key.is_empty() || !name.ends_with(key) {
            continue;
        }
        if best.map_or(true, |(len, _)| key.len() > len) {
            best = Some((key.len(), FieldTarget::Field(f)));
        }
    }
    match best {
        Some((len, target)) if len < name.len() => Ok((name[..name.len() - len].to_string(), target)),
        _ => {
            let suffix = name.find('.').map(|i| &name[i..]).unwrap_or(name);
            let keys = schema
                .sample_fields()
                .iter()
                .map(|f| f.external_key.as_str())
                .chain(std::iter::once(PROFILE_SUFFIX));
            Err(ImportError::UnmappedTestName {
                name: name.to_string(),
                suggestion: closest_match(suffix, keys),
            })
        }
    }
}

/// Outcome of importing one report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportResult {
    pub suite: String,
    /// False when the run already existed: a duplicate submission.
    pub created: bool,
    pub run: Run,
    pub machine_created: bool,
    pub revision_created: bool,
    pub added_tests: usize,
    pub added_samples: usize,
    pub added_profiles: usize,
    pub imported_from: Option<String>,
}

impl ImportResult {
    pub fn is_duplicate(&self) -> bool {
        !self.created
    }
}

/// Sample values for one (test, positional index) slot.
struct Slot {
    values: Vec<FieldValue>,
    profile: Option<serde_json::Value>,
}

struct TestGroup {
    name: String,
    slots: Vec<Slot>,
}

impl TestGroup {
    fn slot(&mut self, index: usize, width: usize) -> &mut Slot {
        while self.slots.len() <= index {
            self.slots.push(Slot {
                values: vec![FieldValue::Null; width],
                profile: None,
            });
        }
        &mut self.slots[index]
    }
}

/// Reported values concatenated per full reported name, in first-seen order.
fn collect_reported<'r>(
    tag: &str,
    tests: &'r [TestReport],
) -> Result<Vec<(String, Vec<&'r serde_json::Value>)>, ImportError> {
    let prefix = format!("{}.", tag);
    let mut order: Vec<(String, Vec<&'r serde_json::Value>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for t in tests {
        if !t.info.is_empty() {
            return Err(ImportError::UnsupportedTestInfo {
                name: t.name.clone(),
            });
        }
        let Some(name) = t.name.strip_prefix(&prefix) else {
            return Err(ImportError::MisnamedTest {
                name: t.name.clone(),
                tag: tag.to_string(),
            });
        };
        let slot = *index.entry(name.to_string()).or_insert_with(|| {
            order.push((name.to_string(), Vec::new()));
            order.len() - 1
        });
        order[slot].1.extend(t.data.iter());
    }
    Ok(order)
}

fn group_samples(
    schema: &SuiteSchema,
    reported: Vec<(String, Vec<&serde_json::Value>)>,
) -> Result<Vec<TestGroup>, ImportError> {
    let width = schema.sample_fields().len();
    let mut groups: Vec<TestGroup> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();
    for (reported_name, data) in reported {
        let (test_name, target) = resolve_test_name(schema, &reported_name)?;
        let gi = *by_name.entry(test_name.clone()).or_insert_with(|| {
            groups.push(TestGroup {
                name: test_name.clone(),
                slots: Vec::new(),
            });
            groups.len() - 1
        });
        for (i, raw) in data.into_iter().enumerate() {
            let slot = groups[gi].slot(i, width);
            match target {
                FieldTarget::Profile => slot.profile = Some(raw.clone()),
                FieldTarget::Field(f) => {
                    slot.values[f.index] = f.sample_type.parse_value(raw).map_err(|reason| {
                        ImportError::InvalidSampleValue {
                            test: test_name.clone(),
                            field: f.name.clone(),
                            reason,
                        }
                    })?;
                }
            }
        }
    }
    Ok(groups)
}

impl SuiteConn<'_> {
    /// Imports one report into this suite. Must run inside the suite write
    /// transaction; an error leaves nothing behind once it rolls back.
    pub fn import_report(&self, report: &Report) -> anyhow::Result<ImportResult> {
        let schema = self.schema();
        let tag = report.tag()?;
        if tag != schema.name() {
            return Err(ImportError::UnknownSuite { tag }.into());
        }
        let start = parse_timestamp(&report.run.start_time)?;
        let end = parse_timestamp(&report.run.end_time)?;

        let mut run_info = report.run.info.clone();
        run_info.remove(TAG_KEY);
        let revision_values = self.take_revision_values(&mut run_info)?;

        let (machine, machine_created) =
            self.get_or_create_machine(&report.machine.name, &report.machine.info)?;
        let (revision, revision_created) = self.get_or_create_revision(&revision_values)?;
        let (run, created) = self.get_or_create_run(&machine, &revision, &run_info, &start, &end)?;
        if !created {
            return Ok(ImportResult {
                suite: schema.name().to_string(),
                created: false,
                imported_from: run.imported_from.clone(),
                run,
                machine_created,
                revision_created,
                added_tests: 0,
                added_samples: 0,
                added_profiles: 0,
            });
        }

        // Names are checked only for new runs; a bad one rolls the run back.
        let groups = group_samples(schema, collect_reported(&tag, &report.tests)?)?;
        let (added_tests, added_samples, added_profiles) = self.import_samples(&run, groups)?;
        Ok(ImportResult {
            suite: schema.name().to_string(),
            created: true,
            imported_from: None,
            run,
            machine_created,
            revision_created,
            added_tests,
            added_samples,
            added_profiles,
        })
    }

    fn import_samples(&self, run: &Run, groups: Vec<TestGroup>) -> anyhow::Result<(usize, usize, usize)> {
        let mut tests = self.tests_by_name()?;
        let mut profiles: HashMap<String, RowId> = HashMap::new();
        let (mut added_tests, mut added_samples) = (0, 0);
        for group in groups {
            let existing = tests.get(&group.name).map(|t| t.id);
            let test_id = match existing {
                Some(id) => id,
                None => {
                    let t = self.create_test(&group.name)?;
                    tracing::debug!(
                        event = "perfwatch.import.new_test",
                        suite = %self.schema().name(),
                        test = %t.name,
                    );
                    added_tests += 1;
                    let id = t.id;
                    tests.insert(group.name.clone(), t);
                    id
                }
            };
            for slot in group.slots {
                let profile_id = match &slot.profile {
                    None => None,
                    Some(payload) => {
                        let key = payload.to_string();
                        match profiles.get(&key) {
                            Some(id) => Some(*id),
                            None => {
                                let p = self.create_profile(payload)?;
                                profiles.insert(key, p.id);
                                Some(p.id)
                            }
                        }
                    }
                };
                self.insert_sample(run.id, test_id, profile_id, &slot.values)?;
                added_samples += 1;
            }
        }
        Ok((added_tests, added_samples, profiles.len()))
    }
}

impl SuiteDb {
    /// Imports one report in a single IMMEDIATE transaction. `imported_from`
    /// is recorded on the run only when the run is new.
    pub fn import(&self, report: &Report, imported_from: Option<&str>) -> anyhow::Result<ImportResult> {
        let result = self.write(|c| {
            let mut result = c.import_report(report)?;
            if let (true, Some(source)) = (result.created, imported_from) {
                c.set_imported_from(result.run.id, source)?;
                result.run.imported_from = Some(source.to_string());
                result.imported_from = Some(source.to_string());
            }
            Ok(result)
        })?;

        if result.created {
            tracing::info!(
                event = "perfwatch.import.completed",
                suite = %result.suite,
                run_id = result.run.id,
                machine_id = result.run.machine_id,
                revision_id = result.run.revision_id,
                added_tests = result.added_tests,
                added_samples = result.added_samples,
            );
        } else {
            tracing::info!(
                event = "perfwatch.import.duplicate",
                suite = %result.suite,
                run_id = result.run.id,
            );
        }
        Ok(result)
    }

    pub fn machine_of(&self, run: &Run) -> anyhow::Result<Machine> {
        self.get_machine(run.machine_id)
    }

    pub fn revision_of(&self, run: &Run) -> anyhow::Result<Revision> {
        self.read(|c| c.get_revision(run.revision_id))
    }
}
