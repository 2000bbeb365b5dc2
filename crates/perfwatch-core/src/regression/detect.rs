//! Change detection over a freshly imported run.

use crate::metrics_api::{ChangeKind, Comparator, Comparison, ComparisonInput};
use crate::model::{FieldChange, Regression, RegressionState, RowId, Run, Sample};
use crate::regression::records::{ChangeFilter, NewFieldChange};
use crate::schema::{SampleField, StatusKind, SuiteSchema};
use crate::storage::{SuiteConn, SuiteDb};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Which revision a run is compared against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnalysisMode {
    /// The nearest earlier revision the machine reported at.
    #[default]
    Previous,
    /// A fixed baseline revision, resolved to the machine's closest report.
    Baseline { revision: Vec<String> },
}

/// What one analysis pass found and wrote.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Analysis {
    pub run_id: RowId,
    pub baseline_run_ids: Vec<RowId>,
    pub comparisons: usize,
    /// Changes suppressed because the binary hash did not change.
    pub hash_suppressed: usize,
    pub new_changes: Vec<FieldChange>,
    pub refreshed_changes: Vec<RowId>,
    pub new_regressions: Vec<Regression>,
    pub extended_regressions: Vec<RowId>,
    pub reverted_regressions: Vec<RowId>,
}

/// One side of a comparison for one (test, field).
#[derive(Debug, Default)]
struct Side {
    values: Vec<f64>,
    failed: bool,
    hashes: BTreeSet<String>,
}

fn collect_side(schema: &SuiteSchema, samples: &[Sample], test_id: RowId, field: &SampleField) -> Side {
    let status = schema.status_field_of(field);
    let hash = schema.hash_field();
    let mut side = Side::default();
    for s in samples.iter().filter(|s| s.test_id == test_id) {
        if let Some(v) = s.values.get(&field.name).and_then(|v| v.as_real()) {
            side.values.push(v);
        }
        if let Some(st) = status {
            if s.values.get(&st.name).and_then(|v| v.as_status()) == Some(StatusKind::Fail) {
                side.failed = true;
            }
        }
        if let Some(h) = hash {
            if let Some(digest) = s.values.get(&h.name).and_then(|v| v.as_hash()) {
                side.hashes.insert(digest.to_string());
            }
        }
    }
    side
}

/// Runs the comparator for one (test, field), applying the hash
/// short-circuit. Returns `None` when either side has no values.
fn compare_field(
    schema: &SuiteSchema,
    comparator: &dyn Comparator,
    before: &[Sample],
    after: &[Sample],
    test_id: RowId,
    field: &SampleField,
) -> anyhow::Result<Option<(Comparison, bool)>> {
    let prev = collect_side(schema, before, test_id, field);
    let cur = collect_side(schema, after, test_id, field);
    if prev.values.is_empty() || cur.values.is_empty() {
        return Ok(None);
    }
    let cmp = comparator.compare(&ComparisonInput {
        field,
        previous: &prev.values,
        current: &cur.values,
        previous_failed: prev.failed,
        current_failed: cur.failed,
    })?;
    let same_binary = !prev.hashes.is_empty() && prev.hashes == cur.hashes;
    if same_binary && cmp.kind != ChangeKind::Unchanged {
        let suppressed = cmp.kind.is_change();
        return Ok(Some((cmp.with_kind(ChangeKind::Unchanged), suppressed)));
    }
    Ok(Some((cmp, false)))
}

/// Strict overlap of two revision intervals given as comparator ranks.
pub fn intervals_overlap(a: (usize, usize), b: (usize, usize)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

/// What an analysis pass reads before any comparator runs.
struct Snapshot {
    run: Run,
    baseline: Vec<Run>,
    before: Vec<Sample>,
    after: Vec<Sample>,
    /// Active regressions on the run's machine, with the samples needed to
    /// judge whether each has reverted. `None` means it cannot have.
    reversions: Vec<(RowId, Option<Vec<ReversionEvidence>>)>,
}

/// Samples for one change of a regression: its start revision against the
/// machine's latest revision.
struct ReversionEvidence {
    test_id: RowId,
    field: String,
    before: Vec<Sample>,
    after: Vec<Sample>,
}

/// A comparison that reported a change, waiting to be persisted.
struct Candidate {
    test_id: RowId,
    field: String,
    kind: ChangeKind,
    old_value: f64,
    new_value: f64,
}

fn compare_run(
    schema: &SuiteSchema,
    comparator: &dyn Comparator,
    snap: &Snapshot,
    analysis: &mut Analysis,
) -> anyhow::Result<Vec<Candidate>> {
    let mut out = Vec::new();
    if snap.baseline.is_empty() {
        return Ok(out);
    }
    let test_ids: BTreeSet<RowId> = snap.after.iter().map(|s| s.test_id).collect();
    for test_id in test_ids {
        for field in schema.metric_fields() {
            let Some((cmp, suppressed)) =
                compare_field(schema, comparator, &snap.before, &snap.after, test_id, field)?
            else {
                continue;
            };
            analysis.comparisons += 1;
            if suppressed {
                analysis.hash_suppressed += 1;
            }
            if !cmp.kind.is_change() {
                continue;
            }
            let (Some(old_value), Some(new_value)) = (cmp.previous, cmp.current) else {
                continue;
            };
            out.push(Candidate {
                test_id,
                field: field.name.clone(),
                kind: cmp.kind,
                old_value,
                new_value,
            });
        }
    }
    Ok(out)
}

/// Whether every change behind a regression is back at its pre-regression
/// level.
fn reverted(
    schema: &SuiteSchema,
    comparator: &dyn Comparator,
    evidence: &[ReversionEvidence],
) -> anyhow::Result<bool> {
    for ev in evidence {
        let Some(field) = schema.sample_field(&ev.field) else {
            return Ok(false);
        };
        match compare_field(schema, comparator, &ev.before, &ev.after, ev.test_id, field)? {
            Some((cmp, _)) if !matches!(cmp.kind, ChangeKind::Regressed | ChangeKind::UnchangedFail) => {}
            _ => return Ok(false),
        }
    }
    Ok(!evidence.is_empty())
}

impl SuiteConn<'_> {
    fn baseline_runs(&self, run: &Run, mode: &AnalysisMode) -> anyhow::Result<Vec<Run>> {
        match mode {
            AnalysisMode::Previous => self.previous_runs(run, 1),
            AnalysisMode::Baseline { revision } => {
                let Some(base) = self.closest_previously_reported_run(run.machine_id, revision)? else {
                    return Ok(Vec::new());
                };
                let ranks = self.revision_ranks()?;
                let (Some(b), Some(r)) = (ranks.get(&base.revision_id), ranks.get(&run.revision_id)) else {
                    return Ok(Vec::new());
                };
                if b >= r {
                    return Ok(Vec::new());
                }
                Ok(vec![base])
            }
        }
    }

    fn interval(&self, ranks: &HashMap<RowId, usize>, fc: &FieldChange) -> Option<(usize, usize)> {
        Some((*ranks.get(&fc.start_revision_id)?, *ranks.get(&fc.end_revision_id)?))
    }

    /// Reads the run, its baseline and both sides' samples, plus reversion
    /// evidence for the machine's active regressions. The run is re-read, so
    /// the id may refer to a run imported before intervening imports.
    fn analysis_snapshot(&self, run_id: RowId, mode: &AnalysisMode) -> anyhow::Result<Snapshot> {
        let run = self.get_run(run_id)?;
        let baseline = self.baseline_runs(&run, mode)?;
        let (before, after) = if baseline.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            let current_ids: Vec<RowId> = self
                .runs_at(run.machine_id, &[run.revision_id])?
                .iter()
                .map(|r| r.id)
                .collect();
            let baseline_ids: Vec<RowId> = baseline.iter().map(|r| r.id).collect();
            (
                self.samples_for_runs(&baseline_ids, None)?,
                self.samples_for_runs(&current_ids, None)?,
            )
        };

        let mut reversions = Vec::new();
        for r in self.regressions(&[RegressionState::Active])? {
            let changes = self.regression_changes(r.id, true)?;
            if changes.iter().any(|fc| fc.machine_id == run.machine_id) {
                reversions.push((r.id, self.reversion_evidence(&changes)?));
            }
        }
        Ok(Snapshot {
            run,
            baseline,
            before,
            after,
            reversions,
        })
    }

    /// Samples needed to check each change for reversion. `None` when some
    /// change has no later revision on its machine to check against.
    fn reversion_evidence(&self, changes: &[FieldChange]) -> anyhow::Result<Option<Vec<ReversionEvidence>>> {
        if changes.is_empty() {
            return Ok(None);
        }
        let ranks = self.revision_ranks()?;
        let mut out = Vec::with_capacity(changes.len());
        for fc in changes {
            let Some(latest) = self.latest_run_on_machine(fc.machine_id)? else {
                return Ok(None);
            };
            let (Some(latest_rank), Some(end_rank)) =
                (ranks.get(&latest.revision_id), ranks.get(&fc.end_revision_id))
            else {
                return Ok(None);
            };
            if latest_rank <= end_rank {
                return Ok(None);
            }
            let before_ids: Vec<RowId> = self
                .runs_at(fc.machine_id, &[fc.start_revision_id])?
                .iter()
                .map(|r| r.id)
                .collect();
            let after_ids: Vec<RowId> = self
                .runs_at(fc.machine_id, &[latest.revision_id])?
                .iter()
                .map(|r| r.id)
                .collect();
            out.push(ReversionEvidence {
                test_id: fc.test_id,
                field: fc.field.clone(),
                before: self.samples_for_runs(&before_ids, Some(fc.test_id))?,
                after: self.samples_for_runs(&after_ids, Some(fc.test_id))?,
            });
        }
        Ok(Some(out))
    }

    /// Persists compared changes: refreshes overlapping ones, inserts the
    /// rest and folds regressed changes into regressions. Ranks are re-read
    /// here since revisions may have been inserted since the snapshot.
    fn record_changes(
        &self,
        run: &Run,
        start_revision_id: RowId,
        candidates: Vec<Candidate>,
        analysis: &mut Analysis,
    ) -> anyhow::Result<()> {
        let ranks = self.revision_ranks()?;
        let new_interval = match (ranks.get(&start_revision_id), ranks.get(&run.revision_id)) {
            (Some(a), Some(b)) => (*a, *b),
            _ => return Ok(()),
        };

        let mut regressed: Vec<FieldChange> = Vec::new();
        for c in candidates {
            let existing = self.field_changes(&ChangeFilter {
                machine_id: Some(run.machine_id),
                test_id: Some(c.test_id),
                field: Some(c.field.clone()),
                include_ignored: true,
                ..ChangeFilter::default()
            })?;
            let overlapping = existing.iter().find(|fc| {
                self.interval(&ranks, fc)
                    .is_some_and(|iv| intervals_overlap(iv, new_interval))
            });
            if let Some(fc) = overlapping {
                self.refresh_field_change(fc.id, c.old_value, c.new_value, run.id)?;
                analysis.refreshed_changes.push(fc.id);
                continue;
            }

            let fc = self.insert_field_change(&NewFieldChange {
                old_value: c.old_value,
                new_value: c.new_value,
                start_revision_id,
                end_revision_id: run.revision_id,
                test_id: c.test_id,
                machine_id: run.machine_id,
                field: c.field,
                run_id: Some(run.id),
            })?;
            tracing::debug!(
                event = "perfwatch.analysis.field_change",
                suite = %self.schema().name(),
                field_change_id = fc.id,
                test_id = fc.test_id,
                field = %fc.field,
                kind = ?c.kind,
                old_value = c.old_value,
                new_value = c.new_value,
            );
            if c.kind == ChangeKind::Regressed {
                regressed.push(fc.clone());
            }
            analysis.new_changes.push(fc);
        }

        self.fold_into_regressions(run, &ranks, regressed, analysis)
    }


    /// Attaches each regressed change to an open regression on the same
    /// machine with an overlapping interval, or groups the rest by interval
    /// into new DETECTED regressions.
    fn fold_into_regressions(
        &self,
        run: &Run,
        ranks: &HashMap<RowId, usize>,
        regressed: Vec<FieldChange>,
        analysis: &mut Analysis,
    ) -> anyhow::Result<()> {
        if regressed.is_empty() {
            return Ok(());
        }
        let open = self.regressions(&[
            RegressionState::Detected,
            RegressionState::Staged,
            RegressionState::Active,
        ])?;
        let mut open_intervals: Vec<(RowId, Vec<(usize, usize)>)> = Vec::new();
        for r in &open {
            let ivs: Vec<(usize, usize)> = self
                .regression_changes(r.id, true)?
                .iter()
                .filter(|fc| fc.machine_id == run.machine_id)
                .filter_map(|fc| self.interval(ranks, fc))
                .collect();
            if !ivs.is_empty() {
                open_intervals.push((r.id, ivs));
            }
        }

        let mut fresh: BTreeMap<(RowId, RowId), Vec<RowId>> = BTreeMap::new();
        for fc in regressed {
            let Some(iv) = self.interval(ranks, &fc) else {
                continue;
            };
            let target = open_intervals
                .iter()
                .find(|(_, ivs)| ivs.iter().any(|o| intervals_overlap(*o, iv)))
                .map(|(id, _)| *id);
            match target {
                Some(regression_id) => {
                    self.add_indicator(regression_id, fc.id)?;
                    if !analysis.extended_regressions.contains(&regression_id) {
                        analysis.extended_regressions.push(regression_id);
                    }
                }
                None => fresh
                    .entry((fc.start_revision_id, fc.end_revision_id))
                    .or_default()
                    .push(fc.id),
            }
        }
        for ids in fresh.values() {
            let r = self.new_regression(ids)?;
            tracing::info!(
                event = "perfwatch.regression.detected",
                suite = %self.schema().name(),
                regression_id = r.id,
                title = %r.title,
            );
            analysis.new_regressions.push(r);
        }
        Ok(())
    }

    /// Moves the given regressions to DETECTED_FIXED if they are still
    /// ACTIVE. Returns the ids that moved.
    fn mark_reverted(&self, ids: &[RowId]) -> anyhow::Result<Vec<RowId>> {
        let mut moved = Vec::new();
        for id in ids {
            let mut r = self.get_regression(*id)?;
            if r.state != RegressionState::Active {
                continue;
            }
            r.state = RegressionState::DetectedFixed;
            self.save_regression(&r)?;
            tracing::info!(
                event = "perfwatch.regression.reverted",
                suite = %self.schema().name(),
                regression_id = r.id,
            );
            moved.push(r.id);
        }
        Ok(moved)
    }
}

impl SuiteDb {
    /// One analysis pass: compares `run_id` against its baseline, persists
    /// new field changes, folds regressed changes into regressions and checks
    /// active regressions on the same machine for reversion.
    ///
    /// Samples are read up front and the comparator runs without holding the
    /// store, so imports proceed while a pass is comparing. All writes happen
    /// in one short transaction at the end; a failed pass leaves nothing
    /// behind.
    pub fn analyze_run(
        &self,
        run_id: RowId,
        comparator: &dyn Comparator,
        mode: &AnalysisMode,
    ) -> anyhow::Result<Analysis> {
        let snap = self.read(|c| c.analysis_snapshot(run_id, mode))?;
        let mut analysis = Analysis {
            run_id,
            baseline_run_ids: snap.baseline.iter().map(|r| r.id).collect(),
            ..Analysis::default()
        };

        let candidates = compare_run(self.schema(), comparator, &snap, &mut analysis)?;
        let mut reverted_ids = Vec::new();
        for (id, evidence) in &snap.reversions {
            if let Some(evidence) = evidence {
                if reverted(self.schema(), comparator, evidence)? {
                    reverted_ids.push(*id);
                }
            }
        }

        let start_revision_id = snap.baseline.first().map(|r| r.revision_id);
        let needs_write = !candidates.is_empty() || !reverted_ids.is_empty();
        if needs_write {
            self.write(|c| {
                if let Some(start) = start_revision_id {
                    c.record_changes(&snap.run, start, candidates, &mut analysis)?;
                }
                // A regression this run just extended has not reverted.
                reverted_ids.retain(|id| !analysis.extended_regressions.contains(id));
                analysis.reverted_regressions = c.mark_reverted(&reverted_ids)?;
                Ok(())
            })?;
        }

        tracing::info!(
            event = "perfwatch.analysis.completed",
            suite = %self.schema().name(),
            run_id,
            comparator = comparator.name(),
            comparisons = analysis.comparisons,
            new_changes = analysis.new_changes.len(),
            new_regressions = analysis.new_regressions.len(),
            reverted = analysis.reverted_regressions.len(),
        );
        Ok(analysis)
    }

    pub fn field_changes(&self, filter: &ChangeFilter) -> anyhow::Result<Vec<FieldChange>> {
        self.read(|c| c.field_changes(filter))
    }

    pub fn get_field_change(&self, id: RowId) -> anyhow::Result<FieldChange> {
        self.read(|c| c.get_field_change(id))
    }

    pub fn regression_changes(&self, regression_id: RowId, include_ignored: bool) -> anyhow::Result<Vec<FieldChange>> {
        self.read(|c| c.regression_changes(regression_id, include_ignored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_is_strict() {
        assert!(intervals_overlap((0, 2), (1, 3)));
        assert!(intervals_overlap((1, 3), (0, 5)));
        assert!(!intervals_overlap((0, 1), (1, 2)));
        assert!(!intervals_overlap((2, 3), (0, 1)));
    }

    #[test]
    fn analysis_mode_yaml_shape() {
        let m: AnalysisMode = serde_yaml::from_str("type: baseline\nrevision: ['100']").unwrap();
        assert_eq!(
            m,
            AnalysisMode::Baseline {
                revision: vec!["100".into()]
            }
        );
        let m: AnalysisMode = serde_yaml::from_str("type: previous").unwrap();
        assert_eq!(m, AnalysisMode::Previous);
    }
}
