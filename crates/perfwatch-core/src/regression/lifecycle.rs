//! Regression triage: creation, state transitions and indicator edits.

use crate::errors::TriageError;
use crate::model::{Regression, RegressionIndicator, RegressionState, RowId};
use crate::storage::{SuiteConn, SuiteDb};
use chrono::{Duration, NaiveDateTime, Timelike};

/// Title a regression carries until its first rebuild.
pub const PLACEHOLDER_TITLE: &str = "Regression of 0 benchmarks";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriagePolicy {
    /// Time a staged regression waits before it may become active.
    pub staging_cooldown: Duration,
}

impl Default for TriagePolicy {
    fn default() -> Self {
        Self {
            staging_cooldown: Duration::hours(24),
        }
    }
}

impl TriagePolicy {
    /// Cooldowns past what `Duration` can hold saturate to its maximum.
    pub fn from_secs(secs: u64) -> Self {
        let staging_cooldown = i64::try_from(secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        Self { staging_cooldown }
    }

    /// Seconds left before `staged_at` clears the cooldown, if any. A
    /// cooldown that ends past the calendar never clears.
    pub fn remaining(&self, staged_at: Option<NaiveDateTime>, now: NaiveDateTime) -> Option<i64> {
        let staged_at = staged_at?;
        let Some(ready_at) = staged_at.checked_add_signed(self.staging_cooldown) else {
            return Some(i64::MAX);
        };
        let left = ready_at.signed_duration_since(now).num_seconds();
        (left > 0).then_some(left)
    }
}

pub fn transition_allowed(from: RegressionState, to: RegressionState) -> bool {
    use RegressionState::*;
    matches!(
        (from, to),
        (Detected, Staged | Active | Ntbf | Ignored | Fixed)
            | (Staged, Active | Detected | Ntbf | Ignored | Fixed)
            | (Active, Ntbf | Ignored | Fixed | DetectedFixed)
            | (DetectedFixed, Fixed | Active)
    )
}

fn invalid(from: RegressionState, to: RegressionState) -> TriageError {
    TriageError::InvalidTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
}

impl SuiteConn<'_> {
    /// Creates a DETECTED regression over the given field changes.
    pub fn new_regression(&self, field_change_ids: &[RowId]) -> anyhow::Result<Regression> {
        let r = self.create_regression(PLACEHOLDER_TITLE, RegressionState::Detected)?;
        for fc in field_change_ids {
            self.get_field_change(*fc)?;
            self.link_indicator(r.id, *fc)?;
        }
        self.rebuild_title(r.id)
    }

    pub fn transition(
        &self,
        id: RowId,
        to: RegressionState,
        policy: &TriagePolicy,
        now: NaiveDateTime,
    ) -> anyhow::Result<Regression> {
        let mut r = self.get_regression(id)?;
        let from = r.state;
        if !transition_allowed(from, to) {
            return Err(invalid(from, to).into());
        }
        if from == RegressionState::Staged && to == RegressionState::Active {
            if let Some(remaining_secs) = policy.remaining(r.staged_at, now) {
                return Err(TriageError::CooldownPending { remaining_secs }.into());
            }
        }
        r.state = to;
        r.staged_at = (to == RegressionState::Staged).then_some(now);
        self.save_regression(&r)?;
        tracing::info!(
            event = "perfwatch.regression.transition",
            suite = %self.schema().name(),
            regression_id = id,
            from = %from,
            to = %to,
        );
        Ok(r)
    }

    /// Moves every staged regression whose cooldown has elapsed to ACTIVE.
    pub fn promote_staged(
        &self,
        policy: &TriagePolicy,
        now: NaiveDateTime,
    ) -> anyhow::Result<Vec<Regression>> {
        let mut promoted = Vec::new();
        for r in self.regressions(&[RegressionState::Staged])? {
            if policy.remaining(r.staged_at, now).is_none() {
                promoted.push(self.transition(r.id, RegressionState::Active, policy, now)?);
            }
        }
        Ok(promoted)
    }

    pub fn add_indicator(
        &self,
        regression_id: RowId,
        field_change_id: RowId,
    ) -> anyhow::Result<(Regression, RegressionIndicator)> {
        self.get_regression(regression_id)?;
        self.get_field_change(field_change_id)?;
        let (ri, _) = self.link_indicator(regression_id, field_change_id)?;
        Ok((self.rebuild_title(regression_id)?, ri))
    }

    pub fn remove_indicator(&self, regression_id: RowId, field_change_id: RowId) -> anyhow::Result<Regression> {
        self.get_regression(regression_id)?;
        self.unlink_indicator(regression_id, field_change_id)?;
        self.rebuild_title(regression_id)
    }

    /// Replaces the title by hand; later rebuilds keep it.
    pub fn set_title(&self, regression_id: RowId, title: &str) -> anyhow::Result<Regression> {
        let mut r = self.get_regression(regression_id)?;
        r.title = title.to_string();
        r.auto_title = false;
        self.save_regression(&r)?;
        Ok(r)
    }

    pub fn restore_auto_title(&self, regression_id: RowId) -> anyhow::Result<Regression> {
        let mut r = self.get_regression(regression_id)?;
        r.auto_title = true;
        self.save_regression(&r)?;
        self.rebuild_title(regression_id)
    }

    pub fn set_bug(&self, regression_id: RowId, bug: Option<&str>) -> anyhow::Result<Regression> {
        let mut r = self.get_regression(regression_id)?;
        r.bug = bug.map(str::to_string);
        self.save_regression(&r)?;
        Ok(r)
    }

    /// Links every indicator of `sources` into `target` and retires the
    /// sources as IGNORED. Sources keep their own indicators.
    pub fn merge_regressions(&self, target: RowId, sources: &[RowId]) -> anyhow::Result<Regression> {
        let t = self.get_regression(target)?;
        if t.state.is_terminal() {
            return Err(invalid(t.state, t.state).into());
        }
        for &src in sources {
            if src == target {
                continue;
            }
            let mut s = self.get_regression(src)?;
            if s.state.is_terminal() {
                return Err(invalid(s.state, RegressionState::Ignored).into());
            }
            for ri in self.indicators(src)? {
                self.link_indicator(target, ri.field_change_id)?;
            }
            s.state = RegressionState::Ignored;
            s.staged_at = None;
            self.save_regression(&s)?;
        }
        tracing::info!(
            event = "perfwatch.regression.merged",
            suite = %self.schema().name(),
            regression_id = target,
            merged = ?sources,
        );
        self.rebuild_title(target)
    }
}

/// Current UTC time at the one-second precision timestamps are stored with.
fn now() -> NaiveDateTime {
    let t = chrono::Utc::now().naive_utc();
    t.with_nanosecond(0).unwrap_or(t)
}

impl SuiteDb {
    pub fn get_regression(&self, id: RowId) -> anyhow::Result<Regression> {
        self.read(|c| c.get_regression(id))
    }

    /// Regressions in any of `states`; all regressions when empty.
    pub fn regressions(&self, states: &[RegressionState]) -> anyhow::Result<Vec<Regression>> {
        self.read(|c| c.regressions(states))
    }

    pub fn regressions_for_machine(
        &self,
        machine_id: RowId,
        states: &[RegressionState],
    ) -> anyhow::Result<Vec<Regression>> {
        self.read(|c| c.regressions_for_machine(machine_id, states))
    }

    pub fn regressions_between(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
        states: &[RegressionState],
    ) -> anyhow::Result<Vec<Regression>> {
        self.read(|c| c.regressions_between(from, to, states))
    }

    pub fn new_regression(&self, field_change_ids: &[RowId]) -> anyhow::Result<Regression> {
        self.write(|c| c.new_regression(field_change_ids))
    }

    pub fn transition(
        &self,
        id: RowId,
        to: RegressionState,
        policy: &TriagePolicy,
    ) -> anyhow::Result<Regression> {
        self.write(|c| c.transition(id, to, policy, now()))
    }

    pub fn stage(&self, id: RowId, policy: &TriagePolicy) -> anyhow::Result<Regression> {
        self.transition(id, RegressionState::Staged, policy)
    }

    pub fn promote_staged(&self, policy: &TriagePolicy) -> anyhow::Result<Vec<Regression>> {
        self.write(|c| c.promote_staged(policy, now()))
    }

    pub fn add_indicator(&self, regression_id: RowId, field_change_id: RowId) -> anyhow::Result<Regression> {
        self.write(|c| c.add_indicator(regression_id, field_change_id).map(|(r, _)| r))
    }

    pub fn remove_indicator(&self, regression_id: RowId, field_change_id: RowId) -> anyhow::Result<Regression> {
        self.write(|c| c.remove_indicator(regression_id, field_change_id))
    }

    pub fn set_title(&self, regression_id: RowId, title: &str) -> anyhow::Result<Regression> {
        self.write(|c| c.set_title(regression_id, title))
    }

    pub fn restore_auto_title(&self, regression_id: RowId) -> anyhow::Result<Regression> {
        self.write(|c| c.restore_auto_title(regression_id))
    }

    pub fn set_bug(&self, regression_id: RowId, bug: Option<&str>) -> anyhow::Result<Regression> {
        self.write(|c| c.set_bug(regression_id, bug))
    }

    pub fn merge_regressions(&self, target: RowId, sources: &[RowId]) -> anyhow::Result<Regression> {
        self.write(|c| c.merge_regressions(target, sources))
    }

    pub fn ignore_change(&self, field_change_id: RowId) -> anyhow::Result<()> {
        self.write(|c| c.ignore_change(field_change_id).map(|_| ()))
    }

    pub fn unignore_change(&self, field_change_id: RowId) -> anyhow::Result<bool> {
        self.write(|c| c.unignore_change(field_change_id))
    }
}
