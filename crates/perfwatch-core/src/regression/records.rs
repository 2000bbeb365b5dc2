//! Field change and regression rows.

use crate::errors::NotFound;
use crate::model::{ChangeIgnore, FieldChange, Regression, RegressionIndicator, RegressionState, RowId};
use crate::report::format_timestamp;
use crate::storage::rows::{parse_stored_time, placeholders};
use crate::storage::SuiteConn;
use chrono::NaiveDateTime;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

const FIELD_CHANGE_COLUMNS: &str =
    "fc.id, fc.old_value, fc.new_value, fc.start_revision_id, fc.end_revision_id, fc.test_id, fc.machine_id, fc.field, fc.run_id";
const REGRESSION_COLUMNS: &str = "id, title, bug, state, auto_title, staged_at";

/// Selection over field changes. Ignored changes are left out unless asked
/// for; the time range applies to the start time of the run the change was
/// last observed in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeFilter {
    pub machine_id: Option<RowId>,
    pub test_id: Option<RowId>,
    pub field: Option<String>,
    pub since: Option<NaiveDateTime>,
    pub until: Option<NaiveDateTime>,
    pub include_ignored: bool,
}

impl ChangeFilter {
    pub fn machine(machine_id: RowId) -> Self {
        Self {
            machine_id: Some(machine_id),
            ..Self::default()
        }
    }
}

fn field_change_from_row(row: &Row<'_>) -> rusqlite::Result<FieldChange> {
    Ok(FieldChange {
        id: row.get(0)?,
        old_value: row.get(1)?,
        new_value: row.get(2)?,
        start_revision_id: row.get(3)?,
        end_revision_id: row.get(4)?,
        test_id: row.get(5)?,
        machine_id: row.get(6)?,
        field: row.get(7)?,
        run_id: row.get(8)?,
    })
}

fn regression_from_row(row: &Row<'_>) -> rusqlite::Result<Regression> {
    let code: i64 = row.get(3)?;
    let state = RegressionState::from_code(code).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Integer,
            format!("unknown regression state {}", code).into(),
        )
    })?;
    let staged_at: Option<String> = row.get(5)?;
    Ok(Regression {
        id: row.get(0)?,
        title: row.get(1)?,
        bug: row.get(2)?,
        state,
        auto_title: row.get(4)?,
        staged_at: staged_at.map(|s| parse_stored_time(5, &s)).transpose()?,
    })
}

/// A field change not yet stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFieldChange {
    pub old_value: f64,
    pub new_value: f64,
    pub start_revision_id: RowId,
    pub end_revision_id: RowId,
    pub test_id: RowId,
    pub machine_id: RowId,
    pub field: String,
    pub run_id: Option<RowId>,
}

impl SuiteConn<'_> {
    // --- Field changes ---

    pub fn insert_field_change(&self, fc: &NewFieldChange) -> anyhow::Result<FieldChange> {
        self.conn().execute(
            &format!(
                "INSERT INTO {} (old_value, new_value, start_revision_id, end_revision_id, test_id, machine_id, field, run_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                self.table("FieldChange")
            ),
            params![
                fc.old_value,
                fc.new_value,
                fc.start_revision_id,
                fc.end_revision_id,
                fc.test_id,
                fc.machine_id,
                fc.field,
                fc.run_id
            ],
        )?;
        self.get_field_change(self.conn().last_insert_rowid())
    }

    /// Records the latest observation of an existing change.
    pub fn refresh_field_change(
        &self,
        id: RowId,
        old_value: f64,
        new_value: f64,
        run_id: RowId,
    ) -> anyhow::Result<()> {
        let n = self.conn().execute(
            &format!(
                "UPDATE {} SET old_value = ?1, new_value = ?2, run_id = ?3 WHERE id = ?4",
                self.table("FieldChange")
            ),
            params![old_value, new_value, run_id, id],
        )?;
        if n == 0 {
            return Err(NotFound { entity: "field change", id }.into());
        }
        Ok(())
    }

    pub fn get_field_change(&self, id: RowId) -> anyhow::Result<FieldChange> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {} FROM {} fc WHERE fc.id = ?1",
                    FIELD_CHANGE_COLUMNS,
                    self.table("FieldChange")
                ),
                params![id],
                field_change_from_row,
            )
            .optional()?
            .ok_or_else(|| NotFound { entity: "field change", id }.into())
    }

    pub fn field_changes(&self, filter: &ChangeFilter) -> anyhow::Result<Vec<FieldChange>> {
        let mut cond: Vec<String> = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();
        if let Some(m) = filter.machine_id {
            cond.push("fc.machine_id = ?".into());
            args.push(m.into());
        }
        if let Some(t) = filter.test_id {
            cond.push("fc.test_id = ?".into());
            args.push(t.into());
        }
        if let Some(f) = &filter.field {
            cond.push("fc.field = ?".into());
            args.push(f.clone().into());
        }
        if let Some(since) = &filter.since {
            cond.push("ru.start_time >= ?".into());
            args.push(format_timestamp(since).into());
        }
        if let Some(until) = &filter.until {
            cond.push("ru.start_time <= ?".into());
            args.push(format_timestamp(until).into());
        }
        if !filter.include_ignored {
            cond.push(format!(
                "NOT EXISTS (SELECT 1 FROM {} ci WHERE ci.field_change_id = fc.id)",
                self.table("ChangeIgnore")
            ));
        }
        let where_clause = if cond.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", cond.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM {} fc LEFT JOIN {} ru ON ru.id = fc.run_id {} ORDER BY fc.id",
            FIELD_CHANGE_COLUMNS,
            self.table("FieldChange"),
            self.table("Run"),
            where_clause
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), field_change_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // --- Regressions ---

    pub fn create_regression(&self, title: &str, state: RegressionState) -> anyhow::Result<Regression> {
        self.conn().execute(
            &format!(
                "INSERT INTO {} (title, bug, state, auto_title, staged_at) VALUES (?1, NULL, ?2, 1, NULL)",
                self.table("Regression")
            ),
            params![title, state.code()],
        )?;
        self.get_regression(self.conn().last_insert_rowid())
    }

    pub fn get_regression(&self, id: RowId) -> anyhow::Result<Regression> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {} FROM {} WHERE id = ?1",
                    REGRESSION_COLUMNS,
                    self.table("Regression")
                ),
                params![id],
                regression_from_row,
            )
            .optional()?
            .ok_or_else(|| NotFound { entity: "regression", id }.into())
    }

    /// Regressions in the given states (all states when empty), by id.
    pub fn regressions(&self, states: &[RegressionState]) -> anyhow::Result<Vec<Regression>> {
        self.query_regressions(states, None)
    }

    /// Regressions with a non-ignored change on `machine_id`.
    pub fn regressions_for_machine(
        &self,
        machine_id: RowId,
        states: &[RegressionState],
    ) -> anyhow::Result<Vec<Regression>> {
        self.query_regressions(states, Some(("fc.machine_id = ?".into(), vec![machine_id.into()])))
    }

    /// Regressions with a non-ignored change last observed in a run that
    /// started within `[from, to]`.
    pub fn regressions_between(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
        states: &[RegressionState],
    ) -> anyhow::Result<Vec<Regression>> {
        self.query_regressions(
            states,
            Some((
                "ru.start_time >= ? AND ru.start_time <= ?".into(),
                vec![format_timestamp(&from).into(), format_timestamp(&to).into()],
            )),
        )
    }

    /// `evidence` restricts to regressions linked to a matching field
    /// change; its clause may refer to `fc` and `ru`.
    fn query_regressions(
        &self,
        states: &[RegressionState],
        evidence: Option<(String, Vec<SqlValue>)>,
    ) -> anyhow::Result<Vec<Regression>> {
        let mut cond: Vec<String> = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();
        if let Some((clause, values)) = evidence {
            cond.push(format!(
                "id IN (SELECT ri.regression_id FROM {} ri \
                 JOIN {} fc ON fc.id = ri.field_change_id \
                 LEFT JOIN {} ru ON ru.id = fc.run_id \
                 WHERE {} AND NOT EXISTS (SELECT 1 FROM {} ci WHERE ci.field_change_id = fc.id))",
                self.table("RegressionIndicator"),
                self.table("FieldChange"),
                self.table("Run"),
                clause,
                self.table("ChangeIgnore"),
            ));
            args.extend(values);
        }
        if !states.is_empty() {
            cond.push(format!("state IN ({})", placeholders(states.len())));
            args.extend(states.iter().map(|s| SqlValue::from(s.code())));
        }
        let where_clause = if cond.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", cond.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM {} {} ORDER BY id",
            REGRESSION_COLUMNS,
            self.table("Regression"),
            where_clause
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), regression_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn save_regression(&self, r: &Regression) -> anyhow::Result<()> {
        let n = self.conn().execute(
            &format!(
                "UPDATE {} SET title = ?1, bug = ?2, state = ?3, auto_title = ?4, staged_at = ?5 WHERE id = ?6",
                self.table("Regression")
            ),
            params![
                r.title,
                r.bug,
                r.state.code(),
                r.auto_title,
                r.staged_at.as_ref().map(format_timestamp),
                r.id
            ],
        )?;
        if n == 0 {
            return Err(NotFound { entity: "regression", id: r.id }.into());
        }
        Ok(())
    }

    // --- Indicators ---

    /// Links a field change to a regression. Linking twice is a no-op.
    pub fn link_indicator(
        &self,
        regression_id: RowId,
        field_change_id: RowId,
    ) -> anyhow::Result<(RegressionIndicator, bool)> {
        let n = self.conn().execute(
            &format!(
                "INSERT OR IGNORE INTO {} (regression_id, field_change_id) VALUES (?1, ?2)",
                self.table("RegressionIndicator")
            ),
            params![regression_id, field_change_id],
        )?;
        let id: RowId = self.conn().query_row(
            &format!(
                "SELECT id FROM {} WHERE regression_id = ?1 AND field_change_id = ?2",
                self.table("RegressionIndicator")
            ),
            params![regression_id, field_change_id],
            |r| r.get(0),
        )?;
        Ok((
            RegressionIndicator {
                id,
                regression_id,
                field_change_id,
            },
            n > 0,
        ))
    }

    pub fn unlink_indicator(&self, regression_id: RowId, field_change_id: RowId) -> anyhow::Result<bool> {
        let n = self.conn().execute(
            &format!(
                "DELETE FROM {} WHERE regression_id = ?1 AND field_change_id = ?2",
                self.table("RegressionIndicator")
            ),
            params![regression_id, field_change_id],
        )?;
        Ok(n > 0)
    }

    pub fn indicators(&self, regression_id: RowId) -> anyhow::Result<Vec<RegressionIndicator>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT id, regression_id, field_change_id FROM {} WHERE regression_id = ?1 ORDER BY id",
            self.table("RegressionIndicator")
        ))?;
        let rows = stmt.query_map(params![regression_id], |r| {
            Ok(RegressionIndicator {
                id: r.get(0)?,
                regression_id: r.get(1)?,
                field_change_id: r.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// The field changes behind a regression, in indicator order.
    pub fn regression_changes(
        &self,
        regression_id: RowId,
        include_ignored: bool,
    ) -> anyhow::Result<Vec<FieldChange>> {
        let ignore = if include_ignored {
            String::new()
        } else {
            format!(
                "AND NOT EXISTS (SELECT 1 FROM {} ci WHERE ci.field_change_id = fc.id)",
                self.table("ChangeIgnore")
            )
        };
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {} FROM {} ri JOIN {} fc ON fc.id = ri.field_change_id
             WHERE ri.regression_id = ?1 {} ORDER BY ri.id",
            FIELD_CHANGE_COLUMNS,
            self.table("RegressionIndicator"),
            self.table("FieldChange"),
            ignore
        ))?;
        let rows = stmt.query_map(params![regression_id], field_change_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn regressions_for_field_change(&self, field_change_id: RowId) -> anyhow::Result<Vec<Regression>> {
        let cols: Vec<String> = REGRESSION_COLUMNS
            .split(", ")
            .map(|c| format!("r.{}", c))
            .collect();
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {} FROM {} r JOIN {} ri ON ri.regression_id = r.id
             WHERE ri.field_change_id = ?1 ORDER BY r.id",
            cols.join(", "),
            self.table("Regression"),
            self.table("RegressionIndicator")
        ))?;
        let rows = stmt.query_map(params![field_change_id], regression_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // --- Suppression ---

    pub fn ignore_change(&self, field_change_id: RowId) -> anyhow::Result<ChangeIgnore> {
        self.get_field_change(field_change_id)?;
        self.conn().execute(
            &format!(
                "INSERT OR IGNORE INTO {} (field_change_id) VALUES (?1)",
                self.table("ChangeIgnore")
            ),
            params![field_change_id],
        )?;
        let id: RowId = self.conn().query_row(
            &format!(
                "SELECT id FROM {} WHERE field_change_id = ?1",
                self.table("ChangeIgnore")
            ),
            params![field_change_id],
            |r| r.get(0),
        )?;
        Ok(ChangeIgnore { id, field_change_id })
    }

    pub fn unignore_change(&self, field_change_id: RowId) -> anyhow::Result<bool> {
        let n = self.conn().execute(
            &format!("DELETE FROM {} WHERE field_change_id = ?1", self.table("ChangeIgnore")),
            params![field_change_id],
        )?;
        Ok(n > 0)
    }

    pub fn is_ignored(&self, field_change_id: RowId) -> anyhow::Result<bool> {
        let n: i64 = self.conn().query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE field_change_id = ?1",
                self.table("ChangeIgnore")
            ),
            params![field_change_id],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }
}
