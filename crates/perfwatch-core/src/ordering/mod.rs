//! Revision ordering engine.
//!
//! Revisions form a doubly linked list held as an arena of rows addressed by
//! id. Inserting a revision reloads and sorts the suite's revisions, then
//! rewrites only the links of the new node and its two neighbours. Callers
//! must hold the suite write transaction across [`SuiteConn::get_or_create_revision`].

pub mod compare;

pub use compare::{compare_revisions, compare_values};

use crate::errors::{ImportError, NotFound};
use crate::model::{Parameters, Revision, RowId, Run};
use crate::report::info_value_to_string;
use crate::storage::rows::{placeholders, revision_columns, revision_from_row};
use crate::storage::schema::quote;
use crate::storage::{SuiteConn, SuiteDb};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Back,
    Forward,
}

/// New link pair for one revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkUpdate {
    pub id: RowId,
    pub previous_id: Option<RowId>,
    pub next_id: Option<RowId>,
}

/// Links for the node `new_id` and its immediate neighbours in `sorted`.
/// Returns nothing if `new_id` is not present.
pub fn relink(sorted: &[RowId], new_id: RowId) -> Vec<LinkUpdate> {
    let Some(pos) = sorted.iter().position(|id| *id == new_id) else {
        return Vec::new();
    };
    let at = |i: usize| LinkUpdate {
        id: sorted[i],
        previous_id: i.checked_sub(1).map(|p| sorted[p]),
        next_id: sorted.get(i + 1).copied(),
    };
    let mut out = Vec::with_capacity(3);
    if pos > 0 {
        out.push(at(pos - 1));
    }
    out.push(at(pos));
    if pos + 1 < sorted.len() {
        out.push(at(pos + 1));
    }
    out
}

/// Indices of the `n` entries before or after `index`, nearest first.
pub fn adjacent_slice(len: usize, index: usize, n: usize, direction: Direction) -> Vec<usize> {
    match direction {
        Direction::Back => (index.saturating_sub(n)..index).rev().collect(),
        Direction::Forward => (index + 1..len.min(index.saturating_add(n).saturating_add(1))).collect(),
    }
}

fn sort_revisions(revisions: &mut [Revision]) {
    revisions.sort_by(|a, b| compare_revisions(&a.values(), &b.values()).then(a.id.cmp(&b.id)));
}

impl<'a> SuiteConn<'a> {
    /// Pops the suite's revision fields out of a run info map. Every revision
    /// field is required; a null or blank value counts as missing.
    pub fn take_revision_values(&self, info: &mut Parameters) -> Result<Vec<String>, ImportError> {
        self.schema()
            .revision_fields()
            .iter()
            .map(|f| {
                info.remove(&f.external_key)
                    .filter(|v| !v.is_null())
                    .map(|v| info_value_to_string(&v))
                    .filter(|v| !v.trim().is_empty())
                    .ok_or_else(|| ImportError::MissingRequiredField {
                        key: f.external_key.clone(),
                    })
            })
            .collect()
    }

    pub fn find_revision(&self, values: &[String]) -> anyhow::Result<Option<Revision>> {
        let fields = self.schema().revision_fields();
        anyhow::ensure!(
            values.len() == fields.len(),
            "revision has {} values for {} fields",
            values.len(),
            fields.len()
        );
        let cond: Vec<String> = fields
            .iter()
            .map(|f| format!("{} = ?", quote(&f.name)))
            .collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            revision_columns(self.schema()),
            self.table("Revision"),
            cond.join(" AND ")
        );
        Ok(self
            .conn()
            .query_row(&sql, params_from_iter(values.iter()), |r| {
                revision_from_row(self.schema(), r)
            })
            .optional()?)
    }

    /// Resolves a revision by its field values, inserting and linking it if it
    /// has not been seen. Returns whether it was created.
    pub fn get_or_create_revision(&self, values: &[String]) -> anyhow::Result<(Revision, bool)> {
        if let Some(rev) = self.find_revision(values)? {
            return Ok((rev, false));
        }

        let cols: Vec<String> = self
            .schema()
            .revision_fields()
            .iter()
            .map(|f| quote(&f.name))
            .collect();
        self.conn().execute(
            &format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.table("Revision"),
                cols.join(", "),
                placeholders(cols.len())
            ),
            params_from_iter(values.iter()),
        )?;
        let new_id = self.conn().last_insert_rowid();

        let mut all = self.revisions()?;
        sort_revisions(&mut all);
        let sorted: Vec<RowId> = all.iter().map(|r| r.id).collect();
        let sql = format!(
            "UPDATE {} SET previous_revision_id = ?1, next_revision_id = ?2 WHERE id = ?3",
            self.table("Revision")
        );
        for link in relink(&sorted, new_id) {
            self.conn()
                .execute(&sql, params![link.previous_id, link.next_id, link.id])?;
        }

        let rev = self.get_revision(new_id)?;
        tracing::debug!(
            event = "perfwatch.revision.inserted",
            suite = %self.schema().name(),
            revision_id = rev.id,
            revision = %rev.as_ordered_string(),
            previous_id = ?rev.previous_id,
            next_id = ?rev.next_id,
        );
        Ok((rev, true))
    }

    pub fn get_revision(&self, id: RowId) -> anyhow::Result<Revision> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?1",
            revision_columns(self.schema()),
            self.table("Revision")
        );
        self.conn()
            .query_row(&sql, params![id], |r| revision_from_row(self.schema(), r))
            .optional()?
            .ok_or_else(|| NotFound { entity: "revision", id }.into())
    }

    /// All revisions in id order.
    pub fn revisions(&self) -> anyhow::Result<Vec<Revision>> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY id",
            revision_columns(self.schema()),
            self.table("Revision")
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map([], |r| revision_from_row(self.schema(), r))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// All revisions in comparator order.
    pub fn sorted_revisions(&self) -> anyhow::Result<Vec<Revision>> {
        let mut all = self.revisions()?;
        sort_revisions(&mut all);
        Ok(all)
    }

    /// Walks next-links from the head. Stops early on a broken or cyclic
    /// chain, so the result may be shorter than the revision count.
    pub fn revision_sequence(&self) -> anyhow::Result<Vec<Revision>> {
        let all = self.revisions()?;
        let by_id: std::collections::HashMap<RowId, &Revision> =
            all.iter().map(|r| (r.id, r)).collect();
        let mut out = Vec::with_capacity(all.len());
        let mut cursor = all.iter().find(|r| r.previous_id.is_none());
        while let Some(rev) = cursor {
            if out.len() >= all.len() {
                break;
            }
            out.push(rev.clone());
            cursor = rev.next_id.and_then(|id| by_id.get(&id).copied());
        }
        Ok(out)
    }

    /// Whether walking the links reproduces the comparator order exactly.
    pub fn verify_revision_chain(&self) -> anyhow::Result<bool> {
        let walked: Vec<RowId> = self.revision_sequence()?.iter().map(|r| r.id).collect();
        let sorted: Vec<RowId> = self.sorted_revisions()?.iter().map(|r| r.id).collect();
        Ok(walked == sorted)
    }

    /// Distinct revisions a machine has reported at, in comparator order.
    pub fn machine_revisions(&self, machine_id: RowId) -> anyhow::Result<Vec<Revision>> {
        let cols: Vec<String> = revision_columns(self.schema())
            .split(", ")
            .map(|c| format!("r.{}", c))
            .collect();
        let sql = format!(
            "SELECT DISTINCT {} FROM {} r JOIN {} ru ON ru.revision_id = r.id WHERE ru.machine_id = ?1",
            cols.join(", "),
            self.table("Revision"),
            self.table("Run")
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![machine_id], |r| revision_from_row(self.schema(), r))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        sort_revisions(&mut out);
        Ok(out)
    }

    /// Runs of `run`'s machine at the `n` reported revisions before or after
    /// `run`'s revision, nearest revision first. Runs sharing a revision are
    /// ordered by start time.
    pub fn adjacent_runs(&self, run: &Run, n: usize, direction: Direction) -> anyhow::Result<Vec<Run>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let revisions = self.machine_revisions(run.machine_id)?;
        let Some(index) = revisions.iter().position(|r| r.id == run.revision_id) else {
            return Ok(Vec::new());
        };
        let picked = adjacent_slice(revisions.len(), index, n, direction);
        if picked.is_empty() {
            return Ok(Vec::new());
        }
        let rank: std::collections::HashMap<RowId, usize> = picked
            .iter()
            .enumerate()
            .map(|(nearness, i)| (revisions[*i].id, nearness))
            .collect();
        let ids: Vec<RowId> = picked.iter().map(|i| revisions[*i].id).collect();
        let mut runs = self.runs_at(run.machine_id, &ids)?;
        runs.sort_by(|a, b| {
            rank[&a.revision_id]
                .cmp(&rank[&b.revision_id])
                .then(a.start_time.cmp(&b.start_time))
                .then(a.id.cmp(&b.id))
        });
        Ok(runs)
    }

    pub fn previous_runs(&self, run: &Run, n: usize) -> anyhow::Result<Vec<Run>> {
        self.adjacent_runs(run, n, Direction::Back)
    }

    pub fn next_runs(&self, run: &Run, n: usize) -> anyhow::Result<Vec<Run>> {
        self.adjacent_runs(run, n, Direction::Forward)
    }

    /// The most recent run of a machine at the earliest revision it reported
    /// that is at or after `values`. Used to anchor baseline comparisons to a
    /// revision the machine may never have reported exactly.
    pub fn closest_previously_reported_run(
        &self,
        machine_id: RowId,
        values: &[String],
    ) -> anyhow::Result<Option<Run>> {
        let best = self
            .machine_revisions(machine_id)?
            .into_iter()
            .find(|r| compare_revisions(&r.values(), values) != Ordering::Less);
        let Some(best) = best else {
            return Ok(None);
        };
        Ok(self.runs_at(machine_id, &[best.id])?.into_iter().last())
    }

    /// The most recently reported run of a machine by revision, then start time.
    pub fn latest_run_on_machine(&self, machine_id: RowId) -> anyhow::Result<Option<Run>> {
        let Some(last) = self.machine_revisions(machine_id)?.pop() else {
            return Ok(None);
        };
        Ok(self.runs_at(machine_id, &[last.id])?.into_iter().last())
    }

    /// Position of each revision in comparator order.
    pub fn revision_ranks(&self) -> anyhow::Result<std::collections::HashMap<RowId, usize>> {
        Ok(self
            .sorted_revisions()?
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id, i))
            .collect())
    }

    /// Whether any run of this machine references the given revision ids.
    pub fn machine_reported_at(&self, machine_id: RowId, revision_ids: &[RowId]) -> anyhow::Result<bool> {
        if revision_ids.is_empty() {
            return Ok(false);
        }
        let mut args: Vec<SqlValue> = vec![machine_id.into()];
        args.extend(revision_ids.iter().map(|id| SqlValue::from(*id)));
        let n: i64 = self.conn().query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE machine_id = ? AND revision_id IN ({})",
                self.table("Run"),
                placeholders(revision_ids.len())
            ),
            params_from_iter(args.iter()),
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }
}

impl SuiteDb {
    pub fn revision_sequence(&self) -> anyhow::Result<Vec<Revision>> {
        self.read(|c| c.revision_sequence())
    }

    pub fn verify_revision_chain(&self) -> anyhow::Result<bool> {
        self.read(|c| c.verify_revision_chain())
    }

    pub fn adjacent_runs(&self, run: &Run, n: usize, direction: Direction) -> anyhow::Result<Vec<Run>> {
        self.read(|c| c.adjacent_runs(run, n, direction))
    }
}
