//! Per-suite entity store.

use crate::errors::NotFound;
use crate::model::{Machine, Parameters, Profile, Revision, RowId, Run, Sample, Test};
use crate::report::{format_timestamp, info_value_to_string};
use crate::schema::{FieldValue, SuiteSchema};
use crate::storage::rows::{
    decode_counters, encode_counters, encode_parameters, machine_columns, machine_from_row,
    now_timestamp, parse_stored_time, placeholders, run_columns, run_from_row, sample_columns,
    sample_from_row, sha256_hex,
};
use crate::storage::schema::quote;
use crate::storage::store::Store;
use chrono::NaiveDateTime;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Handle on one suite's tables. Cheap to clone; all clones share the store's
/// connection.
#[derive(Debug, Clone)]
pub struct SuiteDb {
    store: Store,
    schema: Arc<SuiteSchema>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SuiteCounts {
    pub machines: u64,
    pub revisions: u64,
    pub runs: u64,
    pub tests: u64,
    pub samples: u64,
    pub profiles: u64,
    pub field_changes: u64,
    pub regressions: u64,
}

impl SuiteDb {
    pub(crate) fn new(store: Store, schema: Arc<SuiteSchema>) -> Self {
        Self { store, schema }
    }

    pub fn schema(&self) -> &Arc<SuiteSchema> {
        &self.schema
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn read<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&SuiteConn<'_>) -> anyhow::Result<T>,
    {
        let conn = self.store.lock()?;
        f(&SuiteConn::new(&conn, &self.schema))
    }

    /// Runs `f` inside one IMMEDIATE transaction; any error rolls back every
    /// write `f` made.
    pub fn write<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&SuiteConn<'_>) -> anyhow::Result<T>,
    {
        let mut conn = self.store.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&SuiteConn::new(&tx, &self.schema))?;
        tx.commit()?;
        Ok(out)
    }

    pub fn get_machine(&self, id: RowId) -> anyhow::Result<Machine> {
        self.read(|c| c.get_machine(id))
    }

    pub fn machines(&self) -> anyhow::Result<Vec<Machine>> {
        self.read(|c| c.machines(None))
    }

    pub fn get_run(&self, id: RowId) -> anyhow::Result<Run> {
        self.read(|c| c.get_run(id))
    }

    pub fn runs_for_machine(&self, machine_id: RowId) -> anyhow::Result<Vec<Run>> {
        self.read(|c| c.runs_for_machine(machine_id))
    }

    pub fn runs_in_time_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> anyhow::Result<Vec<Run>> {
        self.read(|c| c.runs_in_time_range(start, end))
    }

    pub fn tests(&self) -> anyhow::Result<Vec<Test>> {
        self.read(|c| c.tests())
    }

    pub fn samples_for_run(&self, run_id: RowId) -> anyhow::Result<Vec<Sample>> {
        self.read(|c| c.samples_for_run(run_id))
    }

    pub fn get_profile(&self, id: RowId) -> anyhow::Result<Profile> {
        self.read(|c| c.get_profile(id))
    }

    pub fn counts(&self) -> anyhow::Result<SuiteCounts> {
        self.read(|c| c.counts())
    }
}

/// One suite's view of an open connection or transaction.
pub struct SuiteConn<'a> {
    conn: &'a Connection,
    schema: &'a SuiteSchema,
}

impl<'a> SuiteConn<'a> {
    pub fn new(conn: &'a Connection, schema: &'a SuiteSchema) -> Self {
        Self { conn, schema }
    }

    pub fn conn(&self) -> &'a Connection {
        self.conn
    }

    pub fn schema(&self) -> &'a SuiteSchema {
        self.schema
    }

    pub(crate) fn table(&self, entity: &str) -> String {
        self.schema.table(entity)
    }

    // --- Machines ---

    /// Finds the machine with this name, these field values and these leftover
    /// parameters, creating it if none exists. Returns whether it was created.
    pub fn get_or_create_machine(
        &self,
        name: &str,
        info: &Parameters,
    ) -> anyhow::Result<(Machine, bool)> {
        let mut params = info.clone();
        let mut values = Vec::with_capacity(self.schema.machine_fields().len());
        for f in self.schema.machine_fields() {
            let v = params
                .remove(&f.external_key)
                .map(|v| info_value_to_string(&v))
                .unwrap_or_default();
            values.push(v);
        }
        let encoded = encode_parameters(&params)?;

        let mut args: Vec<SqlValue> = vec![name.to_string().into(), encoded.clone().into()];
        args.extend(values.iter().cloned().map(SqlValue::from));

        let mut cond = vec!["name = ?".to_string(), "parameters = ?".to_string()];
        cond.extend(
            self.schema
                .machine_fields()
                .iter()
                .map(|f| format!("{} = ?", quote(&f.name))),
        );
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY id LIMIT 1",
            machine_columns(self.schema),
            self.table("Machine"),
            cond.join(" AND ")
        );
        let existing = self
            .conn
            .query_row(&sql, params_from_iter(args.iter()), |r| {
                machine_from_row(self.schema, r)
            })
            .optional()?;
        if let Some(m) = existing {
            return Ok((m, false));
        }

        let cols: Vec<String> = ["name".to_string(), "parameters".to_string()]
            .into_iter()
            .chain(self.schema.machine_fields().iter().map(|f| quote(&f.name)))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table("Machine"),
            cols.join(", "),
            placeholders(cols.len())
        );
        self.conn.execute(&sql, params_from_iter(args.iter()))?;
        let id = self.conn.last_insert_rowid();
        Ok((self.get_machine(id)?, true))
    }

    pub fn get_machine(&self, id: RowId) -> anyhow::Result<Machine> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?1",
            machine_columns(self.schema),
            self.table("Machine")
        );
        self.conn
            .query_row(&sql, params![id], |r| machine_from_row(self.schema, r))
            .optional()?
            .ok_or_else(|| NotFound { entity: "machine", id }.into())
    }

    pub fn machines(&self, name: Option<&str>) -> anyhow::Result<Vec<Machine>> {
        let base = format!(
            "SELECT {} FROM {}",
            machine_columns(self.schema),
            self.table("Machine")
        );
        let mut out = Vec::new();
        match name {
            Some(n) => {
                let mut stmt = self.conn.prepare(&format!("{} WHERE name = ?1 ORDER BY id", base))?;
                let rows = stmt.query_map(params![n], |r| machine_from_row(self.schema, r))?;
                for r in rows {
                    out.push(r?);
                }
            }
            None => {
                let mut stmt = self.conn.prepare(&format!("{} ORDER BY id", base))?;
                let rows = stmt.query_map([], |r| machine_from_row(self.schema, r))?;
                for r in rows {
                    out.push(r?);
                }
            }
        }
        Ok(out)
    }

    // --- Runs ---

    /// Finds the run with identical machine, revision, times, run fields and
    /// leftover parameters, creating it if none exists.
    pub fn get_or_create_run(
        &self,
        machine: &Machine,
        revision: &Revision,
        info: &Parameters,
        start_time: &NaiveDateTime,
        end_time: &NaiveDateTime,
    ) -> anyhow::Result<(Run, bool)> {
        let mut params = info.clone();
        let mut values = Vec::with_capacity(self.schema.run_fields().len());
        for f in self.schema.run_fields() {
            let v = params
                .remove(&f.external_key)
                .map(|v| info_value_to_string(&v))
                .unwrap_or_default();
            values.push(v);
        }
        let encoded = encode_parameters(&params)?;

        let mut args: Vec<SqlValue> = vec![
            machine.id.into(),
            revision.id.into(),
            format_timestamp(start_time).into(),
            format_timestamp(end_time).into(),
            encoded.into(),
        ];
        args.extend(values.into_iter().map(SqlValue::from));

        let mut cond: Vec<String> = [
            "machine_id",
            "revision_id",
            "start_time",
            "end_time",
            "parameters",
        ]
        .iter()
        .map(|c| format!("{} = ?", c))
        .collect();
        cond.extend(
            self.schema
                .run_fields()
                .iter()
                .map(|f| format!("{} = ?", quote(&f.name))),
        );
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY id LIMIT 1",
            run_columns(self.schema),
            self.table("Run"),
            cond.join(" AND ")
        );
        let existing = self
            .conn
            .query_row(&sql, params_from_iter(args.iter()), |r| {
                run_from_row(self.schema, r)
            })
            .optional()?;
        if let Some(run) = existing {
            return Ok((run, false));
        }

        let cols: Vec<String> = [
            "machine_id",
            "revision_id",
            "start_time",
            "end_time",
            "parameters",
        ]
        .iter()
        .map(|c| c.to_string())
        .chain(self.schema.run_fields().iter().map(|f| quote(&f.name)))
        .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table("Run"),
            cols.join(", "),
            placeholders(cols.len())
        );
        self.conn.execute(&sql, params_from_iter(args.iter()))?;
        let id = self.conn.last_insert_rowid();
        Ok((self.get_run(id)?, true))
    }

    pub fn set_imported_from(&self, run_id: RowId, source: &str) -> anyhow::Result<()> {
        let n = self.conn.execute(
            &format!("UPDATE {} SET imported_from = ?1 WHERE id = ?2", self.table("Run")),
            params![source, run_id],
        )?;
        if n == 0 {
            return Err(NotFound { entity: "run", id: run_id }.into());
        }
        Ok(())
    }

    pub fn get_run(&self, id: RowId) -> anyhow::Result<Run> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?1",
            run_columns(self.schema),
            self.table("Run")
        );
        self.conn
            .query_row(&sql, params![id], |r| run_from_row(self.schema, r))
            .optional()?
            .ok_or_else(|| NotFound { entity: "run", id }.into())
    }

    fn query_runs(&self, clause: &str, args: Vec<SqlValue>) -> anyhow::Result<Vec<Run>> {
        let sql = format!(
            "SELECT {} FROM {} {}",
            run_columns(self.schema),
            self.table("Run"),
            clause
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |r| {
            run_from_row(self.schema, r)
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn runs_for_machine(&self, machine_id: RowId) -> anyhow::Result<Vec<Run>> {
        self.query_runs(
            "WHERE machine_id = ? ORDER BY start_time, id",
            vec![machine_id.into()],
        )
    }

    /// Runs whose start time falls in `[start, end]`.
    pub fn runs_in_time_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> anyhow::Result<Vec<Run>> {
        self.query_runs(
            "WHERE start_time >= ? AND start_time <= ? ORDER BY start_time, id",
            vec![format_timestamp(&start).into(), format_timestamp(&end).into()],
        )
    }

    /// Runs of one machine at any of the given revisions.
    pub fn runs_at(&self, machine_id: RowId, revision_ids: &[RowId]) -> anyhow::Result<Vec<Run>> {
        if revision_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args: Vec<SqlValue> = vec![machine_id.into()];
        args.extend(revision_ids.iter().map(|id| SqlValue::from(*id)));
        self.query_runs(
            &format!(
                "WHERE machine_id = ? AND revision_id IN ({}) ORDER BY start_time, id",
                placeholders(revision_ids.len())
            ),
            args,
        )
    }

    // --- Tests ---

    pub fn tests(&self) -> anyhow::Result<Vec<Test>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id, name FROM {} ORDER BY id", self.table("Test")))?;
        let rows = stmt.query_map([], |r| {
            Ok(Test {
                id: r.get(0)?,
                name: r.get(1)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn tests_by_name(&self) -> anyhow::Result<HashMap<String, Test>> {
        Ok(self
            .tests()?
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect())
    }

    pub fn get_test(&self, id: RowId) -> anyhow::Result<Test> {
        self.conn
            .query_row(
                &format!("SELECT id, name FROM {} WHERE id = ?1", self.table("Test")),
                params![id],
                |r| {
                    Ok(Test {
                        id: r.get(0)?,
                        name: r.get(1)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| NotFound { entity: "test", id }.into())
    }

    pub fn create_test(&self, name: &str) -> anyhow::Result<Test> {
        self.conn.execute(
            &format!("INSERT INTO {} (name) VALUES (?1)", self.table("Test")),
            params![name],
        )?;
        Ok(Test {
            id: self.conn.last_insert_rowid(),
            name: name.to_string(),
        })
    }

    // --- Profiles ---

    /// Stores an opaque profile payload. A JSON string payload is stored as
    /// its text; anything else as its JSON encoding. Counters are read from a
    /// top-level `counters` object.
    pub fn create_profile(&self, payload: &serde_json::Value) -> anyhow::Result<Profile> {
        let data = match payload {
            serde_json::Value::String(s) => s.as_bytes().to_vec(),
            other => serde_json::to_vec(other)?,
        };
        let counters: BTreeMap<String, String> = payload
            .get("counters")
            .and_then(|c| c.as_object())
            .map(|obj| {
                obj.iter()
                    .map(|(k, v)| (k.clone(), info_value_to_string(v)))
                    .collect()
            })
            .unwrap_or_default();
        let encoded = encode_counters(&counters);
        let digest = sha256_hex(&data);
        let now = now_timestamp();
        self.conn.execute(
            &format!(
                "INSERT INTO {} (created_time, accessed_time, digest, counters, data)
                 VALUES (?1, ?1, ?2, ?3, ?4)",
                self.table("Profile")
            ),
            params![now, digest, encoded, data],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_profile(id)
    }

    pub fn get_profile(&self, id: RowId) -> anyhow::Result<Profile> {
        self.conn
            .query_row(
                &format!(
                    "SELECT id, created_time, accessed_time, digest, counters, data FROM {} WHERE id = ?1",
                    self.table("Profile")
                ),
                params![id],
                |r| {
                    let created: String = r.get(1)?;
                    let accessed: String = r.get(2)?;
                    let counters: String = r.get(4)?;
                    Ok(Profile {
                        id: r.get(0)?,
                        created_time: parse_stored_time(1, &created)?,
                        accessed_time: parse_stored_time(2, &accessed)?,
                        digest: r.get(3)?,
                        counters: decode_counters(&counters),
                        data: r.get(5)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| NotFound { entity: "profile", id }.into())
    }

    // --- Samples ---

    /// `values` is aligned with the suite's sample field list.
    pub fn insert_sample(
        &self,
        run_id: RowId,
        test_id: RowId,
        profile_id: Option<RowId>,
        values: &[FieldValue],
    ) -> anyhow::Result<RowId> {
        let fields = self.schema.sample_fields();
        anyhow::ensure!(
            values.len() == fields.len(),
            "sample has {} values for {} fields",
            values.len(),
            fields.len()
        );
        let cols: Vec<String> = ["run_id", "test_id", "profile_id"]
            .iter()
            .map(|c| c.to_string())
            .chain(fields.iter().map(|f| quote(&f.name)))
            .collect();
        let mut args: Vec<SqlValue> = vec![
            run_id.into(),
            test_id.into(),
            profile_id.map(SqlValue::from).unwrap_or(SqlValue::Null),
        ];
        args.extend(
            fields
                .iter()
                .zip(values)
                .map(|(f, v)| f.sample_type.to_sql(v)),
        );
        self.conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.table("Sample"),
                cols.join(", "),
                placeholders(cols.len())
            ),
            params_from_iter(args.iter()),
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn samples_for_run(&self, run_id: RowId) -> anyhow::Result<Vec<Sample>> {
        self.samples_for_runs(&[run_id], None)
    }

    /// Samples of the given runs, optionally restricted to one test, ordered
    /// by id.
    pub fn samples_for_runs(
        &self,
        run_ids: &[RowId],
        test_id: Option<RowId>,
    ) -> anyhow::Result<Vec<Sample>> {
        if run_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args: Vec<SqlValue> = run_ids.iter().map(|id| SqlValue::from(*id)).collect();
        let mut clause = format!("run_id IN ({})", placeholders(run_ids.len()));
        if let Some(t) = test_id {
            clause.push_str(" AND test_id = ?");
            args.push(t.into());
        }
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY id",
            sample_columns(self.schema),
            self.table("Sample"),
            clause
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |r| {
            sample_from_row(self.schema, r)
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    fn count(&self, entity: &str) -> anyhow::Result<u64> {
        let n: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.table(entity)),
            [],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn counts(&self) -> anyhow::Result<SuiteCounts> {
        Ok(SuiteCounts {
            machines: self.count("Machine")?,
            revisions: self.count("Revision")?,
            runs: self.count("Run")?,
            tests: self.count("Test")?,
            samples: self.count("Sample")?,
            profiles: self.count("Profile")?,
            field_changes: self.count("FieldChange")?,
            regressions: self.count("Regression")?,
        })
    }
}
