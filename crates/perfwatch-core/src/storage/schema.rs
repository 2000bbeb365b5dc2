use crate::schema::SuiteSchema;

/// Tables shared by every suite in one database.
pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS sample_types (
  id            INTEGER PRIMARY KEY AUTOINCREMENT,
  name          TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS status_kinds (
  id            INTEGER PRIMARY KEY,
  name          TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS test_suites (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  name            TEXT NOT NULL UNIQUE,
  db_key_name     TEXT NOT NULL UNIQUE,
  version         TEXT NOT NULL,
  definition_json TEXT NOT NULL,
  created_at      TEXT NOT NULL,
  updated_at      TEXT NOT NULL
);
"#;

pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident)
}

/// A schema-defined column: table, column name, declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table: String,
    pub column: String,
    pub decl: String,
}

/// Every column that comes from the suite definition rather than from the
/// fixed entity layout. Used to evolve existing tables in place.
pub fn schema_columns(schema: &SuiteSchema) -> Vec<ColumnSpec> {
    let mut out = Vec::new();
    let text = "TEXT NOT NULL DEFAULT ''".to_string();
    for f in schema.machine_fields() {
        out.push(ColumnSpec {
            table: schema.table("Machine"),
            column: f.name.clone(),
            decl: text.clone(),
        });
    }
    for f in schema.revision_fields() {
        out.push(ColumnSpec {
            table: schema.table("Revision"),
            column: f.name.clone(),
            decl: text.clone(),
        });
    }
    for f in schema.run_fields() {
        out.push(ColumnSpec {
            table: schema.table("Run"),
            column: f.name.clone(),
            decl: text.clone(),
        });
    }
    for f in schema.sample_fields() {
        out.push(ColumnSpec {
            table: schema.table("Sample"),
            column: f.name.clone(),
            decl: f.sample_type.column_sql(),
        });
    }
    out
}

fn field_columns<'a>(names: impl Iterator<Item = &'a str>, decl: &str) -> String {
    names
        .map(|n| format!(",\n  {} {}", quote(n), decl))
        .collect()
}

/// CREATE statements for the per-suite tables.
pub fn suite_ddl(schema: &SuiteSchema) -> String {
    let text = "TEXT NOT NULL DEFAULT ''";
    let machine = schema.table("Machine");
    let revision = schema.table("Revision");
    let run = schema.table("Run");
    let test = schema.table("Test");
    let profile = schema.table("Profile");
    let sample = schema.table("Sample");
    let field_change = schema.table("FieldChange");
    let regression = schema.table("Regression");
    let indicator = schema.table("RegressionIndicator");
    let ignore = schema.table("ChangeIgnore");

    let machine_cols = field_columns(schema.machine_fields().iter().map(|f| f.name.as_str()), text);
    let revision_cols =
        field_columns(schema.revision_fields().iter().map(|f| f.name.as_str()), text);
    let run_cols = field_columns(schema.run_fields().iter().map(|f| f.name.as_str()), text);
    let sample_cols: String = schema
        .sample_fields()
        .iter()
        .map(|f| format!(",\n  {} {}", quote(&f.name), f.sample_type.column_sql()))
        .collect();

    format!(
        r#"
CREATE TABLE IF NOT EXISTS {machine} (
  id            INTEGER PRIMARY KEY AUTOINCREMENT,
  name          TEXT NOT NULL,
  parameters    TEXT NOT NULL DEFAULT '[]'{machine_cols}
);

CREATE TABLE IF NOT EXISTS {revision} (
  id                    INTEGER PRIMARY KEY AUTOINCREMENT,
  previous_revision_id  INTEGER REFERENCES {revision}(id),
  next_revision_id      INTEGER REFERENCES {revision}(id){revision_cols}
);

CREATE TABLE IF NOT EXISTS {run} (
  id            INTEGER PRIMARY KEY AUTOINCREMENT,
  machine_id    INTEGER NOT NULL REFERENCES {machine}(id),
  revision_id   INTEGER NOT NULL REFERENCES {revision}(id),
  imported_from TEXT,
  start_time    TEXT NOT NULL,
  end_time      TEXT NOT NULL,
  parameters    TEXT NOT NULL DEFAULT '[]'{run_cols}
);

CREATE TABLE IF NOT EXISTS {test} (
  id            INTEGER PRIMARY KEY AUTOINCREMENT,
  name          TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS {profile} (
  id            INTEGER PRIMARY KEY AUTOINCREMENT,
  created_time  TEXT NOT NULL,
  accessed_time TEXT NOT NULL,
  digest        TEXT NOT NULL,
  counters      TEXT NOT NULL DEFAULT '',
  data          BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS {sample} (
  id            INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id        INTEGER NOT NULL REFERENCES {run}(id),
  test_id       INTEGER NOT NULL REFERENCES {test}(id),
  profile_id    INTEGER REFERENCES {profile}(id){sample_cols}
);

CREATE TABLE IF NOT EXISTS {field_change} (
  id                INTEGER PRIMARY KEY AUTOINCREMENT,
  old_value         REAL NOT NULL,
  new_value         REAL NOT NULL,
  start_revision_id INTEGER NOT NULL REFERENCES {revision}(id),
  end_revision_id   INTEGER NOT NULL REFERENCES {revision}(id),
  test_id           INTEGER NOT NULL REFERENCES {test}(id),
  machine_id        INTEGER NOT NULL REFERENCES {machine}(id),
  field             TEXT NOT NULL,
  run_id            INTEGER REFERENCES {run}(id)
);

CREATE TABLE IF NOT EXISTS {regression} (
  id            INTEGER PRIMARY KEY AUTOINCREMENT,
  title         TEXT NOT NULL,
  bug           TEXT,
  state         INTEGER NOT NULL,
  auto_title    INTEGER NOT NULL DEFAULT 1,
  staged_at     TEXT
);

CREATE TABLE IF NOT EXISTS {indicator} (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  regression_id   INTEGER NOT NULL REFERENCES {regression}(id),
  field_change_id INTEGER NOT NULL REFERENCES {field_change}(id),
  UNIQUE(regression_id, field_change_id)
);

CREATE TABLE IF NOT EXISTS {ignore} (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  field_change_id INTEGER NOT NULL UNIQUE REFERENCES {field_change}(id)
);
"#
    )
}

/// Identity indexes. They cover schema-defined columns, so they are rebuilt
/// whenever those columns change.
pub fn suite_index_ddl(schema: &SuiteSchema) -> String {
    let key = schema.db_key_name();
    let cols = |fixed: &[&str], fields: Vec<&str>| {
        fixed
            .iter()
            .map(|c| c.to_string())
            .chain(fields.into_iter().map(quote))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let machine_cols = cols(
        &["name", "parameters"],
        schema.machine_fields().iter().map(|f| f.name.as_str()).collect(),
    );
    let revision_cols = cols(
        &[],
        schema.revision_fields().iter().map(|f| f.name.as_str()).collect(),
    );
    let run_cols = cols(
        &["machine_id", "revision_id", "start_time", "end_time", "parameters"],
        schema.run_fields().iter().map(|f| f.name.as_str()).collect(),
    );

    format!(
        r#"
DROP INDEX IF EXISTS "ix_{key}_Machine_identity";
DROP INDEX IF EXISTS "ix_{key}_Revision_identity";
DROP INDEX IF EXISTS "ix_{key}_Run_identity";
CREATE UNIQUE INDEX "ix_{key}_Machine_identity" ON {machine} ({machine_cols});
CREATE UNIQUE INDEX "ix_{key}_Revision_identity" ON {revision} ({revision_cols});
CREATE UNIQUE INDEX "ix_{key}_Run_identity" ON {run} ({run_cols});
CREATE INDEX IF NOT EXISTS "ix_{key}_Run_machine" ON {run} (machine_id, revision_id);
CREATE INDEX IF NOT EXISTS "ix_{key}_Sample_run" ON {sample} (run_id, test_id);
CREATE INDEX IF NOT EXISTS "ix_{key}_FieldChange_identity" ON {field_change} (machine_id, test_id, field, start_revision_id, end_revision_id);
"#,
        machine = schema.table("Machine"),
        revision = schema.table("Revision"),
        run = schema.table("Run"),
        sample = schema.table("Sample"),
        field_change = schema.table("FieldChange"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SampleTypeRegistry, SuiteDefinition};
    use rusqlite::Connection;

    #[test]
    fn nts_tables_create_and_index() {
        let schema =
            SuiteSchema::bind(&SuiteDefinition::nts(), &SampleTypeRegistry::builtin()).unwrap();
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(DDL).unwrap();
        conn.execute_batch("INSERT INTO status_kinds (id, name) VALUES (0, 'PASS');")
            .unwrap();
        conn.execute_batch(&suite_ddl(&schema)).unwrap();
        conn.execute_batch(&suite_index_ddl(&schema)).unwrap();
        // Rebuilding the indexes on an existing database is allowed.
        conn.execute_batch(&suite_index_ddl(&schema)).unwrap();

        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'NT_%'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 10);
    }

    #[test]
    fn schema_columns_follow_the_definition() {
        let schema =
            SuiteSchema::bind(&SuiteDefinition::nts(), &SampleTypeRegistry::builtin()).unwrap();
        let cols = schema_columns(&schema);
        let sample: Vec<_> = cols
            .iter()
            .filter(|c| c.table == "\"NT_Sample\"")
            .map(|c| c.column.as_str())
            .collect();
        assert_eq!(sample.len(), 6);
        assert!(cols
            .iter()
            .any(|c| c.column == "llvm_project_revision" && c.table == "\"NT_Revision\""));
    }
}
