use crate::errors::ConfigError;
use crate::schema::{
    SampleType, SampleTypeRegistry, StatusKind, SuiteDefinition, SuiteSchema, SCHEMA_VERSION,
};
use crate::storage::rows::{add_column_if_missing, get_columns};
use crate::storage::schema::{schema_columns, suite_ddl, suite_index_ddl, DDL};
use crate::storage::suite::SuiteDb;
use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
pub struct Store {
    pub conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreStats {
    pub suites: Option<u64>,
    pub sample_types: Option<u64>,
    pub version: Option<String>,
}

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("failed to open sqlite db")?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite db")?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn lock(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("store connection mutex poisoned"))
    }

    /// Creates the shared tables and seeds the built-in sample types and
    /// status kinds. Safe to run on every open.
    pub fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(DDL)?;
        for ty in SampleType::all() {
            conn.execute(
                "INSERT OR IGNORE INTO sample_types (name) VALUES (?1)",
                params![ty.name()],
            )?;
        }
        for kind in StatusKind::all() {
            conn.execute(
                "INSERT OR IGNORE INTO status_kinds (id, name) VALUES (?1, ?2)",
                params![kind.id(), kind.name()],
            )?;
        }
        Ok(())
    }

    pub fn sample_type_registry(&self) -> anyhow::Result<SampleTypeRegistry> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT name FROM sample_types ORDER BY id")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut names = Vec::new();
        for r in rows {
            names.push(r?);
        }
        Ok(SampleTypeRegistry::from_names(names))
    }

    /// Adds a sample type name to this database. Suites may only use types
    /// that are both registered here and implemented by [`SampleType`].
    pub fn register_sample_type(&self, name: &str) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO sample_types (name) VALUES (?1)",
            params![name],
        )?;
        Ok(())
    }

    /// Binds and persists a suite definition, creating its tables or evolving
    /// them with any newly declared fields. Existing columns are never dropped.
    pub fn register_suite(&self, def: &SuiteDefinition) -> anyhow::Result<SuiteDb> {
        let registry = self.sample_type_registry()?;
        let schema = SuiteSchema::bind(def, &registry)?;
        let definition_json = serde_json::to_string(def)?;
        let now = chrono::Utc::now().to_rfc3339();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let existing_key: Option<String> = tx
            .query_row(
                "SELECT db_key_name FROM test_suites WHERE name = ?1",
                params![def.name],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(key) = existing_key {
            if key != def.db_key_name {
                return Err(ConfigError::Invalid(format!(
                    "test suite '{}' is stored under table prefix '{}', not '{}'",
                    def.name, key, def.db_key_name
                ))
                .into());
            }
        }
        tx.execute(
            "INSERT INTO test_suites (name, db_key_name, version, definition_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(name) DO UPDATE SET
               version = excluded.version,
               definition_json = excluded.definition_json,
               updated_at = excluded.updated_at",
            params![def.name, def.db_key_name, SCHEMA_VERSION, definition_json, now],
        )
        .with_context(|| format!("failed to store test suite '{}'", def.name))?;
        ensure_suite_tables(&tx, &schema)?;
        tx.commit()?;
        drop(conn);

        tracing::info!(
            event = "perfwatch.suite.registered",
            suite = %schema.name(),
            db_key = %schema.db_key_name(),
            sample_fields = schema.sample_fields().len(),
        );
        Ok(SuiteDb::new(self.clone(), schema))
    }

    /// Rebinds a previously registered suite from its stored definition.
    pub fn suite(&self, name: &str) -> anyhow::Result<SuiteDb> {
        let raw: Option<String> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT definition_json FROM test_suites WHERE name = ?1",
                params![name],
                |r| r.get(0),
            )
            .optional()?
        };
        let raw = raw.ok_or_else(|| ConfigError::UnknownSuite(name.to_string()))?;
        let def: SuiteDefinition = serde_json::from_str(&raw)
            .with_context(|| format!("stored definition of suite '{}' is corrupt", name))?;
        let schema = SuiteSchema::bind(&def, &self.sample_type_registry()?)?;
        Ok(SuiteDb::new(self.clone(), schema))
    }

    pub fn suite_names(&self) -> anyhow::Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT name FROM test_suites ORDER BY name")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn load_suites(&self) -> anyhow::Result<Vec<SuiteDb>> {
        self.suite_names()?
            .iter()
            .map(|name| self.suite(name))
            .collect()
    }

    pub fn stats_best_effort(&self) -> anyhow::Result<StoreStats> {
        let conn = self.lock()?;
        let suites: Option<u64> = conn
            .query_row("SELECT COUNT(*) FROM test_suites", [], |r| {
                r.get::<_, i64>(0).map(|x| x as u64)
            })
            .ok();
        let sample_types: Option<u64> = conn
            .query_row("SELECT COUNT(*) FROM sample_types", [], |r| {
                r.get::<_, i64>(0).map(|x| x as u64)
            })
            .ok();
        let version: Option<String> = conn
            .query_row(
                "SELECT version FROM test_suites ORDER BY updated_at DESC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .ok();
        Ok(StoreStats {
            suites,
            sample_types,
            version,
        })
    }
}

fn ensure_suite_tables(conn: &Connection, schema: &SuiteSchema) -> anyhow::Result<()> {
    conn.execute_batch(&suite_ddl(schema))?;
    let mut added = 0usize;
    for spec in schema_columns(schema) {
        let cols = get_columns(conn, &spec.table)?;
        if add_column_if_missing(conn, &cols, &spec.table, &spec.column, &spec.decl)? {
            added += 1;
        }
    }
    if added > 0 {
        tracing::info!(
            event = "perfwatch.suite.migrated",
            suite = %schema.name(),
            columns_added = added,
        );
    }
    conn.execute_batch(&suite_index_ddl(schema))?;
    Ok(())
}
