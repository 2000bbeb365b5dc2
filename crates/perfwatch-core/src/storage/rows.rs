//! Row codecs shared by the suite queries.

use crate::model::{Fields, Machine, Parameters, Revision, Run, Sample};
use crate::report::{format_timestamp, TIMESTAMP_FORMAT};
use crate::schema::SuiteSchema;
use crate::storage::schema::quote;
use chrono::NaiveDateTime;
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

/// Upper bound on the stored counter summary of a profile.
pub const COUNTERS_MAX_LEN: usize = 512;

pub const MACHINE_FIXED: &[&str] = &["id", "name", "parameters"];
pub const REVISION_FIXED: &[&str] = &["id", "previous_revision_id", "next_revision_id"];
pub const RUN_FIXED: &[&str] = &[
    "id",
    "machine_id",
    "revision_id",
    "imported_from",
    "start_time",
    "end_time",
    "parameters",
];
pub const SAMPLE_FIXED: &[&str] = &["id", "run_id", "test_id", "profile_id"];

pub fn select_list<'a>(fixed: &[&str], fields: impl Iterator<Item = &'a str>) -> String {
    fixed
        .iter()
        .map(|c| c.to_string())
        .chain(fields.map(quote))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn machine_columns(schema: &SuiteSchema) -> String {
    select_list(
        MACHINE_FIXED,
        schema.machine_fields().iter().map(|f| f.name.as_str()),
    )
}

pub fn revision_columns(schema: &SuiteSchema) -> String {
    select_list(
        REVISION_FIXED,
        schema.revision_fields().iter().map(|f| f.name.as_str()),
    )
}

pub fn run_columns(schema: &SuiteSchema) -> String {
    select_list(RUN_FIXED, schema.run_fields().iter().map(|f| f.name.as_str()))
}

pub fn sample_columns(schema: &SuiteSchema) -> String {
    select_list(
        SAMPLE_FIXED,
        schema.sample_fields().iter().map(|f| f.name.as_str()),
    )
}

/// `?, ?, ?` for an IN list or VALUES clause.
pub fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Leftover parameters are stored as a JSON list of `[key, value]` pairs in
/// key order, so equal parameter sets always encode to equal text.
pub fn encode_parameters(params: &Parameters) -> anyhow::Result<String> {
    let pairs: Vec<(&String, &serde_json::Value)> = params.iter().collect();
    Ok(serde_json::to_string(&pairs)?)
}

pub fn decode_parameters(raw: &str) -> Parameters {
    serde_json::from_str::<Vec<(String, serde_json::Value)>>(raw)
        .map(|pairs| pairs.into_iter().collect())
        .unwrap_or_default()
}

pub fn parse_stored_time(idx: usize, raw: &str) -> rusqlite::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    })
}

pub fn now_timestamp() -> String {
    format_timestamp(&chrono::Utc::now().naive_utc())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

/// `k=v` pairs joined by `,`, keeping whole pairs up to the length cap.
pub fn encode_counters(counters: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (k, v) in counters {
        let pair = format!("{}={}", k, v);
        let needed = if out.is_empty() { pair.len() } else { pair.len() + 1 };
        if out.len() + needed > COUNTERS_MAX_LEN {
            break;
        }
        if !out.is_empty() {
            out.push(',');
        }
        out.push_str(&pair);
    }
    out
}

pub fn decode_counters(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn text_fields<'a>(
    row: &Row<'_>,
    offset: usize,
    names: impl Iterator<Item = &'a str>,
) -> rusqlite::Result<Fields<String>> {
    let mut fields = Fields::default();
    for (i, name) in names.enumerate() {
        let v: Option<String> = row.get(offset + i)?;
        fields.push(name, v.unwrap_or_default());
    }
    Ok(fields)
}

pub fn machine_from_row(schema: &SuiteSchema, row: &Row<'_>) -> rusqlite::Result<Machine> {
    let params: String = row.get(2)?;
    Ok(Machine {
        id: row.get(0)?,
        name: row.get(1)?,
        parameters: decode_parameters(&params),
        fields: text_fields(
            row,
            MACHINE_FIXED.len(),
            schema.machine_fields().iter().map(|f| f.name.as_str()),
        )?,
    })
}

pub fn revision_from_row(schema: &SuiteSchema, row: &Row<'_>) -> rusqlite::Result<Revision> {
    Ok(Revision {
        id: row.get(0)?,
        previous_id: row.get(1)?,
        next_id: row.get(2)?,
        fields: text_fields(
            row,
            REVISION_FIXED.len(),
            schema.revision_fields().iter().map(|f| f.name.as_str()),
        )?,
    })
}

pub fn run_from_row(schema: &SuiteSchema, row: &Row<'_>) -> rusqlite::Result<Run> {
    let start: String = row.get(4)?;
    let end: String = row.get(5)?;
    let params: String = row.get(6)?;
    Ok(Run {
        id: row.get(0)?,
        machine_id: row.get(1)?,
        revision_id: row.get(2)?,
        imported_from: row.get(3)?,
        start_time: parse_stored_time(4, &start)?,
        end_time: parse_stored_time(5, &end)?,
        parameters: decode_parameters(&params),
        fields: text_fields(
            row,
            RUN_FIXED.len(),
            schema.run_fields().iter().map(|f| f.name.as_str()),
        )?,
    })
}

pub fn sample_from_row(schema: &SuiteSchema, row: &Row<'_>) -> rusqlite::Result<Sample> {
    let mut values = Fields::default();
    for (i, f) in schema.sample_fields().iter().enumerate() {
        let raw = row.get_ref(SAMPLE_FIXED.len() + i)?;
        values.push(f.name.clone(), f.sample_type.from_sql(raw));
    }
    Ok(Sample {
        id: row.get(0)?,
        run_id: row.get(1)?,
        test_id: row.get(2)?,
        profile_id: row.get(3)?,
        values,
    })
}

pub fn get_columns(conn: &Connection, table: &str) -> anyhow::Result<HashSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut out = HashSet::new();
    for r in rows {
        out.insert(r?.to_ascii_lowercase());
    }
    Ok(out)
}

/// Returns whether the column was added.
pub fn add_column_if_missing(
    conn: &Connection,
    cols: &HashSet<String>,
    table: &str,
    col: &str,
    ty: &str,
) -> anyhow::Result<bool> {
    if cols.contains(&col.to_ascii_lowercase()) {
        return Ok(false);
    }
    let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, quote(col), ty);
    conn.execute(&sql, [])?;
    Ok(true)
}
