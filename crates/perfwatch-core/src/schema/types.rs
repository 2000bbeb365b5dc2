use rusqlite::types::{Value as SqlValue, ValueRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Width of the hash column; longer hash values are rejected at write time.
pub const HASH_WIDTH: usize = 64;

/// Value kinds a sample field may hold.
///
/// Each kind owns its column type, value parsing and row decoding, so adding a
/// kind only touches this file (plus a `sample_types` row) and never the
/// ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleType {
    Real,
    Status,
    Hash,
}

impl SampleType {
    pub fn all() -> &'static [SampleType] {
        &[SampleType::Real, SampleType::Status, SampleType::Hash]
    }

    pub fn name(&self) -> &'static str {
        match self {
            SampleType::Real => "Real",
            SampleType::Status => "Status",
            SampleType::Hash => "Hash",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|t| t.name() == name)
    }

    /// Metric kinds can be interpreted as better or worse than another value.
    pub fn is_metric(&self) -> bool {
        matches!(self, SampleType::Real)
    }

    pub fn column_sql(&self) -> String {
        match self {
            SampleType::Real => "REAL".to_string(),
            SampleType::Status => "INTEGER REFERENCES status_kinds(id)".to_string(),
            SampleType::Hash => format!("VARCHAR({})", HASH_WIDTH),
        }
    }

    /// Converts one reported datum into a typed value.
    pub fn parse_value(&self, raw: &serde_json::Value) -> Result<FieldValue, String> {
        if raw.is_null() {
            return Ok(FieldValue::Null);
        }
        match self {
            SampleType::Real => match raw {
                serde_json::Value::Number(n) => n
                    .as_f64()
                    .map(FieldValue::Real)
                    .ok_or_else(|| format!("number {} is not representable", n)),
                serde_json::Value::String(s) => match s.trim().parse::<f64>() {
                    Ok(v) if v.is_finite() => Ok(FieldValue::Real(v)),
                    Ok(_) => Err(format!("expected a finite number, got '{}'", s)),
                    Err(_) => Err(format!("expected a number, got '{}'", s)),
                },
                other => Err(format!("expected a number, got {}", other)),
            },
            SampleType::Status => {
                let code = match raw {
                    serde_json::Value::Number(n) => n.as_i64(),
                    serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                };
                code.and_then(StatusKind::from_id)
                    .map(FieldValue::Status)
                    .ok_or_else(|| format!("unknown status code {}", raw))
            }
            SampleType::Hash => {
                let s = match raw {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if s.len() > HASH_WIDTH {
                    return Err(format!("hash longer than {} characters", HASH_WIDTH));
                }
                Ok(FieldValue::Hash(s))
            }
        }
    }

    pub fn to_sql(&self, value: &FieldValue) -> SqlValue {
        match value {
            FieldValue::Real(v) => SqlValue::Real(*v),
            FieldValue::Status(k) => SqlValue::Integer(k.id()),
            FieldValue::Hash(s) => SqlValue::Text(s.clone()),
            FieldValue::Null => SqlValue::Null,
        }
    }

    pub fn from_sql(&self, raw: ValueRef<'_>) -> FieldValue {
        match (self, raw) {
            (_, ValueRef::Null) => FieldValue::Null,
            (SampleType::Real, ValueRef::Real(v)) => FieldValue::Real(v),
            (SampleType::Real, ValueRef::Integer(v)) => FieldValue::Real(v as f64),
            (SampleType::Status, ValueRef::Integer(v)) => StatusKind::from_id(v)
                .map(FieldValue::Status)
                .unwrap_or(FieldValue::Null),
            (SampleType::Hash, ValueRef::Text(t)) => {
                FieldValue::Hash(String::from_utf8_lossy(t).into_owned())
            }
            _ => FieldValue::Null,
        }
    }
}

/// Sample outcome codes referenced by Status-typed fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusKind {
    Pass,
    Fail,
    Xfail,
}

impl StatusKind {
    pub fn all() -> &'static [StatusKind] {
        &[StatusKind::Pass, StatusKind::Fail, StatusKind::Xfail]
    }

    pub fn id(&self) -> i64 {
        match self {
            StatusKind::Pass => 0,
            StatusKind::Fail => 1,
            StatusKind::Xfail => 2,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        Self::all().iter().copied().find(|k| k.id() == id)
    }

    pub fn name(&self) -> &'static str {
        match self {
            StatusKind::Pass => "PASS",
            StatusKind::Fail => "FAIL",
            StatusKind::Xfail => "XFAIL",
        }
    }
}

/// A typed sample column value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Real(f64),
    Status(StatusKind),
    Hash(String),
    Null,
}

impl FieldValue {
    pub fn as_real(&self) -> Option<f64> {
        match self {
            FieldValue::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_status(&self) -> Option<StatusKind> {
        match self {
            FieldValue::Status(k) => Some(*k),
            _ => None,
        }
    }

    pub fn as_hash(&self) -> Option<&str> {
        match self {
            FieldValue::Hash(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

/// The set of sample type names known to a database.
///
/// Binding a suite resolves every declared type through the registry, so a
/// type name that is neither registered nor implemented fails at bind time.
#[derive(Debug, Clone)]
pub struct SampleTypeRegistry {
    names: BTreeSet<String>,
}

impl SampleTypeRegistry {
    pub fn builtin() -> Self {
        Self::from_names(SampleType::all().iter().map(|t| t.name().to_string()))
    }

    pub fn from_names<I: IntoIterator<Item = String>>(names: I) -> Self {
        Self {
            names: names.into_iter().collect(),
        }
    }

    pub fn resolve(&self, name: &str) -> Option<SampleType> {
        if !self.names.contains(name) {
            return None;
        }
        SampleType::from_name(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn real_accepts_numbers_and_numeric_strings() {
        assert_eq!(
            SampleType::Real.parse_value(&json!(0.25)).unwrap(),
            FieldValue::Real(0.25)
        );
        assert_eq!(
            SampleType::Real.parse_value(&json!(" 3 ")).unwrap(),
            FieldValue::Real(3.0)
        );
        assert!(SampleType::Real.parse_value(&json!("fast")).is_err());
    }

    #[test]
    fn real_rejects_non_finite_strings() {
        for raw in ["NaN", "inf", "-infinity"] {
            let err = SampleType::Real.parse_value(&json!(raw)).unwrap_err();
            assert!(err.contains("finite"), "{raw}: {err}");
        }
    }

    #[test]
    fn status_must_be_known_kind() {
        assert_eq!(
            SampleType::Status.parse_value(&json!(1)).unwrap(),
            FieldValue::Status(StatusKind::Fail)
        );
        assert!(SampleType::Status.parse_value(&json!(7)).is_err());
    }

    #[test]
    fn hash_is_width_limited() {
        let long = "a".repeat(HASH_WIDTH + 1);
        assert!(SampleType::Hash.parse_value(&json!(long)).is_err());
        assert_eq!(
            SampleType::Hash.parse_value(&json!("abc")).unwrap(),
            FieldValue::Hash("abc".into())
        );
    }

    #[test]
    fn registry_requires_registration_and_implementation() {
        let reg = SampleTypeRegistry::from_names(vec!["Real".to_string(), "Blob".to_string()]);
        assert_eq!(reg.resolve("Real"), Some(SampleType::Real));
        assert_eq!(reg.resolve("Status"), None);
        assert_eq!(reg.resolve("Blob"), None);
    }
}
