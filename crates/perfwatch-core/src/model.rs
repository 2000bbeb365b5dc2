use crate::schema::FieldValue;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type RowId = i64;

/// Ordered name -> value mapping for the schema-defined part of a record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fields<V> {
    entries: Vec<(String, V)>,
}

impl<V> Default for Fields<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<V> Fields<V> {
    pub fn push(&mut self, name: impl Into<String>, value: V) {
        self.entries.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&V> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn set(&mut self, name: &str, value: V) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V> FromIterator<(String, V)> for Fields<V> {
    fn from_iter<T: IntoIterator<Item = (String, V)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Leftover report parameters, sorted by key.
pub type Parameters = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Machine {
    pub id: RowId,
    pub name: String,
    pub fields: Fields<String>,
    pub parameters: Parameters,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Revision {
    pub id: RowId,
    pub previous_id: Option<RowId>,
    pub next_id: Option<RowId>,
    /// Values in comparator (ordinal) order.
    pub fields: Fields<String>,
}

impl Revision {
    pub fn values(&self) -> Vec<&str> {
        self.fields.values().map(|s| s.as_str()).collect()
    }

    /// A single-field revision prints as its value; otherwise as a tuple.
    pub fn as_ordered_string(&self) -> String {
        let values = self.values();
        if values.len() == 1 {
            values[0].to_string()
        } else {
            format!("({})", values.join(", "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Run {
    pub id: RowId,
    pub machine_id: RowId,
    pub revision_id: RowId,
    pub imported_from: Option<String>,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub fields: Fields<String>,
    pub parameters: Parameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Test {
    pub id: RowId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub id: RowId,
    pub run_id: RowId,
    pub test_id: RowId,
    pub profile_id: Option<RowId>,
    pub values: Fields<FieldValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Profile {
    pub id: RowId,
    pub created_time: NaiveDateTime,
    pub accessed_time: NaiveDateTime,
    /// SHA-256 of the stored blob.
    pub digest: String,
    pub counters: BTreeMap<String, String>,
    #[serde(skip)]
    pub data: Vec<u8>,
}

/// A detected delta of one metric for one (machine, test, field) between two
/// revisions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub id: RowId,
    pub old_value: f64,
    pub new_value: f64,
    pub start_revision_id: RowId,
    pub end_revision_id: RowId,
    pub test_id: RowId,
    pub machine_id: RowId,
    pub field: String,
    /// Run the change was last observed in.
    pub run_id: Option<RowId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegressionState {
    Detected,
    Staged,
    Active,
    Ntbf,
    Ignored,
    Fixed,
    DetectedFixed,
}

impl RegressionState {
    pub fn all() -> &'static [RegressionState] {
        &[
            RegressionState::Detected,
            RegressionState::Staged,
            RegressionState::Active,
            RegressionState::Ntbf,
            RegressionState::Ignored,
            RegressionState::Fixed,
            RegressionState::DetectedFixed,
        ]
    }

    pub fn code(&self) -> i64 {
        match self {
            RegressionState::Detected => 0,
            RegressionState::Staged => 1,
            RegressionState::Active => 10,
            RegressionState::Ntbf => 20,
            RegressionState::Ignored => 21,
            RegressionState::Fixed => 22,
            RegressionState::DetectedFixed => 23,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::all().iter().copied().find(|s| s.code() == code)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            RegressionState::Detected => "Detected",
            RegressionState::Staged => "Staged",
            RegressionState::Active => "Active",
            RegressionState::Ntbf => "Not to be Fixed",
            RegressionState::Ignored => "Ignored",
            RegressionState::Fixed => "Fixed",
            RegressionState::DetectedFixed => "Verify",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RegressionState::Ntbf | RegressionState::Ignored | RegressionState::Fixed
        )
    }

    /// States in which new evidence may still be attached.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            RegressionState::Detected | RegressionState::Staged | RegressionState::Active
        )
    }
}

impl std::fmt::Display for RegressionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Regression {
    pub id: RowId,
    pub title: String,
    pub bug: Option<String>,
    pub state: RegressionState,
    /// Title is derived from the indicators and rebuilt on every change.
    pub auto_title: bool,
    pub staged_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegressionIndicator {
    pub id: RowId,
    pub regression_id: RowId,
    pub field_change_id: RowId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeIgnore {
    pub id: RowId,
    pub field_change_id: RowId,
}
