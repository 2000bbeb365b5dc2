use crate::schema::SampleField;
use serde::{Deserialize, Serialize};

/// Four-way classification of one metric between two revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Improved,
    Regressed,
    Unchanged,
    /// Failing on both sides; the values carry no signal.
    UnchangedFail,
}

impl ChangeKind {
    /// Kinds that become persisted field changes.
    pub fn is_change(&self) -> bool {
        matches!(self, ChangeKind::Improved | ChangeKind::Regressed)
    }
}

pub struct ComparisonInput<'a> {
    pub field: &'a SampleField,
    pub previous: &'a [f64],
    pub current: &'a [f64],
    pub previous_failed: bool,
    pub current_failed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub kind: ChangeKind,
    /// Aggregated value on each side.
    pub previous: Option<f64>,
    pub current: Option<f64>,
    pub delta: Option<f64>,
    pub pct_delta: Option<f64>,
}

impl Comparison {
    pub fn unchanged(previous: Option<f64>, current: Option<f64>) -> Self {
        let delta = match (previous, current) {
            (Some(p), Some(c)) => Some(c - p),
            _ => None,
        };
        Self {
            kind: ChangeKind::Unchanged,
            previous,
            current,
            delta,
            pct_delta: None,
        }
    }

    pub fn with_kind(mut self, kind: ChangeKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Statistical collaborator that classifies a metric delta. Implementations
/// must honour the field's higher-is-better flag.
pub trait Comparator: Send + Sync {
    fn name(&self) -> &'static str;

    fn compare(&self, input: &ComparisonInput<'_>) -> anyhow::Result<Comparison>;
}
