//! Submitted report format.

use crate::errors::ImportError;
use crate::model::Parameters;
use anyhow::Context;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Run info key selecting the test suite.
pub const TAG_KEY: &str = "tag";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    #[serde(rename = "Machine")]
    pub machine: MachineReport,
    #[serde(rename = "Run")]
    pub run: RunReport,
    #[serde(rename = "Tests", default)]
    pub tests: Vec<TestReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineReport {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Info", default)]
    pub info: Parameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    #[serde(rename = "Info", default)]
    pub info: Parameters,
    #[serde(rename = "StartTime", alias = "Start Time")]
    pub start_time: String,
    #[serde(rename = "EndTime", alias = "End Time")]
    pub end_time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    /// `<tag>.<test>.<fieldKey>`
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Info", default, skip_serializing_if = "Parameters::is_empty")]
    pub info: Parameters,
    #[serde(rename = "Data", default)]
    pub data: Vec<serde_json::Value>,
}

impl Report {
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).context("failed to parse report JSON")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read report {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn tag(&self) -> Result<String, ImportError> {
        self.run
            .info
            .get(TAG_KEY)
            .map(info_value_to_string)
            .ok_or_else(|| ImportError::MissingRequiredField {
                key: TAG_KEY.to_string(),
            })
    }
}

pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime, ImportError> {
    NaiveDateTime::parse_from_str(value.trim(), TIMESTAMP_FORMAT).map_err(|_| {
        ImportError::InvalidTimestamp {
            value: value.to_string(),
        }
    })
}

pub fn format_timestamp(t: &NaiveDateTime) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

/// Info values are stored as text; non-string JSON keeps its JSON spelling.
pub fn info_value_to_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
