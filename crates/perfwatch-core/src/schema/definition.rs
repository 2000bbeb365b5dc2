use serde::{Deserialize, Serialize};

/// Declarative description of a test suite, as written in configuration and
/// persisted in the `test_suites` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteDefinition {
    pub name: String,
    /// Prefix of the suite's tables.
    pub db_key_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machine_fields: Vec<FieldDefinition>,
    pub revision_fields: Vec<RevisionFieldDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub sample_fields: Vec<SampleFieldDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(alias = "info_key")]
    pub external_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionFieldDefinition {
    pub name: String,
    #[serde(alias = "info_key")]
    pub external_key: String,
    #[serde(default)]
    pub ordinal: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleFieldDefinition {
    pub name: String,
    #[serde(alias = "info_key")]
    pub external_key: String,
    #[serde(rename = "type")]
    pub sample_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_field: Option<String>,
    #[serde(default, alias = "bigger_is_better")]
    pub higher_is_better: bool,
}

impl FieldDefinition {
    pub fn new(name: &str, external_key: &str) -> Self {
        Self {
            name: name.to_string(),
            external_key: external_key.to_string(),
        }
    }
}

impl RevisionFieldDefinition {
    pub fn new(name: &str, external_key: &str, ordinal: u32) -> Self {
        Self {
            name: name.to_string(),
            external_key: external_key.to_string(),
            ordinal,
        }
    }
}

impl SampleFieldDefinition {
    pub fn new(name: &str, external_key: &str, sample_type: &str) -> Self {
        Self {
            name: name.to_string(),
            external_key: external_key.to_string(),
            sample_type: sample_type.to_string(),
            status_field: None,
            higher_is_better: false,
        }
    }

    pub fn with_status(mut self, status_field: &str) -> Self {
        self.status_field = Some(status_field.to_string());
        self
    }

    pub fn higher_is_better(mut self) -> Self {
        self.higher_is_better = true;
        self
    }
}

impl SuiteDefinition {
    /// The nightly-test style suite: compile/execution timings with paired
    /// status codes and a binary hash.
    pub fn nts() -> Self {
        Self {
            name: "nts".into(),
            db_key_name: "NT".into(),
            machine_fields: vec![
                FieldDefinition::new("hardware", "hardware"),
                FieldDefinition::new("os", "os"),
            ],
            revision_fields: vec![RevisionFieldDefinition::new(
                "llvm_project_revision",
                "run_order",
                0,
            )],
            run_fields: vec![],
            sample_fields: vec![
                SampleFieldDefinition::new("compile_status", ".compile.status", "Status"),
                SampleFieldDefinition::new("compile_time", ".compile", "Real")
                    .with_status("compile_status"),
                SampleFieldDefinition::new("execution_status", ".exec.status", "Status"),
                SampleFieldDefinition::new("execution_time", ".exec", "Real")
                    .with_status("execution_status"),
                SampleFieldDefinition::new("hash_status", ".hash.status", "Status"),
                SampleFieldDefinition::new("hash", ".hash", "Hash").with_status("hash_status"),
            ],
        }
    }
}
