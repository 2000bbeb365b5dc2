//! Per-suite schema registry.
//!
//! A [`SuiteDefinition`] is validated once into an immutable [`SuiteSchema`]
//! handle. Every other component takes the handle explicitly; a schema change
//! means binding a fresh handle, never mutating a live one.

pub mod definition;
pub mod types;

pub use definition::{
    FieldDefinition, RevisionFieldDefinition, SampleFieldDefinition, SuiteDefinition,
};
pub use types::{FieldValue, SampleType, SampleTypeRegistry, StatusKind};

use crate::errors::{closest_match, ConfigError};
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

pub const MACHINE_RESERVED: &[&str] = &["id", "name", "parameters"];
pub const REVISION_RESERVED: &[&str] = &["id", "previous_revision_id", "next_revision_id"];
pub const RUN_RESERVED: &[&str] = &[
    "id",
    "machine_id",
    "revision_id",
    "imported_from",
    "start_time",
    "end_time",
    "parameters",
];
pub const SAMPLE_RESERVED: &[&str] = &["id", "run_id", "test_id", "profile_id", "profile"];

/// Reported test-name suffix that carries a profile instead of a field value.
pub const PROFILE_SUFFIX: &str = ".profile";

/// Version stamp recorded with persisted suite definitions.
pub const SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    pub name: String,
    pub external_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevisionField {
    pub name: String,
    pub external_key: String,
    pub ordinal: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleField {
    /// Position in the suite's sample field list.
    pub index: usize,
    pub name: String,
    pub external_key: String,
    pub sample_type: SampleType,
    /// Index of the paired Status field.
    pub status_field: Option<usize>,
    pub higher_is_better: bool,
}

/// Human-readable title: `_` becomes a space and every word is capitalized.
pub fn field_title(name: &str) -> String {
    name.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(c) => c.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

impl Field {
    pub fn title(&self) -> String {
        field_title(&self.name)
    }
}

impl SampleField {
    pub fn title(&self) -> String {
        field_title(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuiteSchema {
    name: String,
    db_key_name: String,
    machine_fields: Vec<Field>,
    /// Sorted by ordinal; this is the comparator's field order.
    revision_fields: Vec<RevisionField>,
    run_fields: Vec<Field>,
    sample_fields: Vec<SampleField>,
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
}

struct Checker<'a> {
    suite: &'a str,
}

impl Checker<'_> {
    fn identifier(&self, name: &str) -> Result<(), ConfigError> {
        if identifier_re().is_match(name) {
            Ok(())
        } else {
            Err(ConfigError::InvalidIdentifier {
                suite: self.suite.to_string(),
                name: name.to_string(),
            })
        }
    }

    /// Names are compared case-insensitively: SQLite column names are.
    fn names<'n>(
        &self,
        entity: &'static str,
        reserved: &[&str],
        names: impl Iterator<Item = &'n str>,
    ) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for name in names {
            self.identifier(name)?;
            let lower = name.to_ascii_lowercase();
            if reserved.contains(&lower.as_str()) {
                return Err(ConfigError::ReservedName {
                    suite: self.suite.to_string(),
                    entity,
                    field: name.to_string(),
                });
            }
            if !seen.insert(lower) {
                return Err(ConfigError::DuplicateField {
                    suite: self.suite.to_string(),
                    entity,
                    field: name.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl SuiteSchema {
    /// Validates a definition and produces the immutable handle.
    pub fn bind(
        def: &SuiteDefinition,
        registry: &SampleTypeRegistry,
    ) -> Result<Arc<SuiteSchema>, ConfigError> {
        let check = Checker { suite: &def.name };
        check.identifier(&def.db_key_name)?;

        check.names(
            "machine",
            MACHINE_RESERVED,
            def.machine_fields.iter().map(|f| f.name.as_str()),
        )?;
        check.names(
            "revision",
            REVISION_RESERVED,
            def.revision_fields.iter().map(|f| f.name.as_str()),
        )?;
        check.names("run", RUN_RESERVED, def.run_fields.iter().map(|f| f.name.as_str()))?;
        check.names(
            "sample",
            SAMPLE_RESERVED,
            def.sample_fields.iter().map(|f| f.name.as_str()),
        )?;

        if def.revision_fields.is_empty() {
            return Err(ConfigError::NoRevisionFields {
                suite: def.name.clone(),
            });
        }
        let mut ordinals = HashSet::new();
        for f in &def.revision_fields {
            if !ordinals.insert(f.ordinal) {
                return Err(ConfigError::DuplicateOrdinal {
                    suite: def.name.clone(),
                    ordinal: f.ordinal,
                });
            }
        }
        let mut revision_fields: Vec<RevisionField> = def
            .revision_fields
            .iter()
            .map(|f| RevisionField {
                name: f.name.clone(),
                external_key: f.external_key.clone(),
                ordinal: f.ordinal,
            })
            .collect();
        revision_fields.sort_by_key(|f| f.ordinal);

        let mut types = Vec::with_capacity(def.sample_fields.len());
        for f in &def.sample_fields {
            let ty = registry.resolve(&f.sample_type).ok_or_else(|| {
                ConfigError::UnknownSampleType {
                    suite: def.name.clone(),
                    field: f.name.clone(),
                    type_name: f.sample_type.clone(),
                    suggestion: closest_match(&f.sample_type, registry.names()),
                }
            })?;
            types.push(ty);
        }

        let index_by_name: HashMap<&str, usize> = def
            .sample_fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.as_str(), i))
            .collect();

        let mut sample_fields = Vec::with_capacity(def.sample_fields.len());
        let mut hash_field: Option<&str> = None;
        for (i, f) in def.sample_fields.iter().enumerate() {
            let status_field = match &f.status_field {
                None => None,
                Some(status) => match index_by_name.get(status.as_str()) {
                    Some(&j) if j != i && types[j] == SampleType::Status => Some(j),
                    _ => {
                        return Err(ConfigError::BadStatusField {
                            suite: def.name.clone(),
                            field: f.name.clone(),
                            status: status.clone(),
                        })
                    }
                },
            };
            if types[i] == SampleType::Hash {
                if let Some(first) = hash_field {
                    return Err(ConfigError::MultipleHashFields {
                        suite: def.name.clone(),
                        first: first.to_string(),
                        second: f.name.clone(),
                    });
                }
                hash_field = Some(&f.name);
            }
            sample_fields.push(SampleField {
                index: i,
                name: f.name.clone(),
                external_key: f.external_key.clone(),
                sample_type: types[i],
                status_field,
                higher_is_better: f.higher_is_better,
            });
        }

        let to_fields = |fs: &[FieldDefinition]| {
            fs.iter()
                .map(|f| Field {
                    name: f.name.clone(),
                    external_key: f.external_key.clone(),
                })
                .collect::<Vec<_>>()
        };

        Ok(Arc::new(SuiteSchema {
            name: def.name.clone(),
            db_key_name: def.db_key_name.clone(),
            machine_fields: to_fields(&def.machine_fields),
            revision_fields,
            run_fields: to_fields(&def.run_fields),
            sample_fields,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db_key_name(&self) -> &str {
        &self.db_key_name
    }

    pub fn machine_fields(&self) -> &[Field] {
        &self.machine_fields
    }

    pub fn revision_fields(&self) -> &[RevisionField] {
        &self.revision_fields
    }

    pub fn run_fields(&self) -> &[Field] {
        &self.run_fields
    }

    pub fn sample_fields(&self) -> &[SampleField] {
        &self.sample_fields
    }

    pub fn sample_field(&self, name: &str) -> Option<&SampleField> {
        self.sample_fields.iter().find(|f| f.name == name)
    }

    pub fn status_field_of(&self, field: &SampleField) -> Option<&SampleField> {
        field.status_field.map(|i| &self.sample_fields[i])
    }

    /// Fields that are not themselves another field's status field.
    pub fn primary_fields(&self) -> impl Iterator<Item = &SampleField> {
        let status: HashSet<usize> = self
            .sample_fields
            .iter()
            .filter_map(|f| f.status_field)
            .collect();
        self.sample_fields
            .iter()
            .filter(move |f| !status.contains(&f.index))
    }

    /// Fields whose values can be better or worse than one another.
    pub fn metric_fields(&self) -> impl Iterator<Item = &SampleField> {
        self.sample_fields
            .iter()
            .filter(|f| f.sample_type.is_metric())
    }

    /// The content-identity field: two samples with equal hashes measured
    /// identical binaries.
    pub fn hash_field(&self) -> Option<&SampleField> {
        self.sample_fields
            .iter()
            .find(|f| f.sample_type == SampleType::Hash)
    }

    pub fn table(&self, entity: &str) -> String {
        format!("\"{}_{}\"", self.db_key_name, entity)
    }
}
