use thiserror::Error;

/// Schema-bind and configuration failures. A suite that fails to bind cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("test suite '{suite}' defines reserved {entity} key '{field}'")]
    ReservedName {
        suite: String,
        entity: &'static str,
        field: String,
    },

    #[error("test suite '{suite}' defines {entity} field '{field}' more than once")]
    DuplicateField {
        suite: String,
        entity: &'static str,
        field: String,
    },

    #[error("test suite '{suite}': '{name}' is not a valid identifier")]
    InvalidIdentifier { suite: String, name: String },

    #[error(
        "test suite '{suite}' defines unknown sample type '{type_name}' for field '{field}'{}",
        did_you_mean(.suggestion)
    )]
    UnknownSampleType {
        suite: String,
        field: String,
        type_name: String,
        suggestion: Option<String>,
    },

    #[error("test suite '{suite}': field '{field}' names '{status}' as its status field, which is not a Status field of this suite")]
    BadStatusField {
        suite: String,
        field: String,
        status: String,
    },

    #[error("test suite '{suite}' defines more than one Hash field ('{first}' and '{second}')")]
    MultipleHashFields {
        suite: String,
        first: String,
        second: String,
    },

    #[error("test suite '{suite}' uses revision ordinal {ordinal} more than once")]
    DuplicateOrdinal { suite: String, ordinal: u32 },

    #[error("test suite '{suite}' defines no revision fields")]
    NoRevisionFields { suite: String },

    #[error("unknown test suite '{0}'")]
    UnknownSuite(String),

    #[error("{0}")]
    Invalid(String),
}

/// Failures that abort the import of one submitted report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImportError {
    #[error("supplied run is missing required run parameter: '{key}'")]
    MissingRequiredField { key: String },

    #[error("test '{name}' is misnamed for reporting under schema '{tag}'")]
    MisnamedTest { name: String, tag: String },

    #[error(
        "test '{name}' does not map to a sample field in the reported suite{}",
        did_you_mean(.suggestion)
    )]
    UnmappedTestName {
        name: String,
        suggestion: Option<String>,
    },

    #[error("no test suite is registered for tag '{tag}'")]
    UnknownSuite { tag: String },

    #[error("invalid timestamp '{value}' (expected YYYY-MM-DD HH:MM:SS)")]
    InvalidTimestamp { value: String },

    #[error("invalid value for field '{field}' of test '{test}': {reason}")]
    InvalidSampleValue {
        test: String,
        field: String,
        reason: String,
    },

    #[error("test parameter sets are not supported (test '{name}')")]
    UnsupportedTestInfo { name: String },
}

/// Failures of externally triggered triage actions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriageError {
    #[error("regression cannot move from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("regression is staged; cooldown has {remaining_secs}s remaining")]
    CooldownPending { remaining_secs: i64 },
}

/// A record addressed by id does not exist (or no longer exists) in the suite.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{entity} {id} not found")]
pub struct NotFound {
    pub entity: &'static str,
    pub id: i64,
}

pub fn did_you_mean(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(" (did you mean '{}'?)", s),
        None => String::new(),
    }
}

/// Closest candidate by edit distance, if any is near enough to be a plausible typo.
pub fn closest_match<'a, I>(needle: &str, candidates: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let limit = (needle.chars().count() / 3).max(2);
    candidates
        .into_iter()
        .map(|c| (strsim::levenshtein(&needle.to_lowercase(), &c.to_lowercase()), c))
        .filter(|(d, _)| *d <= limit)
        .min_by_key(|(d, _)| *d)
        .map(|(_, c)| c.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggestion_is_rendered_in_message() {
        let err = ConfigError::UnknownSampleType {
            suite: "nts".into(),
            field: "compile_time".into(),
            type_name: "Rael".into(),
            suggestion: closest_match("Rael", ["Real", "Status", "Hash"]),
        };
        assert!(err.to_string().contains("did you mean 'Real'?"));
    }

    #[test]
    fn far_candidates_are_not_suggested() {
        assert_eq!(closest_match("bogus", [".exec", ".compile"]), None);
    }
}
