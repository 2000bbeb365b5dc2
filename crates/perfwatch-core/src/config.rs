use crate::errors::ConfigError;
use crate::regression::{AnalysisMode, TriagePolicy};
use crate::schema::SuiteDefinition;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const SUPPORTED_CONFIG_VERSION: u32 = 1;

/// Upper bounds for the analysis settings.
pub const MAX_ATTEMPTS: u32 = 100;
pub const MAX_RETRY_BACKOFF_MS: u64 = 10 * 60 * 1000;
pub const MAX_STAGING_COOLDOWN_SECS: u64 = 366 * 24 * 60 * 60;

pub const ENV_DB: &str = "PERFWATCH_DB";
pub const ENV_LOG: &str = "PERFWATCH_LOG";
pub const ENV_ANALYSIS: &str = "PERFWATCH_ANALYSIS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    /// SQLite database file. In-memory when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
    #[serde(default)]
    pub suites: Vec<SuiteDefinition>,
    #[serde(default)]
    pub analysis: AnalysisSettings,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: AnalysisMode,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_staging_cooldown_secs")]
    pub staging_cooldown_secs: u64,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: AnalysisMode::default(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            staging_cooldown_secs: default_staging_cooldown_secs(),
        }
    }
}

impl AnalysisSettings {
    pub fn triage_policy(&self) -> TriagePolicy {
        TriagePolicy::from_secs(self.staging_cooldown_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_ATTEMPTS).contains(&self.max_attempts) {
            return Err(ConfigError::Invalid(format!(
                "analysis.max_attempts must be between 1 and {}, got {}",
                MAX_ATTEMPTS, self.max_attempts
            )));
        }
        if self.retry_backoff_ms > MAX_RETRY_BACKOFF_MS {
            return Err(ConfigError::Invalid(format!(
                "analysis.retry_backoff_ms must be at most {}, got {}",
                MAX_RETRY_BACKOFF_MS, self.retry_backoff_ms
            )));
        }
        if self.staging_cooldown_secs > MAX_STAGING_COOLDOWN_SECS {
            return Err(ConfigError::Invalid(format!(
                "analysis.staging_cooldown_secs must be at most {}, got {}",
                MAX_STAGING_COOLDOWN_SECS, self.staging_cooldown_secs
            )));
        }
        Ok(())
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            version: SUPPORTED_CONFIG_VERSION,
            database: None,
            suites: vec![SuiteDefinition::nts()],
            analysis: AnalysisSettings::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_version() -> u32 {
    SUPPORTED_CONFIG_VERSION
}
fn default_log_level() -> String {
    "info".into()
}
fn default_true() -> bool {
    true
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_staging_cooldown_secs() -> u64 {
    24 * 60 * 60
}

/// Parses YAML config text. Unknown keys fail in strict mode and are logged
/// otherwise; keys starting with `_` or `x-` are always allowed.
pub fn parse_config(raw: &str, strict: bool) -> Result<InstanceConfig, ConfigError> {
    let mut ignored_keys = HashSet::new();
    let deserializer = serde_yaml::Deserializer::from_str(raw);
    let cfg: InstanceConfig = serde_ignored::deserialize(deserializer, |path| {
        ignored_keys.insert(path.to_string());
    })
    .map_err(|e| ConfigError::Invalid(format!("failed to parse YAML: {}", e)))?;

    let mut unknown: Vec<&String> = ignored_keys
        .iter()
        .filter(|k| !k.starts_with('_') && !k.starts_with("x-"))
        .collect();
    unknown.sort();
    if !unknown.is_empty() {
        if strict {
            return Err(ConfigError::Invalid(format!(
                "unknown fields detected in strict mode: {:?}",
                unknown
            )));
        }
        tracing::warn!(event = "perfwatch.config.ignored_keys", keys = ?unknown);
    }

    if cfg.version != SUPPORTED_CONFIG_VERSION {
        return Err(ConfigError::Invalid(format!(
            "unsupported config version {} (supported: {})",
            cfg.version, SUPPORTED_CONFIG_VERSION
        )));
    }
    cfg.analysis.validate()?;
    let mut names = HashSet::new();
    for s in &cfg.suites {
        if !names.insert(s.name.as_str()) {
            return Err(ConfigError::Invalid(format!("test suite '{}' is defined twice", s.name)));
        }
    }
    Ok(cfg)
}

/// Loads a config file. A relative database path is resolved against the
/// config file's directory.
pub fn load_config(path: &Path, strict: bool) -> Result<InstanceConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("failed to read config {}: {}", path.display(), e)))?;
    let mut cfg = parse_config(&raw, strict)
        .map_err(|e| ConfigError::Invalid(format!("{} (file: {})", e, path.display())))?;
    if let Some(db) = cfg.database.as_mut() {
        if db.is_relative() {
            let base = path.parent().unwrap_or(Path::new("."));
            *db = base.join(&*db);
        }
    }
    Ok(cfg)
}

/// Applies `PERFWATCH_DB`, `PERFWATCH_LOG` and `PERFWATCH_ANALYSIS` from the
/// given lookup (normally the process environment).
pub fn apply_env_overrides<F>(cfg: &mut InstanceConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(db) = lookup(ENV_DB).filter(|v| !v.trim().is_empty()) {
        cfg.database = Some(PathBuf::from(db));
    }
    if let Some(level) = lookup(ENV_LOG).filter(|v| !v.trim().is_empty()) {
        cfg.log_level = level;
    }
    if let Some(flag) = lookup(ENV_ANALYSIS) {
        cfg.analysis.enabled = match flag.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => true,
            "0" | "false" | "off" | "no" => false,
            other => {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a boolean, got '{}'",
                    ENV_ANALYSIS, other
                )))
            }
        };
    }
    Ok(())
}

pub fn apply_process_env(cfg: &mut InstanceConfig) -> Result<(), ConfigError> {
    apply_env_overrides(cfg, |k| std::env::var(k).ok())
}

pub fn write_sample_config(path: &Path) -> Result<(), ConfigError> {
    std::fs::write(
        path,
        r#"version: 1
database: perfwatch.db
log_level: info
analysis:
  enabled: true
  mode:
    type: previous
  max_attempts: 3
  retry_backoff_ms: 500
  staging_cooldown_secs: 86400
suites:
  - name: nts
    db_key_name: NT
    machine_fields:
      - { name: hardware, external_key: hardware }
      - { name: os, external_key: os }
    revision_fields:
      - { name: llvm_project_revision, external_key: run_order, ordinal: 0 }
    sample_fields:
      - { name: compile_status, external_key: .compile.status, type: Status }
      - { name: compile_time, external_key: .compile, type: Real, status_field: compile_status }
      - { name: execution_status, external_key: .exec.status, type: Status }
      - { name: execution_time, external_key: .exec, type: Real, status_field: execution_status }
      - { name: hash_status, external_key: .hash.status, type: Status }
      - { name: hash, external_key: .hash, type: Hash, status_field: hash_status }
"#,
    )
    .map_err(|e| ConfigError::Invalid(format!("failed to write sample config: {}", e)))?;
    Ok(())
}
