//! Configuration system for stratus.
//!
//! Uses `figment` for layered configuration: config file -> environment -> explicit overrides.
//! Unlike optional tuning knobs, the entity list, upstream endpoint and storage layout have no
//! defaults: a missing value is a startup error, never a silently assumed one.
//!
//! Loading and validation are separate steps. [`load_config`] only extracts; callers invoke
//! [`PipelineConfig::validate`] explicitly before the first run.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::storage::PartitionFormat;
use crate::types::Entity;

/// Top-level configuration for a stratus deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub upstream: UpstreamConfig,
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub retry: RetryConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub pipeline: RunConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where and what to request from the upstream API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Endpoint receiving the per-entity requests.
    pub base_url: String,
    /// Hourly variables requested for every entity.
    pub hourly_variables: Vec<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Retry ceiling and exponential backoff for upstream requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Add up to 25% jitter on top of the computed delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter: false,
        }
    }
}

/// Durable storage layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the object store.
    pub root: PathBuf,
    #[serde(default = "default_raw_prefix")]
    pub raw_prefix: String,
    #[serde(default = "default_processed_prefix")]
    pub processed_prefix: String,
    /// Date-hierarchy template, e.g. `year={year}/month={month}/day={day}`.
    pub partition_format: String,
}

fn default_raw_prefix() -> String {
    "raw".to_string()
}

fn default_processed_prefix() -> String {
    "processed".to_string()
}

/// When the scheduled trigger fires and how late it may still run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Cron expression (seconds granularity), evaluated in UTC.
    pub cron: String,
    /// A missed fire within this many seconds still executes.
    pub grace_window_secs: u64,
    /// Where schedule state is persisted between restarts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_path: Option<PathBuf>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: "0 0 1 * * * *".to_string(),
            grace_window_secs: 3_600,
            state_path: None,
        }
    }
}

impl ScheduleConfig {
    pub fn grace_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_window_secs as i64)
    }
}

/// Run-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Time slices a complete day yields per entity.
    pub expected_rows_per_entity: usize,
    /// Directory receiving one JSON summary per completed run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            expected_rows_per_entity: 24,
            summary_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for the JSON log files. Falls back to the platform data dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

/// Load configuration from `path`, then `STRATUS_*` environment variables, then `overrides`.
///
/// Environment keys use `__` as the section separator, e.g. `STRATUS_RETRY__MAX_ATTEMPTS=5`.
pub fn load_config(
    path: &Path,
    overrides: Option<&serde_json::Value>,
) -> Result<PipelineConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    let mut figment = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("STRATUS_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    extract(figment)
}

/// Parse configuration from an in-memory TOML document, without file or environment layers.
pub fn from_toml_str(toml: &str) -> Result<PipelineConfig, ConfigError> {
    extract(Figment::from(Toml::string(toml)))
}

fn extract(figment: Figment) -> Result<PipelineConfig, ConfigError> {
    figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })
}

impl PipelineConfig {
    /// Check every semantic constraint, reporting all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.entities.is_empty() {
            problems.push("no entities defined".to_string());
        }
        let mut seen = HashSet::new();
        for entity in &self.entities {
            let label = if entity.name.trim().is_empty() {
                "<unnamed>".to_string()
            } else {
                entity.name.clone()
            };
            if entity.name.trim().is_empty() {
                problems.push("entity with blank name".to_string());
            } else if !is_path_safe(&entity.name) {
                problems.push(format!(
                    "entity '{}' name must only contain letters, digits, '-' or '_'",
                    entity.name
                ));
            }
            if !seen.insert(entity.name.as_str()) {
                problems.push(format!("duplicate entity name '{}'", label));
            }
            if !(-90.0..=90.0).contains(&entity.latitude) {
                problems.push(format!(
                    "entity '{}' has invalid latitude: {}",
                    label, entity.latitude
                ));
            }
            if !(-180.0..=180.0).contains(&entity.longitude) {
                problems.push(format!(
                    "entity '{}' has invalid longitude: {}",
                    label, entity.longitude
                ));
            }
            if entity.timezone.trim().is_empty() {
                problems.push(format!("entity '{}' has no timezone", label));
            }
        }

        if self.upstream.hourly_variables.is_empty() {
            problems.push("no hourly variables defined".to_string());
        }
        if let Err(e) = url::Url::parse(&self.upstream.base_url) {
            problems.push(format!(
                "upstream.base_url '{}' is not a valid URL: {}",
                self.upstream.base_url, e
            ));
        }
        if self.upstream.timeout_secs == 0 {
            problems.push("upstream.timeout_secs must be greater than 0".to_string());
        }

        if self.retry.max_attempts == 0 {
            problems.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.multiplier < 1.0 {
            problems.push(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            problems.push(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            ));
        }

        if let Err(e) = PartitionFormat::parse(&self.storage.partition_format) {
            problems.push(e);
        }
        if self.storage.raw_prefix.trim().is_empty()
            || self.storage.processed_prefix.trim().is_empty()
        {
            problems.push("storage prefixes must not be blank".to_string());
        } else if self.storage.raw_prefix == self.storage.processed_prefix {
            problems.push("storage.raw_prefix and storage.processed_prefix must differ".to_string());
        }

        if let Err(e) = crate::schedule::parse_cron_expression(&self.schedule.cron) {
            problems.push(e.to_string());
        }

        if self.pipeline.expected_rows_per_entity == 0 {
            problems.push("pipeline.expected_rows_per_entity must be greater than 0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }

    pub fn entity_names(&self) -> Vec<&str> {
        self.entities.iter().map(|e| e.name.as_str()).collect()
    }
}

fn is_path_safe(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
[upstream]
base_url = "https://archive-api.open-meteo.com/v1/archive"
hourly_variables = ["temperature_2m", "relative_humidity_2m", "wind_speed_10m"]

[[entities]]
name = "accra"
latitude = 5.6037
longitude = -0.187
timezone = "Africa/Accra"

[[entities]]
name = "london"
latitude = 51.5074
longitude = -0.1278
timezone = "Europe/London"

[storage]
root = "/var/lib/stratus"
partition_format = "year={year}/month={month}/day={day}"
"#;

    #[test]
    fn test_parse_applies_optional_defaults() {
        let config = from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.entities.len(), 2);
        assert_eq!(config.upstream.timeout_secs, 30);
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.storage.raw_prefix, "raw");
        assert_eq!(config.storage.processed_prefix, "processed");
        assert_eq!(config.schedule.cron, "0 0 1 * * * *");
        assert_eq!(config.schedule.grace_window_secs, 3600);
        assert_eq!(config.pipeline.expected_rows_per_entity, 24);
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_required_section_is_an_error() {
        let without_storage = SAMPLE.split("[storage]").next().unwrap();
        let err = from_toml_str(without_storage).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
        assert!(err.to_string().contains("storage"));
    }

    #[test]
    fn test_missing_entities_is_an_error() {
        let toml = r#"
[upstream]
base_url = "https://example.com"
hourly_variables = ["temperature_2m"]

[storage]
root = "/tmp/x"
partition_format = "{year}/{month}/{day}"
"#;
        let err = from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("entities"));
    }

    #[test]
    fn test_validate_collects_all_problems() {
        let mut config = from_toml_str(SAMPLE).unwrap();
        config.entities[0].latitude = 120.0;
        config.entities[1].name = "accra".into();
        config.upstream.hourly_variables.clear();
        config.retry.max_attempts = 0;
        config.storage.partition_format = "year={year}/day={day}".into();

        let err = config.validate().unwrap_err();
        let ConfigError::Invalid { problems } = err else {
            panic!("expected Invalid");
        };
        assert_eq!(problems.len(), 5, "{:?}", problems);
        assert!(problems.iter().any(|p| p.contains("invalid latitude")));
        assert!(problems.iter().any(|p| p.contains("duplicate entity")));
        assert!(problems.iter().any(|p| p.contains("hourly variables")));
        assert!(problems.iter().any(|p| p.contains("max_attempts")));
        assert!(problems.iter().any(|p| p.contains("{month}")));
    }

    #[test]
    fn test_validate_rejects_path_unsafe_names_and_bad_cron() {
        let mut config = from_toml_str(SAMPLE).unwrap();
        config.entities[0].name = "../etc".into();
        config.schedule.cron = "every day".into();
        let ConfigError::Invalid { problems } = config.validate().unwrap_err() else {
            panic!("expected Invalid");
        };
        assert!(problems.iter().any(|p| p.contains("letters, digits")));
        assert!(problems.iter().any(|p| p.contains("every day")));
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Path::new("/nonexistent/stratus.toml"), None).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_load_config_env_and_overrides() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("stratus.toml", SAMPLE)?;
            jail.set_env("STRATUS_RETRY__MAX_ATTEMPTS", "5");
            jail.set_env("STRATUS_SCHEDULE__GRACE_WINDOW_SECS", "600");

            let overrides = serde_json::json!({ "pipeline": { "expected_rows_per_entity": 48 } });
            let config = load_config(Path::new("stratus.toml"), Some(&overrides))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.retry.max_attempts, 5);
            assert_eq!(config.schedule.grace_window_secs, 600);
            assert_eq!(config.pipeline.expected_rows_per_entity, 48);
            assert_eq!(config.entity_names(), vec!["accra", "london"]);
            Ok(())
        });
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = from_toml_str(SAMPLE).unwrap();
        let toml_str = toml::to_string(&config).unwrap();
        let restored = from_toml_str(&toml_str).unwrap();
        assert_eq!(restored.entities, config.entities);
        assert_eq!(restored.retry, config.retry);
        assert_eq!(
            restored.storage.partition_format,
            config.storage.partition_format
        );
    }
}
