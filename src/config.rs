//! Configuration file handling.
//!
//! This module handles loading, validating and merging configuration from
//! `.cadence.toml` files.

use crate::models::SourceDescriptor;
use crate::orchestrator::{ClassifierRule, StagePlan, FALLBACK_CATEGORY};
use crate::worker::HealthThresholds;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Default config file name, looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = ".cadence.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Refresh scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Stage orchestrator settings.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Worker health thresholds.
    #[serde(default)]
    pub health: HealthConfig,

    /// Data sources kept fresh by the scheduler.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Worker units available to the orchestrator.
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,

    /// Category to stage routing.
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Keyword rules used when a request has no category.
    #[serde(default)]
    pub classifier: Vec<ClassifierConfig>,
}

impl Default for Config {
    /// A small self-contained setup: one static source, a snapshot of it and
    /// a digest stage.
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            scheduler: SchedulerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            health: HealthConfig::default(),
            sources: vec![SourceConfig {
                name: "heartbeat".to_string(),
                kind: SourceKind::Static,
                url: None,
                payload: Some(json!({ "status": "ok" })),
                refresh_interval_secs: 60,
                error_backoff_secs: 10,
            }],
            workers: vec![
                WorkerConfig {
                    id: "heartbeat_snapshot".to_string(),
                    kind: WorkerKind::SourceSnapshot,
                    source: Some("heartbeat".to_string()),
                    required_fields: Vec::new(),
                },
                WorkerConfig {
                    id: "digest".to_string(),
                    kind: WorkerKind::StageDigest,
                    source: None,
                    required_fields: Vec::new(),
                },
            ],
            routing: RoutingConfig {
                routes: BTreeMap::from([(
                    FALLBACK_CATEGORY.to_string(),
                    vec![
                        vec!["heartbeat_snapshot".to_string()],
                        vec!["digest".to_string()],
                    ],
                )]),
            },
            classifier: Vec::new(),
        }
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Seconds between status log lines in `serve` mode.
    #[serde(default = "default_status_log_secs")]
    pub status_log_secs: u64,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            status_log_secs: default_status_log_secs(),
            verbose: false,
        }
    }
}

fn default_status_log_secs() -> u64 {
    30
}

/// Refresh scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How long `stop` waits for loops before aborting them.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Request timeout for HTTP sources.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: default_shutdown_grace(),
            http_timeout_secs: default_http_timeout(),
        }
    }
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_http_timeout() -> u64 {
    10
}

/// Stage orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Per-worker timeout. Unset means workers may run as long as they need.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_timeout_secs: Option<u64>,

    /// Category used when no classifier rule matches.
    #[serde(default = "default_category")]
    pub default_category: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_timeout_secs: None,
            default_category: default_category(),
        }
    }
}

fn default_category() -> String {
    FALLBACK_CATEGORY.to_string()
}

/// Worker health thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_min_success_ratio")]
    pub min_success_ratio: f64,

    #[serde(default = "default_max_avg_latency_ms")]
    pub max_avg_latency_ms: u64,

    #[serde(default = "default_max_errors")]
    pub max_errors: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            min_success_ratio: default_min_success_ratio(),
            max_avg_latency_ms: default_max_avg_latency_ms(),
            max_errors: default_max_errors(),
        }
    }
}

fn default_min_success_ratio() -> f64 {
    0.8
}

fn default_max_avg_latency_ms() -> u64 {
    5000
}

fn default_max_errors() -> u64 {
    10
}

impl From<&HealthConfig> for HealthThresholds {
    fn from(config: &HealthConfig) -> Self {
        Self {
            min_success_ratio: config.min_success_ratio,
            max_avg_latency: Duration::from_millis(config.max_avg_latency_ms),
            max_errors: config.max_errors,
        }
    }
}

/// How a source is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// HTTP GET returning JSON.
    HttpJson,
    /// Fixed payload from the config file.
    Static,
}

/// One `[[sources]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,

    pub kind: SourceKind,

    /// Endpoint for `http_json` sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Payload for `static` sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_error_backoff() -> u64 {
    60
}

impl From<&SourceConfig> for SourceDescriptor {
    fn from(config: &SourceConfig) -> Self {
        SourceDescriptor::new(
            config.name.clone(),
            Duration::from_secs(config.refresh_interval_secs),
            Duration::from_secs(config.error_backoff_secs),
        )
    }
}

/// Built-in worker kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Reports one cached source.
    SourceSnapshot,
    /// Digests earlier stages' results.
    StageDigest,
}

/// One `[[workers]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,

    pub kind: WorkerKind,

    /// Source read by `source_snapshot` workers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Request parameters the worker needs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_fields: Vec<String>,
}

/// The `[routing]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Category to ordered stages of worker ids.
    #[serde(default)]
    pub routes: BTreeMap<String, StagePlan>,
}

/// One `[[classifier]]` rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub category: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl From<&ClassifierConfig> for ClassifierRule {
    fn from(config: &ClassifierConfig) -> Self {
        ClassifierRule {
            category: config.category.clone(),
            keywords: config.keywords.clone(),
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only
    /// when given explicitly.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(timeout) = args.worker_timeout {
            self.orchestrator.worker_timeout_secs = Some(timeout);
        }

        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        let mut source_names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                bail!("Source name must not be empty");
            }
            if !source_names.insert(source.name.as_str()) {
                bail!("Duplicate source '{}'", source.name);
            }
            if source.refresh_interval_secs == 0 {
                bail!("Source '{}': refresh_interval_secs must be at least 1", source.name);
            }
            if source.error_backoff_secs == 0 {
                bail!("Source '{}': error_backoff_secs must be at least 1", source.name);
            }
            if source.error_backoff_secs > source.refresh_interval_secs {
                bail!(
                    "Source '{}': error_backoff_secs ({}) exceeds refresh_interval_secs ({})",
                    source.name,
                    source.error_backoff_secs,
                    source.refresh_interval_secs
                );
            }
            match source.kind {
                SourceKind::HttpJson => {
                    let url = source.url.as_deref().unwrap_or("");
                    if !url.starts_with("http://") && !url.starts_with("https://") {
                        bail!(
                            "Source '{}': url must start with 'http://' or 'https://'",
                            source.name
                        );
                    }
                }
                SourceKind::Static => {
                    if source.payload.is_none() {
                        bail!("Source '{}': static sources need a payload", source.name);
                    }
                }
            }
        }

        let mut worker_ids = HashSet::new();
        for worker in &self.workers {
            if worker.id.trim().is_empty() {
                bail!("Worker id must not be empty");
            }
            if !worker_ids.insert(worker.id.as_str()) {
                bail!("Duplicate worker '{}'", worker.id);
            }
            if worker.kind == WorkerKind::SourceSnapshot {
                match worker.source.as_deref() {
                    Some(source) if source_names.contains(source) => {}
                    Some(source) => {
                        bail!("Worker '{}' reads unknown source '{}'", worker.id, source)
                    }
                    None => bail!("Worker '{}' needs a source", worker.id),
                }
            }
        }

        for (category, stages) in &self.routing.routes {
            for id in stages.iter().flatten() {
                if !worker_ids.contains(id.as_str()) {
                    bail!("Route '{}' references unknown worker '{}'", category, id);
                }
            }
        }

        if !(0.0..=1.0).contains(&self.health.min_success_ratio) {
            bail!("health.min_success_ratio must be between 0.0 and 1.0");
        }
        if self.general.status_log_secs == 0 {
            bail!("general.status_log_secs must be at least 1");
        }
        if self.orchestrator.worker_timeout_secs == Some(0) {
            bail!("orchestrator.worker_timeout_secs must be at least 1");
        }
        if self.orchestrator.default_category.trim().is_empty() {
            bail!("orchestrator.default_category must not be empty");
        }

        Ok(())
    }

    pub fn worker_timeout(&self) -> Option<Duration> {
        self.orchestrator.worker_timeout_secs.map(Duration::from_secs)
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.status_log_secs, 30);
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.workers.len(), 2);
        assert!(config.routing.routes.contains_key("general"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[general]
status_log_secs = 10

[orchestrator]
worker_timeout_secs = 4

[[sources]]
name = "odds"
kind = "http_json"
url = "https://example.com/odds.json"
refresh_interval_secs = 30
error_backoff_secs = 5

[[sources]]
name = "league"
kind = "static"
payload = { season = 2024, teams = 12 }

[[workers]]
id = "odds_snapshot"
kind = "source_snapshot"
source = "odds"

[[workers]]
id = "digest"
kind = "stage_digest"
required_fields = ["league_id"]

[routing.routes]
urgent = [["odds_snapshot"], ["digest"]]

[[classifier]]
category = "urgent"
keywords = ["now", "asap"]
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.general.status_log_secs, 10);
        assert_eq!(config.worker_timeout(), Some(Duration::from_secs(4)));
        assert_eq!(config.sources[0].kind, SourceKind::HttpJson);
        assert_eq!(config.sources[1].refresh_interval_secs, 300);
        assert_eq!(config.sources[1].payload.as_ref().unwrap()["teams"], 12);
        assert_eq!(config.workers[1].required_fields, vec!["league_id"]);
        assert_eq!(
            config.routing.routes["urgent"],
            vec![vec!["odds_snapshot".to_string()], vec!["digest".to_string()]]
        );
        assert_eq!(config.classifier[0].keywords, vec!["now", "asap"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_omitted_sections_are_empty() {
        let config: Config = toml::from_str("[general]\nverbose = true\n").unwrap();
        assert!(config.general.verbose);
        assert!(config.sources.is_empty());
        assert!(config.routing.routes.is_empty());
        assert_eq!(config.health.max_errors, 10);
    }

    #[test]
    fn test_validate_rejects_bad_intervals() {
        let mut config = Config::default();
        config.sources[0].refresh_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sources[0].error_backoff_secs = 120;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("exceeds"));
    }

    #[test]
    fn test_validate_rejects_unknown_references() {
        let mut config = Config::default();
        config
            .routing
            .routes
            .insert("trade".to_string(), vec![vec!["ghost".to_string()]]);
        assert!(config.validate().unwrap_err().to_string().contains("ghost"));

        let mut config = Config::default();
        config.workers[0].source = Some("missing".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sources.push(config.sources[0].clone());
        assert!(config.validate().unwrap_err().to_string().contains("Duplicate"));
    }

    #[test]
    fn test_default_toml_round_trips() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[[sources]]"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.sources[0].payload, Some(json!({ "status": "ok" })));
        assert_eq!(parsed.routing.routes, Config::default().routing.routes);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scheduler]\nshutdown_grace_secs = 2").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.scheduler.shutdown_grace_secs, 2);
        assert_eq!(config.scheduler.http_timeout_secs, 10);

        assert!(Config::load(Path::new("/nonexistent/.cadence.toml")).is_err());
    }

    #[test]
    fn test_health_thresholds_from_config() {
        let thresholds = HealthThresholds::from(&HealthConfig::default());
        assert_eq!(thresholds, HealthThresholds::default());
    }
}
