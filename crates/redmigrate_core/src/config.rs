use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ASSEMBLA_BASE_URL: &str = "https://api.assembla.com/v1";
pub const DEFAULT_PER_PAGE: usize = 10;
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_TRACKER_ID: i64 = 2;
pub const DEFAULT_STATUS_ID: i64 = 2;
pub const DEFAULT_ASSETS_DIR: &str = "img";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct MigrationConfig {
    #[serde(default)]
    pub assembla: AssemblaSection,
    #[serde(default)]
    pub redmine: RedmineSection,
    #[serde(default)]
    pub mapping: MappingSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct AssemblaSection {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub space: Option<String>,
    pub base_url: Option<String>,
    pub per_page: Option<usize>,
    pub max_attempts: Option<usize>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct RedmineSection {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub project: Option<String>,
    pub tracker_id: Option<i64>,
    pub default_status_id: Option<i64>,
    pub timeout_ms: Option<u64>,
}

/// Status names and priority ids are platform data, not logic; both tables
/// can be overridden wholesale from the config file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MappingSection {
    #[serde(default = "default_status_map")]
    pub status: BTreeMap<String, i64>,
    #[serde(default = "default_priority_map")]
    pub priority: BTreeMap<String, i64>,
}

impl Default for MappingSection {
    fn default() -> Self {
        Self {
            status: default_status_map(),
            priority: default_priority_map(),
        }
    }
}

impl MigrationConfig {
    /// Resolve the Assembla API key: env ASSEMBLA_API_KEY > config.
    pub fn assembla_api_key(&self) -> Result<String> {
        require_value(
            "ASSEMBLA_API_KEY",
            self.assembla.api_key.as_deref(),
            "[assembla].api_key",
        )
    }

    pub fn assembla_api_secret(&self) -> Result<String> {
        require_value(
            "ASSEMBLA_API_SECRET",
            self.assembla.api_secret.as_deref(),
            "[assembla].api_secret",
        )
    }

    /// Resolve the source space name: env ASSEMBLA_SPACE > config.
    pub fn assembla_space(&self) -> Result<String> {
        require_value(
            "ASSEMBLA_SPACE",
            self.assembla.space.as_deref(),
            "[assembla].space",
        )
    }

    pub fn assembla_base_url(&self) -> String {
        self.assembla
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_ASSEMBLA_BASE_URL.to_string())
    }

    pub fn redmine_url(&self) -> Result<String> {
        require_value("REDMINE_URL", self.redmine.url.as_deref(), "[redmine].url")
    }

    pub fn redmine_api_key(&self) -> Result<String> {
        require_value(
            "REDMINE_API_KEY",
            self.redmine.api_key.as_deref(),
            "[redmine].api_key",
        )
    }

    /// Resolve the target project identifier: env REDMINE_PROJECT > config.
    pub fn redmine_project(&self) -> Result<String> {
        require_value(
            "REDMINE_PROJECT",
            self.redmine.project.as_deref(),
            "[redmine].project",
        )
    }

    pub fn tracker_id(&self) -> i64 {
        self.redmine.tracker_id.unwrap_or(DEFAULT_TRACKER_ID)
    }

    pub fn default_status_id(&self) -> i64 {
        self.redmine.default_status_id.unwrap_or(DEFAULT_STATUS_ID)
    }

    /// Map a source status name to a target status id, falling back to the
    /// configured default for unknown names.
    pub fn status_id(&self, status: &str) -> i64 {
        self.mapping
            .status
            .get(status)
            .copied()
            .unwrap_or_else(|| self.default_status_id())
    }

    /// Map a source priority id to a target priority id. Unknown priorities
    /// have no safe default and are surfaced to the caller.
    pub fn priority_id(&self, priority: i64) -> Option<i64> {
        self.mapping.priority.get(&priority.to_string()).copied()
    }
}

/// Load and parse a MigrationConfig from a TOML file. Returns default if the
/// file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MigrationConfig> {
    if !config_path.exists() {
        return Ok(MigrationConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MigrationConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn require_value(env_key: &str, config_value: Option<&str>, config_key: &str) -> Result<String> {
    if let Ok(value) = env::var(env_key) {
        let trimmed = value.trim().to_string();
        if !trimmed.is_empty() {
            return Ok(trimmed);
        }
    }
    if let Some(value) = config_value
        && !value.trim().is_empty()
    {
        return Ok(value.trim().to_string());
    }
    bail!("{env_key} is not configured (set the env var or {config_key})")
}

fn default_status_map() -> BTreeMap<String, i64> {
    [
        ("New", 1),
        ("Accepted", 2),
        ("Test", 4),
        ("Fixed", 5),
        ("Invalid", 6),
        ("Awaiting Dependency", 4),
        ("Discussion", 4),
        ("In-Progress", 2),
    ]
    .into_iter()
    .map(|(name, id)| (name.to_string(), id))
    .collect()
}

fn default_priority_map() -> BTreeMap<String, i64> {
    [("5", 1), ("4", 1), ("3", 2), ("2", 3), ("1", 4)]
        .into_iter()
        .map(|(priority, id)| (priority.to_string(), id))
        .collect()
}
