//! Upload configuration
//!
//! Loaded from a YAML file (path from `ROW_UPLOAD_CONFIG`) and then
//! overridden by individual environment variables.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

pub const CONFIG_PATH_VAR: &str = "ROW_UPLOAD_CONFIG";
pub const AGENT_VAR: &str = "ROW_UPLOAD_AGENT";
pub const MODE_VAR: &str = "ROW_UPLOAD_MODE";
pub const CLEARED_POLICY_VAR: &str = "ROW_UPLOAD_CLEARED_POLICY";

/// Whether rows are written or only checked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    #[default]
    Commit,
    /// Every row is rolled back after its decisions are made
    Validate,
}

/// What happens to a previously linked record whose relationship the row
/// now leaves blank
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearedRelationshipPolicy {
    /// Keep the record
    #[default]
    Hold,
    /// Delete the record unless something else still references it
    Delete,
}

impl FromStr for UploadMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "commit" => Ok(UploadMode::Commit),
            "validate" | "dry-run" | "dry_run" => Ok(UploadMode::Validate),
            other => Err(ConfigError::InvalidValue {
                key: MODE_VAR.to_string(),
                value: other.to_string(),
                message: "valid values: commit, validate".to_string(),
            }),
        }
    }
}

impl fmt::Display for UploadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadMode::Commit => write!(f, "commit"),
            UploadMode::Validate => write!(f, "validate"),
        }
    }
}

impl FromStr for ClearedRelationshipPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hold" => Ok(ClearedRelationshipPolicy::Hold),
            "delete" => Ok(ClearedRelationshipPolicy::Delete),
            other => Err(ConfigError::InvalidValue {
                key: CLEARED_POLICY_VAR.to_string(),
                value: other.to_string(),
                message: "valid values: hold, delete".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadConfig {
    /// Acting identity recorded in the audit trail
    pub agent: String,
    pub mode: UploadMode,
    pub cleared_relationship_policy: ClearedRelationshipPolicy,
    /// Batch scope: scope table -> record id
    pub scope: BTreeMap<String, String>,
    /// Stop processing after the first row that fails
    pub stop_on_failed_row: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            agent: "row-upload".to_string(),
            mode: UploadMode::Commit,
            cleared_relationship_policy: ClearedRelationshipPolicy::Hold,
            scope: BTreeMap::new(),
            stop_on_failed_row: false,
        }
    }
}

impl UploadConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|e| ConfigError::Read {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading upload configuration from {}", path.display());
        let read_error = |message: String| ConfigError::Read {
            path: path.display().to_string(),
            message,
        };
        let content = std::fs::read_to_string(path).map_err(|e| read_error(e.to_string()))?;
        serde_yaml::from_str(&content).map_err(|e| read_error(e.to_string()))
    }

    /// File named by `ROW_UPLOAD_CONFIG` (or defaults), then env overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let base = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        base.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `ROW_UPLOAD_*` overrides from a variable lookup
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(agent) = lookup(AGENT_VAR).filter(|a| !a.trim().is_empty()) {
            self.agent = agent.trim().to_string();
        }
        if let Some(mode) = lookup(MODE_VAR) {
            self.mode = mode.parse()?;
        }
        if let Some(policy) = lookup(CLEARED_POLICY_VAR) {
            self.cleared_relationship_policy = policy.parse()?;
        }
        Ok(self)
    }
}
