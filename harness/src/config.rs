//! Configuration parsing for tuning runs.

use std::{collections::HashSet, path::Path};

use inctune_config::{CandidateParams, DataParams, TuneParams};
use inctune_core::{Candidate, Dataset};
use serde::{Deserialize, Serialize};

use crate::store::validate_name;

/// Top-level configuration loaded from TOML (raw, before merging).
#[derive(Debug, Clone, Deserialize)]
struct RawTuneConfig {
    #[serde(default)]
    pub tune: TuneParams,
    #[serde(default)]
    pub data: DataParams,
    #[serde(default)]
    pub swarm: SwarmSettings,
    #[serde(default = "empty_table")]
    pub defaults: toml::Value,
    #[serde(default)]
    pub candidates: Vec<toml::Value>,
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

/// Top-level configuration after merging defaults into candidates.
#[derive(Debug, Clone)]
pub struct TuneConfig {
    pub tune: TuneParams,
    pub data: DataParams,
    pub swarm: SwarmSettings,
    pub candidates: Vec<CandidateParams>,
}

/// Settings for `inctune swarm`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmSettings {
    /// Default number of worker processes.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// `RUST_LOG` value to pass to worker processes.
    #[serde(default)]
    pub rust_log: Option<String>,
}

impl Default for SwarmSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            rust_log: None,
        }
    }
}

fn default_workers() -> usize {
    2
}

/// Merge two TOML tables, with `overlay` values taking precedence.
fn merge_toml(base: &toml::Value, overlay: &toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(base_map), toml::Value::Table(overlay_map)) => {
            let mut merged = base_map.clone();
            for (k, v) in overlay_map {
                merged.insert(
                    k.clone(),
                    if let Some(base_v) = base_map.get(k) {
                        merge_toml(base_v, v)
                    } else {
                        v.clone()
                    },
                );
            }
            toml::Value::Table(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

impl TuneConfig {
    /// Load configuration from a TOML file, merging defaults into each candidate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().display().to_string(), e))?;
        content.parse()
    }

    /// Instantiate every configured candidate, in config order.
    #[must_use]
    pub fn build_candidates(&self) -> Vec<Box<dyn Candidate>> {
        self.candidates
            .iter()
            .map(inctune_models::build_candidate)
            .collect()
    }

    /// The training data described by `[data]`.
    pub fn dataset(&self) -> Result<Dataset, ConfigError> {
        inctune_data::blobs(&self.data).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.candidates.is_empty() {
            return Err(ConfigError::Invalid("no [[candidates]] configured".into()));
        }
        let mut names = HashSet::new();
        for candidate in &self.candidates {
            let name = candidate.name.as_str();
            if validate_name(name).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "candidate name {name:?} cannot be used as a directory name"
                )));
            }
            if !names.insert(name) {
                return Err(ConfigError::DuplicateCandidate(name.to_string()));
            }
        }
        if self.data.instances == 0 {
            return Err(ConfigError::Invalid("[data] instances must be positive".into()));
        }
        Ok(())
    }
}

impl std::str::FromStr for TuneConfig {
    type Err = ConfigError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let raw: RawTuneConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let candidates: Vec<CandidateParams> = raw
            .candidates
            .iter()
            .map(|value| {
                merge_toml(&raw.defaults, value)
                    .try_into()
                    .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))
            })
            .collect::<Result<_, _>>()?;

        let config = Self {
            tune: raw.tune,
            data: raw.data,
            swarm: raw.swarm,
            candidates,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("duplicate candidate name {0}")]
    DuplicateCandidate(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}
