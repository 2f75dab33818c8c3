//! Configuration
//!
//! - `ConfigSet`: per-task configuration values hashed into signatures
//! - `EngineConfig`: scheduler-facing settings, with defaults in ~/.kiln/config.json

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::hasher::{Digest, Fold};

/// A configuration value: a single string or an ordered list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Str(String),
    List(Vec<String>),
}

impl ConfigValue {
    /// Values as command arguments; an empty string expands to nothing
    pub fn as_list(&self) -> Vec<String> {
        match self {
            ConfigValue::Str(s) if s.is_empty() => Vec::new(),
            ConfigValue::Str(s) => vec![s.clone()],
            ConfigValue::List(l) => l.clone(),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::Str(s.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(s: String) -> Self {
        ConfigValue::Str(s)
    }
}

impl From<Vec<String>> for ConfigValue {
    fn from(l: Vec<String>) -> Self {
        ConfigValue::List(l)
    }
}

/// Ordered set of named configuration values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigSet {
    values: BTreeMap<String, ConfigValue>,
}

impl ConfigSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    /// Values of `key` as a list, empty when undefined
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.values.get(key).map(ConfigValue::as_list).unwrap_or_default()
    }

    /// Space-joined value, empty when undefined
    pub fn get_flat(&self, key: &str) -> String {
        self.get_list(key).join(" ")
    }

    /// Copy of `self` with `overrides` applied on top
    pub fn derive(&self, overrides: &BTreeMap<String, ConfigValue>) -> ConfigSet {
        let mut values = self.values.clone();
        values.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        ConfigSet { values }
    }

    /// Digest of the named subset, in the order given.
    /// Undefined keys hash differently from empty values.
    pub fn hash_keys(&self, keys: &[String]) -> Digest {
        let mut fold = Fold::new();
        for key in keys {
            fold.str(key);
            match self.values.get(key) {
                None => {
                    fold.str("\0undefined");
                }
                Some(ConfigValue::Str(s)) => {
                    fold.str("s").str(s);
                }
                Some(ConfigValue::List(list)) => {
                    fold.str("l");
                    for item in list {
                        fold.str(item);
                    }
                }
            }
        }
        fold.finish()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Scheduler-facing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker count, at least 1
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    /// Continue with independent tasks after a failure
    #[serde(default)]
    pub keep_going: bool,
    /// Bypass the artifact cache
    #[serde(default)]
    pub no_cache: bool,
    /// Glob patterns of outputs whose producers always run
    #[serde(default)]
    pub force: Vec<String>,
    /// Local artifact cache root
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Remote cache server address (host:port)
    #[serde(default)]
    pub net_cache: Option<String>,
    /// Directory holding the persisted build state and temporary copies
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Build variant; each variant has its own state store
    #[serde(default = "default_variant")]
    pub variant: String,
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".kiln")
}

fn default_variant() -> String {
    "default".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            keep_going: false,
            no_cache: false,
            force: Vec::new(),
            cache_dir: None,
            net_cache: None,
            state_dir: default_state_dir(),
            variant: default_variant(),
        }
    }
}

impl EngineConfig {
    /// Where the persisted tables of this variant live, relative to `root`
    pub fn state_path(&self, root: &std::path::Path) -> PathBuf {
        root.join(&self.state_dir).join("state").join(&self.variant)
    }

    /// Where modify steps keep their temporary copies
    pub fn tmp_path(&self, root: &std::path::Path) -> PathBuf {
        root.join(&self.state_dir).join("tmp")
    }
}

/// Get config file path (~/.kiln/config.json)
pub fn get_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kiln")
        .join("config.json")
}

/// Load engine config from disk, defaults when absent
pub fn load_config() -> Result<EngineConfig> {
    let path = get_config_path();
    if !path.exists() {
        return Ok(EngineConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config: EngineConfig = serde_json::from_str(&content)?;
    Ok(config)
}

/// Save engine config to disk
pub fn save_config(config: &EngineConfig) -> Result<()> {
    let path = get_config_path();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, content)?;

    tracing::info!("Config saved to {:?}", path);
    Ok(())
}
