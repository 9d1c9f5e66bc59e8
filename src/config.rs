use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::entry::DEFAULT_CHUNK_SIZE;
use crate::core::ignore::IgnoreRules;

pub const DEFAULT_CONFIG_FILE: &str = "backsweep.toml";
const ENV_PREFIX: &str = "BACKSWEEP_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub source_root: PathBuf,
    pub catalog_path: PathBuf,
    /// Deepest folder level descended into; unset means unbounded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,
    pub hash_chunk_size: usize,
    pub ignore: IgnoreConfig,
    pub mirror: MirrorConfig,
    pub object_store: ObjectStoreConfig,
    pub log: LogSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from("."),
            catalog_path: PathBuf::from("backsweep.db"),
            max_depth: None,
            hash_chunk_size: DEFAULT_CHUNK_SIZE,
            ignore: IgnoreConfig::default(),
            mirror: MirrorConfig::default(),
            object_store: ObjectStoreConfig::default(),
            log: LogSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreConfig {
    /// `|`-separated glob patterns matched against root-relative paths
    pub patterns: String,
    pub files: Vec<String>,
    pub folders: Vec<String>,
}

impl IgnoreConfig {
    pub fn compile(&self) -> Result<IgnoreRules, regex::Error> {
        IgnoreRules::new(&self.patterns, &self.files, &self.folders)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub enabled: bool,
    pub destination: PathBuf,
    pub sync_files: bool,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            destination: PathBuf::new(),
            sync_files: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub bucket: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    pub reduced_redundancy: bool,
    /// Validate credentials and connectivity without writing anything
    pub test_only: bool,
    pub timeout_secs: u64,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            bucket: String::new(),
            access_token: None,
            reduced_redundancy: false,
            test_only: false,
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub json: bool,
    pub verbose: bool,
}

impl AppConfig {
    /// Layer defaults, the TOML file, `BACKSWEEP_*` environment variables
    /// (nested keys split on `__`) and finally CLI overrides.
    pub fn load<T: Serialize>(file: &Path, overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", file.display()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}
