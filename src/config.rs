use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use async_trait::async_trait;
use dashmap::DashMap;
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::constants::LogLevel;

pub const LISTEN_TO_EMPTY_PORTS_KEY: &str = "PORTS_LISTEN_TO_EMPTY_PORTS";
pub const WARN_ON_IGNORED_RETURNS_KEY: &str = "PORTS_WARN_ON_IGNORED_RETURNS";
pub const LOGGING_KEY: &str = "PORTS_LOGGING";

/// Flags for one attach call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct AttachOptions {
    /// Attach a log-and-discard listener to outbound ports nobody declared.
    pub listen_to_empty_ports: bool,
    /// Warn when a port without a reply returns something other than null.
    pub warn_on_ignored_returns: bool,
    /// Verbosity of the logger created for the attach call.
    pub logging: LogLevel,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            listen_to_empty_ports: true,
            warn_on_ignored_returns: true,
            logging: LogLevel::Errors,
        }
    }
}

impl AttachOptions {
    pub fn listen_to_empty_ports(mut self, on: bool) -> Self {
        self.listen_to_empty_ports = on;
        self
    }

    pub fn warn_on_ignored_returns(mut self, on: bool) -> Self {
        self.warn_on_ignored_returns = on;
        self
    }

    pub fn logging(mut self, level: LogLevel) -> Self {
        self.logging = level;
        self
    }

    /// Reads the `PORTS_*` keys; anything missing keeps its default.
    pub async fn load(config: &ConfigManager) -> Result<Self, ConfigError> {
        let mut options = Self::default();
        if let Some(raw) = config.0.get(LISTEN_TO_EMPTY_PORTS_KEY).await {
            options.listen_to_empty_ports = parse_bool(LISTEN_TO_EMPTY_PORTS_KEY, &raw)?;
        }
        if let Some(raw) = config.0.get(WARN_ON_IGNORED_RETURNS_KEY).await {
            options.warn_on_ignored_returns = parse_bool(WARN_ON_IGNORED_RETURNS_KEY, &raw)?;
        }
        if let Some(raw) = config.0.get(LOGGING_KEY).await {
            options.logging = LogLevel::from_str(raw.trim()).map_err(|_| ConfigError::InvalidValue {
                key: LOGGING_KEY.to_string(),
                value: raw.clone(),
                expected: "NONE, ERRORS, RESULT or DEBUG",
            })?;
        }
        debug!(?options, "attach options loaded from {}", config.0.debug_box());
        Ok(options)
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            expected: "a boolean",
        }),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config key {key} has value `{value}` but expected {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },
}

#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment first, then the entries of an optional `.env` file.
/// The file is read once and never written back into the environment.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
    file_values: DashMap<String, String>,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        let file_values = DashMap::new();
        if env_file.exists() {
            match dotenvy::from_path_iter(&env_file) {
                Ok(iter) => {
                    for item in iter {
                        match item {
                            Ok((k, v)) => {
                                file_values.insert(k, v);
                            }
                            Err(err) => warn!("skipping malformed line in {}: {err}", env_file.display()),
                        }
                    }
                    info!("Loaded .env from {}", env_file.display());
                }
                Err(err) => warn!("could not read .env from {}: {err}", env_file.display()),
            }
        } else {
            debug!("no .env at {}", env_file.display())
        }

        Box::new(Self { env_file, file_values })
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = env::vars().map(|(k, _)| k).collect();
        for entry in self.file_values.iter() {
            if !keys.contains(entry.key()) {
                keys.push(entry.key().clone());
            }
        }
        keys
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key)
            .ok()
            .or_else(|| self.file_values.get(key).map(|v| v.clone()))
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Writes `attach-options.schema.json` into `out_dir` and returns its path.
pub fn write_options_schema(out_dir: &Path) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(out_dir)?;
    let schema = schema_for!(AttachOptions);
    let path = out_dir.join("attach-options.schema.json");
    fs::write(&path, serde_json::to_string_pretty(&schema)?)?;
    Ok(path)
}
