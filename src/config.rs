use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use async_trait::async_trait;
use dashmap::DashMap;
use protocol_runtime::LifecycleConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const ROOT_ENV: &str = "JARVIS_ROOT";
pub const PROTOCOLS_DIR: &str = "JARVIS_PROTOCOLS_DIR";
pub const CHANNEL_DIR: &str = "JARVIS_CHANNEL_DIR";
pub const INTERPRETER: &str = "JARVIS_INTERPRETER";
pub const ACTIVATION_TIMEOUT_MS: &str = "JARVIS_ACTIVATION_TIMEOUT_MS";
pub const GRACE_PERIOD_MS: &str = "JARVIS_GRACE_PERIOD_MS";
pub const REQUEST_TIMEOUT_MS: &str = "JARVIS_REQUEST_TIMEOUT_MS";
pub const COMMS_POLL_MS: &str = "JARVIS_COMMS_POLL_MS";
pub const BOOT_PROTOCOL: &str = "JARVIS_BOOT_PROTOCOL";

/// `JARVIS_ROOT`, or `./jarvis`.
pub fn resolve_root_dir() -> PathBuf {
    env::var_os(ROOT_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./jarvis"))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("`{key}` must be a number of milliseconds, got `{value}`")]
    InvalidDuration { key: String, value: String },

    #[error("could not write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                pairs.push((key, value));
            }
        }
        pairs
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

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

/// Process environment backed by a `.env` file that `set`/`del` keep in sync.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("loaded settings from {}", env_file.display()),
                Err(e) => warn!(error = %e, "could not parse {}", env_file.display()),
            }
        } else {
            warn!("no settings file at {}", env_file.display());
        }
        Box::new(Self { env_file })
    }

    pub fn env_file(&self) -> &Path {
        &self.env_file
    }

    /// Rewrites the file with `key` set to `value`, or removed when `None`.
    fn rewrite(&self, key: &str, value: Option<&str>) -> Result<(), ConfigError> {
        let existing = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut replaced = false;
        let mut lines: Vec<String> = Vec::new();
        for line in existing.lines() {
            let is_key = line.split_once('=').is_some_and(|(k, _)| k.trim() == key);
            if !is_key {
                lines.push(line.to_string());
            } else if let Some(value) = value {
                if !replaced {
                    lines.push(format!("{key}={value}"));
                    replaced = true;
                }
            }
        }
        if let (Some(value), false) = (value, replaced) {
            lines.push(format!("{key}={value}"));
        }
        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        fs::write(&self.env_file, content).map_err(|source| ConfigError::Write {
            path: self.env_file.clone(),
            source,
        })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.rewrite(key, Some(value))?;
        // SAFETY: settings change from the CLI before the runtime spawns threads
        unsafe { env::set_var(key, value) };
        Ok(())
    }

    async fn del(&self, key: &str) {
        if let Err(e) = self.rewrite(key, None) {
            warn!(error = %e, key, "could not remove setting from file");
        }
        // SAFETY: see `set`
        unsafe { env::remove_var(key) };
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// In-memory settings, mostly for tests and embedding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::default()
    }

    pub fn with(self: Box<Self>, key: &str, value: &str) -> Box<Self> {
        self.map.insert(key.to_string(), value.to_string());
        self
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|e| e.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Typed hub settings. Directories default to subdirectories of the root.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub root: PathBuf,
    pub protocols_dir: PathBuf,
    pub channel_dir: PathBuf,
    pub comms_dir: PathBuf,
    pub log_dir: PathBuf,
    pub interpreter: Option<PathBuf>,
    pub activation_timeout: Duration,
    pub grace_period: Duration,
    pub request_timeout: Duration,
    pub comms_poll: Duration,
    /// Protocol activated right after startup.
    pub boot_protocol: Option<String>,
}

impl HubSettings {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            protocols_dir: root.join("protocols"),
            channel_dir: root.join("channels"),
            comms_dir: root.join("comms"),
            log_dir: root.join("logs"),
            root,
            interpreter: None,
            activation_timeout: Duration::from_secs(10),
            grace_period: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            comms_poll: Duration::from_millis(100),
            boot_protocol: None,
        }
    }

    pub async fn from_config(root: impl Into<PathBuf>, config: &ConfigManager) -> Result<Self, ConfigError> {
        let mut settings = Self::with_root(root);
        let cfg = &config.0;
        if let Some(dir) = cfg.get(PROTOCOLS_DIR).await {
            settings.protocols_dir = PathBuf::from(dir);
        }
        if let Some(dir) = cfg.get(CHANNEL_DIR).await {
            settings.channel_dir = PathBuf::from(dir);
        }
        settings.interpreter = cfg.get(INTERPRETER).await.filter(|s| !s.is_empty()).map(PathBuf::from);
        settings.boot_protocol = cfg.get(BOOT_PROTOCOL).await.filter(|s| !s.is_empty());

        for (key, slot) in [
            (ACTIVATION_TIMEOUT_MS, &mut settings.activation_timeout),
            (GRACE_PERIOD_MS, &mut settings.grace_period),
            (REQUEST_TIMEOUT_MS, &mut settings.request_timeout),
            (COMMS_POLL_MS, &mut settings.comms_poll),
        ] {
            if let Some(raw) = cfg.get(key).await {
                *slot = parse_millis(key, &raw)?;
            }
        }
        Ok(settings)
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        let mut config = LifecycleConfig::new(&self.channel_dir, &self.protocols_dir);
        config.interpreter = self.interpreter.clone();
        config.activation_timeout = self.activation_timeout;
        config.grace_period = self.grace_period;
        config.request_timeout = self.request_timeout;
        config.log_dir = Some(self.log_dir.clone());
        config
    }
}

fn parse_millis(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::InvalidDuration {
            key: key.to_string(),
            value: raw.to_string(),
        })
}
