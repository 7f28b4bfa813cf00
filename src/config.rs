//! Configuration, loaded once at startup.
//!
//! Lookup order: `--config <path>`, `$DEPOTSYNC_CONFIG`, then
//! `<config_dir>/depotsync/config.toml`. A missing default file means
//! defaults; an explicit file that cannot be read or parsed is an error.
//! `DEPOTSYNC_SERVICE_URL`, `DEPOTSYNC_USER`, `DEPOTSYNC_PASSWORD` and
//! `DEPOTSYNC_PROXY` override the file.

use crate::error::{Result, SyncError};
use crate::filter::case::platform_is_case_insensitive;
use crate::server::protocol::Credentials;
use crate::streaming::channel::{DEFAULT_BATCH_BYTES, DEFAULT_WORKERS, STAGE_CHANNEL_SIZE};
use crate::streaming::pipeline::PipelineOptions;
use crate::transfer::DEFAULT_PATH_FORMAT;
use crate::transport::{parse_service_addr, ServiceClient};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "DEPOTSYNC_CONFIG";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub service_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub proxy_url: Option<String>,
    pub pipeline: PipelineConfig,
    pub service: ServiceConfig,
    pub depot: DepotConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub batch_bytes: u64,
    pub workers: usize,
    pub channel_capacity: usize,
    pub case_insensitive: bool,
    pub havelist: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_bytes: DEFAULT_BATCH_BYTES,
            workers: DEFAULT_WORKERS,
            channel_capacity: STAGE_CHANNEL_SIZE,
            case_insensitive: platform_is_case_insensitive(),
            havelist: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { timeout_secs: 5 }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DepotConfig {
    /// fstat command template; `{prefix}`, `{from}`, `{to}` are substituted
    pub command: Option<String>,
    /// head command template; `{prefix}` is substituted
    pub head_command: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    pub command: Option<String>,
    pub force_args: Vec<String>,
    pub path_format: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            command: None,
            force_args: vec!["-f".to_string()],
            path_format: DEFAULT_PATH_FORMAT.to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_url: None,
            username: None,
            password: None,
            proxy_url: None,
            pipeline: PipelineConfig::default(),
            service: ServiceConfig::default(),
            depot: DepotConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

/// Default config file location
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("depotsync").join("config.toml"))
}

impl Config {
    /// Load, apply environment overrides and validate.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os(CONFIG_ENV)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        let mut config = match explicit.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => match default_config_path() {
                Some(path) if path.is_file() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::parse(&contents)
            .map_err(|e| SyncError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    pub fn parse(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn apply_env_overrides(&mut self) {
        let var = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        if let Some(v) = var("DEPOTSYNC_SERVICE_URL") {
            self.service_url = Some(v);
        }
        if let Some(v) = var("DEPOTSYNC_USER") {
            self.username = Some(v);
        }
        if let Some(v) = var("DEPOTSYNC_PASSWORD") {
            self.password = Some(v);
        }
        if let Some(v) = var("DEPOTSYNC_PROXY") {
            self.proxy_url = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.workers == 0 {
            return Err(SyncError::Config("pipeline.workers must be at least 1".to_string()));
        }
        if self.pipeline.batch_bytes == 0 {
            return Err(SyncError::Config("pipeline.batch_bytes must be at least 1".to_string()));
        }
        if self.pipeline.channel_capacity == 0 {
            return Err(SyncError::Config(
                "pipeline.channel_capacity must be at least 1".to_string(),
            ));
        }
        for url in [&self.service_url, &self.proxy_url].into_iter().flatten() {
            parse_service_addr(url)?;
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(SyncError::Config(
                "username and password must be given together".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            channel_capacity: self.pipeline.channel_capacity,
            batch_bytes: self.pipeline.batch_bytes,
            workers: self.pipeline.workers,
        }
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    /// Client for the fstat service, via the proxy when one is set.
    pub fn service_client(&self) -> Result<Option<ServiceClient>> {
        let Some(url) = self.proxy_url.as_ref().or(self.service_url.as_ref()) else {
            return Ok(None);
        };
        Ok(Some(
            ServiceClient::new(url)?
                .with_credentials(self.credentials())
                .with_timeout(Duration::from_secs(self.service.timeout_secs)),
        ))
    }
}
