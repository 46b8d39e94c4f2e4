use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::cli::RunArgs;
use crate::mediahaven::MediahavenSettings;
use crate::retry::RetryPolicy;
use crate::sync::SyncConfig;

const DEFAULT_DATABASE: &str = "database.db";
const DEFAULT_IDENTIFIER_POINTER: &str = "/Dynamic/dc_identifier_cpid";

/// On-disk YAML layout.
#[derive(Debug, Deserialize)]
struct FileConfig {
    environment: Environment,
    media_type: String,
    #[serde(default)]
    max_amount_to_process: u64,
    #[serde(default = "default_nr_of_results")]
    nr_of_results: u64,
    #[serde(default)]
    database: Option<String>,
    #[serde(default = "default_throttle_ms")]
    throttle_ms: u64,
    #[serde(default)]
    skip_discovery: bool,
    #[serde(default = "default_identifier_pointer")]
    identifier_pointer: String,
    #[serde(default = "default_request_timeout_secs")]
    request_timeout_secs: u64,
    #[serde(default)]
    retry: RetryPolicy,
    #[serde(default)]
    server: ServerSection,
}

#[derive(Debug, Deserialize)]
struct Environment {
    mediahaven: MediahavenSection,
    vrt_request_api: RequestApiSection,
}

#[derive(Deserialize)]
struct MediahavenSection {
    host: String,
    username: String,
    #[serde(default)]
    password: Option<String>,
}

impl std::fmt::Debug for MediahavenSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediahavenSection")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct RequestApiSection {
    host: String,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    #[serde(default = "default_bind")]
    bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Only the database location, for commands that never contact the APIs.
#[derive(Debug, Default, Deserialize)]
struct DatabaseOnly {
    #[serde(default)]
    database: Option<String>,
}

fn default_nr_of_results() -> u64 {
    1000
}

fn default_throttle_ms() -> u64 {
    1000
}

fn default_identifier_pointer() -> String {
    DEFAULT_IDENTIFIER_POINTER.to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

/// Values given on the command line, applied on top of the file.
#[derive(Default)]
pub struct Overrides {
    pub database: Option<String>,
    pub password: Option<String>,
    pub run: RunArgs,
    pub bind: Option<SocketAddr>,
    pub no_progress_bar: bool,
}

/// Application configuration.
pub struct Config {
    pub mediahaven_host: String,
    pub username: String,
    pub password: String,
    pub media_type: String,
    pub request_api_url: String,
    pub database: PathBuf,
    pub identifier_pointer: String,
    pub retry: RetryPolicy,

    pub page_size: u64,
    pub max_amount: u64,
    pub throttle: Duration,
    pub request_timeout: Duration,
    pub bind: SocketAddr,

    pub skip_discovery: bool,
    pub no_progress_bar: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("mediahaven_host", &self.mediahaven_host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("media_type", &self.media_type)
            .field("request_api_url", &self.request_api_url)
            .field("database", &self.database)
            .field("page_size", &self.page_size)
            .field("max_amount", &self.max_amount)
            .field("skip_discovery", &self.skip_discovery)
            .finish_non_exhaustive()
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Config {
    /// Read and validate the YAML file at `path`, then apply `overrides`.
    pub fn load(path: &Path, overrides: Overrides) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&text, overrides)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml(text: &str, overrides: Overrides) -> anyhow::Result<Self> {
        let file: FileConfig = serde_yaml::from_str(text)?;
        let Environment {
            mediahaven,
            vrt_request_api,
        } = file.environment;

        let password = overrides
            .password
            .or(mediahaven.password)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "No MediaHaven password: set environment.mediahaven.password \
                     or MEDIAHAVEN_PASSWORD"
                )
            })?;

        let database = overrides
            .database
            .or(file.database)
            .unwrap_or_else(|| DEFAULT_DATABASE.to_string());

        let bind = match overrides.bind {
            Some(bind) => bind,
            None => file
                .server
                .bind
                .parse()
                .with_context(|| format!("Invalid server.bind '{}'", file.server.bind))?,
        };

        let config = Self {
            mediahaven_host: mediahaven.host.trim().to_string(),
            username: mediahaven.username,
            password,
            media_type: file.media_type,
            request_api_url: vrt_request_api.host.trim().to_string(),
            database: expand_tilde(&database),
            identifier_pointer: file.identifier_pointer,
            retry: file.retry,
            page_size: file.nr_of_results,
            max_amount: overrides.run.max_amount.unwrap_or(file.max_amount_to_process),
            throttle: Duration::from_millis(overrides.run.throttle_ms.unwrap_or(file.throttle_ms)),
            request_timeout: Duration::from_secs(file.request_timeout_secs),
            bind,
            skip_discovery: overrides.run.skip_discovery || file.skip_discovery,
            no_progress_bar: overrides.no_progress_bar,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.mediahaven_host.is_empty() {
            anyhow::bail!("environment.mediahaven.host must not be empty");
        }
        if self.request_api_url.is_empty() {
            anyhow::bail!("environment.vrt_request_api.host must not be empty");
        }
        if self.media_type.trim().is_empty() {
            anyhow::bail!("media_type must not be empty");
        }
        if self.page_size == 0 {
            anyhow::bail!("nr_of_results must be greater than 0");
        }
        if !self.identifier_pointer.starts_with('/') {
            anyhow::bail!(
                "identifier_pointer '{}' must be a JSON pointer starting with '/'",
                self.identifier_pointer
            );
        }
        Ok(())
    }

    pub fn mediahaven_settings(&self) -> MediahavenSettings {
        MediahavenSettings {
            host: self.mediahaven_host.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            media_type: self.media_type.clone(),
            timeout: self.request_timeout,
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            page_size: self.page_size,
            max_amount: self.max_amount,
            throttle: self.throttle,
            skip_discovery: self.skip_discovery,
            identifier_pointer: self.identifier_pointer.clone(),
            no_progress_bar: self.no_progress_bar,
        }
    }
}

/// Resolve the database path without requiring a complete config file.
///
/// The override wins; otherwise the file's `database` key is used when the
/// file exists and parses, and the default path when it does not.
pub fn database_path(config_path: &Path, database: Option<&str>) -> anyhow::Result<PathBuf> {
    if let Some(db) = database {
        return Ok(expand_tilde(db));
    }
    let from_file = match std::fs::read_to_string(config_path) {
        Ok(text) => {
            serde_yaml::from_str::<DatabaseOnly>(&text)
                .with_context(|| format!("Invalid config file {}", config_path.display()))?
                .database
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            return Err(e).with_context(|| {
                format!("Failed to read config file {}", config_path.display())
            })
        }
    };
    Ok(expand_tilde(from_file.as_deref().unwrap_or(DEFAULT_DATABASE)))
}
