//! Worker configuration.
//!
//! Loaded once from `FERRYX_*` environment variables via `envy`:
//!   - `FERRYX_HUB_URL`        (required, coordinator base URL)
//!   - `FERRYX_HUB_TOKEN`      (required, raw base64 key or signed token)
//!   - `FERRYX_GROUP`          (required, group to join)
//!   - `FERRYX_LISTEN_ADDR`    (default `0.0.0.0:16080`)
//!   - `FERRYX_OPERATION_ROOT` (default `/ferryx/operation`)
//!   - `FERRYX_SHELL`          (default `bash`)

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;
use url::Url;

use ferryx_common::contract::{hub, operation};

use crate::error::ConfigError;
use crate::token;

pub const ENV_PREFIX: &str = "FERRYX_";

/// Raw configuration as read from the environment.
#[derive(Debug, Default, Deserialize)]
pub struct WorkerConfig {
    pub hub_url: Option<String>,
    pub hub_token: Option<String>,
    pub group: Option<String>,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_operation_root")]
    pub operation_root: String,

    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:16080".to_string()
}

fn default_operation_root() -> String {
    operation::DEFAULT_ROOT.to_string()
}

fn default_shell() -> String {
    "bash".to_string()
}

impl WorkerConfig {
    /// Reads `FERRYX_*` variables from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be deserialized.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed(ENV_PREFIX).from_env()
    }

    /// Reads `FERRYX_*` variables from an explicit list of pairs.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be deserialized.
    pub fn from_pairs<I>(pairs: I) -> Result<Self, envy::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::prefixed(ENV_PREFIX).from_iter(pairs)
    }
}

/// Immutable coordinator settings shared by the session manager.
#[derive(Clone)]
pub struct HubOptions {
    pub hub_url: Url,
    pub token: String,
    pub group: String,
}

impl HubOptions {
    /// Full URL of the deploy hub.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}{}", self.hub_url.as_str().trim_end_matches('/'), hub::PATH)
    }
}

impl fmt::Debug for HubOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubOptions")
            .field("hub_url", &self.hub_url.as_str())
            .field("token", &"<redacted>")
            .field("group", &self.group)
            .finish()
    }
}

/// Validated process-wide settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub hub: HubOptions,
    pub listen_addr: SocketAddr,
    pub operation_root: PathBuf,
    pub shell: String,
}

impl Settings {
    /// Validates `config` and provisions the hub token.
    ///
    /// # Errors
    ///
    /// Returns an error if a required value is missing or blank, the hub URL
    /// is unusable, or the hub key cannot be turned into a token.
    pub fn from_config(config: WorkerConfig) -> Result<Self, ConfigError> {
        let raw_token = required(config.hub_token, "FERRYX_HUB_TOKEN")?;
        let group = required(config.group, "FERRYX_GROUP")?;
        let raw_url = required(config.hub_url, "FERRYX_HUB_URL")?;

        let hub_url = Url::parse(raw_url.trim()).map_err(|source| ConfigError::InvalidUrl {
            url: raw_url.clone(),
            source,
        })?;
        if !matches!(hub_url.scheme(), "http" | "https") {
            return Err(ConfigError::UnsupportedScheme(hub_url.scheme().to_string()));
        }

        let listen_addr = config
            .listen_addr
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddr(config.listen_addr.clone()))?;

        let token = token::provision(&raw_token)?;

        Ok(Self {
            hub: HubOptions {
                hub_url,
                token,
                group,
            },
            listen_addr,
            operation_root: PathBuf::from(config.operation_root),
            shell: config.shell,
        })
    }
}

fn required(value: Option<String>, name: &'static str) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name)),
    }
}
