use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "config.json";
pub const DEFAULT_API_PORT: u16 = 47675;
pub const DEFAULT_API_ALT_PORT: u16 = 47676;
const CONFIG_DIR_NAME: &str = "qbt-inhibitor";
const ENV_QBT_PASSWORD: &str = "QBT_INHIBITOR_QBT_PASSWORD";
const ENV_PLEX_TOKEN: &str = "QBT_INHIBITOR_PLEX_TOKEN";
const ENV_RELEASE_CHECK: &str = "QBT_INHIBITOR_RELEASE_CHECK";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration file found (searched: {})", display_paths(.0))]
    NotFound(Vec<PathBuf>),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Deployment configuration, read from `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InhibitorConfig {
    pub qbt_url: String,
    pub qbt_user: String,
    #[serde(default)]
    pub qbt_password: String,
    #[serde(default)]
    pub plex_url: Option<String>,
    #[serde(default)]
    pub plex_token: Option<String>,
    #[serde(default = "default_api_ip")]
    pub api_ip: IpAddr,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_api_alt_port")]
    pub api_alt_port: u16,
    #[serde(default)]
    pub net_interface: Option<String>,
    #[serde(default = "default_net_threshold")]
    pub net_threshold_mbit: f64,
    #[serde(default)]
    pub release_repo: Option<String>,
    #[serde(default = "default_true")]
    pub release_check: bool,
}

fn default_api_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}

fn default_api_alt_port() -> u16 {
    DEFAULT_API_ALT_PORT
}

fn default_net_threshold() -> f64 {
    0.5
}

fn default_true() -> bool {
    true
}

impl InhibitorConfig {
    /// Resolves the config path: an explicit path must exist; otherwise the
    /// working directory is tried before the user config directory.
    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return if path.exists() {
                Ok(path.to_path_buf())
            } else {
                Err(ConfigError::NotFound(vec![path.to_path_buf()]))
            };
        }
        let mut candidates = vec![PathBuf::from(DEFAULT_CONFIG_FILE)];
        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join(CONFIG_DIR_NAME).join(DEFAULT_CONFIG_FILE));
        }
        candidates
            .iter()
            .find(|path| path.exists())
            .cloned()
            .ok_or(ConfigError::NotFound(candidates))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(password) = lookup(ENV_QBT_PASSWORD) {
            self.qbt_password = password;
        }
        if let Some(token) = lookup(ENV_PLEX_TOKEN) {
            self.plex_token = Some(token);
        }
        if let Some(flag) = lookup(ENV_RELEASE_CHECK) {
            self.release_check = !is_disabled_flag(&flag);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.qbt_url.trim().is_empty() {
            return Err(ConfigError::Invalid("qbt_url must not be empty".into()));
        }
        if self.plex_url.is_some() && self.plex_token.is_none() {
            return Err(ConfigError::Invalid(
                "plex_url requires plex_token".into(),
            ));
        }
        if !self.net_threshold_mbit.is_finite() || self.net_threshold_mbit < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "net_threshold_mbit must be a non-negative number, got {}",
                self.net_threshold_mbit
            )));
        }
        Ok(())
    }
}

fn is_disabled_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "off" | "no"
    )
}
