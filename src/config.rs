use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_suffix")]
    pub log_suffix: String,
    #[serde(default = "default_disk_mount")]
    pub disk_mount: String,
    #[serde(default = "default_temperature_sensor")]
    pub temperature_sensor: String,
    #[serde(default)]
    pub stop_when_idle: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("config validation error: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if self.tick_secs < 1 {
            return Err(ConfigError::Validation(
                "tick_secs must be >= 1".to_string(),
            ));
        }
        if self.log_dir.trim().is_empty() {
            return Err(ConfigError::Validation(
                "log_dir must not be empty".to_string(),
            ));
        }
        if self.log_suffix.trim().is_empty() {
            return Err(ConfigError::Validation(
                "log_suffix must not be empty".to_string(),
            ));
        }
        if self.disk_mount.trim().is_empty() {
            return Err(ConfigError::Validation(
                "disk_mount must not be empty".to_string(),
            ));
        }
        if self.temperature_sensor.trim().is_empty() {
            return Err(ConfigError::Validation(
                "temperature_sensor must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

const fn default_tick_secs() -> u64 {
    3
}

fn default_log_dir() -> String {
    "/var/log/apache2".to_string()
}

fn default_log_suffix() -> String {
    "_access.log".to_string()
}

fn default_disk_mount() -> String {
    "/".to_string()
}

fn default_temperature_sensor() -> String {
    "coretemp".to_string()
}
