//! Configuration parsing for the replay daemon.
//!
//! Simple `key=value` file format merged over defaults.
//! Precedence: CLI flags > `--config` file > defaults.

use crate::types::ResponseMode;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid response_mode: {0} (expected 'blocking' or 'streaming')")]
    InvalidResponseMode(String),
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    #[error("missing required config key: {0}")]
    MissingKey(&'static str),
}

/// Daemon and run configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Remote chat API
    pub api_url: String,
    pub api_key: String,
    /// User identity reported to the remote service with every turn.
    pub user_id: String,
    /// Per-call timeout in seconds.
    pub timeout_sec: u32,
    pub response_mode: ResponseMode,

    // Retry policy
    /// Retries after the first attempt (total attempts = retries + 1).
    pub retries: u32,
    pub retry_delay_sec: u32,

    // Pacing
    /// Delay between turns within a run, to avoid hammering the API.
    pub case_delay_sec: u32,

    // Input and persistence
    pub cases_path: PathBuf,
    pub db_path: PathBuf,

    // HTTP control plane
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: String::new(),
            user_id: "replay_user".to_string(),
            timeout_sec: 30,
            response_mode: ResponseMode::Streaming,
            retries: 3,
            retry_delay_sec: 5,
            case_delay_sec: 2,
            cases_path: PathBuf::from("cases.csv"),
            db_path: default_db_path(),
            port: 7810,
        }
    }
}

/// Default database path (~/.local/share/replayd/replayd.db).
fn default_db_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("replayd").join("replayd.db")
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "api_url" => self.api_url = value.trim_end_matches('/').to_string(),
            "api_key" => self.api_key = value.to_string(),
            "user_id" => self.user_id = value.to_string(),
            "timeout_sec" => self.timeout_sec = parse_int(key, value)?,
            "response_mode" => {
                self.response_mode = match value.to_ascii_lowercase().as_str() {
                    "blocking" => ResponseMode::Blocking,
                    "streaming" => ResponseMode::Streaming,
                    other => return Err(ConfigError::InvalidResponseMode(other.to_string())),
                }
            }
            "retries" => self.retries = parse_int(key, value)?,
            "retry_delay_sec" => self.retry_delay_sec = parse_int(key, value)?,
            "case_delay_sec" => self.case_delay_sec = parse_int(key, value)?,
            "cases_path" => self.cases_path = PathBuf::from(value),
            "db_path" => self.db_path = PathBuf::from(value),
            "port" => self.port = parse_int(key, value)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Validate values needed before a run can start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_url.is_empty() {
            return Err(ConfigError::MissingKey("api_url"));
        }
        if self.api_key.is_empty() {
            return Err(ConfigError::MissingKey("api_key"));
        }
        if self.timeout_sec == 0 {
            return Err(ConfigError::InvalidInt {
                key: "timeout_sec".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidInt {
        key: key.to_string(),
        value: value.to_string(),
    })
}
