use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::ConfigError;

/// Environment variable that points at the config file.
pub const CONFIG_ENV_VAR: &str = "OANDA_YML";

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "oanda.yml";

const CONFIG_TEMPLATE: &str = "\
---
oanda:
  environment: practice       # { trade, practice }
  token: YOUR_API_TOKEN
  account_id: YOUR_ACCOUNT_ID
instruments:
  - EUR_USD
  - USD_JPY
queue:
  max_length: 1000
";

/// Top-level YAML configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub oanda: OandaConfig,
    #[serde(default)]
    pub instruments: Vec<String>,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OandaConfig {
    pub environment: Environment,
    pub token: String,
    pub account_id: String,
}

/// In-memory queue sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_length: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_length: 1000 }
    }
}

/// Which API host pair to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Trade,
    Practice,
}

impl Environment {
    pub fn rest_url(&self) -> &'static str {
        match self {
            Environment::Trade => "https://api-fxtrade.oanda.com",
            Environment::Practice => "https://api-fxpractice.oanda.com",
        }
    }

    pub fn stream_url(&self) -> &'static str {
        match self {
            Environment::Trade => "https://stream-fxtrade.oanda.com",
            Environment::Practice => "https://stream-fxpractice.oanda.com",
        }
    }
}

/// Resolve the config path: `--file` flag, then `$OANDA_YML`, then
/// `./oanda.yml`.
pub fn resolve_config_path(flag: Option<&Path>) -> PathBuf {
    let path = flag
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    debug!(path = %path.display(), "resolved config path");
    path
}

/// Load and parse the YAML config file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
        path: path.display().to_string(),
        source,
    })
}

/// Write the config template. Returns `false` without touching anything if
/// the file already exists.
pub fn write_config_template(path: &Path) -> Result<bool, ConfigError> {
    if path.exists() {
        return Ok(false);
    }
    fs::write(path, CONFIG_TEMPLATE).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parses() {
        let config: Config = serde_yaml::from_str(CONFIG_TEMPLATE).unwrap();
        assert_eq!(config.oanda.environment, Environment::Practice);
        assert_eq!(config.instruments, vec!["EUR_USD", "USD_JPY"]);
        assert_eq!(config.queue.max_length, 1000);
    }

    #[test]
    fn test_missing_sections_default() {
        let yaml = "oanda:\n  environment: trade\n  token: t\n  account_id: a\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.instruments.is_empty());
        assert_eq!(config.queue.max_length, 1000);
        assert_eq!(config.oanda.environment.rest_url(), "https://api-fxtrade.oanda.com");
        assert_eq!(
            config.oanda.environment.stream_url(),
            "https://stream-fxtrade.oanda.com"
        );
    }

    #[test]
    fn test_resolve_prefers_flag() {
        let flag = PathBuf::from("/tmp/custom.yml");
        assert_eq!(resolve_config_path(Some(&flag)), flag);
    }

    #[test]
    fn test_write_template_refuses_overwrite() {
        let path = std::env::temp_dir().join("test_oanda_cfg_overwrite.yml");
        let _ = fs::remove_file(&path);
        assert!(write_config_template(&path).unwrap());
        assert!(!write_config_template(&path).unwrap());
        let _ = fs::remove_file(&path);
    }
}
