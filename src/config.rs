//! Packager configuration
//!
//! Resolution priority:
//! 1. `--config <path>` flag
//! 2. `$MODELPACK_HOME/config.toml` (or `~/.modelpack/config.toml`) when present
//! 3. Built-in defaults
//!
//! `MODELPACK_PYTHON`, `MODELPACK_ENV_ROOT` and `MODELPACK_ENV_MANAGER`
//! override whatever was loaded.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use modelpack_core::manifest::{DEFAULT_CONDA_CHANNEL, DEFAULT_CONDA_ENV_NAME};

use crate::reconstruction::EnvManager;

pub const HOME_ENV_VAR: &str = "MODELPACK_HOME";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {format} config {path}: {reason}")]
    Parse {
        format: &'static str,
        path: String,
        reason: String,
    },

    #[error("Invalid value for {var}: {value}")]
    InvalidEnvValue { var: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration file format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConfigFormat {
    Json,
    #[default]
    Toml,
    Yaml,
}

impl ConfigFormat {
    /// Detect the format from a file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| ConfigError::UnsupportedFormat(path.display().to_string()))?;
        ext.parse()
    }

    fn label(&self) -> &'static str {
        match self {
            ConfigFormat::Json => "JSON",
            ConfigFormat::Toml => "TOML",
            ConfigFormat::Yaml => "YAML",
        }
    }
}

impl std::str::FromStr for ConfigFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ConfigFormat::Json),
            "toml" => Ok(ConfigFormat::Toml),
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            _ => Err(ConfigError::UnsupportedFormat(s.to_string())),
        }
    }
}

/// HTTP scoring server settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    pub host: String,
    pub port: u16,
    /// Concurrent scoring processes
    pub workers: usize,
    pub scoring_timeout_secs: u64,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            workers: 1,
            scoring_timeout_secs: 60,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackagerConfig {
    /// Interpreter used to snapshot the saving runtime
    pub python: String,
    /// Cache of reconstructed environments; `None` means `<home>/envs`
    pub env_root: Option<PathBuf>,
    pub default_env_manager: EnvManager,
    pub conda_channels: Vec<String>,
    pub conda_env_name: String,
    pub probe_timeout_secs: u64,
    pub install_timeout_secs: u64,
    pub serve: ServeConfig,
}

impl Default for PackagerConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            env_root: None,
            default_env_manager: EnvManager::Virtualenv,
            conda_channels: vec![DEFAULT_CONDA_CHANNEL.to_string()],
            conda_env_name: DEFAULT_CONDA_ENV_NAME.to_string(),
            probe_timeout_secs: 120,
            install_timeout_secs: 1800,
            serve: ServeConfig::default(),
        }
    }
}

impl PackagerConfig {
    /// Load a config file, picking the parser from its extension
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let format = ConfigFormat::from_path(path)?;
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let parse_err = |reason: String| ConfigError::Parse {
            format: format.label(),
            path: path.display().to_string(),
            reason,
        };

        let config = match format {
            ConfigFormat::Toml => toml::from_str(&content).map_err(|e| parse_err(e.to_string()))?,
            ConfigFormat::Json => {
                serde_json::from_str(&content).map_err(|e| parse_err(e.to_string()))?
            }
            ConfigFormat::Yaml => {
                serde_yaml::from_str(&content).map_err(|e| parse_err(e.to_string()))?
            }
        };

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Resolve, load, apply environment overrides and validate
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => {
                let default_path = modelpack_home().map(|home| home.join(CONFIG_FILE_NAME));
                match default_path {
                    Some(path) if path.exists() => Self::load(&path)?,
                    _ => {
                        debug!("No config file found, using defaults");
                        Self::default()
                    }
                }
            }
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MODELPACK_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(python) = std::env::var("MODELPACK_PYTHON") {
            self.python = python;
            debug!("Applied env override for python");
        }

        if let Ok(root) = std::env::var("MODELPACK_ENV_ROOT") {
            self.env_root = Some(PathBuf::from(root));
            debug!("Applied env override for env_root");
        }

        if let Ok(manager) = std::env::var("MODELPACK_ENV_MANAGER") {
            self.default_env_manager =
                manager
                    .parse()
                    .map_err(|_| ConfigError::InvalidEnvValue {
                        var: "MODELPACK_ENV_MANAGER".to_string(),
                        value: manager.clone(),
                    })?;
            debug!("Applied env override for default_env_manager");
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.python.trim().is_empty() {
            return Err(ConfigError::Invalid("python must not be empty".to_string()));
        }
        if self.conda_channels.is_empty() {
            return Err(ConfigError::Invalid(
                "conda_channels must list at least one channel".to_string(),
            ));
        }
        if self.conda_env_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "conda_env_name must not be empty".to_string(),
            ));
        }
        if self.probe_timeout_secs == 0 || self.install_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".to_string()));
        }
        if self.serve.port == 0 {
            return Err(ConfigError::Invalid("serve.port must be positive".to_string()));
        }
        if self.serve.workers == 0 || self.serve.scoring_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "serve.workers and serve.scoring_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding reconstructed environments
    pub fn env_root(&self) -> PathBuf {
        self.env_root.clone().unwrap_or_else(|| {
            modelpack_home()
                .unwrap_or_else(|| PathBuf::from(".modelpack"))
                .join("envs")
        })
    }

    pub fn probe_timeout_ms(&self) -> u64 {
        self.probe_timeout_secs.saturating_mul(1000)
    }

    pub fn install_timeout_ms(&self) -> u64 {
        self.install_timeout_secs.saturating_mul(1000)
    }
}

/// `$MODELPACK_HOME`, falling back to `~/.modelpack`
pub fn modelpack_home() -> Option<PathBuf> {
    if let Ok(home) = std::env::var(HOME_ENV_VAR) {
        return Some(PathBuf::from(home));
    }
    dirs::home_dir().map(|home| home.join(".modelpack"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(
            ConfigFormat::from_path(Path::new("a/config.yml")).unwrap(),
            ConfigFormat::Yaml
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("config.JSON")).unwrap(),
            ConfigFormat::Json
        );
        assert!(ConfigFormat::from_path(Path::new("config.ini")).is_err());
        assert!(ConfigFormat::from_path(Path::new("config")).is_err());
    }

    #[test]
    fn test_load_toml_with_partial_fields() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
python = "/opt/python/bin/python3.10"
default_env_manager = "uv"

[serve]
port = 8080
"#,
        )
        .unwrap();

        let config = PackagerConfig::load(&path).unwrap();
        assert_eq!(config.python, "/opt/python/bin/python3.10");
        assert_eq!(config.default_env_manager, EnvManager::Uv);
        assert_eq!(config.serve.port, 8080);
        assert_eq!(config.serve.host, "127.0.0.1");
        assert_eq!(config.conda_channels, vec!["conda-forge".to_string()]);
    }

    #[test]
    fn test_load_yaml_and_json() {
        let temp_dir = TempDir::new().unwrap();
        let yaml = temp_dir.path().join("config.yaml");
        fs::write(&yaml, "conda_channels:\n  - defaults\n").unwrap();
        assert_eq!(
            PackagerConfig::load(&yaml).unwrap().conda_channels,
            vec!["defaults".to_string()]
        );

        let json = temp_dir.path().join("config.json");
        fs::write(&json, r#"{"env_root": "/tmp/envs"}"#).unwrap();
        assert_eq!(
            PackagerConfig::load(&json).unwrap().env_root(),
            PathBuf::from("/tmp/envs")
        );
    }

    #[test]
    fn test_malformed_file_reports_format() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "python = [").unwrap();
        let err = PackagerConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { format: "TOML", .. }));
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = PackagerConfig::resolve(Some(Path::new("/nonexistent/modelpack.toml")))
            .unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PackagerConfig::default();
        assert!(config.validate().is_ok());

        config.serve.port = 0;
        assert!(config.validate().is_err());

        let mut config = PackagerConfig::default();
        config.conda_channels.clear();
        assert!(config.validate().is_err());

        let mut config = PackagerConfig::default();
        config.probe_timeout_secs = 0;
        assert!(config.validate().is_err());
    }
}
