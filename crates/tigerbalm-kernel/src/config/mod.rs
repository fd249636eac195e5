//! Host configuration.
//!
//! The configuration is a plain typed value, [`TigerbalmConfig`], loaded once
//! at startup and threaded through constructors. Files may be YAML, TOML or
//! JSON (detected from the extension). `${VAR}` and `$VAR` references are
//! substituted from the process environment before parsing, and
//! `TIGERBALM__SECTION__KEY` variables override file values.

use std::path::Path;
use std::sync::LazyLock;

use config::{Config as Cfg, Environment, File, FileFormat};
use regex::Regex;
use serde::de::DeserializeOwned;

mod types;

pub use types::*;

/// Prefix of environment variables that override file values.
pub const ENV_PREFIX: &str = "TIGERBALM";

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A value parsed but cannot be used (bad plugin directory, bad broker
    /// address, unknown level).
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Detect configuration format from file extension
///
/// # Supported Extensions
///
/// - YAML: `.yaml`, `.yml`
/// - TOML: `.toml`
/// - JSON: `.json`
pub fn detect_format(path: &Path) -> ConfigResult<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

static ENV_REF: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)\b").ok()
});

/// Substitute environment variables in a string
///
/// Supports both `${VAR_NAME}` and `$VAR_NAME`. Unset variables are left as
/// written.
pub fn substitute_env_vars(content: &str) -> String {
    let Some(re) = ENV_REF.as_ref() else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}

/// Load any deserializable configuration from a file, without environment
/// overrides.
pub fn load_config<T>(path: impl AsRef<Path>) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let path = path.as_ref();
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    from_str(&content, format)
}

/// Load configuration from a string with explicit format
pub fn from_str<T>(content: &str, format: FileFormat) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let substituted_content = substitute_env_vars(content);

    let config = Cfg::builder()
        .add_source(File::from_str(&substituted_content, format))
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    config
        .try_deserialize()
        .map_err(|e| ConfigError::Serialization(e.to_string()))
}

impl TigerbalmConfig {
    /// Load the host configuration from `path`, apply `TIGERBALM__*`
    /// overrides and validate the result.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let format = detect_format(path)?;
        let content = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&content);

        let config: Self = Cfg::builder()
            .add_source(File::from_str(&substituted, format))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("kafka.brokers")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::Serialization(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document. Used by tests and embedders; no validation.
    pub fn from_yaml(content: &str) -> ConfigResult<Self> {
        from_str(content, FileFormat::Yaml)
    }

    /// Startup checks that are fatal to the affected subsystem.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.plugin.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("plugin.path is empty".into()));
        }
        if !self.plugin.path.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "plugin.path {} is not a directory",
                self.plugin.path.display()
            )));
        }
        if let Some(watch) = &self.plugin.watch_path {
            if !watch.is_dir() {
                return Err(ConfigError::Invalid(format!(
                    "plugin.watch_path {} is not a directory",
                    watch.display()
                )));
            }
        }
        if self.kafka.enabled && self.kafka.backend == KafkaBackend::Rdkafka {
            if self.kafka.brokers.is_empty() {
                return Err(ConfigError::Invalid("kafka.brokers is empty".into()));
            }
            for broker in &self.kafka.brokers {
                validate_broker(broker)?;
            }
        }
        Ok(())
    }
}

fn validate_broker(addr: &str) -> ConfigResult<()> {
    let valid = addr
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
    if valid {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "broker address {addr:?} is not host:port"
        )))
    }
}
