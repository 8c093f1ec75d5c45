//! Configuration schema definitions.
//!
//! This module defines the structure of the configuration file using serde.
//! All configuration sections are defined here with appropriate defaults.

use super::error::{ConfigError, ConfigResult};
use crate::port::{PortKind, PropertyOverrides};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Log levels accepted by `[logging] level`.
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// VISA runtime configuration
    pub visa: VisaConfig,
    /// Prologix GPIB-USB controllers
    pub prologix: PrologixConfig,
    /// Friendly names for resource strings
    pub aliases: HashMap<String, String>,
    /// Per-resource property overrides, applied on top of driver requests
    pub ports: BTreeMap<String, PropertyOverrides>,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Resolve a resource name through aliases.
    pub fn resolve_resource(&self, name: &str) -> String {
        self.aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    /// Property overrides configured for `resource`, if any.
    pub fn port_overrides(&self, resource: &str) -> Option<&PropertyOverrides> {
        self.ports.get(resource)
    }

    /// Check values serde cannot check on its own.
    pub fn validate(&self) -> ConfigResult<()> {
        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::validation(
                "logging.level",
                format!("'{}' is not one of {}", self.logging.level, LOG_LEVELS.join(", ")),
            ));
        }
        if let Some(empty) = self.prologix.controllers.iter().find(|a| a.trim().is_empty()) {
            return Err(ConfigError::validation(
                "prologix.controllers",
                format!("controller address {empty:?} is empty"),
            ));
        }
        for resource in self.ports.keys() {
            if PortKind::from_resource(resource).is_none() {
                return Err(ConfigError::validation(
                    format!("ports.\"{resource}\""),
                    "not a resource string of any port type",
                ));
            }
        }
        Ok(())
    }
}

/// VISA runtime section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisaConfig {
    /// Use the VISA runtime. When disabled, VISA-backed ports cannot be
    /// opened and VISA discovery returns nothing.
    pub enabled: bool,
}

impl Default for VisaConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Prologix controller section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrologixConfig {
    /// Serial addresses of attached controllers, e.g. `["COM7"]`
    pub controllers: Vec<String>,
}

/// Logging configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level: "trace", "debug", "info", "warn", "error", "off"
    pub level: String,
    /// Log format: "json", "pretty", "compact"
    pub format: LogFormat,
    /// Log file path (optional, stderr otherwise)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format
    Json,
    /// Pretty format with colors
    #[default]
    Pretty,
    /// Compact format
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.visa.enabled);
        assert!(config.prologix.controllers.is_empty());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_alias_resolution() {
        let mut config = Config::default();
        config
            .aliases
            .insert("dmm".to_string(), "GPIB0::22::INSTR".to_string());

        assert_eq!(config.resolve_resource("dmm"), "GPIB0::22::INSTR");
        assert_eq!(config.resolve_resource("COM5"), "COM5");
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [prologix]
            controllers = ["COM7"]

            [ports."COM3"]
            baudrate = 115200
            EOLread = "\r\n"

            [logging]
            format = "json"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.prologix.controllers, vec!["COM7".to_string()]);
        let overrides = config.port_overrides("COM3").unwrap();
        assert_eq!(overrides.get("baudrate"), Some(&json!(115200)));
        assert_eq!(overrides.get("EOLread"), Some(&json!("\r\n")));
        assert_eq!(config.logging.format, LogFormat::Json);
        // Defaults should still work
        assert!(config.visa.enabled);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.prologix.controllers.push("COM7".to_string());
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[visa]"));
        assert!(toml_str.contains("[prologix]"));
        assert!(toml_str.contains("[logging]"));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.logging.level = "chatty".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { .. })
        ));

        let mut config = Config::default();
        config
            .ports
            .insert("LPT1".to_string(), PropertyOverrides::new());
        assert!(config.validate().is_err());
    }
}
