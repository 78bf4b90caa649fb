//! Agent configuration
//!
//! Built from the option text the host passes at activation
//! (`mods=./mods,log=debug,disable=foo+bar`), then overridden by environment
//! variables.

use crate::logging::{TracingConfig, TracingFormat};
use crate::registry::DuplicatePolicy;
use std::path::PathBuf;
use thiserror::Error;
use tracing::Level;

/// Extension source directory used when none is configured
pub const DEFAULT_MODS_DIR: &str = "./mods";

/// Overrides the `mods` option
pub const ENV_MODS_DIR: &str = "VOIDLOADER_MODS_DIR";

/// `EnvFilter` directive overriding the `log` option
pub const ENV_LOG: &str = "VOIDLOADER_LOG";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Malformed option `{0}`; expected key=value")]
    Malformed(String),

    #[error("Unknown option `{0}`")]
    UnknownKey(String),

    #[error("Invalid value `{value}` for option `{key}`: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Resolved agent configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Directory scanned for extensions
    pub mods_dir: PathBuf,

    /// Subscriber settings
    pub logging: TracingConfig,

    /// How discovery treats a second artifact with an already admitted name
    pub duplicates: DuplicatePolicy,

    /// Extensions disabled right after discovery
    pub disabled: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mods_dir: PathBuf::from(DEFAULT_MODS_DIR),
            logging: TracingConfig::default(),
            duplicates: DuplicatePolicy::default(),
            disabled: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Parse option text and apply process environment overrides
    pub fn from_options(options: &str) -> Result<Self, ConfigError> {
        Ok(Self::parse(options)?.with_env(|key| std::env::var(key).ok()))
    }

    /// Parse option text only
    pub fn parse(options: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for pair in options.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }

            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::Malformed(pair.to_string()))?;
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() {
                return Err(ConfigError::Malformed(pair.to_string()));
            }

            config.set(key, value)?;
        }

        Ok(config)
    }

    /// Apply overrides from `lookup` (normally the process environment)
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(ENV_MODS_DIR).filter(|v| !v.trim().is_empty()) {
            self.mods_dir = PathBuf::from(dir.trim());
        }
        if let Some(directive) = lookup(ENV_LOG).filter(|v| !v.trim().is_empty()) {
            self.logging.directive = Some(directive.trim().to_string());
        }
        self
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "mods" => {
                if value.is_empty() {
                    return Err(ConfigError::invalid(key, value, "directory must not be empty"));
                }
                self.mods_dir = PathBuf::from(value);
            }
            "log" => {
                let level = value
                    .parse::<Level>()
                    .map_err(|e| ConfigError::invalid(key, value, e.to_string()))?;
                self.logging.level = Some(level);
            }
            "log_format" => {
                self.logging.format = value
                    .parse::<TracingFormat>()
                    .map_err(|reason| ConfigError::invalid(key, value, reason))?;
            }
            "duplicates" => {
                self.duplicates = match value.to_ascii_lowercase().as_str() {
                    "last-write-wins" => DuplicatePolicy::LastWriteWins,
                    "reject" => DuplicatePolicy::Reject,
                    _ => {
                        return Err(ConfigError::invalid(
                            key,
                            value,
                            "expected last-write-wins|reject",
                        ))
                    }
                };
            }
            "disable" => {
                self.disabled = value
                    .split('+')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_options_are_defaults() {
        assert_eq!(AgentConfig::parse("").unwrap(), AgentConfig::default());
        assert_eq!(AgentConfig::parse(" , ,").unwrap(), AgentConfig::default());
    }

    #[test]
    fn test_parse_all_keys() {
        let config = AgentConfig::parse(
            "mods=/opt/game/mods, log=DEBUG ,log_format=json,duplicates=reject,disable=a+ b +",
        )
        .unwrap();

        assert_eq!(config.mods_dir, PathBuf::from("/opt/game/mods"));
        assert_eq!(config.logging.level, Some(Level::DEBUG));
        assert_eq!(config.logging.format, TracingFormat::Json);
        assert_eq!(config.duplicates, DuplicatePolicy::Reject);
        assert_eq!(config.disabled, vec!["a", "b"]);
    }

    #[test]
    fn test_rejects_bad_options() {
        assert_eq!(
            AgentConfig::parse("verbose").unwrap_err(),
            ConfigError::Malformed("verbose".into())
        );
        assert_eq!(
            AgentConfig::parse("color=yes").unwrap_err(),
            ConfigError::UnknownKey("color".into())
        );
        assert!(matches!(
            AgentConfig::parse("log=loud").unwrap_err(),
            ConfigError::InvalidValue { key, .. } if key == "log"
        ));
        assert!(matches!(
            AgentConfig::parse("duplicates=first").unwrap_err(),
            ConfigError::InvalidValue { key, .. } if key == "duplicates"
        ));
        assert!(AgentConfig::parse("mods=").is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let config = AgentConfig::parse("mods=from-options,log=warn")
            .unwrap()
            .with_env(|key| match key {
                ENV_MODS_DIR => Some("/srv/mods".to_string()),
                ENV_LOG => Some("voidloader_agent=trace".to_string()),
                _ => None,
            });

        assert_eq!(config.mods_dir, PathBuf::from("/srv/mods"));
        assert_eq!(config.logging.filter_directive(), "voidloader_agent=trace");
    }

    #[test]
    fn test_blank_environment_is_ignored() {
        let config = AgentConfig::parse("mods=keep")
            .unwrap()
            .with_env(|_| Some("  ".to_string()));
        assert_eq!(config.mods_dir, PathBuf::from("keep"));
        assert_eq!(config.logging.directive, None);
    }
}
