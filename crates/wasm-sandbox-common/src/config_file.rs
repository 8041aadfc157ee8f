//! Configuration file structures for wasm-sandbox.
//!
//! This module defines the TOML configuration file:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ConfigFileError`]: Failures reading or parsing it

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{RunConfig, RuntimeConfig};

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime]
/// heap_size_bytes = 73_400_320
/// exec_stack_size = 1_048_576
///
/// [runtime.module]
/// stack_size = 1_048_576
/// heap_size = 67_108_864
///
/// [run]
/// repeat = 5
/// threshold = 1_000_000
/// event_id = "event-0"
/// event_payload = "EventMessage"
/// print_header = "[Guest] "
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Benchmark run configuration.
    #[serde(default)]
    pub run: RunConfig,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        let config = Self::from_toml(&content)?;
        tracing::debug!(path = %path.as_ref().display(), "Config file loaded");
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert_eq!(config.runtime.heap_size_bytes, 70 * 1024 * 1024);
        assert_eq!(config.run.repeat, 5);
        assert_eq!(config.run.event_id, "event-0");
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [run]
            repeat = 1
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.run.repeat, 1);
        // Defaults applied
        assert_eq!(config.run.threshold, u64::MAX / 2);
        assert_eq!(config.runtime.module.heap_size, 64 * 1024 * 1024);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [runtime]
            heap_size_bytes = 16_777_216
            max_wasm_stack = 524_288
            max_bytecode_size = 1_048_576
            exec_stack_size = 262_144

            [runtime.module]
            stack_size = 65_536
            heap_size = 131_072

            [run]
            repeat = 2
            threshold = 1000
            event_id = "id"
            event_payload = "payload"
            print_header = "[Guest] "
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.runtime.heap_size_bytes, 16_777_216);
        assert_eq!(config.runtime.max_wasm_stack, 524_288);
        assert_eq!(config.runtime.max_bytecode_size, 1_048_576);
        assert_eq!(config.runtime.exec_stack_size, 262_144);
        assert_eq!(config.runtime.module.stack_size, 65_536);
        assert_eq!(config.runtime.module.heap_size, 131_072);
        assert_eq!(config.run.repeat, 2);
        assert_eq!(config.run.threshold, 1000);
        assert_eq!(config.run.event_id, "id");
        assert_eq!(config.run.event_payload, "payload");
        assert_eq!(config.run.print_header.as_deref(), Some("[Guest] "));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigFile::from_file("/nonexistent/wasm-sandbox.toml");
        assert!(matches!(result, Err(ConfigFileError::Io { .. })));
    }
}
