use jsonschema::{Draft, JSONSchema};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};

pub mod env;
pub use env::RunEnvironment;

/// File name of the defaults file inside the config directory.
pub const DEFAULTS_FILE: &str = "kiln.json";

static KILN_SCHEMA: Lazy<Value> = Lazy::new(|| {
    serde_json::json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "kiln defaults",
        "type": "object",
        "properties": {
            "runtime": { "type": "string", "minLength": 1 },
            "isolation": {
                "type": "string",
                "enum": ["oci", "default", "rootless", "oci-rootless", "chroot"]
            },
            "defaultShell": {
                "type": "array",
                "items": { "type": "string", "minLength": 1 },
                "minItems": 1
            },
            "storageRoot": { "type": "string", "minLength": 1 },
            "runtimeFlags": {
                "type": "array",
                "items": { "type": "string", "minLength": 1 }
            }
        },
        "additionalProperties": false
    })
});

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    ConfigFileNotFound { path: String },

    #[error("Schema compilation failed: {message}")]
    SchemaCompilationFailed { message: String },

    #[error("Config validation failed: {}", summarize(errors))]
    ValidationFailed { errors: Vec<ValidationError> },

    #[error("JSON parsing failed: {message}")]
    JsonParsingFailed { message: String },

    #[error("IO error: {message}")]
    IoError { message: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidOverride { key: String, message: String },
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub json_pointer: String,
    pub message: String,
    pub schema_path: String,
}

fn summarize(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| {
            if e.json_pointer.is_empty() {
                e.message.clone()
            } else {
                format!("{}: {}", e.json_pointer, e.message)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Contents of `kiln.json`. Every field is optional; absent fields fall
/// back to compiled-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KilnConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_shell: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runtime_flags: Vec<String>,
}

pub struct ConfigManager {
    config_dir: PathBuf,
}

impl ConfigManager {
    /// Uses `KILN_CONFIG_DIR` when set, else `<user config dir>/kiln`.
    pub fn new(env: &RunEnvironment) -> Self {
        let config_dir = env
            .config_dir
            .clone()
            .unwrap_or_else(Self::default_config_dir);
        Self { config_dir }
    }

    pub fn with_dir(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }

    pub fn config_dir(&self) -> &PathBuf {
        &self.config_dir
    }

    pub fn defaults_path(&self) -> PathBuf {
        self.config_dir.join(DEFAULTS_FILE)
    }

    fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("kiln"))
            .unwrap_or_else(|| PathBuf::from(".kiln"))
    }

    /// Loads `kiln.json`. A missing file yields [`KilnConfig::default`].
    #[instrument(skip(self), fields(dir = %self.config_dir.display()))]
    pub fn load_defaults(&self) -> Result<KilnConfig, ConfigError> {
        let path = self.defaults_path();
        if !path.exists() {
            debug!("Defaults file not found, using built-in defaults");
            return Ok(KilnConfig::default());
        }
        self.load_defaults_file(&path)
    }

    /// Loads an explicit defaults file; unlike [`Self::load_defaults`] a
    /// missing file is an error.
    #[instrument(skip(self))]
    pub fn load_defaults_file(&self, path: &Path) -> Result<KilnConfig, ConfigError> {
        debug!("Loading defaults from: {:?}", path);

        if !path.exists() {
            return Err(ConfigError::ConfigFileNotFound {
                path: path.to_string_lossy().to_string(),
            });
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            message: format!("Failed to read config file: {}", e),
        })?;

        let value: Value =
            serde_json::from_str(&content).map_err(|e| ConfigError::JsonParsingFailed {
                message: e.to_string(),
            })?;

        self.validate_config_value(&value)?;

        serde_json::from_value(value).map_err(|e| ConfigError::JsonParsingFailed {
            message: e.to_string(),
        })
    }

    pub fn validate_config_value(&self, config: &Value) -> Result<(), ConfigError> {
        let schema = compiled_schema()?;
        let validation_result = schema.validate(config);

        if let Err(errors) = validation_result {
            let validation_errors: Vec<ValidationError> = errors
                .map(|error| ValidationError {
                    json_pointer: error.instance_path.to_string(),
                    message: error.to_string(),
                    schema_path: error.schema_path.to_string(),
                })
                .collect();

            return Err(ConfigError::ValidationFailed {
                errors: validation_errors,
            });
        }

        Ok(())
    }
}

fn compiled_schema() -> Result<JSONSchema, ConfigError> {
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&KILN_SCHEMA)
        .map_err(|e| ConfigError::SchemaCompilationFailed {
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ConfigManager) {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_dir(temp_dir.path().to_path_buf());
        (temp_dir, manager)
    }

    #[test]
    fn missing_defaults_file_is_all_default() {
        let (_temp_dir, manager) = setup();
        assert_eq!(manager.load_defaults().unwrap(), KilnConfig::default());
    }

    #[test]
    fn defaults_file_is_loaded() {
        let (_temp_dir, manager) = setup();
        fs::write(
            manager.defaults_path(),
            r#"{
                "runtime": "crun",
                "isolation": "rootless",
                "defaultShell": ["/bin/bash", "-c"],
                "runtimeFlags": ["debug"]
            }"#,
        )
        .unwrap();

        let config = manager.load_defaults().unwrap();
        assert_eq!(config.runtime.as_deref(), Some("crun"));
        assert_eq!(config.isolation.as_deref(), Some("rootless"));
        assert_eq!(
            config.default_shell,
            Some(vec!["/bin/bash".to_string(), "-c".to_string()])
        );
        assert_eq!(config.runtime_flags, vec!["debug".to_string()]);
        assert!(config.storage_root.is_none());
    }

    #[test]
    fn unknown_keys_fail_validation() {
        let (_temp_dir, manager) = setup();
        fs::write(manager.defaults_path(), r#"{ "runtime": "runc", "colour": "blue" }"#).unwrap();
        assert!(matches!(
            manager.load_defaults(),
            Err(ConfigError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let (_temp_dir, manager) = setup();
        fs::write(manager.defaults_path(), "{ runtime: runc").unwrap();
        assert!(matches!(
            manager.load_defaults(),
            Err(ConfigError::JsonParsingFailed { .. })
        ));
    }

    #[test]
    fn explicit_missing_file_still_fails() {
        let (temp_dir, manager) = setup();
        let result = manager.load_defaults_file(&temp_dir.path().join("nope.json"));
        assert!(matches!(result, Err(ConfigError::ConfigFileNotFound { .. })));
    }
}
