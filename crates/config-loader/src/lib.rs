//! Configuration for the warden daemon.
//!
//! Sources, lowest precedence first: built-in defaults, an optional YAML or
//! JSON file, `WARDEN_*` environment variables. The merged document is
//! validated against the embedded schema before it is deserialized.

use jsonschema::{Draft, JSONSchema};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

mod interpolate;
pub use interpolate::interpolate_env;

const CONFIG_SCHEMA: &str = include_str!("../schema/warden-config.v1.json");

/// Environment variable → config key.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("WARDEN_SOCKET", "socketPath"),
    ("WARDEN_SOCKET_MODE", "socketMode"),
    ("WARDEN_DEPOT", "depotPath"),
    ("WARDEN_CAPTURES", "capturePath"),
    ("WARDEN_SHELL", "shell"),
    ("WARDEN_KILL_GRACE", "killGrace"),
    ("WARDEN_MAX_CONNECTIONS", "maxConnections"),
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    ConfigFileNotFound { path: String },

    #[error("Unsupported config file format: {path} (expected .yaml, .yml or .json)")]
    UnsupportedFormat { path: String },

    #[error("Schema compilation failed: {message}")]
    SchemaCompilationFailed { message: String },

    #[error("Config validation failed: {}", summarize(.errors))]
    ValidationFailed { errors: Vec<ValidationError> },

    #[error("Config parsing failed: {message}")]
    ParsingFailed { message: String },

    #[error("Environment variable {var} referenced by config is not set")]
    MissingEnv { var: String },

    #[error("Invalid value for {var}: {message}")]
    InvalidEnv { var: String, message: String },

    #[error("IO error: {message}")]
    IoError { message: String },
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
        .map(|e| format!("{} ({})", e.message, e.json_pointer))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WardenConfig {
    /// Unix socket the control protocol listens on.
    pub socket_path: PathBuf,
    /// Permission bits applied to the socket after bind.
    #[serde(with = "octal_mode")]
    pub socket_mode: u32,
    /// Per-container working directories.
    pub depot_path: PathBuf,
    /// Where `run` writes captured stdout/stderr. Not cleaned on destroy.
    pub capture_path: PathBuf,
    pub shell: PathBuf,
    /// Time between SIGTERM and SIGKILL when a job is aborted.
    #[serde(with = "human_duration")]
    pub kill_grace: Duration,
    pub max_connections: usize,
}

impl Default for WardenConfig {
    fn default() -> Self {
        let runtime_dir = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
        let state_dir = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            socket_path: runtime_dir.join("warden").join("warden.sock"),
            socket_mode: 0o600,
            depot_path: state_dir.join("warden").join("depot"),
            capture_path: state_dir.join("warden").join("captures"),
            shell: PathBuf::from("/bin/sh"),
            kill_grace: Duration::from_secs(2),
            max_connections: 128,
        }
    }
}

pub struct ConfigLoader {
    file: Option<PathBuf>,
    vars: HashMap<String, String>,
}

impl ConfigLoader {
    /// Loader reading overrides from the process environment.
    pub fn new() -> Self {
        Self::with_vars(std::env::vars())
    }

    pub fn with_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            file: None,
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    #[instrument(skip(self), fields(file = ?self.file))]
    pub fn load(&self) -> Result<WardenConfig, ConfigError> {
        let mut merged = serde_json::to_value(WardenConfig::default()).map_err(|e| {
            ConfigError::ParsingFailed {
                message: e.to_string(),
            }
        })?;

        if let Some(path) = &self.file {
            let mut file_value = load_config_file(path)?;
            interpolate_env(&mut file_value, &self.vars)?;
            merge_object(&mut merged, file_value)?;
        }

        self.apply_env_overrides(&mut merged)?;
        validate_config(&merged)?;

        let config: WardenConfig =
            serde_json::from_value(merged).map_err(|e| ConfigError::ParsingFailed {
                message: e.to_string(),
            })?;
        debug!(?config, "loaded warden config");
        Ok(config)
    }

    fn apply_env_overrides(&self, merged: &mut Value) -> Result<(), ConfigError> {
        let Value::Object(map) = merged else {
            return Ok(());
        };
        for (var, key) in ENV_OVERRIDES {
            let Some(raw) = self.vars.get(*var) else {
                continue;
            };
            let value = if *key == "maxConnections" {
                let parsed: u64 = raw.trim().parse().map_err(|e| ConfigError::InvalidEnv {
                    var: var.to_string(),
                    message: format!("{e}"),
                })?;
                Value::from(parsed)
            } else {
                Value::String(raw.clone())
            };
            debug!(var, key, "applying environment override");
            map.insert(key.to_string(), value);
        }
        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn load_config_file(path: &Path) -> Result<Value, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::ConfigFileNotFound {
            path: path.display().to_string(),
        });
    }

    let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        message: format!("Failed to read config file {}: {}", path.display(), e),
    })?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParsingFailed {
                message: e.to_string(),
            })
        }
        Some("json") => serde_json::from_str(&content).map_err(|e| ConfigError::ParsingFailed {
            message: e.to_string(),
        }),
        _ => Err(ConfigError::UnsupportedFormat {
            path: path.display().to_string(),
        }),
    }
}

fn merge_object(target: &mut Value, overlay: Value) -> Result<(), ConfigError> {
    match (target, overlay) {
        (Value::Object(target), Value::Object(overlay)) => {
            for (key, value) in overlay {
                target.insert(key, value);
            }
            Ok(())
        }
        // An empty YAML document deserializes to null.
        (_, Value::Null) => Ok(()),
        _ => Err(ConfigError::ParsingFailed {
            message: "config file must contain a mapping at the top level".to_string(),
        }),
    }
}

fn compiled_schema() -> Result<&'static JSONSchema, ConfigError> {
    static SCHEMA: OnceCell<JSONSchema> = OnceCell::new();
    SCHEMA.get_or_try_init(|| {
        let schema_value: Value =
            serde_json::from_str(CONFIG_SCHEMA).map_err(|e| ConfigError::ParsingFailed {
                message: e.to_string(),
            })?;
        JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema_value)
            .map_err(|e| ConfigError::SchemaCompilationFailed {
                message: e.to_string(),
            })
    })
}

pub fn validate_config(config: &Value) -> Result<(), ConfigError> {
    let schema = compiled_schema()?;
    if let Err(errors) = schema.validate(config) {
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

mod octal_mode {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(mode: &u32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:04o}", mode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        let raw = String::deserialize(deserializer)?;
        u32::from_str_radix(raw.trim(), 8).map_err(de::Error::custom)
    }
}

mod human_duration {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(de::Error::custom)
    }
}
