use crate::resolver::OutputPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_IMAGE: &str = "picai_nnunet_gc_algorithm:latest";
pub const DEFAULT_RUNTIME: &str = "docker";
pub const DETECTION_MAP_DIR: &str = "images/cspca-detection-map";

pub const IMAGE_ENV: &str = "PICAI_DOCKER_IMAGE";
pub const RUNTIME_ENV: &str = "SEGMENTATION_RUNTIME";
pub const TIMEOUT_ENV: &str = "SEGMENTATION_TIMEOUT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },
}

/// Settings for one [`crate::Pipeline`], fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Model image reference passed to `<runtime> run`.
    pub image: String,
    /// Container runtime CLI binary.
    pub runtime: String,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    #[serde(with = "duration_str")]
    pub probe_timeout: Duration,
    pub output_policy: OutputPolicy,
    /// Directories, relative to the workspace output root, that the model
    /// expects to exist before it starts.
    pub output_subdirs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            runtime: DEFAULT_RUNTIME.to_string(),
            timeout: capsules_container_exec::DEFAULT_TIMEOUT,
            probe_timeout: capsules_container_exec::RuntimeProbe::DEFAULT_TIMEOUT,
            output_policy: OutputPolicy::default(),
            output_subdirs: vec![DETECTION_MAP_DIR.to_string()],
            container_user: None,
            network: None,
        }
    }
}

impl PipelineConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// YAML file with environment overrides applied on top.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: PipelineConfig =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(path = %path.display(), "loaded pipeline config");

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Blank variables are treated as unset.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(image) = env_value(IMAGE_ENV) {
            self.image = image;
        }
        if let Some(runtime) = env_value(RUNTIME_ENV) {
            self.runtime = runtime;
        }
        if let Some(timeout) = env_value(TIMEOUT_ENV) {
            self.timeout = humantime::parse_duration(&timeout).map_err(|err| {
                ConfigError::InvalidValue {
                    key: TIMEOUT_ENV,
                    message: format!("'{}': {}", timeout, err),
                }
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "image",
                message: "image reference cannot be empty".to_string(),
            });
        }
        if self.runtime.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "runtime",
                message: "runtime binary cannot be empty".to_string(),
            });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "timeout",
                message: "timeout must be greater than zero".to_string(),
            });
        }
        if self.probe_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "probeTimeout",
                message: "probe timeout must be greater than zero".to_string(),
            });
        }
        for subdir in &self.output_subdirs {
            let path = Path::new(subdir);
            let escapes = path.is_absolute()
                || path
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir));
            if escapes {
                return Err(ConfigError::InvalidValue {
                    key: "outputSubdirs",
                    message: format!("'{}' must stay under the output directory", subdir),
                });
            }
        }
        Ok(())
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
