//! Configuration loading
//!
//! Builds the configuration with config-rs in layers, lowest precedence
//! first: environment credentials, the deploy file (JSON, YAML or TOML,
//! chosen by extension), nested `MODEL_SERVE_*__*` variables, then the
//! shortcut variables. Every key missing from all layers keeps its default.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use config_rs::{Config, ConfigError, File, FileFormat, Source};
use tracing::{debug, info};

use common::error::{Error, Result};
use crate::defaults::ENV_DEPLOY_CONFIG;
use crate::environment::{credential_defaults, overrides, process_env};
use crate::schema::ServeConfig;

/// Deploy file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// Picks a format from a file extension, defaulting to JSON
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            Some("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Json,
        }
    }

    fn file_format(self) -> FileFormat {
        match self {
            ConfigFormat::Json => FileFormat::Json,
            ConfigFormat::Yaml => FileFormat::Yaml,
            ConfigFormat::Toml => FileFormat::Toml,
        }
    }
}

/// Loads and holds the service configuration
pub struct ConfigManager {
    /// Resolved configuration
    config: ServeConfig,

    /// File the configuration was read from, if any
    source: Option<PathBuf>,
}

impl ConfigManager {
    /// Loads configuration from `path`, or from `MODEL_SERVE_DEPLOY_CONFIG`
    ///
    /// A missing file is not an error: defaults plus environment are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_from(path, &process_env())
    }

    /// Loads configuration against the given environment variables
    pub fn load_from(path: Option<&Path>, vars: &HashMap<String, String>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(|| {
            vars.get(ENV_DEPLOY_CONFIG)
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from)
        });

        let source = match path {
            Some(path) if path.exists() => Some(path),
            Some(path) => {
                debug!(path = %path.display(), "deploy config not found, using defaults");
                None
            }
            None => None,
        };

        let mut builder = credential_defaults(Config::builder(), vars).map_err(config_error)?;
        if let Some(path) = &source {
            builder = builder.add_source(file_source(path));
        }
        let config: ServeConfig = overrides(builder, vars)
            .and_then(|builder| builder.build())
            .and_then(|built| built.try_deserialize())
            .map_err(|e| match &source {
                Some(path) => Error::Config(format!("{}: {}", path.display(), e)),
                None => config_error(e),
            })?;

        if let Some(path) = &source {
            info!(path = %path.display(), models = config.models.len(), "loaded deploy config");
        }

        Ok(Self { config, source })
    }

    /// Wraps an already built configuration
    pub fn from_config(config: ServeConfig) -> Self {
        Self {
            config,
            source: None,
        }
    }

    /// Reads and parses a deploy file without the environment layers
    pub fn read_file(path: &Path) -> Result<ServeConfig> {
        Config::builder()
            .add_source(file_source(path))
            .build()
            .and_then(|built| built.try_deserialize())
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parses configuration text in the given format
    pub fn parse(contents: &str, format: ConfigFormat) -> Result<ServeConfig> {
        Config::builder()
            .add_source(File::from_str(contents, format.file_format()))
            .build()
            .and_then(|built| built.try_deserialize())
            .map_err(config_error)
    }

    /// Gets the configuration
    pub fn config(&self) -> &ServeConfig {
        &self.config
    }

    /// Gets the file the configuration came from
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

fn file_source(path: &Path) -> impl Source + Send + Sync + 'static {
    File::from(path.to_path_buf())
        .format(ConfigFormat::from_path(path).file_format())
        .required(true)
}

fn config_error(err: ConfigError) -> Error {
    Error::Config(err.to_string())
}
