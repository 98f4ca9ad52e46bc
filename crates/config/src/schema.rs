//! Configuration schema
//!
//! Typed view of the deploy file. Every section has defaults so a partial
//! file, or no file at all, still produces a usable configuration.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use common::types::DeviceKind;
use common::utils::gigabytes_to_bytes;
use crate::defaults::*;

/// Root configuration for the weight materialization service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    /// Deployment name
    pub name: String,

    /// Local weight cache
    pub cache: CacheSettings,

    /// Opaque credentials handed to fetch backends
    pub credentials: Credentials,

    /// Model hub endpoint
    pub hub: HubSettings,

    /// Object store backend
    pub object_store: ObjectStoreSettings,

    /// Outbound HTTP client
    pub http: HttpSettings,

    /// Logging
    pub log: LogConfig,

    /// Statically declared devices, merged over discovery
    pub devices: Vec<DeviceSpec>,

    /// Per-model deploy entries keyed by `model_id` or `model_id@version`
    pub models: HashMap<String, ModelDeployConfig>,
}

/// Cache root and byte budget
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Cache root directory
    pub root_dir: PathBuf,

    /// Maximum bytes kept on disk across all source kinds
    pub max_bytes: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            max_bytes: gigabytes_to_bytes(DEFAULT_CACHE_MAX_GB),
        }
    }
}

/// Per-source credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    /// Bearer token for the model hub
    pub hub_token: Option<String>,

    /// Object store credentials
    pub object_store: ObjectStoreCredentials,
}

/// Object store credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreCredentials {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
}

/// Model hub settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Base URL of the hub
    pub endpoint: String,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_HUB_ENDPOINT.to_string(),
        }
    }
}

/// Object store backend settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreSettings {
    /// Directory where buckets are mounted (one subdirectory per bucket)
    pub mount_dir: Option<PathBuf>,
}

/// Outbound HTTP settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Longest wait for a response or for the next body chunk; a transfer
    /// that keeps making progress is never cut off
    #[serde(alias = "timeout_secs")]
    pub read_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub user_agent: String,
    /// Shard URLs downloaded concurrently within one shard set
    pub max_parallel_shards: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            read_timeout_secs: DEFAULT_HTTP_READ_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_HTTP_CONNECT_TIMEOUT_SECS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_parallel_shards: DEFAULT_MAX_PARALLEL_SHARDS,
        }
    }
}

impl HttpSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.max(1))
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human readable output
    pub json: bool,

    /// Optional log file; stdout when absent
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            json: false,
            file: None,
        }
    }
}

/// A device declared in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub id: String,
    pub kind: DeviceKind,
    pub total_memory_bytes: u64,
}

/// Deploy entry for one model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelDeployConfig {
    /// Weight slots and where to fetch them from
    pub weights: BTreeMap<String, WeightSource>,

    /// Device preference, e.g. `auto`, `cpu`, `cuda:1`
    pub device: String,

    /// Memory to reserve on the chosen device
    pub estimated_memory_bytes: u64,
}

impl Default for ModelDeployConfig {
    fn default() -> Self {
        Self {
            weights: BTreeMap::new(),
            device: DEFAULT_DEVICE_PREFERENCE.to_string(),
            estimated_memory_bytes: 0,
        }
    }
}

/// Where a weight slot comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WeightSource {
    #[serde(rename = "s3")]
    S3(S3Weight),
    #[serde(rename = "hf")]
    Hf(HfWeight),
    #[serde(rename = "http")]
    Http(HttpWeight),
}

/// Object store weight: a single `key` or every object under `prefix`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Weight {
    pub bucket: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

/// Hub weight: one file, or the whole repo snapshot when `filename` is absent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HfWeight {
    pub repo: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
}

/// HTTP weight: one `url`, or a shard set of `urls`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpWeight {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub urls: Option<Vec<String>>,
}

impl ServeConfig {
    /// Looks up a model entry, preferring the versioned key
    ///
    /// Unknown models get an empty entry, which means "no weights, auto device".
    pub fn model_config(&self, model_id: &str, version: Option<&str>) -> ModelDeployConfig {
        version
            .and_then(|version| self.find_model(&format!("{}@{}", model_id, version)))
            .or_else(|| self.find_model(model_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Exact match first; config-rs may hand back table keys lowercased
    fn find_model(&self, name: &str) -> Option<&ModelDeployConfig> {
        self.models.get(name).or_else(|| {
            self.models
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, cfg)| cfg)
        })
    }

    /// Secrets the configured weight sources need
    pub fn required_secrets(&self) -> BTreeSet<&'static str> {
        let mut required = BTreeSet::new();

        for model in self.models.values() {
            for weight in model.weights.values() {
                match weight {
                    WeightSource::S3(_) => {
                        required.insert(ENV_ACCESS_KEY_ID);
                        required.insert(ENV_SECRET_ACCESS_KEY);
                    }
                    WeightSource::Hf(_) => {
                        required.insert(ENV_HUB_TOKEN);
                    }
                    WeightSource::Http(_) => {}
                }
            }
        }

        required
    }

    /// Required secrets that have no value in the credentials section
    pub fn missing_secrets(&self) -> Vec<&'static str> {
        self.required_secrets()
            .into_iter()
            .filter(|name| {
                let value = match *name {
                    ENV_ACCESS_KEY_ID => &self.credentials.object_store.access_key_id,
                    ENV_SECRET_ACCESS_KEY => &self.credentials.object_store.secret_access_key,
                    ENV_HUB_TOKEN => &self.credentials.hub_token,
                    _ => return true,
                };
                value.as_deref().map_or(true, str::is_empty)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(models: &[(&str, ModelDeployConfig)]) -> ServeConfig {
        ServeConfig {
            models: models
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_versioned_lookup_falls_back_to_unversioned() {
        let plain = ModelDeployConfig {
            device: "cpu".to_string(),
            ..Default::default()
        };
        let pinned = ModelDeployConfig {
            device: "cuda:1".to_string(),
            ..Default::default()
        };
        let config = config_with(&[("clf", plain), ("clf@2.0.0", pinned)]);

        assert_eq!(config.model_config("clf", Some("2.0.0")).device, "cuda:1");
        assert_eq!(config.model_config("clf", Some("1.0.0")).device, "cpu");
        assert_eq!(config.model_config("clf", None).device, "cpu");
        assert_eq!(config.model_config("other", None).device, "auto");
        assert!(config.model_config("other", None).weights.is_empty());

        // table keys may come back lowercased
        assert_eq!(config.model_config("CLF", Some("2.0.0")).device, "cuda:1");
    }

    #[test]
    fn test_missing_secrets() {
        let mut weights = BTreeMap::new();
        weights.insert(
            "encoder".to_string(),
            WeightSource::S3(S3Weight {
                bucket: "b".to_string(),
                key: Some("k".to_string()),
                prefix: None,
                region: None,
            }),
        );
        weights.insert(
            "tokenizer".to_string(),
            WeightSource::Hf(HfWeight {
                repo: "org/model".to_string(),
                filename: None,
                revision: None,
            }),
        );
        let model = ModelDeployConfig {
            weights,
            ..Default::default()
        };
        let mut config = config_with(&[("m", model)]);

        assert_eq!(
            config.missing_secrets(),
            vec![ENV_ACCESS_KEY_ID, ENV_SECRET_ACCESS_KEY, ENV_HUB_TOKEN]
        );

        config.credentials.hub_token = Some("hf_x".to_string());
        config.credentials.object_store.access_key_id = Some("id".to_string());
        assert_eq!(config.missing_secrets(), vec![ENV_SECRET_ACCESS_KEY]);
    }

    #[test]
    fn test_weight_source_tagging() {
        let json = r#"{"type": "hf", "repo": "org/model", "filename": "w.bin"}"#;
        let parsed: WeightSource = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed,
            WeightSource::Hf(HfWeight {
                repo: "org/model".to_string(),
                filename: Some("w.bin".to_string()),
                revision: None,
            })
        );

        let json = r#"{"type": "http", "urls": ["https://h/a", "https://h/b"]}"#;
        let parsed: WeightSource = serde_json::from_str(json).unwrap();
        assert!(matches!(parsed, WeightSource::Http(HttpWeight { urls: Some(ref u), .. }) if u.len() == 2));
    }
}
