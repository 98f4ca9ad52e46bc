//! Configuration management for Model Serve
//!
//! This crate provides the typed deploy configuration: cache location and
//! budget, backend credentials, logging, static devices and per-model weight
//! sources, loaded from a file and overridden by the environment.

pub mod defaults;
pub mod environment;
pub mod manager;
pub mod schema;

// Re-export commonly used types
pub use manager::{ConfigFormat, ConfigManager};
pub use schema::{
    CacheSettings, Credentials, DeviceSpec, HfWeight, HttpSettings, HttpWeight, HubSettings,
    LogConfig, ModelDeployConfig, ObjectStoreCredentials, ObjectStoreSettings, S3Weight,
    ServeConfig, WeightSource,
};
