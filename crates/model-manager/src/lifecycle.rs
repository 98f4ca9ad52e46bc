//! Model identity and the lifecycle hooks of an external model

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use async_trait::async_trait;

use common::error::{Error, Result};
use resource_manager::DeviceDescriptor;

/// A model id with an optional version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelRef {
    pub id: String,
    pub version: Option<String>,
}

impl ModelRef {
    pub fn new(id: impl Into<String>, version: Option<String>) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}@{}", self.id, version),
            None => write!(f, "{}", self.id),
        }
    }
}

impl FromStr for ModelRef {
    type Err = Error;

    /// Parses `id` or `id@version`
    fn from_str(s: &str) -> Result<Self> {
        let (id, version) = match s.split_once('@') {
            Some((id, version)) => (id, Some(version)),
            None => (s, None),
        };

        if id.is_empty() || version.map_or(false, str::is_empty) {
            return Err(Error::InvalidArgument(format!("invalid model reference '{}'", s)));
        }

        Ok(Self::new(id, version.map(str::to_string)))
    }
}

/// Hooks of the model implementation being loaded
///
/// The manager owns weights and devices; the implementation only turns
/// local weight paths into a usable model on the given device.
#[async_trait]
pub trait ModelLifecycle: Send + Sync {
    /// Loads the model from materialized weights onto `device`
    async fn load(&self, weights: &BTreeMap<String, PathBuf>, device: &DeviceDescriptor) -> Result<()>;

    /// Frees whatever `load` acquired
    async fn unload(&self) -> Result<()> {
        Ok(())
    }
}
