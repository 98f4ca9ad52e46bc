//! Common types for Model Serve
//!
//! This module defines the small value types shared across crates.

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

/// Kind of remote source a weight artifact comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// S3-style object storage
    ObjectStore,
    /// Model hub (repo + revision + filename)
    Hub,
    /// Plain HTTP(S) URLs
    Http,
}

impl SourceKind {
    /// All source kinds, in cache directory order
    pub const ALL: [SourceKind; 3] = [SourceKind::ObjectStore, SourceKind::Hub, SourceKind::Http];

    /// Name of the cache subdirectory for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::ObjectStore => "object_store",
            SourceKind::Hub => "hub",
            SourceKind::Http => "http",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "object_store" | "s3" => Ok(SourceKind::ObjectStore),
            "hub" | "hf" => Ok(SourceKind::Hub),
            "http" | "https" => Ok(SourceKind::Http),
            _ => Err(format!("Unknown source kind: {}", s)),
        }
    }
}

/// Kind of compute device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Host CPU and system memory
    Cpu,
    /// Discrete GPU
    Gpu,
    /// Other accelerator (e.g. Apple MPS)
    Accelerator,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Gpu => write!(f, "gpu"),
            DeviceKind::Accelerator => write!(f, "accelerator"),
        }
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(DeviceKind::Cpu),
            "gpu" | "cuda" | "rocm" => Ok(DeviceKind::Gpu),
            "accelerator" | "mps" | "tpu" => Ok(DeviceKind::Accelerator),
            _ => Err(format!("Unknown device kind: {}", s)),
        }
    }
}

/// Identifier of a compute device, e.g. `cpu`, `cuda:0`, `mps`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_parse() {
        assert_eq!("s3".parse::<SourceKind>().unwrap(), SourceKind::ObjectStore);
        assert_eq!("hf".parse::<SourceKind>().unwrap(), SourceKind::Hub);
        assert_eq!("HTTP".parse::<SourceKind>().unwrap(), SourceKind::Http);
        assert!("ftp".parse::<SourceKind>().is_err());
    }

    #[test]
    fn test_device_kind_aliases() {
        assert_eq!("cuda".parse::<DeviceKind>().unwrap(), DeviceKind::Gpu);
        assert_eq!("mps".parse::<DeviceKind>().unwrap(), DeviceKind::Accelerator);
        assert_eq!(DeviceKind::Cpu.to_string(), "cpu");
    }
}
