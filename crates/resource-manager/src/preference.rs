//! Device preference parsing
//!
//! Deploy entries name a device as `auto`, a kind (`cpu`, `gpu`, `cuda`,
//! `accelerator`, `mps`) or a concrete device id such as `cuda:1`.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use common::types::{DeviceId, DeviceKind};

/// Where a model would like to run
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Best available kind, falling back to the CPU
    #[default]
    Auto,
    /// Any device of one kind
    Kind(DeviceKind),
    /// One specific device
    Device(DeviceId),
}

impl FromStr for DevicePreference {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            return Ok(DevicePreference::Auto);
        }
        Ok(match trimmed.parse::<DeviceKind>() {
            Ok(kind) => DevicePreference::Kind(kind),
            Err(_) => DevicePreference::Device(DeviceId::new(trimmed)),
        })
    }
}

impl From<&str> for DevicePreference {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(preference) => preference,
            Err(never) => match never {},
        }
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevicePreference::Auto => write!(f, "auto"),
            DevicePreference::Kind(kind) => write!(f, "{}", kind),
            DevicePreference::Device(id) => write!(f, "{}", id),
        }
    }
}
