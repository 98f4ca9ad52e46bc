//! Compute device discovery for Model Serve
//!
//! This crate enumerates the devices models can be placed on: the host CPU,
//! GPUs visible to the driver tooling and platform accelerators.

pub mod detector;

// Re-export commonly used types
pub use detector::{
    apply_overrides, parse_nvidia_smi, CpuProbe, DeviceProbe, DiscoveredDevice, HardwareDetector,
    MpsProbe, NvidiaSmiProbe,
};
