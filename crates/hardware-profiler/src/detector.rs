//! Device detection implementation
//!
//! Devices are discovered once at startup by a fixed list of probes. The
//! host CPU is always present; GPUs are read from `nvidia-smi` when it is
//! installed, and Apple silicon exposes one MPS accelerator sharing system
//! memory. Statically configured devices are merged over the result.

use std::process::Command;
use serde::{Deserialize, Serialize};
use sysinfo::{System, SystemExt};
use tracing::{debug, info, warn};

use common::types::{DeviceId, DeviceKind};
use common::utils::format_bytes;
use config::DeviceSpec;

/// Bytes per MiB, the unit `nvidia-smi` reports memory in
const MIB: u64 = 1024 * 1024;

/// A compute device found at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Device identifier, e.g. `cpu`, `cuda:0`, `mps`
    pub id: DeviceId,

    /// Device kind
    pub kind: DeviceKind,

    /// Human readable name
    pub name: String,

    /// Memory available to models on this device
    pub total_memory_bytes: u64,
}

/// One source of devices
pub trait DeviceProbe: Send + Sync {
    /// Probe name for logging
    fn name(&self) -> &'static str;

    /// Returns the devices this probe can see; empty when none
    fn probe(&self) -> Vec<DiscoveredDevice>;
}

/// Host CPU and system memory
#[derive(Debug, Default)]
pub struct CpuProbe;

impl DeviceProbe for CpuProbe {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn probe(&self) -> Vec<DiscoveredDevice> {
        let mut system = System::new();
        system.refresh_memory();

        vec![DiscoveredDevice {
            id: DeviceId::new("cpu"),
            kind: DeviceKind::Cpu,
            name: format!("{}-core CPU", num_cpus::get()),
            total_memory_bytes: system.total_memory(),
        }]
    }
}

/// NVIDIA GPUs listed by `nvidia-smi`
#[derive(Debug)]
pub struct NvidiaSmiProbe {
    /// Executable to run
    command: String,
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self {
            command: "nvidia-smi".to_string(),
        }
    }
}

impl NvidiaSmiProbe {
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl DeviceProbe for NvidiaSmiProbe {
    fn name(&self) -> &'static str {
        "nvidia-smi"
    }

    fn probe(&self) -> Vec<DiscoveredDevice> {
        let output = Command::new(&self.command)
            .args(["--query-gpu=index,name,memory.total", "--format=csv,noheader,nounits"])
            .output();

        match output {
            Ok(output) if output.status.success() => {
                parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                debug!(status = %output.status, "nvidia-smi reported no usable GPUs");
                Vec::new()
            }
            Err(e) => {
                debug!(error = %e, "nvidia-smi not available");
                Vec::new()
            }
        }
    }
}

/// Apple silicon GPU through Metal Performance Shaders
#[derive(Debug, Default)]
pub struct MpsProbe;

impl DeviceProbe for MpsProbe {
    fn name(&self) -> &'static str {
        "mps"
    }

    fn probe(&self) -> Vec<DiscoveredDevice> {
        if !cfg!(all(target_os = "macos", target_arch = "aarch64")) {
            return Vec::new();
        }

        // unified memory: the accelerator shares system RAM
        let mut system = System::new();
        system.refresh_memory();

        vec![DiscoveredDevice {
            id: DeviceId::new("mps"),
            kind: DeviceKind::Accelerator,
            name: "Apple MPS".to_string(),
            total_memory_bytes: system.total_memory(),
        }]
    }
}

/// Parses `index,name,memory.total` CSV lines from `nvidia-smi`
///
/// Malformed lines are skipped.
pub fn parse_nvidia_smi(output: &str) -> Vec<DiscoveredDevice> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 3 {
                warn!(line, "unexpected nvidia-smi line");
                return None;
            }

            let index: u32 = fields[0].parse().ok()?;
            let name = fields[1..fields.len() - 1].join(",");
            let memory_mib: u64 = fields[fields.len() - 1].parse().ok()?;

            Some(DiscoveredDevice {
                id: DeviceId::new(format!("cuda:{}", index)),
                kind: DeviceKind::Gpu,
                name,
                total_memory_bytes: memory_mib * MIB,
            })
        })
        .collect()
}

/// Merges configured devices over discovered ones
///
/// A configured device with a discovered id replaces it in place; any other
/// configured device is appended in configuration order.
pub fn apply_overrides(mut devices: Vec<DiscoveredDevice>, overrides: &[DeviceSpec]) -> Vec<DiscoveredDevice> {
    for spec in overrides {
        let device = DiscoveredDevice {
            id: DeviceId::new(spec.id.clone()),
            kind: spec.kind,
            name: format!("configured {}", spec.kind),
            total_memory_bytes: spec.total_memory_bytes,
        };

        match devices.iter_mut().find(|d| d.id == device.id) {
            Some(existing) => {
                debug!(device = %device.id, "configured device overrides discovery");
                *existing = device;
            }
            None => devices.push(device),
        }
    }
    devices
}

/// Runs device probes
pub struct HardwareDetector {
    probes: Vec<Box<dyn DeviceProbe>>,
}

impl Default for HardwareDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareDetector {
    /// Creates a detector with the platform probes
    pub fn new() -> Self {
        Self::with_probes(vec![
            Box::new(CpuProbe),
            Box::new(NvidiaSmiProbe::default()),
            Box::new(MpsProbe),
        ])
    }

    pub fn with_probes(probes: Vec<Box<dyn DeviceProbe>>) -> Self {
        Self { probes }
    }

    /// Discovers devices in probe order, then applies `overrides`
    ///
    /// The result always contains a CPU device.
    pub fn discover(&self, overrides: &[DeviceSpec]) -> Vec<DiscoveredDevice> {
        let mut devices = Vec::new();
        for probe in &self.probes {
            let found = probe.probe();
            debug!(probe = probe.name(), count = found.len(), "probe finished");
            devices.extend(found);
        }

        let mut devices = apply_overrides(devices, overrides);

        if !devices.iter().any(|d| d.kind == DeviceKind::Cpu) {
            devices.insert(0, CpuProbe.probe().remove(0));
        }

        for device in &devices {
            info!(
                device = %device.id,
                kind = %device.kind,
                name = %device.name,
                memory = %format_bytes(device.total_memory_bytes),
                "device discovered"
            );
        }
        devices
    }
}
