//! Device allocation implementation
//!
//! This module places model loads on compute devices. Each decision picks
//! the qualifying device with the most free memory; reservations are only
//! changed under the allocation lock, so two concurrent requests can never
//! both pass the capacity check of the same device.

use std::cmp::Reverse;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use common::error::{AllocationError, Result};
use common::types::{DeviceId, DeviceKind};
use common::utils::format_bytes;
use hardware_profiler::DiscoveredDevice;
use crate::preference::DevicePreference;

/// Order in which `auto` tries device kinds
const AUTO_ORDER: [DeviceKind; 3] = [DeviceKind::Gpu, DeviceKind::Accelerator, DeviceKind::Cpu];

/// A compute device and its reservation counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    /// Device identifier
    pub id: DeviceId,

    /// Device kind
    pub kind: DeviceKind,

    /// Memory available to models
    pub total_memory_bytes: u64,

    /// Memory reserved by current allocations
    pub reserved_memory_bytes: u64,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<DeviceId>, kind: DeviceKind, total_memory_bytes: u64) -> Self {
        Self {
            id: id.into(),
            kind,
            total_memory_bytes,
            reserved_memory_bytes: 0,
        }
    }

    /// Memory not yet reserved
    pub fn free_memory_bytes(&self) -> u64 {
        self.total_memory_bytes.saturating_sub(self.reserved_memory_bytes)
    }
}

impl From<&DiscoveredDevice> for DeviceDescriptor {
    fn from(device: &DiscoveredDevice) -> Self {
        Self::new(device.id.clone(), device.kind, device.total_memory_bytes)
    }
}

/// Device allocator for model loads
pub struct DeviceAllocator {
    /// Device table in discovery order
    devices: Mutex<Vec<DeviceDescriptor>>,
}

impl DeviceAllocator {
    /// Creates an allocator over a fixed device table
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        Self {
            devices: Mutex::new(devices),
        }
    }

    /// Creates an allocator from discovery results
    pub fn from_discovered(devices: &[DiscoveredDevice]) -> Self {
        Self::new(devices.iter().map(DeviceDescriptor::from).collect())
    }

    /// Reserves `requested_bytes` on the best device of `preferred_kind`
    ///
    /// Among devices with enough free memory the one with the most free
    /// memory wins; ties go to the device with less reserved, then to the
    /// earlier discovered one. Any kind qualifies when none is preferred.
    pub fn allocate(&self, requested_bytes: u64, preferred_kind: Option<DeviceKind>) -> Result<DeviceDescriptor> {
        let mut devices = self.devices.lock();

        let chosen = devices
            .iter_mut()
            .enumerate()
            .filter(|(_, d)| preferred_kind.map_or(true, |kind| d.kind == kind))
            .filter(|(_, d)| d.free_memory_bytes() >= requested_bytes)
            .max_by_key(|(index, d)| (d.free_memory_bytes(), Reverse(d.reserved_memory_bytes), Reverse(*index)))
            .map(|(_, d)| d);

        let device = chosen.ok_or(AllocationError::InsufficientCapacity {
            requested_bytes,
            kind: preferred_kind,
        })?;

        device.reserved_memory_bytes += requested_bytes;

        info!(
            device = %device.id,
            requested = %format_bytes(requested_bytes),
            free = %format_bytes(device.free_memory_bytes()),
            "device_allocated"
        );
        Ok(device.clone())
    }

    /// Reserves `requested_bytes` on one specific device
    pub fn allocate_on(&self, id: &DeviceId, requested_bytes: u64) -> Result<DeviceDescriptor> {
        let mut devices = self.devices.lock();

        let device = devices
            .iter_mut()
            .find(|d| &d.id == id)
            .ok_or_else(|| AllocationError::UnknownDevice(id.clone()))?;

        if device.free_memory_bytes() < requested_bytes {
            return Err(AllocationError::InsufficientCapacity {
                requested_bytes,
                kind: Some(device.kind),
            }
            .into());
        }

        device.reserved_memory_bytes += requested_bytes;

        info!(
            device = %device.id,
            requested = %format_bytes(requested_bytes),
            free = %format_bytes(device.free_memory_bytes()),
            "device_allocated"
        );
        Ok(device.clone())
    }

    /// Reserves memory according to a device preference
    ///
    /// `Auto` tries GPUs, then accelerators, then the CPU, and reports the
    /// CPU failure if nothing fits.
    pub fn allocate_preference(&self, preference: &DevicePreference, requested_bytes: u64) -> Result<DeviceDescriptor> {
        match preference {
            DevicePreference::Auto => {
                let mut last_error = None;
                for kind in AUTO_ORDER {
                    match self.allocate(requested_bytes, Some(kind)) {
                        Ok(device) => return Ok(device),
                        Err(e) => {
                            debug!(kind = %kind, error = %e, "no fit, trying next kind");
                            last_error = Some(e);
                        }
                    }
                }
                Err(last_error.unwrap_or_else(|| {
                    AllocationError::InsufficientCapacity {
                        requested_bytes,
                        kind: None,
                    }
                    .into()
                }))
            }
            DevicePreference::Kind(kind) => self.allocate(requested_bytes, Some(*kind)),
            DevicePreference::Device(id) => self.allocate_on(id, requested_bytes),
        }
    }

    /// Returns `memory_bytes` of reservation on a device
    ///
    /// Releasing more than is reserved clamps the reservation at zero.
    pub fn release(&self, id: &DeviceId, memory_bytes: u64) -> Result<()> {
        let mut devices = self.devices.lock();

        let device = devices
            .iter_mut()
            .find(|d| &d.id == id)
            .ok_or_else(|| AllocationError::UnknownDevice(id.clone()))?;

        if memory_bytes > device.reserved_memory_bytes {
            warn!(
                device = %id,
                released = memory_bytes,
                reserved = device.reserved_memory_bytes,
                "release exceeds reservation; clamping to zero"
            );
        }
        device.reserved_memory_bytes = device.reserved_memory_bytes.saturating_sub(memory_bytes);

        info!(
            device = %id,
            released = %format_bytes(memory_bytes),
            free = %format_bytes(device.free_memory_bytes()),
            "device_released"
        );
        Ok(())
    }

    /// Snapshot of the device table
    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.devices.lock().clone()
    }

    pub fn device(&self, id: &DeviceId) -> Option<DeviceDescriptor> {
        self.devices.lock().iter().find(|d| &d.id == id).cloned()
    }
}
