//! GPU VRAM region allocator.
//!
//! ShadowKV's tensor regions (§3) are sized once at construction — full
//! key/value buffers, landmark table, U/SV tables, device scratch — and
//! never individually resized or freed; only torn down with the cache. This
//! allocator tracks those named regions against a device's VRAM budget
//! rather than managing a free-list of fixed-size blocks.

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, PartialEq)]
pub enum AllocatorError {
    #[error("region '{name}' of {requested} bytes exceeds free VRAM on device {device_id} ({remaining} bytes free)")]
    OutOfMemory {
        device_id: usize,
        name: String,
        requested: usize,
        remaining: usize,
    },

    #[error("device {0} not registered with this allocator")]
    DeviceNotInitialized(usize),

    #[error("region '{0}' already allocated on this device")]
    DuplicateRegion(String),
}

/// Location of one allocated region within a device's VRAM budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLocation {
    pub device_id: usize,
    pub offset: usize,
    pub size: usize,
}

struct DeviceRegions {
    device_id: usize,
    capacity: usize,
    used: usize,
    regions: Vec<(String, RegionLocation)>,
}

/// Per-device named-region allocator.
pub struct VramRegionAllocator {
    devices: Vec<DeviceRegions>,
}

impl VramRegionAllocator {
    /// `device_vram`: `(device_id, vram_budget_bytes)` pairs.
    pub fn new(device_vram: &[(usize, usize)]) -> Self {
        let devices = device_vram
            .iter()
            .map(|&(device_id, capacity)| DeviceRegions {
                device_id,
                capacity,
                used: 0,
                regions: Vec::new(),
            })
            .collect();

        Self { devices }
    }

    /// Reserve a named, fixed-size region on `device_id` (e.g.
    /// `"landmark_table"`, `"factor_u"`, `"factor_sv"`, `"device_scratch"`).
    pub fn allocate_region(
        &mut self,
        device_id: usize,
        name: &str,
        size: usize,
    ) -> Result<RegionLocation, AllocatorError> {
        let dev = self
            .devices
            .iter_mut()
            .find(|d| d.device_id == device_id)
            .ok_or(AllocatorError::DeviceNotInitialized(device_id))?;

        if dev.regions.iter().any(|(existing, _)| existing == name) {
            return Err(AllocatorError::DuplicateRegion(name.to_string()));
        }

        let remaining = dev.capacity.saturating_sub(dev.used);
        if size > remaining {
            return Err(AllocatorError::OutOfMemory {
                device_id,
                name: name.to_string(),
                requested: size,
                remaining,
            });
        }

        let location = RegionLocation {
            device_id,
            offset: dev.used,
            size,
        };
        dev.used += size;
        dev.regions.push((name.to_string(), location));

        debug!(
            device = device_id,
            region = name,
            offset = location.offset,
            size,
            "allocated VRAM region"
        );

        Ok(location)
    }

    /// Look up a previously allocated region by name.
    pub fn region(&self, device_id: usize, name: &str) -> Option<RegionLocation> {
        self.devices
            .iter()
            .find(|d| d.device_id == device_id)
            .and_then(|d| d.regions.iter().find(|(n, _)| n == name))
            .map(|(_, loc)| *loc)
    }

    /// Fraction of `device_id`'s VRAM budget currently reserved.
    pub fn utilization(&self, device_id: usize) -> Option<f64> {
        self.devices.iter().find(|d| d.device_id == device_id).map(|d| {
            if d.capacity == 0 {
                0.0
            } else {
                d.used as f64 / d.capacity as f64
            }
        })
    }

    pub fn used_bytes(&self, device_id: usize) -> Option<usize> {
        self.devices.iter().find(|d| d.device_id == device_id).map(|d| d.used)
    }
}
