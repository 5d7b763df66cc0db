//! GPU device discovery and information.
//!
//! Detects available GPUs and their VRAM capacity.
//! When compiled without the `cuda` feature, provides stub info.

use serde::{Deserialize, Serialize};
use tracing::info;

/// Information about a single GPU device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuDeviceInfo {
    /// Device index.
    pub id: usize,

    /// Device name (e.g., "NVIDIA A100-SXM4-80GB").
    pub name: String,

    /// Total VRAM in bytes.
    pub total_vram: usize,

    /// Free VRAM in bytes (at detection time).
    pub free_vram: usize,

    /// Compute capability (major, minor).
    pub compute_capability: (u32, u32),

    /// PCIe bandwidth in bytes/sec (theoretical max); bounds H2D/D2H throughput
    /// for the offloaded variant's per-step value gather.
    pub pcie_bandwidth: u64,
}

/// Detect all available GPU devices.
///
/// With the `cuda` feature enabled, uses CUDA runtime to enumerate devices.
/// Without it, returns an empty list (CPU-only mode).
pub fn detect_devices() -> Vec<GpuDeviceInfo> {
    #[cfg(feature = "cuda")]
    {
        detect_devices_cuda()
    }

    #[cfg(not(feature = "cuda"))]
    {
        info!("CUDA not enabled, running in CPU-only mode");
        Vec::new()
    }
}

#[cfg(feature = "cuda")]
fn detect_devices_cuda() -> Vec<GpuDeviceInfo> {
    // Real implementation would use cudarc to enumerate devices.
    // This is a compile-time gated stub that would be filled in
    // when cudarc is available.
    todo!("Implement CUDA device detection with cudarc")
}

/// Create a stub single-GPU device for testing without CUDA.
pub fn stub_device(total_vram_gb: usize) -> GpuDeviceInfo {
    GpuDeviceInfo {
        id: 0,
        name: "stub-accelerator".to_string(),
        total_vram: total_vram_gb * 1024 * 1024 * 1024,
        free_vram: (total_vram_gb * 1024 * 1024 * 1024 * 9) / 10,
        compute_capability: (8, 0),
        pcie_bandwidth: 25_000_000_000, // ~25 GB/s PCIe 4.0 x16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_devices_cpu_only() {
        // Without the `cuda` feature this must be an empty, not a panicking, call.
        let devices = detect_devices();
        assert!(devices.is_empty());
    }

    #[test]
    fn test_stub_device() {
        let dev = stub_device(80);
        assert_eq!(dev.total_vram, 80 * 1024 * 1024 * 1024);
        assert!(dev.free_vram < dev.total_vram);
    }
}
