//! Host/device data movement for decode-time retrieval (§4.5, §5).
//!
//! - [`gpu_transfer`]: async host↔device copies into device scratch regions
//! - [`dma_scheduler`]: sequences the copy stream (value gather) and the
//!   reconstruction stream (key rebuild) for one decode step

pub mod dma_scheduler;
pub mod gpu_transfer;
