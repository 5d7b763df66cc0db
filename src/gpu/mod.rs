//! GPU device management, VRAM allocation, and stream/event synchronisation.
//!
//! - [`device`]: GPU device discovery and info
//! - [`allocator`]: Region allocator for the cache's fixed-size tensor buffers
//! - [`stream`]: Explicit multi-stream scheduling model (primary / copy /
//!   reconstruction) with event-based happens-before edges

pub mod allocator;
pub mod device;
pub mod stream;
