//! ShadowKV sparse attention cache.
//!
//! - [`dtype`]: storage precision policy for factor/resident tables
//! - [`buffers`]: shared position/shape types and the resident store
//! - [`landmark`]: landmark builder (§4.1)
//! - [`outlier`]: outlier detector (§4.2)
//! - [`lowrank`]: low-rank key codec (§4.3)
//! - [`offload`]: value offload store (§4.4)
//! - [`retrieval`]: retrieval engine scoring (§4.5)
//! - [`update`]: update path (§4.6)
//! - [`lifecycle`]: admission control state machine (§4.7)
//! - [`shadow_cache`]: `ShadowKvCache` / `ShadowKvStack`, wiring the above
//!   behind the external interface (§6)

pub mod buffers;
pub mod dtype;
pub mod landmark;
pub mod lifecycle;
pub mod lowrank;
pub mod offload;
pub mod outlier;
pub mod retrieval;
pub mod shadow_cache;
pub mod update;

pub use shadow_cache::{CosSinCache, ShadowError, ShadowKvCache, ShadowKvStack};
