//! LLM inference engine.
//!
//! - [`engine`]: high-level inference orchestrator driving prefill/decode
//!   through the ShadowKV cache
//! - [`attention_kernel`]: the fused gather-matmul-RoPE reconstruction and
//!   dense-attention external collaborator contract (§9 redesign flag)
//! - [`model_loader`]: GGUF model loading and configuration

pub mod attention_kernel;
pub mod engine;
pub mod model_loader;
