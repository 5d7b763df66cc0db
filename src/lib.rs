//! ShadowKV: sparse-attention KV cache engine for bounded-memory
//! long-context LLM decoding.
//!
//! During prefill, the cache reduces each chunk of the prompt's keys to a
//! landmark, flags outlier chunks that a landmark represents poorly, and
//! factorizes the remaining keys into a low-rank `(U, SV)` pair. During
//! decode, it scores the current query against the landmark table, retrieves
//! a bounded per-step chunk budget, streams the corresponding values from
//! host-pinned memory, and reconstructs keys with a fused gather-matmul-RoPE
//! operation — all while the bulk of a long context stays off-device.

pub mod cache;
pub mod config;
pub mod gpu;
pub mod inference;
pub mod server;
pub mod transfer;
