//! The attention kernel: the external collaborator this crate hands
//! reconstructed keys/values to (§1 scope, §9 design notes).
//!
//! ShadowKV's job stops at producing `|outliers| + |local tail| + S·C +
//! generated-so-far` keys and values for one decode step; the linear
//! projections, RMS norm, and softmax attention proper belong to the
//! transformer layer and are explicitly out of scope. What lives here is the
//! narrow surface a layer actually needs to drive the cache end to end:
//!
//! - a rotary positional embedding table and application function, matching
//!   the `RopeApplyFn` contract `cache::shadow_cache` expects the caller to
//!   supply;
//! - deterministic stand-ins for "freshly projected" query/key/value tensors,
//!   since this crate has no tokenizer or weight-loading story of its own;
//! - a small reference scaled-dot-product attention, used as the Resident
//!   variant's correctness baseline (§1: "used for debugging and correctness
//!   baselining") and by the driving loop in [`crate::inference::engine`].

use ndarray::{Array1, Array2, Array4, ArrayView1, ArrayView2};

use crate::cache::buffers::Position;
use crate::cache::shadow_cache::CosSinCache;

/// Token identifier, mirroring what a tokenizer would hand the engine.
pub type TokenId = i32;

/// Build a standard rotary embedding cos/sin table for `max_position`
/// positions of a `head_dim`-wide head, using the usual `theta` base (10000
/// for most LLaMA-family models).
pub fn build_cos_sin_cache(max_position: usize, head_dim: usize, theta: f32) -> CosSinCache {
    let half = head_dim / 2;
    let mut cos = Array2::<f32>::zeros((max_position, half));
    let mut sin = Array2::<f32>::zeros((max_position, half));

    let inv_freq: Vec<f32> = (0..half)
        .map(|i| 1.0 / theta.powf((2 * i) as f32 / head_dim as f32))
        .collect();

    for pos in 0..max_position {
        for (i, &freq) in inv_freq.iter().enumerate() {
            let angle = pos as f32 * freq;
            cos[[pos, i]] = angle.cos();
            sin[[pos, i]] = angle.sin();
        }
    }

    CosSinCache { cos, sin }
}

/// Rotate-half RoPE: pairs dimension `i` with `i + head_dim/2`.
///
/// Matches the `RopeApplyFn` signature `cache::shadow_cache` expects: given a
/// pre-RoPE row and its absolute position, return the rotated row.
pub fn rope_rotate(row: ArrayView1<f32>, position: Position, cos_sin: &CosSinCache) -> Array1<f32> {
    let d = row.len();
    let half = d / 2;
    let mut out = Array1::<f32>::zeros(d);

    for i in 0..half {
        let cos = cos_sin.cos[[position, i]];
        let sin = cos_sin.sin[[position, i]];
        let x0 = row[i];
        let x1 = row[i + half];
        out[i] = x0 * cos - x1 * sin;
        out[i + half] = x1 * cos + x0 * sin;
    }

    out
}

/// Apply [`rope_rotate`] across every position of a `[B, H_kv, N, D]` tensor,
/// turning a pre-RoPE tensor into its post-RoPE counterpart. Used when
/// building synthetic prefill tensors, since a real layer would hand both
/// forms to `prefill_kv_cache` already computed.
pub fn apply_rope_tensor(pre_rope: &Array4<f32>, cos_sin: &CosSinCache) -> Array4<f32> {
    let (b, h_kv, n, d) = pre_rope.dim();
    let mut out = Array4::<f32>::zeros((b, h_kv, n, d));
    for batch in 0..b {
        for kv_head in 0..h_kv {
            for pos in 0..n {
                let rotated = rope_rotate(pre_rope.slice(ndarray::s![batch, kv_head, pos, ..]), pos, cos_sin);
                out.slice_mut(ndarray::s![batch, kv_head, pos, ..]).assign(&rotated);
            }
        }
    }
    out
}

/// Deterministic stand-in for a linear projection's output, since this crate
/// owns no model weights. `salt` distinguishes independent projections (Q,
/// K, V) built from the same token sequence so they aren't identical.
///
/// Mirrors [`crate::cache::lowrank::deterministic_seed`]'s approach of using
/// a fixed trigonometric function of the inputs rather than a PRNG, so two
/// calls with the same arguments always agree (needed for reproducible
/// tests and for `update`'s append to see the same "freshly computed" key a
/// subsequent fetch should read back).
pub fn synthetic_projection(tokens: &[TokenId], n_kv_heads: usize, head_dim: usize, salt: u32) -> Array4<f32> {
    let n = tokens.len();
    let mut out = Array4::<f32>::zeros((1, n_kv_heads, n, head_dim));
    for (pos, &token) in tokens.iter().enumerate() {
        for kv_head in 0..n_kv_heads {
            for dim in 0..head_dim {
                let phase = (token as f32 + 1.0) * 0.017
                    + (pos as f32 + 1.0) * 0.011
                    + (kv_head as f32 + 1.0) * 0.31
                    + (dim as f32 + 1.0) * 0.053
                    + salt as f32 * 0.7;
                out[[0, kv_head, pos, dim]] = phase.sin();
            }
        }
    }
    out
}

/// Reference scaled-dot-product attention: `softmax(q · kᵀ / √D) · v`.
///
/// `query` is `[G, D]` for one kv-head's group; `keys`/`values` are `[N, D]`,
/// the reconstruction set `ShadowKvCache` produced for this step. This is the
/// Resident variant's correctness baseline (§1), not a performance-oriented
/// kernel — a real deployment's fused attention kernel is the external
/// collaborator this function stands in for.
pub fn dense_attention(query: ArrayView2<f32>, keys: ArrayView2<f32>, values: ArrayView2<f32>) -> Array2<f32> {
    let d = query.ncols() as f32;
    let scale = 1.0 / d.sqrt();

    let mut scores = query.dot(&keys.t()) * scale; // [G, N]
    for mut row in scores.rows_mut() {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|x| (x - max).exp());
        let sum: f32 = row.sum();
        if sum > f32::EPSILON {
            row.mapv_inplace(|x| x / sum);
        }
    }

    scores.dot(&values) // [G, D]
}
