//! Low-rank key codec (§4.3): truncated SVD factorization and the fused
//! gather-matmul reconstruction contract.
//!
//! No linear-algebra crate in this repository's dependency stack exposes a
//! general SVD, so the truncation is computed directly against the `D × D`
//! Gram matrix by power iteration with deflation — standard for recovering
//! the top-`r` eigenpairs of a small symmetric PSD matrix without pulling in
//! a LAPACK binding. The factorization always runs in `f32`; callers apply
//! the configured storage dtype afterwards (see [`crate::cache::dtype`]).

use ndarray::{Array1, Array2, ArrayView2, Axis};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum LowRankError {
    #[error("power iteration did not converge for component {component} of {rank} (layer {layer}, kv_head {kv_head})")]
    NonConvergent {
        layer: usize,
        kv_head: usize,
        component: usize,
        rank: usize,
    },
}

/// Stored low-rank factor pair (§4.3).
///
/// `u`: `[r, D]`, shared across all positions.
/// `sv`: `[n_indexed, r]`, one row per indexed position, in the same order
/// as the positions passed to [`truncated_svd`].
#[derive(Debug, Clone)]
pub struct LowRankFactors {
    pub u: Array2<f32>,
    pub sv: Array2<f32>,
    pub rank: usize,
}

const DEFAULT_MAX_ITERS: usize = 200;
const DEFAULT_TOL: f32 = 1e-5;

/// Deterministic seed vector for power iteration's `k`-th component.
///
/// Avoids a random-number dependency: the seed only needs to be generically
/// non-orthogonal to the dominant eigenvectors, not truly random.
fn deterministic_seed(dim: usize, component: usize) -> Array1<f32> {
    Array1::from_iter((0..dim).map(|i| {
        let phase = (i as f32 + 1.0) * (component as f32 * 0.37 + 1.0);
        phase.sin() + 1e-3
    }))
}

fn normalize(v: &mut Array1<f32>) -> f32 {
    let norm = v.dot(v).sqrt();
    if norm > f32::EPSILON {
        *v /= norm;
    }
    norm
}

/// Compute the truncated SVD of `keys` (`[N, D]`, pre-RoPE) keeping the top
/// `min(rank, N, D)` components, returning the reconstruction factor pair.
///
/// `layer`/`kv_head` are carried only for error/log context.
pub fn truncated_svd(
    keys: ArrayView2<f32>,
    rank: usize,
    layer: usize,
    kv_head: usize,
) -> Result<LowRankFactors, LowRankError> {
    truncated_svd_with_params(keys, rank, layer, kv_head, DEFAULT_MAX_ITERS, DEFAULT_TOL)
}

pub fn truncated_svd_with_params(
    keys: ArrayView2<f32>,
    rank: usize,
    layer: usize,
    kv_head: usize,
    max_iters: usize,
    tol: f32,
) -> Result<LowRankFactors, LowRankError> {
    let (n, d) = keys.dim();
    let effective_rank = rank.min(n).min(d);

    if effective_rank == 0 {
        return Ok(LowRankFactors {
            u: Array2::zeros((0, d)),
            sv: Array2::zeros((n, 0)),
            rank: 0,
        });
    }

    if effective_rank < rank {
        warn!(
            layer,
            kv_head,
            configured_rank = rank,
            effective_rank,
            n_positions = n,
            head_dim = d,
            "clamping configured rank to min(rank, n_positions, head_dim)"
        );
    }

    let mut gram = keys.t().dot(&keys); // [D, D], symmetric PSD
    let mut eigvecs = Array2::<f32>::zeros((d, effective_rank));

    for k in 0..effective_rank {
        let mut v = deterministic_seed(d, k);
        normalize(&mut v);

        let mut lambda = 0.0f32;
        let mut converged = false;

        for _ in 0..max_iters {
            let mut next = gram.dot(&v);
            let norm = normalize(&mut next);
            if norm <= f32::EPSILON {
                // Deflated down to (numerically) zero: remaining components
                // carry no energy, treat as converged at lambda 0.
                lambda = 0.0;
                converged = true;
                v = next;
                break;
            }
            let new_lambda = next.dot(&gram.dot(&next));
            if (new_lambda - lambda).abs() <= tol * new_lambda.abs().max(1.0) {
                v = next;
                lambda = new_lambda;
                converged = true;
                break;
            }
            v = next;
            lambda = new_lambda;
        }

        if !converged {
            return Err(LowRankError::NonConvergent {
                layer,
                kv_head,
                component: k,
                rank: effective_rank,
            });
        }

        // Deflate: gram -= lambda * v v^T, so the next iteration recovers the
        // next-largest eigenpair instead of re-finding this one.
        let outer = {
            let col = v.view().insert_axis(Axis(1));
            col.dot(&col.t())
        };
        gram -= &(outer * lambda);

        eigvecs.column_mut(k).assign(&v);
    }

    let u = eigvecs.t().to_owned(); // [r, D]
    let sv = keys.dot(&eigvecs); // [N, r] == U_svd * Sigma, computed directly

    Ok(LowRankFactors {
        u,
        sv,
        rank: effective_rank,
    })
}

/// Reconstruct pre-RoPE key rows for the given row indices into `sv`.
///
/// `reconstructed[i, :] = sv[rows[i], :] @ u`, the contract from §4.3.
pub fn reconstruct_rows(factors: &LowRankFactors, rows: &[usize]) -> Array2<f32> {
    if rows.is_empty() || factors.rank == 0 {
        return Array2::zeros((rows.len(), factors.u.ncols()));
    }
    let selected = factors.sv.select(Axis(0), rows); // [k, r]
    selected.dot(&factors.u) // [k, D]
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn full_rank_reconstructs_exactly() {
        let keys = arr2(&[[1.0, 2.0], [3.0, -1.0], [0.5, 0.5], [-2.0, 1.0]]);
        let factors = truncated_svd(keys.view(), 2, 0, 0).unwrap();
        assert_eq!(factors.rank, 2);

        let rows: Vec<usize> = (0..keys.nrows()).collect();
        let reconstructed = reconstruct_rows(&factors, &rows);

        for i in 0..keys.nrows() {
            for j in 0..keys.ncols() {
                assert!(
                    (reconstructed[[i, j]] - keys[[i, j]]).abs() < 1e-3,
                    "mismatch at ({i},{j}): {} vs {}",
                    reconstructed[[i, j]],
                    keys[[i, j]]
                );
            }
        }
    }

    #[test]
    fn rank_clamps_to_head_dim() {
        let keys = arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
        let factors = truncated_svd(keys.view(), 160, 0, 0).unwrap();
        assert_eq!(factors.rank, 2); // clamped to D
    }

    #[test]
    fn empty_rows_reconstruct_to_empty() {
        let keys = arr2(&[[1.0, 2.0], [3.0, 4.0]]);
        let factors = truncated_svd(keys.view(), 2, 0, 0).unwrap();
        let reconstructed = reconstruct_rows(&factors, &[]);
        assert_eq!(reconstructed.nrows(), 0);
    }
}
