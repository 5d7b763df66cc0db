//! Retrieval engine (§4.5): per-step affinity scoring, group reduction,
//! top-k chunk selection, and index materialisation.
//!
//! The gather/reconstruct execution itself (parallel value-stream and
//! key-stream work) is choreographed by [`crate::cache::shadow_cache`] using
//! [`crate::gpu::stream`]; this module is the pure, synchronous scoring math
//! that decides *which* positions to reconstruct.

use std::collections::BTreeSet;

use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::cache::buffers::{ChunkId, Position};

/// Affinity scores `a = q · Lᵀ`, scaled by `1/√D`.
///
/// `query`: `[G, D]` (one kv-head's group of query heads).
/// `landmarks`: `[M, D]`.
/// Returns `[G, M]`.
pub fn affinity_scores(query: ArrayView2<f32>, landmarks: ArrayView2<f32>) -> Array2<f32> {
    let d = query.ncols() as f32;
    let scale = 1.0 / d.sqrt();
    query.dot(&landmarks.t()) * scale
}

/// Softmax each row in place (numerically stable via row-max subtraction).
pub fn softmax_rows(scores: &mut Array2<f32>) {
    for mut row in scores.rows_mut() {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|x| (x - max).exp());
        let sum: f32 = row.sum();
        if sum > f32::EPSILON {
            row.mapv_inplace(|x| x / sum);
        }
    }
}

/// Reduce the group-query dimension `G` by maximum (the default contract;
/// see Open Question decisions).
pub fn reduce_group_max(scores: ArrayView2<f32>) -> Array1<f32> {
    scores.fold_axis(Axis(0), f32::NEG_INFINITY, |&acc, &x| acc.max(x))
}

/// Select the `s` chunk ids with the largest reduced affinity. Ties broken by
/// lowest chunk index first.
pub fn top_k_chunk_ids(affinity: &Array1<f32>, s: usize) -> Vec<ChunkId> {
    let mut scored: Vec<(ChunkId, f32)> = affinity.iter().copied().enumerate().collect();
    scored.sort_by(|a, b| match b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal) {
        std::cmp::Ordering::Equal => a.0.cmp(&b.0),
        other => other,
    });
    let mut ids: Vec<ChunkId> = scored.into_iter().take(s.min(affinity.len())).map(|(i, _)| i).collect();
    ids.sort_unstable();
    ids
}

/// Map selected chunk ids (indices into the landmark table) to their
/// absolute position ranges, then union with the fixed local-tail, outlier,
/// and sink position sets plus every position generated so far this decode
/// (`prefill_len..prefill_len+generated_len`), deduplicated and sorted
/// ascending by absolute position (§4.5 steps 4 and 7, and the
/// host-read-locality tie-break). The generated-so-far union is what keeps
/// this sparse path's count in lockstep with the dense-fallback path, which
/// reads every resident position unconditionally.
pub fn materialize_positions(
    selected_chunk_ids: &[ChunkId],
    landmark_index_map: &[(Position, Position)],
    local_tail_positions: &[Position],
    outlier_positions: &[Position],
    sink_positions: &[Position],
    generated_positions: std::ops::Range<Position>,
) -> Vec<Position> {
    let mut set: BTreeSet<Position> = BTreeSet::new();
    for &chunk_id in selected_chunk_ids {
        if let Some(&(start, end)) = landmark_index_map.get(chunk_id) {
            set.extend(start..end);
        }
    }
    set.extend(local_tail_positions.iter().copied());
    set.extend(outlier_positions.iter().copied());
    set.extend(sink_positions.iter().copied());
    set.extend(generated_positions);
    set.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn top_k_breaks_ties_by_lowest_index() {
        let affinity = Array1::from(vec![0.5, 0.9, 0.9, 0.1]);
        let ids = top_k_chunk_ids(&affinity, 2);
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn top_k_caps_at_available_chunks() {
        let affinity = Array1::from(vec![0.1, 0.2]);
        let ids = top_k_chunk_ids(&affinity, 10);
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn materialize_positions_dedupes_and_sorts() {
        let map = vec![(0, 8), (8, 16), (16, 24)];
        let positions = materialize_positions(&[2, 0], &map, &[20, 21], &[8, 9], &[], 0..0);
        assert_eq!(
            positions,
            vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 16, 17, 18, 19, 20, 21, 22, 23]
        );
    }

    #[test]
    fn materialize_positions_includes_sink_and_generated_so_far() {
        let map = vec![(8, 16)];
        let positions = materialize_positions(&[0], &map, &[], &[], &[0, 1, 2, 3], 24..27);
        assert_eq!(positions, vec![0, 1, 2, 3, 8, 9, 10, 11, 12, 13, 14, 15, 24, 25, 26]);
    }

    #[test]
    fn group_reduction_is_max_over_group_axis() {
        let scores = arr2(&[[0.1, 0.9], [0.3, 0.2]]);
        let reduced = reduce_group_max(scores.view());
        assert_eq!(reduced, Array1::from(vec![0.3, 0.9]));
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let mut scores = arr2(&[[1.0, 2.0, 3.0]]);
        softmax_rows(&mut scores);
        let sum: f32 = scores.row(0).sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }
}
