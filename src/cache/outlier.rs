//! Outlier detector (§4.2): chunks whose landmark poorly represents their
//! members are pinned resident and bypass landmark-based retrieval.

use ndarray::{ArrayView1, ArrayView2};

use crate::cache::landmark::ChunkRange;

/// Cosine similarity between two vectors. Returns `0.0` for a zero vector
/// rather than `NaN`, since a chunk of all-zero keys has no meaningful
/// direction to compare.
pub fn cosine_similarity(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    let dot: f32 = a.dot(&b);
    let norm_a = a.dot(&a).sqrt();
    let norm_b = b.dot(&b).sqrt();
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Minimum cosine similarity between a chunk's landmark and each of its
/// member keys.
pub fn chunk_min_similarity(
    keys_pre_rope: ArrayView2<f32>,
    range: ChunkRange,
    landmark: ArrayView1<f32>,
) -> f32 {
    let (start, end) = range;
    keys_pre_rope
        .slice(ndarray::s![start..end, ..])
        .outer_iter()
        .map(|member| cosine_similarity(member, landmark))
        .fold(f32::INFINITY, f32::min)
}

/// Select the `k_outlier` candidate chunks with the smallest minimum
/// similarity. Ties are broken by lowest chunk index first (stable sort on
/// the already chunk-ordered input).
///
/// Returns indices into `candidate` (not absolute chunk ids).
pub fn select_outliers(
    keys_pre_rope: ArrayView2<f32>,
    candidate: &[ChunkRange],
    landmarks: ArrayView2<f32>,
    k_outlier: usize,
) -> Vec<usize> {
    let mut scored: Vec<(usize, f32)> = candidate
        .iter()
        .enumerate()
        .map(|(i, &range)| {
            let min_sim = chunk_min_similarity(keys_pre_rope, range, landmarks.row(i));
            (i, min_sim)
        })
        .collect();

    // Stable sort by similarity ascending; ties keep ascending index order
    // because the input is already index-ordered and the sort is stable.
    scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut outlier_indices: Vec<usize> = scored
        .into_iter()
        .take(k_outlier.min(candidate.len()))
        .map(|(i, _)| i)
        .collect();
    outlier_indices.sort_unstable();
    outlier_indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::landmark::{build_landmarks, chunk_ranges};
    use ndarray::arr2;

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let a = ndarray::arr1(&[1.0, 2.0, 3.0]);
        assert!((cosine_similarity(a.view(), a.view()) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_zero_vector_is_zero() {
        let a = ndarray::arr1(&[0.0, 0.0]);
        let b = ndarray::arr1(&[1.0, 1.0]);
        assert_eq!(cosine_similarity(a.view(), b.view()), 0.0);
    }

    #[test]
    fn select_outliers_picks_smallest_minima() {
        // Chunk 0: uniform keys (high self-similarity). Chunk 1: one key
        // pointing the opposite way (low min similarity) -> should be picked.
        let keys = arr2(&[
            [1.0, 0.0],
            [1.0, 0.0],
            [1.0, 0.0],
            [-1.0, 0.0],
        ]);
        let chunks = chunk_ranges(4, 2);
        let landmarks = build_landmarks(keys.view(), &chunks);
        let outliers = select_outliers(keys.view(), &chunks, landmarks.view(), 1);
        assert_eq!(outliers, vec![1]);
    }

    #[test]
    fn select_outliers_caps_at_candidate_len() {
        let keys = arr2(&[[1.0, 0.0], [1.0, 0.0]]);
        let chunks = chunk_ranges(2, 2);
        let landmarks = build_landmarks(keys.view(), &chunks);
        let outliers = select_outliers(keys.view(), &chunks, landmarks.view(), 48);
        assert_eq!(outliers.len(), 1);
    }
}
