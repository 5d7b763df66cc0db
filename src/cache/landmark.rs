//! Landmark builder (§4.1): chunk-mean summaries of the pre-RoPE key tensor.

use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::cache::buffers::{ChunkId, Position};

/// `[start, end)` absolute-position range of one chunk.
pub type ChunkRange = (Position, Position);

/// Divide `[0, prefill_len)` into `ceil(prefill_len / chunk_size)` chunks of
/// `chunk_size` positions; the final chunk may be short.
pub fn chunk_ranges(prefill_len: usize, chunk_size: usize) -> Vec<ChunkRange> {
    assert!(chunk_size > 0, "chunk_size must be positive");
    let mut ranges = Vec::with_capacity(prefill_len.div_ceil(chunk_size));
    let mut start = 0;
    while start < prefill_len {
        let end = (start + chunk_size).min(prefill_len);
        ranges.push((start, end));
        start = end;
    }
    ranges
}

/// Split chunk ranges into (candidate, local_tail), where `local_tail` is the
/// last `min(local_chunk, chunks.len())` chunks, always kept resident.
pub fn split_local_tail(chunks: &[ChunkRange], local_chunk: usize) -> (&[ChunkRange], &[ChunkRange]) {
    let tail_count = local_chunk.min(chunks.len());
    let split_at = chunks.len() - tail_count;
    chunks.split_at(split_at)
}

/// Arithmetic mean of each chunk's member keys, unreduced and pre-rotation.
///
/// `keys_pre_rope` is `[N, D]` for one `(batch, kv_head)`. Returns `[M, D]`
/// where `M == chunks.len()`.
pub fn build_landmarks(keys_pre_rope: ArrayView2<f32>, chunks: &[ChunkRange]) -> Array2<f32> {
    let d = keys_pre_rope.ncols();
    let mut landmarks = Array2::<f32>::zeros((chunks.len(), d));
    for (row, &(start, end)) in chunks.iter().enumerate() {
        let slice = keys_pre_rope.slice(ndarray::s![start..end, ..]);
        let count = (end - start) as f32;
        let mean: Array1<f32> = slice.sum_axis(Axis(0)) / count;
        landmarks.row_mut(row).assign(&mean);
    }
    landmarks
}

/// Map a candidate chunk's index (within the `candidate` slice passed to
/// [`build_landmarks`]) back to its absolute chunk id among *all* chunks.
pub fn candidate_chunk_id(candidate_index: usize) -> ChunkId {
    candidate_index
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn chunk_ranges_handles_remainder() {
        let ranges = chunk_ranges(10, 4);
        assert_eq!(ranges, vec![(0, 4), (4, 8), (8, 10)]);
    }

    #[test]
    fn split_local_tail_takes_last_chunks() {
        let chunks = chunk_ranges(32, 8); // 4 chunks
        let (candidate, tail) = split_local_tail(&chunks, 1);
        assert_eq!(candidate.len(), 3);
        assert_eq!(tail, &[(24, 32)]);
    }

    #[test]
    fn split_local_tail_saturates_when_fewer_chunks_than_tail() {
        let chunks = chunk_ranges(16, 8); // 2 chunks
        let (candidate, tail) = split_local_tail(&chunks, 4);
        assert!(candidate.is_empty());
        assert_eq!(tail.len(), 2);
    }

    #[test]
    fn landmark_is_chunk_mean() {
        let keys = arr2(&[[1.0, 1.0], [3.0, 3.0], [5.0, 5.0], [7.0, 7.0]]);
        let chunks = chunk_ranges(4, 2);
        let landmarks = build_landmarks(keys.view(), &chunks);
        assert_eq!(landmarks, arr2(&[[2.0, 2.0], [6.0, 6.0]]));
    }
}
