//! Value offload store (§4.4): pinned-host storage for non-outlier,
//! non-local-tail value chunks, gathered into device scratch on demand.
//!
//! This crate models "pinned host memory" as an ordinary `Vec<f32>` per
//! chunk — the distinction from a plain heap allocation is a real CUDA
//! build's concern (`cudaHostAlloc`) handled by [`crate::gpu::allocator`],
//! not this module's.

use ndarray::{Array2, ArrayView2, Axis};
use thiserror::Error;

use crate::cache::buffers::ChunkId;

#[derive(Error, Debug, PartialEq)]
pub enum OffloadError {
    #[error("chunk {0} was never stored")]
    ChunkNotFound(ChunkId),

    #[error("expected chunk width {expected}, got {got}")]
    WidthMismatch { expected: usize, got: usize },
}

/// Host-resident store for value chunks, laid out contiguously per
/// `(layer, batch, kv_head, chunk_id)` — one [`ValueOffloadStore`] instance
/// per `(layer, batch, kv_head)`, a contiguous `[C, D]` block per chunk.
#[derive(Debug, Clone)]
pub struct ValueOffloadStore {
    head_dim: usize,
    chunks: std::collections::BTreeMap<ChunkId, Array2<f32>>,
}

impl ValueOffloadStore {
    pub fn new(head_dim: usize) -> Self {
        Self {
            head_dim,
            chunks: std::collections::BTreeMap::new(),
        }
    }

    /// Store one chunk's `[chunk_size, D]` value rows.
    pub fn store(&mut self, chunk_id: ChunkId, values: ArrayView2<f32>) -> Result<(), OffloadError> {
        if values.ncols() != self.head_dim {
            return Err(OffloadError::WidthMismatch {
                expected: self.head_dim,
                got: values.ncols(),
            });
        }
        self.chunks.insert(chunk_id, values.to_owned());
        Ok(())
    }

    /// Gather the requested chunks, concatenated in the given order (the
    /// retrieval engine is responsible for ascending-position ordering per
    /// §4.5's host-read-locality tie-break).
    pub fn gather(&self, chunk_ids: &[ChunkId]) -> Result<Array2<f32>, OffloadError> {
        let rows: Result<Vec<ArrayView2<f32>>, OffloadError> = chunk_ids
            .iter()
            .map(|id| {
                self.chunks
                    .get(id)
                    .map(|a| a.view())
                    .ok_or(OffloadError::ChunkNotFound(*id))
            })
            .collect();
        let rows = rows?;
        if rows.is_empty() {
            return Ok(Array2::zeros((0, self.head_dim)));
        }
        ndarray::concatenate(Axis(0), &rows).map_err(|_| OffloadError::WidthMismatch {
            expected: self.head_dim,
            got: 0,
        })
    }

    pub fn contains(&self, chunk_id: ChunkId) -> bool {
        self.chunks.contains_key(&chunk_id)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn store_and_gather_preserves_order() {
        let mut store = ValueOffloadStore::new(2);
        store.store(3, arr2(&[[3.0, 3.0]]).view()).unwrap();
        store.store(1, arr2(&[[1.0, 1.0]]).view()).unwrap();
        store.store(2, arr2(&[[2.0, 2.0]]).view()).unwrap();

        let gathered = store.gather(&[1, 2, 3]).unwrap();
        assert_eq!(gathered, arr2(&[[1.0, 1.0], [2.0, 2.0], [3.0, 3.0]]));
    }

    #[test]
    fn gather_missing_chunk_errors() {
        let store = ValueOffloadStore::new(2);
        assert_eq!(store.gather(&[5]), Err(OffloadError::ChunkNotFound(5)));
    }

    #[test]
    fn width_mismatch_is_rejected() {
        let mut store = ValueOffloadStore::new(4);
        let err = store.store(0, arr2(&[[1.0, 2.0]]).view()).unwrap_err();
        assert_eq!(err, OffloadError::WidthMismatch { expected: 4, got: 2 });
    }
}
