//! Shared shape/position types and the resident (outlier + local-tail +
//! generated) key/value store.
//!
//! The data model's shapes (§3) are logical, not literal: `N_max` bounds the
//! *range* of valid positions, but at any moment a layer only holds outlier,
//! local-tail, and already-generated positions resident — the rest live as
//! `(U, SV)` factors or host-offloaded value chunks. A `BTreeMap` keyed by
//! absolute position models that sparsity directly instead of preallocating
//! a dense `N_max`-length array that is mostly never written.

use std::collections::BTreeMap;

use ndarray::Array1;
use thiserror::Error;

/// Absolute sequence position, `0..N_max`.
pub type Position = usize;

/// Index of a fixed-size chunk of `C` positions.
pub type ChunkId = usize;

#[derive(Error, Debug, PartialEq)]
pub enum ShapeError {
    #[error("expected head dimension {expected}, got {got}")]
    HeadDim { expected: usize, got: usize },

    #[error("expected {expected} rows, got {got}")]
    RowCount { expected: usize, got: usize },

    #[error("batch index {index} out of range (batch size {size})")]
    BatchOutOfRange { index: usize, size: usize },

    #[error("kv-head index {index} out of range ({size} kv heads)")]
    KvHeadOutOfRange { index: usize, size: usize },

    #[error("empty tensor where at least one row was required")]
    EmptyInput,
}

/// One resident position: a raw (post-RoPE) key and raw value, kept verbatim
/// because it is an outlier, a local-tail member, or freshly generated.
#[derive(Debug, Clone)]
pub struct ResidentEntry {
    pub key: Array1<f32>,
    pub value: Array1<f32>,
}

/// Sparse, position-keyed store for outlier / local-tail / generated slices.
///
/// Mutated by outlier copy (prefill), local-tail copy (prefill), and the
/// update path (§4.6) — never by landmark-indexed retrieval, which reads
/// through `cache::offload` and `cache::lowrank` instead.
#[derive(Debug, Clone, Default)]
pub struct ResidentStore {
    entries: BTreeMap<Position, ResidentEntry>,
}

impl ResidentStore {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, position: Position, key: Array1<f32>, value: Array1<f32>) {
        self.entries.insert(position, ResidentEntry { key, value });
    }

    pub fn get(&self, position: Position) -> Option<&ResidentEntry> {
        self.entries.get(&position)
    }

    pub fn contains(&self, position: Position) -> bool {
        self.entries.contains_key(&position)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All resident positions, ascending — the order retrieval always gathers in.
    pub fn positions(&self) -> impl Iterator<Item = Position> + '_ {
        self.entries.keys().copied()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get_roundtrip() {
        let mut store = ResidentStore::new();
        store.insert(5, Array1::from(vec![1.0, 2.0]), Array1::from(vec![3.0, 4.0]));
        let entry = store.get(5).unwrap();
        assert_eq!(entry.key, Array1::from(vec![1.0, 2.0]));
        assert_eq!(entry.value, Array1::from(vec![3.0, 4.0]));
        assert!(!store.contains(6));
    }

    #[test]
    fn positions_are_ascending() {
        let mut store = ResidentStore::new();
        for p in [9, 1, 4, 2] {
            store.insert(p, Array1::zeros(2), Array1::zeros(2));
        }
        let got: Vec<_> = store.positions().collect();
        assert_eq!(got, vec![1, 2, 4, 9]);
    }
}
