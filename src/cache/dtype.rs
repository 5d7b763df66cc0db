//! Storage precision policy for factor tables and resident buffers.
//!
//! Factorization itself always runs in `f32` (§4.3 numeric policy); only the
//! values actually held in the cache's tables are subject to down-casting.

use half::{bf16, f16};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Storage precision for landmark, factor, and resident tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDtype {
    F32,
    F16,
    Bf16,
}

impl StorageDtype {
    /// Size of one stored element in bytes.
    pub fn element_size(self) -> usize {
        match self {
            StorageDtype::F32 => 4,
            StorageDtype::F16 | StorageDtype::Bf16 => 2,
        }
    }

    /// Round-trip a row through this dtype's precision, as the factor tables do
    /// when a `f32` SVD result is committed to storage.
    pub fn cast_roundtrip(self, row: &Array1<f32>) -> Array1<f32> {
        match self {
            StorageDtype::F32 => row.clone(),
            StorageDtype::F16 => row.mapv(|x| f16::from_f32(x).to_f32()),
            StorageDtype::Bf16 => row.mapv(|x| bf16::from_f32(x).to_f32()),
        }
    }
}

impl Default for StorageDtype {
    fn default() -> Self {
        StorageDtype::F16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_roundtrip_is_exact() {
        let row = Array1::from(vec![1.0, -2.5, 3.25]);
        let got = StorageDtype::F32.cast_roundtrip(&row);
        assert_eq!(row, got);
    }

    #[test]
    fn f16_roundtrip_loses_precision_but_stays_close() {
        let row = Array1::from(vec![1.0 / 3.0]);
        let got = StorageDtype::F16.cast_roundtrip(&row);
        assert!((got[0] - row[0]).abs() < 1e-3);
    }

    #[test]
    fn element_sizes() {
        assert_eq!(StorageDtype::F32.element_size(), 4);
        assert_eq!(StorageDtype::F16.element_size(), 2);
        assert_eq!(StorageDtype::Bf16.element_size(), 2);
    }
}
