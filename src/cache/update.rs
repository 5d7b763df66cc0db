//! Update path (§4.6): append newly generated positions to the resident tail.

use ndarray::ArrayView1;
use thiserror::Error;

use crate::cache::buffers::ResidentStore;

#[derive(Error, Debug, PartialEq)]
pub enum UpdateError {
    #[error("append would advance past max_length: offset {offset} + delta {delta} > {max_length}")]
    WouldExceedMaxLength {
        offset: usize,
        delta: usize,
        max_length: usize,
    },
}

/// Append `k_new`/`v_new` (one row each, `δ = 1` during decode) at
/// `prefill_len + generated_len`, returning the new `generated_len`.
///
/// Appending with `δ = 0` is a no-op and is the only idempotent case, per
/// §4.6.
pub fn append(
    store: &mut ResidentStore,
    prefill_len: usize,
    generated_len: usize,
    max_length: usize,
    k_new: ArrayView1<f32>,
    v_new: ArrayView1<f32>,
) -> Result<usize, UpdateError> {
    let offset = prefill_len + generated_len;
    if offset >= max_length {
        return Err(UpdateError::WouldExceedMaxLength {
            offset,
            delta: 1,
            max_length,
        });
    }
    store.insert(offset, k_new.to_owned(), v_new.to_owned());
    Ok(generated_len + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn append_advances_generated_len() {
        let mut store = ResidentStore::new();
        let gen = append(&mut store, 100, 0, 256, arr1(&[1.0]).view(), arr1(&[2.0]).view()).unwrap();
        assert_eq!(gen, 1);
        assert!(store.contains(100));
    }

    #[test]
    fn append_at_boundary_succeeds_then_next_fails() {
        let mut store = ResidentStore::new();
        let gen = append(&mut store, 255, 0, 256, arr1(&[1.0]).view(), arr1(&[1.0]).view()).unwrap();
        assert_eq!(gen, 1);

        let err = append(&mut store, 255, gen, 256, arr1(&[1.0]).view(), arr1(&[1.0]).view());
        assert!(err.is_err());
    }
}
