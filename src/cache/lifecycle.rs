//! Lifecycle / admission control (§4.7): the
//! `UNINITIALISED → PREFILLING → READY → DECODING → READY → … → CLEARED`
//! state machine.

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum LifecycleError {
    #[error("prefill called while cache is {0:?}, expected Uninitialised")]
    PrefillOutOfOrder(CacheState),

    #[error("decode requested while cache is {0:?}; prefill must complete first")]
    DecodeBeforePrefill(CacheState),

    #[error("operation invalid in state {0:?}")]
    InvalidState(CacheState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Uninitialised,
    Prefilling,
    Ready,
    Decoding,
    Cleared,
}

impl Default for CacheState {
    fn default() -> Self {
        CacheState::Uninitialised
    }
}

/// The lifecycle state machine, owned by each [`crate::cache::shadow_cache::ShadowKvCache`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Lifecycle {
    state: CacheState,
}

impl Lifecycle {
    pub fn state(&self) -> CacheState {
        self.state
    }

    pub fn begin_prefill(&mut self) -> Result<(), LifecycleError> {
        match self.state {
            CacheState::Uninitialised | CacheState::Cleared => {
                self.state = CacheState::Prefilling;
                Ok(())
            }
            other => Err(LifecycleError::PrefillOutOfOrder(other)),
        }
    }

    pub fn finish_prefill(&mut self) -> Result<(), LifecycleError> {
        match self.state {
            CacheState::Prefilling => {
                self.state = CacheState::Ready;
                Ok(())
            }
            other => Err(LifecycleError::InvalidState(other)),
        }
    }

    pub fn begin_decode(&mut self) -> Result<(), LifecycleError> {
        match self.state {
            CacheState::Ready => {
                self.state = CacheState::Decoding;
                Ok(())
            }
            other @ (CacheState::Uninitialised | CacheState::Prefilling) => {
                Err(LifecycleError::DecodeBeforePrefill(other))
            }
            other => Err(LifecycleError::InvalidState(other)),
        }
    }

    pub fn finish_decode(&mut self) -> Result<(), LifecycleError> {
        match self.state {
            CacheState::Decoding => {
                self.state = CacheState::Ready;
                Ok(())
            }
            other => Err(LifecycleError::InvalidState(other)),
        }
    }

    /// Returns to `Uninitialised`; buffer allocations are untouched by this
    /// transition (the caller decides whether to also clear storage).
    pub fn clear(&mut self) {
        self.state = CacheState::Uninitialised;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut lc = Lifecycle::default();
        lc.begin_prefill().unwrap();
        lc.finish_prefill().unwrap();
        lc.begin_decode().unwrap();
        lc.finish_decode().unwrap();
        assert_eq!(lc.state(), CacheState::Ready);
    }

    #[test]
    fn decode_before_prefill_is_rejected() {
        let mut lc = Lifecycle::default();
        let err = lc.begin_decode().unwrap_err();
        assert_eq!(err, LifecycleError::DecodeBeforePrefill(CacheState::Uninitialised));
    }

    #[test]
    fn prefill_twice_is_rejected() {
        let mut lc = Lifecycle::default();
        lc.begin_prefill().unwrap();
        lc.finish_prefill().unwrap();
        let err = lc.begin_prefill().unwrap_err();
        assert_eq!(err, LifecycleError::PrefillOutOfOrder(CacheState::Ready));
    }

    #[test]
    fn clear_returns_to_uninitialised_from_any_state() {
        let mut lc = Lifecycle::default();
        lc.begin_prefill().unwrap();
        lc.clear();
        assert_eq!(lc.state(), CacheState::Uninitialised);
        // And prefill can start again.
        lc.begin_prefill().unwrap();
    }
}
