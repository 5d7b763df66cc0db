//! Explicit multi-stream scheduling model (§5): the primary attention
//! stream, the copy (value-gather) stream, and the reconstruction
//! (key-rebuild) stream, synchronised only through explicit event
//! record/wait — never implicit ordering (§9 redesign flag).

use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug, PartialEq)]
pub enum StreamError {
    #[error("event '{0}' was waited on for step {1} before being recorded for that step")]
    WaitBeforeRecord(String, u64),
}

/// A point-in-time marker on one stream.
///
/// `wait(step)` only succeeds once `record` has been called with a
/// generation `>= step` — modelling the happens-before edge a real CUDA
/// event would enforce between streams.
#[derive(Debug, Clone)]
pub struct Event {
    label: String,
    recorded_generation: Option<u64>,
}

impl Event {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            recorded_generation: None,
        }
    }

    pub fn record(&mut self, generation: u64) {
        self.recorded_generation = Some(generation);
        trace!(event = %self.label, generation, "stream event recorded");
    }

    pub fn wait(&self, generation: u64) -> Result<(), StreamError> {
        match self.recorded_generation {
            Some(recorded) if recorded >= generation => Ok(()),
            _ => Err(StreamError::WaitBeforeRecord(self.label.clone(), generation)),
        }
    }
}

/// Owns the per-decode-step happens-before edges between the copy stream,
/// the reconstruction stream, and the primary stream's attention barrier.
///
/// One `StreamContext` is shared by all layers of a [`crate::cache::shadow_cache::ShadowKvStack`]
/// for a given sequence, since all layers within one decode step advance
/// through the same copy/reconstruct/barrier choreography.
pub struct StreamContext {
    generation: u64,
    value_stream_done: Event,
    key_stream_done: Event,
}

impl StreamContext {
    pub fn new() -> Self {
        Self {
            generation: 0,
            value_stream_done: Event::new("value-gather"),
            key_stream_done: Event::new("key-reconstruct"),
        }
    }

    /// Begin a new decode step; returns the generation token the copy and
    /// reconstruction streams must record against before the barrier opens.
    pub fn begin_step(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn record_value_stream(&mut self, generation: u64) {
        self.value_stream_done.record(generation);
    }

    pub fn record_key_stream(&mut self, generation: u64) {
        self.key_stream_done.record(generation);
    }

    /// The primary stream's explicit wait before the attention kernel may
    /// read device scratch (§4.5 step 5, §4.7, §9).
    pub fn barrier(&self, generation: u64) -> Result<(), StreamError> {
        self.value_stream_done.wait(generation)?;
        self.key_stream_done.wait(generation)?;
        Ok(())
    }
}

impl Default for StreamContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_succeeds_once_both_streams_record() {
        let mut ctx = StreamContext::new();
        let step = ctx.begin_step();
        ctx.record_value_stream(step);
        ctx.record_key_stream(step);
        assert!(ctx.barrier(step).is_ok());
    }

    #[test]
    fn barrier_rejects_stale_scratch_from_a_delayed_stream() {
        let mut ctx = StreamContext::new();
        let step = ctx.begin_step();
        ctx.record_key_stream(step);
        // Value stream never recorded for this step (simulated delay).
        assert!(ctx.barrier(step).is_err());
    }

    #[test]
    fn barrier_rejects_a_stale_prior_generation() {
        let mut ctx = StreamContext::new();
        let step1 = ctx.begin_step();
        ctx.record_value_stream(step1);
        ctx.record_key_stream(step1);

        let step2 = ctx.begin_step();
        // Neither stream has recorded for step2 yet.
        assert!(ctx.barrier(step2).is_err());
    }
}
