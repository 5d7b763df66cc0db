//! DMA scheduler: sequences one decode step's host-to-device value gathers
//! and key reconstructions (§4.5 step 5, §5).
//!
//! Selected positions are deduplicated and reordered ascending before being
//! queued, to maximise host read locality (§4.5 notes, §8 property 6 is the
//! companion stream-ordering test in [`crate::gpu::stream`]).

use std::collections::VecDeque;

use tracing::debug;

use crate::cache::buffers::{ChunkId, Position};

/// Which secondary stream a transfer belongs to (§5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Host-resident value chunk gather.
    Copy,
    /// Fused gather-matmul-RoPE key reconstruction.
    Reconstruction,
}

/// One position's worth of work on a given stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOp {
    pub position: Position,
    pub chunk_id: Option<ChunkId>,
    pub stream: StreamKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DmaStats {
    pub total_scheduled: u64,
    pub total_completed: u64,
    pub total_failed: u64,
}

/// Queue of transfer operations for one decode step, bounded by
/// `max_concurrent` in-flight transfers.
pub struct DmaScheduler {
    queue: VecDeque<TransferOp>,
    max_concurrent: usize,
    in_flight: usize,
    stats: DmaStats,
}

impl DmaScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            max_concurrent,
            in_flight: 0,
            stats: DmaStats::default(),
        }
    }

    /// Build and enqueue a step's transfer plan for one stream: positions
    /// are deduplicated and reordered ascending (§4.5) before queuing.
    pub fn plan_step(
        &mut self,
        positions: &[Position],
        chunk_of: impl Fn(Position) -> Option<ChunkId>,
        stream: StreamKind,
    ) {
        let mut sorted: Vec<Position> = positions.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        debug!(count = sorted.len(), stream = ?stream, "planned transfer step");

        for position in sorted {
            self.queue.push_back(TransferOp {
                position,
                chunk_id: chunk_of(position),
                stream,
            });
            self.stats.total_scheduled += 1;
        }
    }

    /// Dequeue the next transfer if there is spare concurrency.
    pub fn next(&mut self) -> Option<TransferOp> {
        if self.in_flight >= self.max_concurrent {
            return None;
        }
        let op = self.queue.pop_front()?;
        self.in_flight += 1;
        Some(op)
    }

    /// Mark an in-flight transfer as finished.
    pub fn complete(&mut self, success: bool) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if success {
            self.stats.total_completed += 1;
        } else {
            self.stats.total_failed += 1;
        }
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight
    }

    pub fn stats(&self) -> DmaStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_step_dedups_and_sorts_ascending() {
        let mut scheduler = DmaScheduler::new(4);
        scheduler.plan_step(&[40, 8, 8, 24], |p| Some(p / 8), StreamKind::Copy);

        let mut seen = Vec::new();
        while let Some(op) = scheduler.next() {
            seen.push(op.position);
        }
        assert_eq!(seen, vec![8, 24, 40]);
    }

    #[test]
    fn max_concurrent_limits_in_flight_transfers() {
        let mut scheduler = DmaScheduler::new(1);
        scheduler.plan_step(&[0, 8], |p| Some(p / 8), StreamKind::Reconstruction);

        assert!(scheduler.next().is_some());
        assert!(scheduler.next().is_none());

        scheduler.complete(true);
        assert!(scheduler.next().is_some());
        assert_eq!(scheduler.stats().total_completed, 1);
    }

    #[test]
    fn chunk_id_lookup_is_carried_through() {
        let mut scheduler = DmaScheduler::new(4);
        scheduler.plan_step(&[16], |_| None, StreamKind::Copy);
        let op = scheduler.next().unwrap();
        assert_eq!(op.chunk_id, None);
        assert_eq!(op.stream, StreamKind::Copy);
    }
}
