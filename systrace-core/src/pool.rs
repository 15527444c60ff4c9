//! Component C — Buffer Pool.
//!
//! Two mutex-guarded FIFOs per tracked function: an empty pool (reusable
//! segments) and a ready pool (segments awaiting drain). Grounded in the
//! producer/consumer handoff discipline of `SequencerConsumer`, adapted
//! from a single lock-free SPSC ring to a plain mutex-guarded pair because
//! the Buffer Pool's access pattern is one operation per tracked call, not
//! the per-CPU-core hot path the eBPF sequencer serves.

use std::collections::VecDeque;
use std::sync::Mutex;

use systrace_common::TraceSegment;

/// Per-tag pool of recycled [`TraceSegment`]s. `draw_empty` never blocks —
/// it allocates a fresh segment when the empty pool itself is empty, so
/// capture pressure grows memory rather than dropping events.
pub struct PoolPair {
    empty: Mutex<VecDeque<Box<TraceSegment>>>,
    ready: Mutex<VecDeque<Box<TraceSegment>>>,
}

impl PoolPair {
    pub fn new() -> Self {
        Self {
            empty: Mutex::new(VecDeque::new()),
            ready: Mutex::new(VecDeque::new()),
        }
    }

    /// Never blocks; allocates a fresh zeroed segment if none are recycled.
    pub fn draw_empty(&self) -> Box<TraceSegment> {
        let mut empty = self.empty.lock().expect("pool mutex poisoned");
        empty.pop_front().unwrap_or_else(TraceSegment::new)
    }

    pub fn park_ready(&self, seg: Box<TraceSegment>) {
        debug_assert!(seg.is_full(), "only full segments are parked ready");
        self.ready.lock().expect("pool mutex poisoned").push_back(seg);
    }

    pub fn take_ready(&self) -> Option<Box<TraceSegment>> {
        self.ready.lock().expect("pool mutex poisoned").pop_front()
    }

    /// Number of full segments currently parked, without draining them.
    pub fn ready_len(&self) -> usize {
        self.ready.lock().expect("pool mutex poisoned").len()
    }

    pub fn return_empty(&self, mut seg: Box<TraceSegment>) {
        seg.recycle();
        self.empty.lock().expect("pool mutex poisoned").push_back(seg);
    }

    /// Drain every ready segment, in FIFO order, recycling each back to the
    /// empty pool via `on_each`. Used by the Dump Controller's per-tag fold.
    pub fn drain_ready(&self, mut on_each: impl FnMut(&TraceSegment)) {
        loop {
            let Some(seg) = self.take_ready() else { break };
            on_each(&seg);
            self.return_empty(seg);
        }
    }
}

impl Default for PoolPair {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use systrace_common::PY_TRACING_BUFFER_SIZE;

    #[test]
    fn draw_empty_never_blocks_and_allocates_on_demand() {
        let pool = PoolPair::new();
        let seg = pool.draw_empty();
        assert_eq!(seg.cursor, 0);
    }

    #[test]
    fn full_segment_round_trips_through_ready_and_back_to_empty() {
        let pool = PoolPair::new();
        let mut seg = pool.draw_empty();
        seg.cursor = PY_TRACING_BUFFER_SIZE;
        pool.park_ready(seg);

        let mut drained = 0;
        pool.drain_ready(|s| {
            assert_eq!(s.cursor, PY_TRACING_BUFFER_SIZE);
            drained += 1;
        });
        assert_eq!(drained, 1);

        // Segment conservation: it is now back in the empty pool with
        // cursor reset to 0.
        let recycled = pool.draw_empty();
        assert_eq!(recycled.cursor, 0);
    }

    #[test]
    fn drain_is_fifo_and_conserves_total_segment_count() {
        let pool = PoolPair::new();
        for _ in 0..3 {
            let mut seg = pool.draw_empty();
            seg.cursor = PY_TRACING_BUFFER_SIZE;
            pool.park_ready(seg);
        }
        let mut count = 0;
        pool.drain_ready(|_| count += 1);
        assert_eq!(count, 3);
        assert!(pool.take_ready().is_none());
    }
}
