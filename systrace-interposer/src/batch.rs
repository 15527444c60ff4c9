//! Per-thread event batching and flush-threshold policy.
//!
//! Replaces `cann_hook.c`'s `pthread_key_create(&thread_data_key,
//! free_thread_data)` with a `thread_local!` whose value's `Drop` impl
//! flushes on thread exit — the Rust-idiomatic equivalent of a pthread
//! key destructor. `LOG_ITEMS_MIN`/`LOG_INTERVAL_SEC` are carried over
//! unchanged (SPEC_FULL.md §4.F).

use std::cell::RefCell;
use std::time::Instant;

use systrace_common::{MemEvent, LOG_INTERVAL_SEC, LOG_ITEMS_MIN};

use crate::writer;

pub struct ThreadBatch {
    events: Vec<MemEvent>,
    last_flush: Instant,
}

impl ThreadBatch {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            last_flush: Instant::now(),
        }
    }

    fn is_due(&self) -> bool {
        !self.events.is_empty()
            && (self.events.len() >= LOG_ITEMS_MIN
                || self.last_flush.elapsed().as_secs() >= LOG_INTERVAL_SEC)
    }
}

/// Flush whatever remains in this thread's batch when the thread exits,
/// matching `free_thread_data()`'s unconditional teardown path.
impl Drop for ThreadBatch {
    fn drop(&mut self) {
        if !self.events.is_empty() {
            let events = std::mem::take(&mut self.events);
            writer::flush_blocking(events);
        }
    }
}

thread_local! {
    static BATCH: RefCell<ThreadBatch> = RefCell::new(ThreadBatch::new());
}

/// Push an event onto this thread's batch and flush it if the size/age
/// threshold is due. The flush itself only ever *tries* the process-wide
/// file lock (`writer::maybe_flush`) — a contended lock defers the batch to
/// the next call rather than blocking the hot path (spec.md §5). The batch
/// is only cleared once the write actually succeeds, so a deferred flush
/// loses nothing; it just retries on the next push past the threshold.
pub fn push(event: MemEvent) {
    BATCH.with(|cell| {
        let mut batch = cell.borrow_mut();
        batch.events.push(event);
        if batch.is_due() && writer::maybe_flush(&batch.events) {
            batch.events.clear();
            batch.last_flush = Instant::now();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_is_not_due_until_item_threshold_or_age_threshold() {
        let mut b = ThreadBatch::new();
        assert!(!b.is_due());
        b.events.push(MemEvent::Free { ptr: 1 });
        assert!(!b.is_due());
        for _ in 1..LOG_ITEMS_MIN {
            b.events.push(MemEvent::Free { ptr: 1 });
        }
        assert!(b.is_due());
    }

    #[test]
    fn age_alone_can_make_a_single_event_due() {
        let mut b = ThreadBatch::new();
        b.events.push(MemEvent::Free { ptr: 1 });
        b.last_flush = Instant::now() - std::time::Duration::from_secs(LOG_INTERVAL_SEC + 1);
        assert!(b.is_due());
    }
}
