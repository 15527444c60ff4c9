//! Component D (engine half) — the call/return/GC state machine the
//! Interpreter Profiler drives. Kept free of any `pyo3`/CPython dependency
//! so it can be built and exercised without an embedded interpreter;
//! `systrace-pyhook` is a thin adapter translating `PyEval_SetProfile`
//! events into calls on this engine.
//!
//! Cursor discipline: a call claims and writes the segment slot at the
//! current cursor, then advances the cursor; if that advance fills the
//! segment, it is handed to the ready pool immediately and a fresh one
//! drawn, so a run of calls with no matching returns still fills and hands
//! off segments exactly at the fill boundary (512 calls -> one handoff, not
//! 513) per spec.md §8. The paired return locates that same entry directly
//! via `TagState`'s last-entry pointer (stable even if the segment has
//! since been parked) and fills in `end_us`/`count`. A return with no
//! preceding call for this tag is a no-op — there is no entry yet to
//! finalize, which is how the `start_us == 0` mispaired-entry case arises.

use std::sync::Mutex;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use systrace_common::{MAX_STACK_DEPTH, PayloadKind, StageType, GC_TAG};

use crate::stage::StageCounter;
use crate::tag::TagRegistry;

pub struct Profiler {
    registry: Arc<TagRegistry>,
    stage_counter: StageCounter,
    /// Single mutex serializing all producer-side state transitions across
    /// every tag — coarse but adequate because the hot path is very short
    /// (spec.md §5).
    global_mutex: Mutex<()>,
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

impl Profiler {
    pub fn new(registry: TagRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            stage_counter: StageCounter::new(),
            global_mutex: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &TagRegistry {
        &self.registry
    }

    /// A second owning handle to the same tag registry, so the Dump
    /// Controller's background thread can walk it independently of the
    /// profiler's own lifetime.
    pub fn registry_arc(&self) -> Arc<TagRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn stage_counter(&self) -> &StageCounter {
        &self.stage_counter
    }

    pub fn on_call(&self, tag: u32, frames: &[String]) {
        let _guard = self.global_mutex.lock().expect("profiler mutex poisoned");
        let func = self.registry.function(tag);
        let state = self.registry.state(tag);
        let mut seg = state.current.lock().expect("segment mutex poisoned");
        let idx = seg.cursor;
        seg.entries[idx] = systrace_common::TraceEntry::zeroed();
        {
            let entry = &mut seg.entries[idx];
            entry.start_us = now_us();
            if func.stage_type == StageType::Dataloader {
                self.stage_counter.advance();
            }
            entry.stage_id = self.stage_counter.current_stage_id();
            entry.stage_type = func.stage_type.as_u32();
            self.stage_counter.set_current_stage_type(func.stage_type);

            let depth = frames.len().min(MAX_STACK_DEPTH);
            for (i, frame) in frames.iter().take(depth).enumerate() {
                entry.push_frame(i, frame);
            }
            entry.stack_depth = depth as u8;
        }
        state.set_last_entry(std::ptr::addr_of_mut!(seg.entries[idx]));
        seg.cursor += 1;

        // Hand the segment off as soon as it fills, not lazily on the next
        // call — see the module docs above. `set_last_entry` above already
        // points at this entry's stable heap address, so the paired return
        // still finds it even if it is now sitting in the ready pool.
        if seg.is_full() {
            let full = std::mem::replace(&mut *seg, state.pool.draw_empty());
            state.pool.park_ready(full);
        }
    }

    pub fn on_return(&self, tag: u32) {
        let _guard = self.global_mutex.lock().expect("profiler mutex poisoned");
        let state = self.registry.state(tag);
        let now = now_us();
        let count = state.next_count();
        state.with_last_entry(|entry| {
            entry.end_us = now;
            entry.count = count;
        });
    }

    /// GC is driven by the interpreter's `gc.callbacks` convention
    /// (`phase ∈ {"start", "stop"}`) rather than call/return, but shares the
    /// same slot-claiming machinery via the reserved `GC_TAG`.
    pub fn on_gc_start(&self) {
        self.on_call(GC_TAG, &[]);
    }

    pub fn on_gc_stop(&self, collected: Option<i32>, uncollectable: Option<i32>) {
        let _guard = self.global_mutex.lock().expect("profiler mutex poisoned");
        let state = self.registry.state(GC_TAG);
        let now = now_us();
        let count = state.next_count();
        state.with_last_entry(|entry| {
            entry.end_us = now;
            entry.count = count;
            entry.payload_kind = PayloadKind::Gc as u32;
            entry.gc_collected = collected.unwrap_or(-1);
            entry.gc_uncollectable = uncollectable.unwrap_or(-1);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use systrace_common::PY_TRACING_BUFFER_SIZE;

    fn profiler_with(selectors: &[&str]) -> Profiler {
        let mut reg = TagRegistry::new();
        for s in selectors {
            reg.register(s);
        }
        Profiler::new(reg)
    }

    #[test]
    fn call_then_return_finalizes_the_same_entry() {
        let p = profiler_with(&["torch@autograd@backward"]);
        let tag = p.registry().tag_of("torch@autograd@backward").unwrap();
        p.on_call(tag, &["backward@train.py:10"]);
        p.on_return(tag);

        let state = p.registry().state(tag);
        let seg = state.current.lock().unwrap();
        let entry = &seg.entries[0];
        assert!(entry.start_us != 0);
        assert!(entry.end_us != 0);
        assert!(entry.end_us >= entry.start_us);
        assert_eq!(entry.count, 0);
    }

    #[test]
    fn per_function_count_is_strictly_monotone() {
        let p = profiler_with(&["torch@autograd@backward"]);
        let tag = p.registry().tag_of("torch@autograd@backward").unwrap();
        for _ in 0..5 {
            p.on_call(tag, &[]);
            p.on_return(tag);
        }
        let state = p.registry().state(tag);
        let seg = state.current.lock().unwrap();
        let counts: Vec<u32> = (0..5).map(|i| seg.entries[i].count).collect();
        assert_eq!(counts, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn dataloader_advances_stage_counter_by_exactly_one_per_call() {
        let p = profiler_with(&["torch.utils.data.dataloader@_BaseDataLoaderIter@__next__"]);
        let tag = p
            .registry()
            .tag_of("torch.utils.data.dataloader@_BaseDataLoaderIter@__next__")
            .unwrap();
        for expected in 1..=4u32 {
            p.on_call(tag, &[]);
            assert_eq!(p.stage_counter().current_stage_id(), expected);
            p.on_return(tag);
        }
    }

    #[test]
    fn mispaired_return_with_no_call_marks_entry_undumpable() {
        let p = profiler_with(&["torch@autograd@backward"]);
        let tag = p.registry().tag_of("torch@autograd@backward").unwrap();
        p.on_return(tag);
        let state = p.registry().state(tag);
        let seg = state.current.lock().unwrap();
        assert!(!seg.entries[0].is_dumpable());
    }

    #[test]
    fn overflow_calls_with_no_returns_hand_off_exactly_one_segment() {
        let p = profiler_with(&["torch@autograd@backward"]);
        let tag = p.registry().tag_of("torch@autograd@backward").unwrap();
        for _ in 0..PY_TRACING_BUFFER_SIZE {
            p.on_call(tag, &[]);
        }
        let state = p.registry().state(tag);
        assert!(state.pool.take_ready().is_some());
        assert!(state.pool.take_ready().is_none());
        let seg = state.current.lock().unwrap();
        assert_eq!(seg.cursor, 0);
    }

    #[test]
    fn thousand_twenty_four_pairs_produce_two_ready_segments_and_empty_third() {
        let p = profiler_with(&["torch@autograd@backward"]);
        let tag = p.registry().tag_of("torch@autograd@backward").unwrap();
        for _ in 0..(2 * PY_TRACING_BUFFER_SIZE) {
            p.on_call(tag, &[]);
            p.on_return(tag);
        }
        let state = p.registry().state(tag);
        let mut ready_count = 0;
        while let Some(seg) = state.pool.take_ready() {
            assert_eq!(seg.cursor, PY_TRACING_BUFFER_SIZE);
            ready_count += 1;
        }
        assert_eq!(ready_count, 2);
        let seg = state.current.lock().unwrap();
        assert_eq!(seg.cursor, 0);
    }

    #[test]
    fn gc_stop_records_payload() {
        let p = profiler_with(&[]);
        p.on_gc_start();
        p.on_gc_stop(Some(7), Some(2));
        let state = p.registry().state(GC_TAG);
        let seg = state.current.lock().unwrap();
        let entry = &seg.entries[0];
        assert_eq!(entry.gc_collected, 7);
        assert_eq!(entry.gc_uncollectable, 2);
        assert_eq!(entry.payload_kind, PayloadKind::Gc as u32);
    }

    #[test]
    fn stack_depth_beyond_32_is_truncated() {
        let p = profiler_with(&["torch@autograd@backward"]);
        let tag = p.registry().tag_of("torch@autograd@backward").unwrap();
        let frames: Vec<String> = (0..40).map(|i| format!("frame{i}@f.py:{i}")).collect();
        p.on_call(tag, &frames);
        let state = p.registry().state(tag);
        let seg = state.current.lock().unwrap();
        assert_eq!(seg.entries[0].stack_depth as usize, MAX_STACK_DEPTH);
    }
}
