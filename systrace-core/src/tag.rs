//! Tracked-function registry shared between the Interpreter Profiler (D)
//! and the Dump Controller (I): one [`TagState`] (pool + producer's current
//! segment + per-function sequence counter) per densely-assigned tag, with
//! `GC` always at reserved tag 0.

use std::collections::HashMap;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::Mutex;

use systrace_common::{StageType, TraceEntry, TraceSegment, TrackedFunction};

use crate::pool::PoolPair;

pub struct TagState {
    pub pool: PoolPair,
    pub current: Mutex<Box<TraceSegment>>,
    pub per_function_count: AtomicU32,
    /// Raw pointer to the entry the most recent call wrote. A segment is a
    /// heap-allocated `Box` whose address does not move when the `Box`
    /// itself is handed off between `current` and the pool's FIFOs, so this
    /// stays valid even if the call's segment fills and is parked to the
    /// ready pool before the paired return arrives (the back-to-back-calls
    /// overflow case in spec.md §8). Null until the first call.
    last_entry: AtomicPtr<TraceEntry>,
}

impl TagState {
    fn new() -> Self {
        Self {
            pool: PoolPair::new(),
            current: Mutex::new(TraceSegment::new()),
            per_function_count: AtomicU32::new(0),
            last_entry: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Record the entry the most recent call wrote into, for the paired
    /// return to finalize directly regardless of which segment it ends up
    /// parked in by the time the return arrives.
    pub(crate) fn set_last_entry(&self, entry: *mut TraceEntry) {
        self.last_entry.store(entry, Ordering::SeqCst);
    }

    /// Apply `f` to the entry the most recent call wrote, if any call has
    /// happened yet on this tag.
    ///
    /// # Safety
    /// Valid as long as no segment has been dropped since the call that
    /// produced this pointer — segments are only ever recycled (zeroed and
    /// requeued), never freed, for the lifetime of the tag registry.
    pub(crate) fn with_last_entry(&self, f: impl FnOnce(&mut TraceEntry)) {
        let ptr = self.last_entry.load(Ordering::SeqCst);
        if let Some(entry) = unsafe { ptr.as_mut() } {
            f(entry);
        }
    }

    pub fn next_count(&self) -> u32 {
        self.per_function_count.fetch_add(1, Ordering::SeqCst)
    }

    /// Atomically swap out whatever segment is currently being written to
    /// (full or not) for a fresh one drawn from the pool, per spec.md
    /// §4.I's dump step ("take the tag's current partial segment, if any,
    /// via an atomic swap that installs a fresh one"). Guarded by the same
    /// mutex `on_call` takes to install a fresh segment on overflow, so a
    /// dump can never observe a half-written entry mid-swap — only ever a
    /// complete entry whose paired return may or may not have landed yet,
    /// the same tolerated race the ready-pool handoff already accepts.
    pub fn take_current(&self) -> Box<TraceSegment> {
        let mut guard = self.current.lock().expect("segment mutex poisoned");
        std::mem::replace(&mut *guard, self.pool.draw_empty())
    }
}

/// Write-once-then-read-only map from selector to tag. Because all
/// insertions happen during the single registration pass, reads after
/// registration need no lock — the same translation spec.md §9 calls for
/// ("mutex-guarded hash table reads... because the map is write-once").
pub struct TagRegistry {
    functions: Vec<TrackedFunction>,
    states: Vec<TagState>,
    by_selector: HashMap<String, u32>,
}

impl TagRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            functions: Vec::new(),
            states: Vec::new(),
            by_selector: HashMap::new(),
        };
        let gc_tag = reg.register("GC");
        debug_assert_eq!(gc_tag, systrace_common::GC_TAG);
        reg
    }

    /// Resolve a selector to its tag, registering it if this is the first
    /// time it's seen. Idempotent: registering the same selector twice
    /// returns the same tag and leaves exactly one entry.
    pub fn register(&mut self, selector: &str) -> u32 {
        if let Some(&tag) = self.by_selector.get(selector) {
            return tag;
        }
        let tag = self.functions.len() as u32;
        let stage_type = if selector == "GC" {
            StageType::Gc
        } else {
            StageType::classify(selector)
        };
        self.functions.push(TrackedFunction {
            tag,
            selector: selector.to_string(),
            stage_type,
            is_native: false,
        });
        self.states.push(TagState::new());
        self.by_selector.insert(selector.to_string(), tag);
        tag
    }

    /// Register the extra selectors from `SYSTRACE_HOST_TRACING_FUNC` plus
    /// the literal default set from SPEC_FULL.md §4.D, in order, after `GC`.
    pub fn register_defaults(&mut self, extra_selectors: &[String]) {
        const DEFAULTS: &[&str] = &[
            "torch.utils.data.dataloader@_BaseDataLoaderIter@__next__",
            "torch_npu@npu@synchronize",
            "torch_npu.npu@Event@synchronize",
            "torch_npu.npu@Event@wait",
            "torch_npu.npu@Stream@synchronize",
            "torch_npu.npu@Stream@wait_event",
            "torch_npu.npu@Stream@wait_stream",
            "torch@autograd@backward",
            "torch@autograd@grad",
            "megatron.core.pipeline_parallel@schedules@forward_step",
            "megatron.core.pipeline_parallel@schedules@backward_step",
        ];
        for selector in DEFAULTS {
            self.register(selector);
        }
        for selector in extra_selectors {
            self.register(selector);
        }
    }

    pub fn function(&self, tag: u32) -> &TrackedFunction {
        &self.functions[tag as usize]
    }

    pub fn state(&self, tag: u32) -> &TagState {
        &self.states[tag as usize]
    }

    pub fn tag_of(&self, selector: &str) -> Option<u32> {
        self.by_selector.get(selector).copied()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TrackedFunction, &TagState)> {
        self.functions.iter().zip(self.states.iter())
    }
}

impl Default for TagRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gc_is_always_tag_zero() {
        let reg = TagRegistry::new();
        assert_eq!(reg.tag_of("GC"), Some(0));
    }

    #[test]
    fn registering_same_selector_twice_is_idempotent() {
        let mut reg = TagRegistry::new();
        let a = reg.register("torch@autograd@backward");
        let b = reg.register("torch@autograd@backward");
        assert_eq!(a, b);
        assert_eq!(reg.len(), 2); // GC + this one selector
    }

    #[test]
    fn default_registration_includes_the_literal_selector_table() {
        let mut reg = TagRegistry::new();
        reg.register_defaults(&["my.module@extra_fn".to_string()]);
        assert!(reg.tag_of("megatron.core.pipeline_parallel@schedules@forward_step").is_some());
        assert!(reg.tag_of("my.module@extra_fn").is_some());
    }
}
