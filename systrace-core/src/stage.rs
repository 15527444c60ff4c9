//! Component E — Stage Counter.
//!
//! A single process-global monotone counter, incremented only on Dataloader
//! entry, plus the current-stage mirror that the Driver Interposer reads at
//! allocation time. Both D and F read the same counter so events from
//! different sources can be joined on `stage_id`.

use std::sync::atomic::{AtomicU32, Ordering};

use systrace_common::StageType;

pub struct StageCounter {
    counter: AtomicU32,
    current: AtomicU32,
}

impl StageCounter {
    pub const fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
            current: AtomicU32::new(StageType::Unknown as u32),
        }
    }

    /// Called exclusively on Dataloader call-entry.
    pub fn advance(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_stage_id(&self) -> u32 {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn set_current_stage_type(&self, stage_type: StageType) {
        self.current.store(stage_type.as_u32(), Ordering::SeqCst);
    }

    pub fn current_stage_type(&self) -> StageType {
        StageType::from_u32(self.current.load(Ordering::SeqCst))
    }
}

impl Default for StageCounter {
    fn default() -> Self {
        Self::new()
    }
}
