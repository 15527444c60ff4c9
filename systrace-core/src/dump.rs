//! Component I — Dump Controller.
//!
//! A single named background thread polls every tracked tag's ready pool and
//! folds whatever it finds into a length-prefixed `TimelineRecord` written to
//! the per-rank timeline file. Trigger policy (when to actually perform a
//! dump versus just drain-and-wait) is pluggable via [`DumpTrigger`], which
//! is how spec.md §9's reset-flag/start-dump relationship question is kept
//! open rather than hard-coded.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use prost::Message;
use systrace_common::{wire, DUMP_POLL_INTERVAL_MS, DEFAULT_TRACE_COUNT, RankCtx};

use crate::tag::TagRegistry;

/// Decides whether the controller should perform a dump on this poll tick.
/// `loop_count` is the 1-based number of poll ticks since the controller
/// started, matching spec.md §4.I's loop ("increment loop_count; if
/// `loop_count % DEFAULT_TRACE_COUNT == 0`, evaluate `should_trigger()`") —
/// cadence is driven by elapsed poll ticks, not by how much data has piled
/// up, per the testable property in spec.md §8 ("exactly 1000 loop
/// iterations must pass between dump attempts under the default").
pub trait DumpTrigger: Send + Sync {
    fn should_dump(&self, loop_count: u64) -> bool;
    /// Called after a dump completes, so stateful triggers (shm switches)
    /// can reset themselves.
    fn on_dumped(&self) {}
}

/// `should_trigger()`'s spec.md §4.I default: fires every
/// [`DEFAULT_TRACE_COUNT`] poll ticks, unconditionally.
pub struct AlwaysTrigger;

impl DumpTrigger for AlwaysTrigger {
    fn should_dump(&self, loop_count: u64) -> bool {
        loop_count % DEFAULT_TRACE_COUNT == 0
    }
}

/// A one-byte shared-memory flag the training harness can flip to request an
/// out-of-band dump ahead of the default cadence. Left open in spec.md §9
/// whether setting the flag also implies a reset of the loop-count cadence,
/// or whether those are independent actuations; this implementation treats
/// them as independent: the flag forces an extra dump on the very next poll
/// tick regardless of `loop_count`, and the controller resets the flag
/// itself immediately after, without disturbing the underlying
/// `loop_count % DEFAULT_TRACE_COUNT` cadence for the *next* scheduled dump.
pub struct ShmSwitch {
    flag: AtomicBool,
}

impl ShmSwitch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            flag: AtomicBool::new(false),
        })
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

impl DumpTrigger for ShmSwitch {
    fn should_dump(&self, loop_count: u64) -> bool {
        self.flag.load(Ordering::SeqCst) || loop_count % DEFAULT_TRACE_COUNT == 0
    }

    fn on_dumped(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct DumpController {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl DumpController {
    /// Spawn the `systrace_poller` thread. `out_dir` should already be the
    /// resolved `SYSTRACE_LOGGING_DIR`-or-default directory.
    pub fn spawn(
        registry: Arc<TagRegistry>,
        rank_ctx: Arc<RankCtx>,
        out_dir: PathBuf,
        trigger: Arc<dyn DumpTrigger>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_in_thread = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("systrace_poller".to_string())
            .spawn(move || poll_loop(registry, rank_ctx, out_dir, trigger, stop_in_thread))
            .expect("spawn systrace_poller thread");
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal the poll loop to exit and perform one final dump, then join.
    /// Idempotent: a second call after the thread has already stopped is a
    /// no-op.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DumpController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(
    registry: Arc<TagRegistry>,
    rank_ctx: Arc<RankCtx>,
    out_dir: PathBuf,
    trigger: Arc<dyn DumpTrigger>,
    stop: Arc<AtomicBool>,
) {
    let mut loop_count: u64 = 0;
    loop {
        std::thread::sleep(Duration::from_millis(DUMP_POLL_INTERVAL_MS));
        loop_count += 1;
        let should_stop = stop.load(Ordering::SeqCst);

        if trigger.should_dump(loop_count) || should_stop {
            dump_once(&registry, &rank_ctx, &out_dir);
            trigger.on_dumped();
        }

        if should_stop {
            break;
        }
    }
}

/// Fold every tag's ready segments, plus whatever sits in the still-filling
/// live segment, into one `TimelineRecord` and append it length-prefixed to
/// `<out_dir>/<rank>-<world_size>.timeline`.
fn dump_once(registry: &TagRegistry, rank_ctx: &RankCtx, out_dir: &Path) {
    let mut entries = Vec::new();

    for (_func, state) in registry.iter() {
        // Ready segments first (oldest data), then the live partial segment
        // (newest), preserving chronological order within a tag.
        state.pool.drain_ready(|seg| {
            for entry in seg.entries.iter() {
                if !entry.is_dumpable() {
                    continue;
                }
                entries.push(to_wire_entry(entry));
            }
        });

        let current = state.take_current();
        for entry in current.entries[..current.cursor].iter() {
            if !entry.is_dumpable() {
                continue;
            }
            entries.push(to_wire_entry(entry));
        }
        state.pool.return_empty(current);
    }

    if entries.is_empty() {
        return;
    }

    // Entries are collected tag-by-tag above (spec.md §4.I's "for each tag"
    // fold), so they arrive grouped by function rather than in wall-clock
    // order across functions. Re-sort into one chronological timeline —
    // what a consumer actually wants, and what the worked end-to-end
    // example (alternating Forward/Backward entries from two distinct
    // tags) expects.
    entries.sort_by_key(|e| e.start_us);

    let record = wire::TimelineRecord {
        rank: rank_ctx.rank,
        world_size: rank_ctx.world_size,
        comm: rank_ctx.job_name.clone(),
        entries,
    };

    let path = out_dir.join(format!("{}.timeline", rank_ctx.filename_stem()));
    if let Err(e) = write_length_prefixed(&path, &record) {
        log::error!("dump controller failed to write {path:?}: {e}");
    }
}

fn to_wire_entry(entry: &systrace_common::TraceEntry) -> wire::TraceEntryMsg {
    use systrace_common::StageType;

    let stage_type = StageType::from_u32(entry.stage_type).name().to_string();
    let stack_frames = (0..entry.stack_depth as usize)
        .map(|i| entry.frame_str(i).to_string())
        .collect();
    let gc_debug = if entry.gc_collected >= 0 || entry.gc_uncollectable >= 0 {
        Some(wire::GcDebug {
            collected: entry.gc_collected,
            uncollectable: entry.gc_uncollectable,
        })
    } else {
        None
    };

    wire::TraceEntryMsg {
        start_us: entry.start_us,
        end_us: entry.end_us,
        // spec.md §4.I step 3c: the emitted `stage_id` is the entry's
        // per-function sequence number (`entry.count`), not the Stage
        // Counter value in `entry.stage_id` — matching
        // `trace->set_stage_id(each_tracing_data->data[i].count)`.
        stage_id: entry.count,
        stage_type,
        stack_frames,
        gc_debug,
    }
}

/// Write the (already length-prefixed-encoded) record, truncating any prior
/// contents: spec.md §6 specifies write/truncate mode, one file per rank per
/// dump, not an accumulating append across dump cycles.
fn write_length_prefixed(path: &Path, record: &wire::TimelineRecord) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(record.encoded_len() + 4);
    buf.extend_from_slice(&(record.encoded_len() as u32).to_le_bytes());
    record.encode(&mut buf).expect("buffer reserved above");

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile_engine::Profiler;

    fn sample_rank_ctx() -> Arc<RankCtx> {
        Arc::new(RankCtx {
            rank: 0,
            world_size: 1,
            local_rank: 0,
            local_world_size: 1,
            job_name: "unit-test-job".to_string(),
            enable: true,
            debug: false,
            devices: vec![0],
        })
    }

    #[test]
    fn always_trigger_fires_only_every_default_trace_count_ticks() {
        let t = AlwaysTrigger;
        for loop_count in 1..DEFAULT_TRACE_COUNT {
            assert!(!t.should_dump(loop_count));
        }
        assert!(t.should_dump(DEFAULT_TRACE_COUNT));
        assert!(!t.should_dump(DEFAULT_TRACE_COUNT + 1));
        assert!(t.should_dump(2 * DEFAULT_TRACE_COUNT));
    }

    #[test]
    fn shm_switch_forces_a_dump_ahead_of_cadence_and_resets_itself() {
        let sw = ShmSwitch::new();
        // loop_count=1 is not a multiple of DEFAULT_TRACE_COUNT, so without
        // the flag set this would not be due yet.
        assert!(!sw.should_dump(1));
        sw.request();
        assert!(sw.should_dump(1));
        sw.on_dumped();
        assert!(!sw.should_dump(1));
    }

    #[test]
    fn dump_once_writes_a_nonempty_length_prefixed_record() {
        let mut registry = TagRegistry::new();
        registry.register("torch@autograd@backward");
        let profiler = Profiler::new(registry);
        let tag = profiler
            .registry()
            .tag_of("torch@autograd@backward")
            .unwrap();
        for _ in 0..systrace_common::PY_TRACING_BUFFER_SIZE {
            profiler.on_call(tag, &["f@g.py:1".to_string()]);
            profiler.on_return(tag);
        }

        let dir = tempfile::tempdir().unwrap();
        let ctx = sample_rank_ctx();
        dump_once(profiler.registry(), &ctx, dir.path());

        let path = dir.path().join(format!("{}.timeline", ctx.filename_stem()));
        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.len() > 4);
        let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let record = wire::TimelineRecord::decode(&bytes[4..4 + len]).unwrap();
        assert_eq!(record.rank, 0);
        assert_eq!(record.entries.len(), systrace_common::PY_TRACING_BUFFER_SIZE);
    }

    #[test]
    fn dump_once_with_no_ready_segments_writes_nothing() {
        let registry = TagRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let ctx = sample_rank_ctx();
        dump_once(&registry, &ctx, dir.path());
        let path = dir.path().join(format!("{}.timeline", ctx.filename_stem()));
        assert!(!path.exists());
    }

    /// A handful of call/return pairs on a tag never fills its 512-slot
    /// segment to the ready pool, so a dump must still pick them up by
    /// swapping out the live partial segment — otherwise a short training
    /// run would never produce a timeline file at all.
    #[test]
    fn dump_once_drains_the_live_partial_segment_too() {
        let mut registry = TagRegistry::new();
        registry.register("megatron.core.pipeline_parallel@schedules@forward_step");
        let profiler = Profiler::new(registry);
        let tag = profiler
            .registry()
            .tag_of("megatron.core.pipeline_parallel@schedules@forward_step")
            .unwrap();
        for _ in 0..3 {
            profiler.on_call(tag, &[]);
            profiler.on_return(tag);
        }

        let dir = tempfile::tempdir().unwrap();
        let ctx = sample_rank_ctx();
        dump_once(profiler.registry(), &ctx, dir.path());

        let path = dir.path().join(format!("{}.timeline", ctx.filename_stem()));
        let bytes = std::fs::read(&path).unwrap();
        let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let record = wire::TimelineRecord::decode(&bytes[4..4 + len]).unwrap();
        assert_eq!(record.entries.len(), 3);
        assert!(record.entries.iter().all(|e| e.stage_type == "Forward"));
    }

    /// End-to-end scenario from spec.md §8: three forward+backward pairs on
    /// two distinct tags fold into one chronologically-ordered timeline,
    /// not grouped by tag. Timestamps are set explicitly (rather than via
    /// real wall-clock calls in a tight loop) so the interleaving this test
    /// checks for doesn't depend on clock resolution.
    #[test]
    fn dump_once_interleaves_entries_from_distinct_tags_chronologically() {
        use systrace_common::StageType;

        let mut registry = TagRegistry::new();
        registry.register("megatron.core.pipeline_parallel@schedules@forward_step");
        registry.register("megatron.core.pipeline_parallel@schedules@backward_step");
        let fwd = registry
            .tag_of("megatron.core.pipeline_parallel@schedules@forward_step")
            .unwrap();
        let bwd = registry
            .tag_of("megatron.core.pipeline_parallel@schedules@backward_step")
            .unwrap();

        // Alternating start_us values: forward at 10,30,50; backward at
        // 20,40,60 — interleaved in wall-clock order across the two tags.
        for (tag, stage, starts) in [
            (fwd, StageType::Forward, [10u64, 30, 50]),
            (bwd, StageType::Backward, [20u64, 40, 60]),
        ] {
            let state = registry.state(tag);
            let mut seg = state.current.lock().unwrap();
            for (i, start) in starts.into_iter().enumerate() {
                seg.entries[i].start_us = start;
                seg.entries[i].end_us = start + 1;
                seg.entries[i].stage_type = stage.as_u32();
            }
            seg.cursor = starts.len();
        }

        let dir = tempfile::tempdir().unwrap();
        let ctx = sample_rank_ctx();
        dump_once(&registry, &ctx, dir.path());

        let path = dir.path().join(format!("{}.timeline", ctx.filename_stem()));
        let bytes = std::fs::read(&path).unwrap();
        let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let record = wire::TimelineRecord::decode(&bytes[4..4 + len]).unwrap();

        assert_eq!(record.entries.len(), 6);
        let stages: Vec<&str> = record.entries.iter().map(|e| e.stage_type.as_str()).collect();
        assert_eq!(
            stages,
            vec!["Forward", "Backward", "Forward", "Backward", "Forward", "Backward"]
        );
        let starts: Vec<u64> = record.entries.iter().map(|e| e.start_us).collect();
        assert_eq!(starts, vec![10, 20, 30, 40, 50, 60]);
    }
}
