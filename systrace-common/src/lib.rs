//! Shared wire types and constants for the systrace profiler.
//!
//! This crate plays the role `linnix-ai-ebpf-common` plays in the eBPF
//! workspace it was cloned from: every crate that needs to agree on a byte
//! layout (pool segments, interposer events, the on-disk record schema)
//! depends on this one and nothing upstream of it.

use bytemuck::{Pod, Zeroable};

pub mod wire {
    //! Generated protobuf message types — the length-prefixed, on-disk
    //! record schema referenced throughout the rest of this crate.
    include!(concat!(env!("OUT_DIR"), "/systrace.rs"));
}

/// Number of `TraceEntry` slots per pool segment.
pub const PY_TRACING_BUFFER_SIZE: usize = 512;
/// Maximum call-stack depth captured per entry.
pub const MAX_STACK_DEPTH: usize = 32;
/// Bytes reserved per formatted stack frame (`name@file:line`, NUL padded).
pub const STACK_FRAME_BYTES: usize = 256;

/// Driver-interposer flush thresholds (`cann_hook.c`).
pub const LOG_ITEMS_MIN: usize = 1000;
pub const LOG_INTERVAL_SEC: u64 = 120;

/// Dump Controller poll cadence and trigger-check period.
pub const DUMP_POLL_INTERVAL_MS: u64 = 10;
pub const DEFAULT_TRACE_COUNT: u64 = 1000;

/// Fallback timeline output directory when `SYSTRACE_LOGGING_DIR` is unset.
pub const DEFAULT_TRACE_DUMP_PATH: &str = "/home/timeline";
/// Fallback SDK-writer output directory when `METRIC_PATH` is unset.
pub const DEFAULT_METRIC_PATH: &str = "/var/log";

/// Cross-process barrier timing.
pub const BARRIER_TIMEOUT_SECS: u64 = 30;
pub const BARRIER_POLL_MICROS: u64 = 100;

/// GC is always registered as tag 0.
pub const GC_TAG: u32 = 0;

/// The coarse phase an entry belongs to, used both to pick a Stage Counter
/// increment point (Dataloader) and to label entries at dump time.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StageType {
    #[default]
    Unknown = 0,
    Dataloader = 1,
    Forward = 2,
    Backward = 3,
    Synchronization = 4,
    Gc = 5,
}

impl StageType {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => StageType::Dataloader,
            2 => StageType::Forward,
            3 => StageType::Backward,
            4 => StageType::Synchronization,
            5 => StageType::Gc,
            _ => StageType::Unknown,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Classify a tracked-function selector per the literal mapping table.
    /// `GC` is handled by the caller before this is reached (reserved tag 0).
    pub fn classify(selector: &str) -> Self {
        if selector.ends_with("dataloader@_BaseDataLoaderIter@__next__") {
            StageType::Dataloader
        } else if selector.contains("@npu@synchronize")
            || selector.contains("Event@synchronize")
            || selector.contains("Event@wait")
            || selector.contains("Stream@synchronize")
            || selector.contains("Stream@wait_event")
            || selector.contains("Stream@wait_stream")
        {
            StageType::Synchronization
        } else if selector.ends_with("autograd@backward")
            || selector.ends_with("autograd@grad")
            || selector.ends_with("schedules@backward_step")
        {
            StageType::Backward
        } else if selector.ends_with("schedules@forward_step") {
            StageType::Forward
        } else {
            StageType::Unknown
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StageType::Unknown => "Unknown",
            StageType::Dataloader => "Dataloader",
            StageType::Forward => "Forward",
            StageType::Backward => "Backward",
            StageType::Synchronization => "Synchronization",
            StageType::Gc => "GC",
        }
    }
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum PayloadKind {
    #[default]
    None = 0,
    Gc = 1,
}

/// A single fixed-size capture produced by the Interpreter Profiler or left
/// zeroed by a mis-paired call/return (see `start_us == 0` dump skip rule).
///
/// `#[repr(C)]` + `Pod`/`Zeroable` keep this a plain byte-for-byte layout so
/// whole segments can be memset, copied, and pooled without per-field
/// initialization — the same discipline `SequencedSlot` uses for its ring
/// buffer, just without the cacheline alignment this type doesn't need.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct TraceEntry {
    pub start_us: u64,
    pub end_us: u64,
    pub count: u32,
    pub stage_id: u32,
    /// Raw `StageType` discriminant; see `StageType::from_u32`.
    pub stage_type: u32,
    /// Raw `PayloadKind` discriminant.
    pub payload_kind: u32,
    /// Valid only when `payload_kind == PayloadKind::Gc`; `-1` means absent.
    pub gc_collected: i32,
    pub gc_uncollectable: i32,
    pub stack_depth: u8,
    _pad: [u8; 7],
    /// `stack_depth` leading entries are valid, each NUL-padded UTF-8.
    pub stack_info: [[u8; STACK_FRAME_BYTES]; MAX_STACK_DEPTH],
}

impl TraceEntry {
    pub const fn zeroed() -> Self {
        Self {
            start_us: 0,
            end_us: 0,
            count: 0,
            stage_id: 0,
            stage_type: 0,
            payload_kind: 0,
            gc_collected: -1,
            gc_uncollectable: -1,
            stack_depth: 0,
            _pad: [0; 7],
            stack_info: [[0; STACK_FRAME_BYTES]; MAX_STACK_DEPTH],
        }
    }

    /// A call/return pair that never completed (no return seen) is skipped
    /// at dump time — this is the `start_us == 0` rule from the spec.
    pub fn is_dumpable(&self) -> bool {
        self.start_us != 0 && self.end_us != 0
    }

    pub fn push_frame(&mut self, idx: usize, frame: &str) {
        if idx >= MAX_STACK_DEPTH {
            return;
        }
        let bytes = frame.as_bytes();
        let n = bytes.len().min(STACK_FRAME_BYTES - 1);
        self.stack_info[idx][..n].copy_from_slice(&bytes[..n]);
        self.stack_info[idx][n] = 0;
    }

    pub fn frame_str(&self, idx: usize) -> &str {
        let raw = &self.stack_info[idx];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        std::str::from_utf8(&raw[..end]).unwrap_or("")
    }
}

/// Fixed-capacity recycled buffer of `TraceEntry` slots. Owned exclusively
/// by whoever currently possesses it: a producer (Interpreter Profiler), a
/// `PoolPair` FIFO, or the drainer (Dump Controller) — never two at once.
pub struct TraceSegment {
    pub entries: [TraceEntry; PY_TRACING_BUFFER_SIZE],
    pub cursor: usize,
}

impl TraceSegment {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            entries: [TraceEntry::zeroed(); PY_TRACING_BUFFER_SIZE],
            cursor: 0,
        })
    }

    pub fn is_full(&self) -> bool {
        self.cursor >= PY_TRACING_BUFFER_SIZE
    }

    /// Reset to the empty-pool invariant (`cursor == 0`) for reuse.
    pub fn recycle(&mut self) {
        self.cursor = 0;
    }
}

/// A function/method/`GC` selector resolved once at registration and never
/// mutated afterward; outlives everything else in the process.
#[derive(Debug, Clone)]
pub struct TrackedFunction {
    pub tag: u32,
    pub selector: String,
    pub stage_type: StageType,
    pub is_native: bool,
}

/// Immutable rank identity, produced once by Env & Rank Config (component A)
/// and owned thereafter by the Top-level Manager.
#[derive(Debug, Clone)]
pub struct RankCtx {
    pub rank: u32,
    pub world_size: u32,
    pub local_rank: u32,
    pub local_world_size: u32,
    pub job_name: String,
    pub enable: bool,
    pub debug: bool,
    pub devices: Vec<u32>,
}

impl RankCtx {
    /// Matches the original's `GlobalConfig::rank_str`, used as a log-line
    /// prefix everywhere in the process.
    pub fn rank_str(&self) -> String {
        format!("[RANK {}] ", self.rank)
    }

    /// `NNNNN-MMMMM` filename stem used by the Dump Controller and, with a
    /// different suffix rule, the driver interposer.
    pub fn filename_stem(&self) -> String {
        format!("{:05}-{:05}", self.rank, self.world_size)
    }
}

/// One native call-stack frame captured by the driver interposer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub addr: u64,
    pub so_name: String,
}

/// Driver-interposer event, flushed in per-thread batches.
#[derive(Debug, Clone)]
pub enum MemEvent {
    Alloc {
        ptr: u64,
        size: u64,
        stage_id: u32,
        stage_type: StageType,
        stack: Vec<Frame>,
    },
    Free {
        ptr: u64,
    },
}

/// `mem_trace_<YYYY><MM><DD>_<HH>_<pid>_rank<R>.pb`, matching
/// `cann_hook.c`'s `get_log_filename()` exactly (including its choice of
/// local-time hour granularity, not UTC).
pub fn mem_trace_filename(now: chrono::DateTime<chrono::Local>, pid: u32, rank: u32) -> String {
    use chrono::{Datelike, Timelike};
    format!(
        "mem_trace_{:04}{:02}{:02}_{:02}_{}_rank{}.pb",
        now.year(),
        now.month(),
        now.day(),
        now.hour(),
        pid,
        rank
    )
}

/// Source timeline an SDK marker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerSource {
    Host,
    Device,
}

/// A vendor-SDK activity-buffer marker record, forwarded by the Ingestor
/// (component G) to the SDK Writer (component H).
#[derive(Debug, Clone)]
pub struct MarkerEvent {
    pub kind: String,
    pub mode: String,
    pub source: MarkerSource,
    pub timestamp_ns: u64,
    pub id: u64,
    pub pid_or_device: u64,
    pub tid_or_stream: u64,
    pub name: String,
}

impl MarkerEvent {
    /// Commas inside `name` are rewritten to `!` before CSV emission
    /// (`replaceCommasWithExclamation`).
    pub fn csv_safe_name(&self) -> String {
        self.name.replace(',', "!")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_entry_is_pod_sized() {
        assert_eq!(
            std::mem::size_of::<TraceEntry>(),
            8 + 8 + 4 + 4 + 4 + 4 + 4 + 4 + 1 + 7 + MAX_STACK_DEPTH * STACK_FRAME_BYTES
        );
    }

    #[test]
    fn segment_starts_empty_and_fills() {
        let mut seg = TraceSegment::new();
        assert_eq!(seg.cursor, 0);
        assert!(!seg.is_full());
        seg.cursor = PY_TRACING_BUFFER_SIZE;
        assert!(seg.is_full());
        seg.recycle();
        assert_eq!(seg.cursor, 0);
    }

    #[test]
    fn entry_skip_rule_on_mispaired_events() {
        let e = TraceEntry::zeroed();
        assert!(!e.is_dumpable());
    }

    #[test]
    fn stage_type_classification_matches_literal_table() {
        assert_eq!(
            StageType::classify("torch.utils.data.dataloader@_BaseDataLoaderIter@__next__"),
            StageType::Dataloader
        );
        assert_eq!(
            StageType::classify("megatron.core.pipeline_parallel@schedules@forward_step"),
            StageType::Forward
        );
        assert_eq!(
            StageType::classify("megatron.core.pipeline_parallel@schedules@backward_step"),
            StageType::Backward
        );
        assert_eq!(StageType::classify("torch@autograd@backward"), StageType::Backward);
        assert_eq!(
            StageType::classify("torch_npu.npu@Stream@wait_event"),
            StageType::Synchronization
        );
        assert_eq!(StageType::classify("some.other@thing"), StageType::Unknown);
    }

    #[test]
    fn push_and_read_back_frame() {
        let mut e = TraceEntry::zeroed();
        e.push_frame(0, "forward_step@megatron/core.py:42");
        assert_eq!(e.frame_str(0), "forward_step@megatron/core.py:42");
    }

    #[test]
    fn marker_event_escapes_commas() {
        let m = MarkerEvent {
            kind: "marker".into(),
            mode: "instant".into(),
            source: MarkerSource::Host,
            timestamp_ns: 0,
            id: 1,
            pid_or_device: 1,
            tid_or_stream: 1,
            name: "allreduce, stage=1".into(),
        };
        assert_eq!(m.csv_safe_name(), "allreduce! stage=1");
    }

    #[test]
    fn mem_trace_filename_matches_the_original_format() {
        use chrono::TimeZone;
        let ts = chrono::Local.with_ymd_and_hms(2026, 7, 27, 14, 0, 0).unwrap();
        assert_eq!(
            mem_trace_filename(ts, 4242, 3),
            "mem_trace_20260727_14_4242_rank3.pb"
        );
    }
}
