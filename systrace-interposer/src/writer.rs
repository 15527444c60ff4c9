//! Per-rank `mem_trace_*.pb` file writer.
//!
//! Grounded in `cann_hook.c`'s `write_protobuf_to_file()`: one
//! process-wide file lock guards the file, acquired with a try-lock on the
//! hot batching path (`maybe_flush`) so a contended writer never stalls an
//! allocation call, and with a blocking lock on the thread-exit path
//! (`flush_blocking`) where the thread is already tearing down and a short
//! wait costs nothing. Like the original, the file lives in the process's
//! current working directory — `get_log_filename()` never joins a
//! directory onto its buffer either.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use prost::Message;
use systrace_common::{mem_trace_filename, wire, Frame, MemEvent, StageType};

static FILE_LOCK: Mutex<()> = Mutex::new(());

fn current_rank() -> u32 {
    systrace_core::Manager::get()
        .map(|m| m.rank_ctx.rank)
        .unwrap_or(0)
}

fn current_filename() -> String {
    mem_trace_filename(chrono::Local::now(), std::process::id(), current_rank())
}

fn frame_to_wire(frame: &Frame) -> wire::FrameMsg {
    wire::FrameMsg {
        addr: frame.addr,
        so_name: frame.so_name.clone(),
    }
}

fn event_to_wire(event: &MemEvent) -> wire::MemEventMsg {
    let kind = match event {
        MemEvent::Alloc {
            ptr,
            size,
            stage_id,
            stage_type,
            stack,
        } => wire::mem_event_msg::Kind::Alloc(wire::AllocMsg {
            ptr: *ptr,
            size: *size,
            stage_id: *stage_id,
            stage_type: stage_type_name(*stage_type),
            stack: stack.iter().map(frame_to_wire).collect(),
        }),
        MemEvent::Free { ptr } => wire::mem_event_msg::Kind::Free(wire::FreeMsg { ptr: *ptr }),
    };
    wire::MemEventMsg { kind: Some(kind) }
}

fn stage_type_name(stage_type: StageType) -> String {
    stage_type.name().to_string()
}

fn write_frame_to(path: &Path, events: &[MemEvent]) -> io::Result<()> {
    let frame = wire::ProcMemFrame {
        events: events.iter().map(event_to_wire).collect(),
    };
    let mut buf = Vec::with_capacity(frame.encoded_len() + 4);
    buf.extend_from_slice(&(frame.encoded_len() as u32).to_le_bytes());
    frame.encode(&mut buf).expect("buffer reserved above");

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&buf)
}

fn write_frame(events: &[MemEvent]) -> io::Result<()> {
    write_frame_to(Path::new(&current_filename()), events)
}

/// Try to flush `events` now. Returns `true` on a successful write (the
/// caller's batch can be cleared), `false` if the file lock was contended
/// (the caller should leave its batch intact and retry on the next push).
pub fn maybe_flush(events: &[MemEvent]) -> bool {
    if events.is_empty() {
        return true;
    }
    match FILE_LOCK.try_lock() {
        Ok(_guard) => {
            if let Err(e) = write_frame(events) {
                log::error!("systrace-interposer: failed to write mem_trace file: {e}");
            }
            true
        }
        Err(_) => {
            log::debug!(
                "systrace-interposer: mem_trace file lock contended, deferring {} events",
                events.len()
            );
            false
        }
    }
}

/// Flush unconditionally, blocking briefly for the file lock. Only called
/// from a thread's `Drop` on exit, where a short wait is acceptable since
/// nothing else on that thread is running concurrently with it.
pub fn flush_blocking(events: Vec<MemEvent>) {
    if events.is_empty() {
        return;
    }
    let _guard = FILE_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Err(e) = write_frame(&events) {
        log::error!("systrace-interposer: failed to write mem_trace file on thread exit: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maybe_flush_of_empty_events_is_a_trivial_success() {
        assert!(maybe_flush(&[]));
    }

    #[test]
    fn event_to_wire_round_trips_alloc_fields() {
        let event = MemEvent::Alloc {
            ptr: 0x1000,
            size: 256,
            stage_id: 3,
            stage_type: StageType::Forward,
            stack: vec![Frame {
                addr: 0x2000,
                so_name: "libascend_hal.so".to_string(),
            }],
        };
        let wire_event = event_to_wire(&event);
        match wire_event.kind.unwrap() {
            wire::mem_event_msg::Kind::Alloc(alloc) => {
                assert_eq!(alloc.ptr, 0x1000);
                assert_eq!(alloc.size, 256);
                assert_eq!(alloc.stage_type, "Forward");
                assert_eq!(alloc.stack.len(), 1);
                assert_eq!(alloc.stack[0].so_name, "libascend_hal.so");
            }
            other => panic!("expected Alloc, got {other:?}"),
        }
    }

    #[test]
    fn event_to_wire_round_trips_free_fields() {
        let event = MemEvent::Free { ptr: 0x3000 };
        let wire_event = event_to_wire(&event);
        match wire_event.kind.unwrap() {
            wire::mem_event_msg::Kind::Free(free) => assert_eq!(free.ptr, 0x3000),
            other => panic!("expected Free, got {other:?}"),
        }
    }

    #[test]
    fn write_frame_to_appends_a_length_prefixed_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mem_trace_test.pb");

        let events = vec![MemEvent::Free { ptr: 99 }];
        write_frame_to(&path, &events).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.len() > 4);
        let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let frame = wire::ProcMemFrame::decode(&bytes[4..4 + len]).unwrap();
        assert_eq!(frame.events.len(), 1);
    }

    #[test]
    fn write_frame_to_appends_multiple_records_on_repeated_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mem_trace_test.pb");

        write_frame_to(&path, &[MemEvent::Free { ptr: 1 }]).unwrap();
        write_frame_to(&path, &[MemEvent::Free { ptr: 2 }]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let first_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        assert!(bytes.len() > 4 + first_len + 4);
    }
}
