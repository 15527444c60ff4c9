//! Native call-stack capture for allocation events.
//!
//! Replaces `cann_hook.c`'s direct `libunwind` calls
//! (`unw_getcontext`/`unw_init_local`/`unw_step`/`unw_get_reg`) with the
//! `backtrace` crate, capped at [`systrace_common::MAX_STACK_DEPTH`] frames
//! matching spec.md §3's `stack_depth <= 32`. Each frame's containing shared
//! object is resolved the same way `get_so_name()` does it — `dladdr` on the
//! frame's instruction pointer — since `backtrace::Symbol::filename()` reports
//! debug-info source paths, not the containing module, and would answer a
//! different question than "which .so is this address in."

use systrace_common::{Frame, MAX_STACK_DEPTH};

/// Walk the current native call stack up to `MAX_STACK_DEPTH` frames,
/// capturing each frame's instruction-pointer address and the short name of
/// the containing shared object (`unknown` if it cannot be resolved, same
/// fallback `get_so_name()` uses).
pub fn capture() -> Vec<Frame> {
    let mut frames = Vec::with_capacity(MAX_STACK_DEPTH);
    backtrace::trace(|frame| {
        let addr = frame.ip() as u64;
        let so_name = so_name_for(addr);
        frames.push(Frame { addr, so_name });
        frames.len() < MAX_STACK_DEPTH
    });
    frames
}

fn so_name_for(addr: u64) -> String {
    // SAFETY: `dladdr` only reads process-wide loader state and writes into
    // `info`; `addr` need not be a valid pointer to dereference, only a
    // candidate instruction-pointer value, which is exactly what it's for.
    unsafe {
        let mut info: libc::Dl_info = std::mem::zeroed();
        if libc::dladdr(addr as *const std::ffi::c_void, &mut info) == 0 || info.dli_fname.is_null() {
            return "unknown".to_string();
        }
        let path = std::ffi::CStr::from_ptr(info.dli_fname).to_string_lossy();
        std::path::Path::new(path.as_ref())
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_never_exceeds_max_depth() {
        let frames = capture();
        assert!(frames.len() <= MAX_STACK_DEPTH);
    }

    #[test]
    fn capture_produces_at_least_one_frame() {
        // This test function itself is on the stack, so there is always
        // something to report even on platforms with limited unwind info.
        let frames = capture();
        assert!(!frames.is_empty());
    }
}
