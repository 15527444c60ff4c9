//! Component F — Driver Interposer, an `LD_PRELOAD`able `cdylib` that
//! shadows four `libascend_hal.so` entry points
//! (`halMemAlloc`/`halMemFree`/`halMemCreate`/`halMemRelease`), forwards to
//! the real driver via [`symbols`], and records every successful
//! allocation/free as a [`systrace_common::MemEvent`] batched per-thread by
//! [`batch`] and flushed to the per-rank `mem_trace_*.pb` file by
//! [`writer`]. Grounded throughout in
//! `examples/original_source/sysTrace/src/cann/cann_hook.c`, generalized
//! from its explicit `dlopen`/pthread-key/global-mutex plumbing to the
//! `dlsym(RTLD_NEXT, ...)`, `thread_local!`, and `Mutex` idioms the rest of
//! this workspace uses.

mod batch;
mod stack;
mod symbols;
mod writer;

use std::ffi::c_void;
use std::os::raw::{c_int, c_ulonglong};

use systrace_common::MemEvent;

/// Runs once, the first time this shared object is loaded (by the dynamic
/// linker's `LD_PRELOAD` processing or an explicit `dlopen`), the same
/// activation point `init_mem_trace()` used lazily on first call — except
/// here it is unconditional and upfront, since a library constructor is the
/// idiomatic Rust equivalent rather than a guarded lazy-init check repeated
/// at the top of every wrapper.
#[ctor::ctor]
fn on_load() {
    let manager = systrace_core::Manager::get_or_init();
    log::info!(
        "{}systrace driver interposer loaded",
        manager.rank_ctx.rank_str()
    );
    unsafe {
        libc::atexit(on_unload);
    }
}

extern "C" fn on_unload() {
    if let Some(manager) = systrace_core::Manager::get() {
        manager.shutdown();
    }
}

fn current_stage() -> (u32, systrace_common::StageType) {
    match systrace_core::Manager::get() {
        Some(manager) => {
            let sc = manager.profiler.stage_counter();
            (sc.current_stage_id(), sc.current_stage_type())
        }
        None => (0, systrace_common::StageType::Unknown),
    }
}

/// # Safety
/// `pp` must be a valid pointer to a `*mut c_void` the driver can write its
/// allocation result into, exactly as the real `halMemAlloc` requires.
#[no_mangle]
pub unsafe extern "C" fn halMemAlloc(
    pp: *mut *mut c_void,
    size: c_ulonglong,
    flag: c_ulonglong,
) -> c_int {
    let Some(orig) = symbols::hal_mem_alloc() else {
        return -1;
    };
    let ret = orig(pp, size, flag);
    if ret == 0 && !pp.is_null() && !(*pp).is_null() {
        record_alloc(*pp as u64, size);
    }
    ret
}

/// # Safety
/// `pp` must be a pointer previously returned by `halMemAlloc`/`halMemCreate`
/// (or null), exactly as the real `halMemFree` requires.
#[no_mangle]
pub unsafe extern "C" fn halMemFree(pp: *mut c_void) -> c_int {
    let Some(orig) = symbols::hal_mem_free() else {
        return -1;
    };
    let ret = orig(pp);
    if ret == 0 && !pp.is_null() {
        record_free(pp as u64);
    }
    ret
}

/// # Safety
/// Same contract as the real `halMemCreate`: `handle` must be writable,
/// `prop` must point to a valid `drv_mem_prop` for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn halMemCreate(
    handle: *mut *mut c_void,
    size: usize,
    prop: *const c_void,
    flag: u64,
) -> c_int {
    let Some(orig) = symbols::hal_mem_create() else {
        return -1;
    };
    let ret = orig(handle, size, prop, flag);
    if ret == 0 && !handle.is_null() && !(*handle).is_null() {
        record_alloc(*handle as u64, size as u64);
    }
    ret
}

/// # Safety
/// `handle` must be a pointer previously returned by `halMemCreate` (or
/// null), exactly as the real `halMemRelease` requires.
#[no_mangle]
pub unsafe extern "C" fn halMemRelease(handle: *mut c_void) -> c_int {
    let Some(orig) = symbols::hal_mem_release() else {
        return -1;
    };
    let ret = orig(handle);
    if ret == 0 && !handle.is_null() {
        record_free(handle as u64);
    }
    ret
}

fn record_alloc(ptr: u64, size: u64) {
    let (stage_id, stage_type) = current_stage();
    batch::push(MemEvent::Alloc {
        ptr,
        size,
        stage_id,
        stage_type,
        stack: stack::capture(),
    });
}

fn record_free(ptr: u64) {
    batch::push(MemEvent::Free { ptr });
}
