//! The C-level profile callback registered via `PyEval_SetProfile`, and the
//! per-thread-state registration loop that installs it everywhere, matching
//! `systrace_register_tracing()`'s walk over `PyThreadState_Next`.

use std::ffi::c_int;
use std::os::raw::c_void;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use pyo3::ffi;
use pyo3::prelude::*;

use systrace_core::profile_engine::Profiler;

use crate::selectors::CodeAddrTable;

static CODE_ADDR_TABLE: OnceCell<CodeAddrTable> = OnceCell::new();
static PROFILER: OnceCell<Arc<Profiler>> = OnceCell::new();

pub fn install(table: CodeAddrTable, profiler: Arc<Profiler>) {
    let _ = CODE_ADDR_TABLE.set(table);
    let _ = PROFILER.set(profiler);
}

/// Register the trampoline on every live thread state, not just the one
/// that imported this module — a training job's dataloader workers and
/// NCCL watchdog threads each carry their own `PyThreadState`.
///
/// `PyEval_SetProfile` only ever affects the *calling* thread's state, so
/// visiting each `ts` via `PyThreadState_Next` is not enough on its own —
/// each one must be swapped in first, matching
/// `systrace_register_tracing()`'s `PyThreadState_Swap(thread_array[i])`
/// before every `PyEval_SetProfile` call, then swapped back to the
/// originating thread state once the walk is done.
pub fn register_on_all_threads(py: Python<'_>) {
    let _ = py;
    unsafe {
        let originating = ffi::PyThreadState_Get();
        let mut ts = ffi::PyInterpreterState_ThreadHead(ffi::PyInterpreterState_Main());
        while !ts.is_null() {
            ffi::PyThreadState_Swap(ts);
            ffi::PyEval_SetProfile(Some(profile_trampoline), std::ptr::null_mut());
            ts = ffi::PyThreadState_Next(ts);
        }
        ffi::PyThreadState_Swap(originating);
    }
}

unsafe extern "C" fn profile_trampoline(
    _obj: *mut ffi::PyObject,
    frame: *mut ffi::PyFrameObject,
    what: c_int,
    _arg: *mut ffi::PyObject,
) -> c_int {
    let Some(profiler) = PROFILER.get() else {
        return 0;
    };
    let Some(table) = CODE_ADDR_TABLE.get() else {
        return 0;
    };

    match what {
        ffi::PyTrace_CALL => {
            let code_addr = unsafe { code_addr_of(frame) };
            if let Some(&tag) = table.get(&code_addr) {
                let frames = unsafe { capture_stack(frame) };
                profiler.on_call(tag, &frames);
            }
        }
        ffi::PyTrace_RETURN => {
            let code_addr = unsafe { code_addr_of(frame) };
            if let Some(&tag) = table.get(&code_addr) {
                profiler.on_return(tag);
            }
        }
        _ => {}
    }
    0
}

unsafe fn code_addr_of(frame: *mut ffi::PyFrameObject) -> usize {
    let code = unsafe { ffi::PyFrame_GetCode(frame) };
    let addr = code as *mut c_void as usize;
    unsafe { ffi::Py_DECREF(code as *mut ffi::PyObject) };
    addr
}

/// Walk `PyFrame_GetBack` up to `MAX_STACK_DEPTH` frames, formatting each as
/// `name@file:line` per spec.md §3's `TraceEntry.stack_info` layout.
///
/// `frame` itself is a borrowed reference (owned by the interpreter's call
/// stack, not by us), but `PyFrame_GetBack` returns a new reference each
/// time it's called, so every frame after the first must be `Py_DECREF`'d
/// once we're done reading it — otherwise every profiled call leaks one
/// frame object per caller on its stack.
unsafe fn capture_stack(frame: *mut ffi::PyFrameObject) -> Vec<String> {
    let mut out = Vec::with_capacity(systrace_common::MAX_STACK_DEPTH);
    let mut current = frame;
    let mut owned = false;
    while !current.is_null() && out.len() < systrace_common::MAX_STACK_DEPTH {
        let code = unsafe { ffi::PyFrame_GetCode(current) };
        let lineno = unsafe { ffi::PyFrame_GetLineNumber(current) };
        let name = unsafe { code_qualname(code) };
        let file = unsafe { code_filename(code) };
        out.push(format!("{name}@{file}:{lineno}"));
        unsafe { ffi::Py_DECREF(code as *mut ffi::PyObject) };

        let back = unsafe { ffi::PyFrame_GetBack(current) };
        if owned {
            unsafe { ffi::Py_DECREF(current as *mut ffi::PyObject) };
        }
        current = back;
        owned = true;
    }
    out
}

unsafe fn code_qualname(code: *mut ffi::PyCodeObject) -> String {
    unsafe { unicode_attr((*code).co_qualname) }
}

unsafe fn code_filename(code: *mut ffi::PyCodeObject) -> String {
    unsafe { unicode_attr((*code).co_filename) }
}

unsafe fn unicode_attr(name_obj: *mut ffi::PyObject) -> String {
    unsafe {
        if name_obj.is_null() {
            return "<unknown>".to_string();
        }
        let mut size: ffi::Py_ssize_t = 0;
        let ptr = ffi::PyUnicode_AsUTF8AndSize(name_obj, &mut size);
        if ptr.is_null() {
            return "<unknown>".to_string();
        }
        let bytes = std::slice::from_raw_parts(ptr as *const u8, size as usize);
        String::from_utf8_lossy(bytes).into_owned()
    }
}
