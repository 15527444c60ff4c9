//! Resolves `mod.sub@Class@method` / `mod.sub@function` selectors to the
//! underlying `PyCodeObject` identity CPython's profile callback reports,
//! following `__wrapped__` chains the way
//! `original_source/src/trace/python/pytorch_tracing.c`'s
//! `runPyTorchCodeGetAddress()` does.

use std::collections::HashMap;

use pyo3::prelude::*;
use pyo3::types::PyModule;

use systrace_core::profile_engine::Profiler;

/// Code-object pointer (as `usize`) → tag, built once at registration and
/// read lock-free from the profile trampoline afterward.
pub type CodeAddrTable = HashMap<usize, u32>;

/// Walk every registered selector except the reserved `"GC"` entry, import
/// its module, resolve the attribute chain, unwrap any `functools.wraps`
/// decoration, and record its `__code__` object's address.
pub fn build_code_addr_table(py: Python<'_>, profiler: &Profiler) -> CodeAddrTable {
    let mut table = CodeAddrTable::new();
    for (func, _state) in profiler.registry().iter() {
        if func.selector == "GC" {
            continue;
        }
        match resolve_one(py, &func.selector) {
            Ok(addr) => {
                table.insert(addr, func.tag);
            }
            Err(e) => {
                log::warn!(
                    "systrace: could not resolve tracked selector '{}': {e}",
                    func.selector
                );
            }
        }
    }
    table
}

/// `mod.sub@Class@method` and `mod.sub@function` both split on `@`: the
/// first segment is always the importable module path, and every segment
/// after it is a chained `getattr`.
fn resolve_one(py: Python<'_>, selector: &str) -> PyResult<usize> {
    let mut parts = selector.split('@');
    let module_path = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| pyo3::exceptions::PyValueError::new_err("empty selector"))?;

    let module = PyModule::import(py, module_path)?;
    let mut obj: Bound<'_, PyAny> = module.into_any();
    for attr in parts {
        obj = obj.getattr(attr)?;
    }

    obj = unwrap_decorators(obj)?;
    let code = obj.getattr("__code__")?;
    Ok(code.as_ptr() as usize)
}

/// Follow `__wrapped__` (the `functools.wraps` convention) until it bottoms
/// out, so a selector pointed at a decorated function still resolves to the
/// code object CPython's profiler actually reports calls against.
fn unwrap_decorators(mut obj: Bound<'_, PyAny>) -> PyResult<Bound<'_, PyAny>> {
    while let Ok(inner) = obj.getattr("__wrapped__") {
        obj = inner;
    }
    Ok(obj)
}
