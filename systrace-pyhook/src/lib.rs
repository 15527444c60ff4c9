//! Component D — Interpreter Profiler, realized as a `pyo3` extension
//! module. `import systrace_pyhook` is this profiler's activation path, the
//! Python-side equivalent of the driver interposer's `LD_PRELOAD`: the
//! module-init function below is where
//! `original_source/src/trace/systrace_manager.cc`'s
//! `PyTorchTrace::getInstance()` used to run.

mod gc_hook;
mod selectors;
mod trampoline;

use pyo3::prelude::*;

#[pymodule]
fn systrace_pyhook(py: Python<'_>, m: &Bound<'_, PyModule>) -> PyResult<()> {
    let manager = systrace_core::Manager::get_or_init();
    let profiler = std::sync::Arc::clone(&manager.profiler);

    let table = selectors::build_code_addr_table(py, &profiler);
    trampoline::install(table, profiler.clone());
    trampoline::register_on_all_threads(py);

    if let Err(e) = gc_hook::register(py, profiler) {
        log::warn!("systrace: failed to register gc callback: {e}");
    }

    register_shutdown_hook(py)?;

    m.add("__doc__", "systrace interpreter-level call-site profiler")?;
    Ok(())
}

/// `atexit.register` is the Python-reachable equivalent of `libc::atexit`
/// spec.md §4.J calls for: CPython always runs registered `atexit` hooks
/// before interpreter teardown, which a `cdylib`'s own destructors are not
/// guaranteed to see.
fn register_shutdown_hook(py: Python<'_>) -> PyResult<()> {
    let atexit = py.import("atexit")?;
    let shutdown = pyo3::types::PyCFunction::new_closure(
        py,
        None,
        None,
        |_args, _kwargs| -> PyResult<()> {
            if let Some(manager) = systrace_core::Manager::get() {
                manager.shutdown();
            }
            Ok(())
        },
    )?;
    atexit.call_method1("register", (shutdown,))?;
    Ok(())
}
