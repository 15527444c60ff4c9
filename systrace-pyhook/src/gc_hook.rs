//! `gc.callbacks` entry reporting GC start/stop into the profiler, replacing
//! the original's custom `GcCallbackType` `PyTypeObject` with a plain
//! `#[pyclass]` implementing `__call__`.

use pyo3::prelude::*;
use pyo3::types::{PyDict, PyModule};
use std::sync::Arc;

use systrace_core::profile_engine::Profiler;

#[pyclass]
pub struct GcCallback {
    profiler: Arc<Profiler>,
}

impl GcCallback {
    pub fn new(profiler: Arc<Profiler>) -> Self {
        Self { profiler }
    }
}

#[pymethods]
impl GcCallback {
    /// Python calls `callback(phase, info)` for every `gc.collect()` cycle;
    /// `info` carries `collected`/`uncollectable` only on `"stop"`.
    fn __call__(&self, phase: &str, info: &Bound<'_, PyDict>) {
        match phase {
            "start" => self.profiler.on_gc_start(),
            "stop" => {
                let collected = info
                    .get_item("collected")
                    .ok()
                    .flatten()
                    .and_then(|v| v.extract::<i32>().ok());
                let uncollectable = info
                    .get_item("uncollectable")
                    .ok()
                    .flatten()
                    .and_then(|v| v.extract::<i32>().ok());
                self.profiler.on_gc_stop(collected, uncollectable);
            }
            _ => {}
        }
    }
}

/// Append a fresh `GcCallback` instance to `gc.callbacks`.
pub fn register(py: Python<'_>, profiler: Arc<Profiler>) -> PyResult<()> {
    let gc = PyModule::import(py, "gc")?;
    let callbacks = gc.getattr("callbacks")?;
    let cb = Py::new(py, GcCallback::new(profiler))?;
    callbacks.call_method1("append", (cb,))?;
    Ok(())
}
