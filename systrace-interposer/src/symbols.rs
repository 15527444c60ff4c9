//! Lazy resolution of the driver's original entry points via
//! `dlsym(RTLD_NEXT, ...)`.
//!
//! Grounded in `cann_hook.c`'s `init_mem_trace()`, generalized from its
//! explicit `dlopen("libascend_hal.so", ...)` + `dlsym(hal_lib, ...)` to the
//! loader's *next*-symbol lookup, matching the `LD_PRELOAD` placement
//! contract spec.md §6 actually describes: this library's strong symbols
//! shadow the vendor library's, and `RTLD_NEXT` finds whatever comes after
//! us in the search order, whether that's the real `libascend_hal.so` or
//! another interposer layered on top of it.

use std::ffi::{c_int, c_void, CString};
use std::sync::OnceLock;

pub type HalMemAllocFn =
    unsafe extern "C" fn(*mut *mut c_void, u64, u64) -> c_int;
pub type HalMemFreeFn = unsafe extern "C" fn(*mut c_void) -> c_int;
pub type HalMemCreateFn =
    unsafe extern "C" fn(*mut *mut c_void, usize, *const c_void, u64) -> c_int;
pub type HalMemReleaseFn = unsafe extern "C" fn(*mut c_void) -> c_int;

/// Resolve `name` against `RTLD_NEXT` once, caching the result (including a
/// resolution failure) for the lifetime of the process. A failed resolution
/// disables that wrapper's forwarding but never aborts the process, per
/// spec.md §7 ("failed to resolve driver symbol -> disable that wrapper's
/// functionality; log once; do not abort").
fn resolve(name: &'static str, cache: &OnceLock<Option<usize>>) -> Option<usize> {
    *cache.get_or_init(|| {
        let cname = CString::new(name).expect("symbol name has no interior NUL");
        // SAFETY: RTLD_NEXT is a valid pseudo-handle for dlsym; `cname` is a
        // valid NUL-terminated C string for the duration of the call.
        let ptr = unsafe { libc::dlsym(libc::RTLD_NEXT, cname.as_ptr()) };
        if ptr.is_null() {
            log::warn!("systrace-interposer: could not resolve original symbol '{name}'");
            None
        } else {
            log::debug!("systrace-interposer: resolved '{name}' at {ptr:p}");
            Some(ptr as usize)
        }
    })
}

macro_rules! resolver {
    ($fn_name:ident, $sym:literal, $ty:ty) => {
        pub fn $fn_name() -> Option<$ty> {
            static CACHE: OnceLock<Option<usize>> = OnceLock::new();
            resolve($sym, &CACHE).map(|addr| unsafe { std::mem::transmute::<usize, $ty>(addr) })
        }
    };
}

resolver!(hal_mem_alloc, "halMemAlloc", HalMemAllocFn);
resolver!(hal_mem_free, "halMemFree", HalMemFreeFn);
resolver!(hal_mem_create, "halMemCreate", HalMemCreateFn);
resolver!(hal_mem_release, "halMemRelease", HalMemReleaseFn);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolving_a_symbol_that_does_not_exist_returns_none_not_a_panic() {
        static CACHE: OnceLock<Option<usize>> = OnceLock::new();
        assert!(resolve("systrace_test_symbol_that_will_never_exist_xyz", &CACHE).is_none());
        // Cached: a second lookup doesn't re-resolve and still returns None.
        assert!(resolve("systrace_test_symbol_that_will_never_exist_xyz", &CACHE).is_none());
    }
}
