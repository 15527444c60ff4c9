//! Component J — Top-level Manager.
//!
//! The single process-wide entry point every embedding surface
//! (`systrace-pyhook`'s `#[pymodule]` init, `systrace-interposer`'s
//! `#[ctor]` constructor) calls into. Owns the init/shutdown ordering spec.md
//! §4.J specifies and is safe to call `get_or_init`/`shutdown` from either
//! surface in either order, since only the first caller of each does
//! anything.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;
use systrace_common::RankCtx;

use crate::dump::{AlwaysTrigger, DumpController, DumpTrigger};
use crate::env::{build_rank_ctx, EnvRegistry};
use crate::profile_engine::Profiler;
use crate::sdk::{ActivityBackend, Ingestor, NullActivityBackend, SdkWriter};
use crate::tag::TagRegistry;

static MANAGER: OnceCell<Manager> = OnceCell::new();

pub struct Manager {
    pub rank_ctx: Arc<RankCtx>,
    pub profiler: Arc<Profiler>,
    pub sdk_writer: Arc<SdkWriter>,
    dump_controller: Mutex<Option<DumpController>>,
    sdk_writer_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Manager {
    /// Idempotent global init, following spec.md §4.J's ordering:
    /// env registration → rank config → logging → tracked-function/pool
    /// registration → SDK ingestor → barrier → Dump Controller thread.
    pub fn get_or_init() -> &'static Manager {
        MANAGER.get_or_init(Self::init)
    }

    /// Returns `None` if `get_or_init` has never been called — callers on
    /// the shutdown path that run before any init (e.g. an `atexit` hook in
    /// a process that never actually loaded a tracked framework) should
    /// treat this as "nothing to do."
    pub fn get() -> Option<&'static Manager> {
        MANAGER.get()
    }

    fn init() -> Manager {
        let env = EnvRegistry::register_all();
        let rank_ctx = Arc::new(build_rank_ctx(&env));

        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_millis()
            .is_test(false)
            .try_init();

        log::info!(
            "{}systrace manager initializing (enable={}, devices={:?})",
            rank_ctx.rank_str(),
            rank_ctx.enable,
            rank_ctx.devices
        );

        let mut registry = TagRegistry::new();
        let extra: Vec<String> = {
            let raw = env.get_string("SYSTRACE_HOST_TRACING_FUNC");
            if raw == "NOT_SET" || raw.is_empty() {
                Vec::new()
            } else {
                raw.split(',').map(|s| s.trim().to_string()).collect()
            }
        };
        registry.register_defaults(&extra);
        let profiler = Arc::new(Profiler::new(registry));

        let metric_path = env.get_string("METRIC_PATH");
        let sdk_writer = SdkWriter::new(&metric_path, rank_ctx.rank as i64, "hccl_activity");
        let sdk_writer_handle = sdk_writer.spawn();

        if rank_ctx.enable {
            if let Err(e) = crate::barrier::barrier(
                "start_work_barrier",
                &rank_ctx.job_name,
                rank_ctx.local_world_size,
                rank_ctx.local_rank,
            ) {
                log::warn!("{}start_work_barrier failed: {e}", rank_ctx.rank_str());
            }
        }

        let logging_dir = env.get_string("SYSTRACE_LOGGING_DIR");
        let out_dir = if logging_dir == "NOT_SET" || logging_dir.is_empty() {
            PathBuf::from(systrace_common::DEFAULT_TRACE_DUMP_PATH)
        } else {
            PathBuf::from(logging_dir)
        };
        let _ = std::fs::create_dir_all(&out_dir);

        let trigger: Arc<dyn DumpTrigger> = Arc::new(AlwaysTrigger);
        let dump_controller = DumpController::spawn(
            profiler.registry_arc(),
            Arc::clone(&rank_ctx),
            out_dir,
            trigger,
        );

        Manager {
            rank_ctx,
            profiler,
            sdk_writer,
            dump_controller: Mutex::new(Some(dump_controller)),
            sdk_writer_handle: Mutex::new(Some(sdk_writer_handle)),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn make_ingestor<B: ActivityBackend>(&self, backend: B) -> Ingestor<B> {
        Ingestor::new(backend, Arc::clone(&self.sdk_writer))
    }

    pub fn make_null_ingestor(&self) -> Ingestor<NullActivityBackend> {
        self.make_ingestor(NullActivityBackend)
    }

    /// Stop Dump Controller → final dump already folded into its `Drop` →
    /// join the SDK writer with a last flush. Safe to call more than once
    /// (from both an `atexit` hook and a `Drop` on whatever owns the
    /// manager's embedding surface) and safe to call concurrently from
    /// multiple threads.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("{}systrace manager shutting down", self.rank_ctx.rank_str());

        if let Some(mut controller) = self.dump_controller.lock().expect("manager mutex poisoned").take() {
            controller.stop();
        }
        if let Some(handle) = self.sdk_writer_handle.lock().expect("manager mutex poisoned").take() {
            self.sdk_writer.stop_and_join(handle);
        }
    }
}
