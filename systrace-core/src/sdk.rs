//! Components G/H — Accelerator-SDK Ingestor and SDK Writer.
//!
//! The vendor tracing SDK itself is out of scope (spec.md §1 names it as an
//! external collaborator identified only by its contract), so it is modeled
//! here as the [`ActivityBackend`] trait. A real backend would resolve the
//! vendor SDK's subscribe/buffer-callback entry points the same way the
//! driver interposer resolves `libascend_hal.so` (`dlsym`-based lookup) and
//! implement `ActivityBackend` over them, outside this workspace's scope;
//! [`NullActivityBackend`] satisfies the trait for tests and for hosts with
//! no accelerator present.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use systrace_common::MarkerEvent;

/// 1 MiB buffer, 8-byte aligned, matching `MSPTITracker::UserBufferRequest`.
pub const ACTIVITY_BUFFER_SIZE: usize = 1024 * 1024;
pub const ACTIVITY_ALIGN: usize = 8;

/// Buffer-request/complete contract the vendor SDK is expected to drive.
pub trait ActivityBackend: Send + Sync {
    /// Allocate an aligned buffer and report how many records it may hold
    /// (0 lets the SDK decide density, per `UserBufferRequest`).
    fn request_buffer(&self) -> (Vec<u8>, usize) {
        (vec![0u8; ACTIVITY_BUFFER_SIZE], 0)
    }

    /// Iterate the SDK's record stream out of a completed buffer, returning
    /// only `Marker`-kind records (everything else is ignored per
    /// `UserBufferComplete`).
    fn complete_buffer(&self, buf: &[u8], valid_size: usize) -> Vec<MarkerEvent>;
}

/// Backend used when no vendor SDK is linked: always reports an empty
/// buffer, so the Ingestor/Writer pipeline can be built and tested without
/// the real accelerator library present.
pub struct NullActivityBackend;

impl ActivityBackend for NullActivityBackend {
    fn complete_buffer(&self, _buf: &[u8], _valid_size: usize) -> Vec<MarkerEvent> {
        Vec::new()
    }
}

/// Owns the subscribe/buffer-callback lifecycle; forwards completed marker
/// records to the [`SdkWriter`].
pub struct Ingestor<B: ActivityBackend> {
    backend: B,
    writer: Arc<SdkWriter>,
}

impl<B: ActivityBackend> Ingestor<B> {
    pub fn new(backend: B, writer: Arc<SdkWriter>) -> Self {
        Self { backend, writer }
    }

    /// Buffer-request callback: hand the SDK a fresh buffer to fill.
    pub fn request_buffer(&self) -> (Vec<u8>, usize) {
        self.backend.request_buffer()
    }

    /// Buffer-complete callback: drain `Marker` records into the writer's
    /// pending queue, then the caller frees/recycles the buffer.
    pub fn complete_buffer(&self, buf: &[u8], valid_size: usize) {
        for marker in self.backend.complete_buffer(buf, valid_size) {
            self.writer.push(marker);
        }
    }
}

const CSV_HEADER: &str = "kind,mode,timestamp,id,process_id&device_id,thread_id,name\n";

/// Background writer of SDK marker events. A dedicated thread wakes every 5
/// seconds (or on shutdown) and flushes the pending queue under a mutex,
/// matching `MSPTIHcclFileWriter::run()`'s `cv.wait_for(lock, 5s)`.
pub struct SdkWriter {
    pending: Mutex<Vec<MarkerEvent>>,
    cv: Condvar,
    stop: AtomicBool,
    path: PathBuf,
    header_written: AtomicBool,
}

impl SdkWriter {
    /// `METRIC_PATH` env var (default `/var/log`) + rank decide the output
    /// path; extension is a build-time choice (`csv` default feature vs
    /// `json`), resolving spec.md §9's open question as recommended there.
    pub fn new(metric_path: &str, rank: i64, base_name: &str) -> Arc<Self> {
        let ext = Self::extension();
        let path = PathBuf::from(metric_path).join(format!("{base_name}.{ext}.{rank}"));
        Arc::new(Self {
            pending: Mutex::new(Vec::new()),
            cv: Condvar::new(),
            stop: AtomicBool::new(false),
            path,
            header_written: AtomicBool::new(false),
        })
    }

    #[cfg(feature = "json")]
    fn extension() -> &'static str {
        "json"
    }

    #[cfg(not(feature = "json"))]
    fn extension() -> &'static str {
        "csv"
    }

    pub fn push(&self, event: MarkerEvent) {
        self.pending.lock().expect("writer mutex poisoned").push(event);
    }

    /// Spawn the background flush thread; returns the join handle so the
    /// Top-level Manager can join it during an orderly shutdown.
    pub fn spawn(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let this = Arc::clone(self);
        std::thread::Builder::new()
            .name("systrace_sdk_writer".to_string())
            .spawn(move || this.run())
            .expect("spawn systrace_sdk_writer thread")
    }

    fn run(&self) {
        let mut guard = self.pending.lock().expect("writer mutex poisoned");
        loop {
            let (next_guard, _timeout) = self
                .cv
                .wait_timeout(guard, Duration::from_secs(5))
                .expect("writer condvar poisoned");
            guard = next_guard;
            self.flush_locked(&mut guard);
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
        }
    }

    fn flush_locked(&self, pending: &mut Vec<MarkerEvent>) {
        if pending.is_empty() {
            return;
        }
        let is_new = !self.path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&self.path);
        let mut file = match file {
            Ok(f) => f,
            Err(e) => {
                log::error!("sdk writer failed to open {:?}: {e}", self.path);
                return;
            }
        };
        if is_new && !self.header_written.swap(true, Ordering::SeqCst) {
            let _ = file.write_all(CSV_HEADER.as_bytes());
        }
        for event in pending.drain(..) {
            let line = format!(
                "{},{},{},{},{},{},{}\n",
                event.kind,
                event.mode,
                event.timestamp_ns,
                event.id,
                event.pid_or_device,
                event.tid_or_stream,
                event.csv_safe_name()
            );
            if let Err(e) = file.write_all(line.as_bytes()) {
                log::error!("sdk writer failed to write {:?}: {e}", self.path);
                return;
            }
        }
    }

    /// Stop flag + notify + final flush, matching the original's destructor
    /// sequence (`stopWriter()`).
    pub fn stop_and_join(self: &Arc<Self>, handle: std::thread::JoinHandle<()>) {
        self.stop.store(true, Ordering::SeqCst);
        self.cv.notify_all();
        let _ = handle.join();
        let mut guard = self.pending.lock().expect("writer mutex poisoned");
        self.flush_locked(&mut guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use systrace_common::MarkerSource;

    fn sample_marker(name: &str) -> MarkerEvent {
        MarkerEvent {
            kind: "marker".into(),
            mode: "instant".into(),
            source: MarkerSource::Host,
            timestamp_ns: 42,
            id: 1,
            pid_or_device: 100,
            tid_or_stream: 7,
            name: name.into(),
        }
    }

    #[test]
    fn ingestor_forwards_markers_to_writer() {
        struct OneMarkerBackend;
        impl ActivityBackend for OneMarkerBackend {
            fn complete_buffer(&self, _buf: &[u8], _valid_size: usize) -> Vec<MarkerEvent> {
                vec![sample_marker("allreduce")]
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let writer = SdkWriter::new(dir.path().to_str().unwrap(), 0, "hccl_activity");
        let ingestor = Ingestor::new(OneMarkerBackend, Arc::clone(&writer));
        let (buf, max_records) = ingestor.request_buffer();
        assert_eq!(buf.len(), ACTIVITY_BUFFER_SIZE);
        assert_eq!(max_records, 0);
        ingestor.complete_buffer(&buf, 0);
        assert_eq!(writer.pending.lock().unwrap().len(), 1);
    }

    #[test]
    fn writer_flush_writes_header_once_and_escapes_commas() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SdkWriter::new(dir.path().to_str().unwrap(), 0, "hccl_activity");
        writer.push(sample_marker("stage, one"));
        let mut pending = writer.pending.lock().unwrap();
        writer.flush_locked(&mut pending);
        drop(pending);

        let contents = std::fs::read_to_string(&writer.path).unwrap();
        assert!(contents.starts_with(CSV_HEADER));
        assert!(contents.contains("stage! one"));
        assert!(!contents.contains("stage, one"));
    }

    #[test]
    fn null_backend_never_produces_markers() {
        let backend = NullActivityBackend;
        assert!(backend.complete_buffer(&[0u8; 16], 0).is_empty());
    }
}
