//! Component B — Cross-process Barrier.
//!
//! Rendezvous on a named POSIX shared-memory object among all local ranks.
//! Backed by `nix::sys::mman::shm_open` + `memmap2::MmapMut` rather than a
//! dedicated shared-memory crate, following the same raw `nix` approach the
//! rest of the example pack uses for this kind of segment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use memmap2::MmapMut;
use nix::fcntl::OFlag;
use nix::sys::mman::shm_open;
use nix::sys::stat::Mode;

use systrace_common::{BARRIER_POLL_MICROS, BARRIER_TIMEOUT_SECS};

use crate::error::BarrierError;

const CELL_STRIDE: usize = 8;

/// Named shared-memory rendezvous. One `AtomicBool` cell per rank, 8-byte
/// strided for alignment, per spec.md §3's `ShmBarrier` data model.
pub struct InterProcessBarrier {
    _mmap: MmapMut,
    base: *mut u8,
    world_size: u32,
}

// SAFETY: the mapped region is shared memory; all access goes through
// atomic operations on non-overlapping per-rank cells.
unsafe impl Send for InterProcessBarrier {}
unsafe impl Sync for InterProcessBarrier {}

impl InterProcessBarrier {
    /// Map-or-create the named segment sized for `world_size` rank cells.
    pub fn open(name: &str, job_name: &str, world_size: u32) -> Result<Self, BarrierError> {
        let shm_name = format!("/systrace-barrier-{job_name}-{name}");
        let len = (world_size as usize * CELL_STRIDE).max(4096);

        let fd = shm_open(
            shm_name.as_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| BarrierError::Shm(std::io::Error::from_raw_os_error(e as i32)))?;

        // SAFETY: fd is a freshly opened/created shm object; ftruncate to
        // at least the region we're about to map.
        unsafe {
            libc::ftruncate(std::os::fd::AsRawFd::as_raw_fd(&fd), len as libc::off_t);
        }

        // SAFETY: fd is open, read-write, and sized by the ftruncate above.
        let mmap = unsafe { MmapMut::map_mut(&fd) }.map_err(BarrierError::Shm)?;

        let base = mmap.as_ptr() as *mut u8;
        Ok(Self {
            _mmap: mmap,
            base,
            world_size,
        })
    }

    fn cell(&self, rank: u32) -> &AtomicBool {
        debug_assert!(rank < self.world_size);
        // SAFETY: offset stays within the mapped region sized for
        // `world_size` cells at construction time.
        unsafe { &*(self.base.add(rank as usize * CELL_STRIDE) as *const AtomicBool) }
    }

    /// Reset phase: zero every cell this rank can see. Safe to race with
    /// other ranks doing the same — eventual consistency over "all true"
    /// recovers correctly from a stale region left by an unclean exit.
    pub fn reset_all(&self) {
        for r in 0..self.world_size {
            self.cell(r).store(false, Ordering::SeqCst);
        }
    }

    fn all_true(&self) -> bool {
        (0..self.world_size).all(|r| self.cell(r).load(Ordering::SeqCst))
    }

    /// Spin-poll, each iteration re-setting this rank's cell to true and
    /// recomputing `all_true()`, until every rank's cell is true or the
    /// 30-second timeout elapses.
    ///
    /// The set must happen every iteration, not just once before the loop:
    /// every participant independently calls `reset_all()` before
    /// rendezvousing, so a rank that arrives late can zero a cell this rank
    /// already set. Re-asserting it each pass is what lets the
    /// eventually-consistent recovery spec.md §3/§4.B describes actually
    /// converge instead of spinning to the timeout.
    pub fn rendezvous(&self, rank: u32, name: &str) -> Result<(), BarrierError> {
        let deadline = Instant::now() + Duration::from_secs(BARRIER_TIMEOUT_SECS);
        loop {
            self.cell(rank).store(true, Ordering::SeqCst);
            if self.all_true() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BarrierError::Timeout {
                    name: name.to_string(),
                    secs: BARRIER_TIMEOUT_SECS,
                    world_size: self.world_size,
                });
            }
            std::thread::sleep(Duration::from_micros(BARRIER_POLL_MICROS));
        }
    }
}

/// Convenience entry point matching spec.md §4.B's
/// `barrier(world_size, rank, name) -> ok | timeout` contract.
pub fn barrier(name: &str, job_name: &str, world_size: u32, rank: u32) -> Result<(), BarrierError> {
    let b = InterProcessBarrier::open(name, job_name, world_size)?;
    b.reset_all();
    b.rendezvous(rank, name)
}
