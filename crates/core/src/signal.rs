//! Per-device synchronization state and the cross-device barrier.
//!
//! # Protocol
//!
//! Every device owns one [`Signal`]. A barrier round on rank `r`, block `b`
//! walks the participating ranks `t`: it increments its own
//! `self_counter[b][t]` to obtain the round's generation `v`, publishes `v`
//! into rank `t`'s `peer_counter[v & 1][b][r]`, and then spins on its own
//! `peer_counter[v & 1][b][t]` until every peer has published the same
//! generation.
//!
//! The `peer_counter` table exists twice, indexed by the generation's low
//! bit. A peer that has already reached the *second* barrier of a kernel
//! writes into the other parity's table, so it cannot clobber a slot a
//! slower block is still spinning on for the *first* barrier. Counters only
//! ever increase; unsigned wraparound is benign because every rank issues
//! the same sequence of barrier calls, so an equality compare never sees a
//! false "reached" value.
//!
//! With `fence` set, the publish uses release semantics and the spin uses
//! acquire semantics, which extends the barrier into a visibility guarantee
//! for data written before it — required exactly once, at the
//! reduce-scatter/all-gather boundary. Without `fence`, relaxed ordering is
//! enough (the counters themselves are the only communicated data).
//!
//! Each thread block runs as one OS thread that executes its lanes
//! sequentially, so the kernel-local sync points that bracket the handshake
//! on a real accelerator are vacuously satisfied here.

use std::alloc::{self, Layout};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::{MAX_BLOCKS, MAX_DEVICES};
use crate::element::DType;

// ─── Scratch region ──────────────────────────────────────────────────────────

/// Raw byte region trailing the counter tables.
///
/// During the two-stage algorithm every rank writes its own partition's
/// partial sums here and reads every peer's region, so the allocation must
/// be peer-visible. Alignment matches the vector transaction width.
struct ScratchRegion {
    ptr: *mut u8,
    bytes: usize,
}

unsafe impl Send for ScratchRegion {}
unsafe impl Sync for ScratchRegion {}

impl ScratchRegion {
    fn new(bytes: usize) -> Self {
        if bytes == 0 {
            return Self {
                ptr: std::ptr::null_mut(),
                bytes: 0,
            };
        }
        let layout = Layout::from_size_align(bytes, crate::element::VECTOR_BYTES)
            .expect("invalid scratch layout");
        // Zero-initialized, like the counter tables.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            alloc::handle_alloc_error(layout);
        }
        Self { ptr, bytes }
    }
}

impl Drop for ScratchRegion {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            let layout = Layout::from_size_align(self.bytes, crate::element::VECTOR_BYTES)
                .expect("invalid scratch layout");
            unsafe { alloc::dealloc(self.ptr, layout) };
        }
    }
}

// ─── Signal ──────────────────────────────────────────────────────────────────

/// Per-device synchronization state plus the two-stage scratch region.
///
/// Allocated once per device for the lifetime of a communicator,
/// zero-initialized at creation and never reset between calls; the counters
/// increase monotonically call after call.
pub struct Signal {
    self_counter: [[AtomicU32; MAX_DEVICES]; MAX_BLOCKS],
    peer_counter: [[[AtomicU32; MAX_DEVICES]; MAX_BLOCKS]; 2],
    scratch: ScratchRegion,
}

impl Signal {
    /// Create a signal with `scratch_bytes` of trailing scratch.
    ///
    /// Use [`Signal::required_scratch_bytes`] to size the region for a
    /// given payload; signals used only with the single-stage or fallback
    /// paths may pass 0.
    pub fn new(scratch_bytes: usize) -> Self {
        // Array-repeat needs a const item at every nesting level because
        // AtomicU32 is not Copy.
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU32 = AtomicU32::new(0);
        #[allow(clippy::declare_interior_mutable_const)]
        const ROW: [AtomicU32; MAX_DEVICES] = [ZERO; MAX_DEVICES];
        #[allow(clippy::declare_interior_mutable_const)]
        const TABLE: [[AtomicU32; MAX_DEVICES]; MAX_BLOCKS] = [ROW; MAX_BLOCKS];
        Self {
            self_counter: TABLE,
            peer_counter: [TABLE; 2],
            scratch: ScratchRegion::new(scratch_bytes),
        }
    }

    /// Scratch bytes sufficient for any rank's partition of a payload.
    ///
    /// The sum of all partitions is the full payload, so sizing every
    /// rank's region to the payload is a safe upper bound that also admits
    /// remainder absorption by the last rank.
    pub fn required_scratch_bytes(num_elements: usize, dtype: DType) -> usize {
        num_elements * dtype.size_in_bytes()
    }

    pub fn scratch_bytes(&self) -> usize {
        self.scratch.bytes
    }

    /// Typed view of the scratch region.
    ///
    /// Callers uphold the ownership rule: only the owning rank writes, and
    /// peers read only after a fenced barrier.
    pub(crate) fn scratch_ptr<T>(&self) -> *mut T {
        self.scratch.ptr.cast()
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("scratch_bytes", &self.scratch.bytes)
            .finish()
    }
}

// ─── Barrier ─────────────────────────────────────────────────────────────────

/// Block all blocks of the current kernel across all ranks until every rank
/// has reached the same barrier generation.
///
/// `signals` is the rank table (one entry per participating device);
/// `block` identifies the calling thread block. With `fence`, writes issued
/// before this call on any rank are visible to every rank after it returns.
pub(crate) fn barrier(signals: &[Signal], my_rank: usize, block: usize, fence: bool) {
    let n = signals.len();
    debug_assert!(n <= MAX_DEVICES, "barrier over more ranks than supported");
    debug_assert!(block < MAX_BLOCKS, "block index out of signal range");
    debug_assert!(my_rank < n, "rank outside the signal table");

    let me = &signals[my_rank];
    let store_order = if fence {
        Ordering::Release
    } else {
        Ordering::Relaxed
    };
    let load_order = if fence {
        Ordering::Acquire
    } else {
        Ordering::Relaxed
    };

    // Publish this round's generation to every peer first, then wait.
    // Publishing before any wait keeps the handshake deadlock-free when
    // blocks run as preemptible OS threads.
    let mut generation = [0u32; MAX_DEVICES];
    for t in 0..n {
        let v = me.self_counter[block][t]
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        generation[t] = v;
        let parity = (v & 1) as usize;
        signals[t].peer_counter[parity][block][my_rank].store(v, store_order);
    }
    for t in 0..n {
        let v = generation[t];
        let parity = (v & 1) as usize;
        let slot = &me.peer_counter[parity][block][t];
        while slot.load(load_order) != v {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::launch_grid;

    #[test]
    fn required_scratch_matches_payload() {
        assert_eq!(Signal::required_scratch_bytes(1024, DType::F32), 4096);
        assert_eq!(Signal::required_scratch_bytes(1024, DType::F16), 2048);
    }

    #[test]
    fn new_signal_counters_start_at_zero() {
        let sig = Signal::new(0);
        for block in 0..MAX_BLOCKS {
            for t in 0..MAX_DEVICES {
                assert_eq!(sig.self_counter[block][t].load(Ordering::Relaxed), 0);
                assert_eq!(sig.peer_counter[0][block][t].load(Ordering::Relaxed), 0);
                assert_eq!(sig.peer_counter[1][block][t].load(Ordering::Relaxed), 0);
            }
        }
    }

    #[test]
    fn counters_advance_once_per_round() {
        let n = 3;
        let grid = 2;
        let rounds = 50;
        let signals: Vec<Signal> = (0..n).map(|_| Signal::new(0)).collect();

        launch_grid(n, grid, |rank, block| {
            for _ in 0..rounds {
                barrier(&signals, rank, block, false);
            }
        });

        for sig in &signals {
            for block in 0..grid {
                for t in 0..n {
                    assert_eq!(
                        sig.self_counter[block][t].load(Ordering::Relaxed),
                        rounds as u32
                    );
                }
            }
        }
    }

    #[test]
    fn fenced_barrier_publishes_prior_writes() {
        let n = 2;
        let signals: Vec<Signal> = (0..n).map(|_| Signal::new(8)).collect();
        let observed = std::sync::Mutex::new(0.0f64);

        launch_grid(n, 1, |rank, block| {
            if rank == 0 {
                unsafe { *signals[0].scratch_ptr::<f64>() = 42.5 };
            }
            barrier(&signals, rank, block, true);
            if rank == 1 {
                let v = unsafe { *signals[0].scratch_ptr::<f64>() };
                *observed.lock().unwrap() = v;
            }
        });

        assert_eq!(*observed.lock().unwrap(), 42.5);
    }

    #[test]
    fn consecutive_rounds_use_alternating_parity() {
        let signals: Vec<Signal> = (0..2).map(|_| Signal::new(0)).collect();
        launch_grid(2, 1, |rank, block| {
            barrier(&signals, rank, block, false);
            barrier(&signals, rank, block, true);
        });
        // Generation 1 landed in the odd table, generation 2 in the even.
        for sig in &signals {
            for t in 0..2 {
                assert_eq!(sig.peer_counter[1][0][t].load(Ordering::Relaxed), 1);
                assert_eq!(sig.peer_counter[0][0][t].load(Ordering::Relaxed), 2);
            }
        }
    }
}
