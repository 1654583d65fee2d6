//! In-process device runtime backing the collective engine.
//!
//! The reduction kernels only need three things from an accelerator runtime:
//! per-device buffer allocation, a driver-level peer-access table, and a
//! `launch(kernel, grid, block)` primitive. This module provides an
//! in-process mesh implementation of that contract: each device is a host
//! memory arena, and a kernel launch runs one OS thread per thread block.
//! Launches for all ranks are issued back-to-back and execute concurrently;
//! the dispatcher joins them before returning, which is the caller-visible
//! synchronize point.
//!
//! Buffers are handed to kernels as raw, unsynchronized-by-default pointers.
//! Safety rests entirely on the engine's handshake discipline: every rank
//! only ever writes its own output buffer and its own signal scratch slot,
//! and cross-rank reads are gated by the counter barrier.

use std::sync::Mutex;

use crate::element::{DType, Element};
use crate::error::{CollectiveError, Result};

// ─── Raw pointer views ───────────────────────────────────────────────────────

/// Read-only device pointer, shareable across kernel threads.
#[derive(Debug)]
pub(crate) struct ConstPtr<T>(pub *const T);

impl<T> Clone for ConstPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for ConstPtr<T> {}

// Kernel threads never write through a ConstPtr; MutPtr writes are
// partitioned per rank by the engine's ownership rules.
unsafe impl<T: Send> Send for ConstPtr<T> {}
unsafe impl<T: Sync> Sync for ConstPtr<T> {}

/// Writable device pointer, shareable across kernel threads.
#[derive(Debug)]
pub(crate) struct MutPtr<T>(pub *mut T);

impl<T> Clone for MutPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for MutPtr<T> {}

unsafe impl<T: Send> Send for MutPtr<T> {}
unsafe impl<T: Sync> Sync for MutPtr<T> {}

// ─── Peer access driver state ────────────────────────────────────────────────

/// Why a pairwise peer-access enable did not take effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PeerAccessError {
    /// The pair was already enabled. Idempotency case, treated as success
    /// by the capability prober.
    AlreadyEnabled,
    /// The interconnect cannot link this pair.
    Unsupported,
}

/// A set of devices plus the driver-level peer-access state between them.
///
/// `DeviceMesh::new` models an interconnect where every pair supports peer
/// access; [`DeviceMesh::without_peer_access`] models one where no pair
/// does, which routes collectives through the staged-copy fallback.
#[derive(Debug)]
pub struct DeviceMesh {
    num_devices: usize,
    p2p_supported: bool,
    // Ordered pairs that have been enabled; survives for the process
    // lifetime of the mesh, so re-probing hits the idempotency path.
    enabled: Mutex<Vec<(usize, usize)>>,
}

impl DeviceMesh {
    /// Create a mesh of `num_devices` fully peer-connected devices.
    pub fn new(num_devices: usize) -> Self {
        Self {
            num_devices,
            p2p_supported: true,
            enabled: Mutex::new(Vec::new()),
        }
    }

    /// Create a mesh whose devices cannot address each other's memory.
    pub fn without_peer_access(num_devices: usize) -> Self {
        Self {
            num_devices,
            p2p_supported: false,
            enabled: Mutex::new(Vec::new()),
        }
    }

    pub fn num_devices(&self) -> usize {
        self.num_devices
    }

    pub(crate) fn check_device(&self, device: usize) -> Result<()> {
        if device >= self.num_devices {
            return Err(CollectiveError::InvalidDevice {
                device,
                num_devices: self.num_devices,
            });
        }
        Ok(())
    }

    /// Whether `from` can directly address `to`'s memory.
    pub(crate) fn can_access_peer(&self, from: usize, to: usize) -> bool {
        from < self.num_devices && to < self.num_devices && (self.p2p_supported || from == to)
    }

    /// Enable direct access from `from` to `to`.
    pub(crate) fn enable_peer_access(
        &self,
        from: usize,
        to: usize,
    ) -> std::result::Result<(), PeerAccessError> {
        if !self.can_access_peer(from, to) {
            return Err(PeerAccessError::Unsupported);
        }
        let mut enabled = self.enabled.lock().expect("peer access table poisoned");
        if enabled.contains(&(from, to)) {
            return Err(PeerAccessError::AlreadyEnabled);
        }
        enabled.push((from, to));
        Ok(())
    }

    /// Stage `src` into `dst` without kernel-side peer access.
    ///
    /// The observable contract is only that the data lands in `dst`'s
    /// device; this runtime moves it with a host-mediated copy.
    pub fn copy_device_to_device<T: Element>(
        &self,
        src: &DeviceBuffer<T>,
        dst: &mut DeviceBuffer<T>,
    ) -> Result<()> {
        self.check_device(src.device())?;
        self.check_device(dst.device())?;
        if src.len() != dst.len() {
            return Err(CollectiveError::ElementCountMismatch {
                rank: dst.device(),
                expected: src.len(),
                actual: dst.len(),
            });
        }
        dst.data.copy_from_slice(&src.data);
        Ok(())
    }
}

// ─── Device buffers ──────────────────────────────────────────────────────────

/// A flat typed buffer resident on one mesh device.
#[derive(Debug)]
pub struct DeviceBuffer<T: Element> {
    device: usize,
    data: Box<[T]>,
}

impl<T: Element> DeviceBuffer<T> {
    /// Allocate a zero-filled buffer of `len` elements on `device`.
    pub fn zeros(mesh: &DeviceMesh, device: usize, len: usize) -> Result<Self> {
        mesh.check_device(device)?;
        Ok(Self {
            device,
            data: vec![T::zero(); len].into_boxed_slice(),
        })
    }

    /// Upload a host slice onto `device`.
    pub fn from_slice(mesh: &DeviceMesh, device: usize, host: &[T]) -> Result<Self> {
        mesh.check_device(device)?;
        Ok(Self {
            device,
            data: host.to_vec().into_boxed_slice(),
        })
    }

    /// Download the buffer contents to the host.
    pub fn to_vec(&self) -> Vec<T> {
        self.data.to_vec()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Ordinal of the owning device.
    pub fn device(&self) -> usize {
        self.device
    }

    pub fn dtype(&self) -> DType {
        T::DTYPE
    }

    pub(crate) fn as_ptr(&self) -> ConstPtr<T> {
        ConstPtr(self.data.as_ptr())
    }

    pub(crate) fn as_mut_ptr(&mut self) -> MutPtr<T> {
        MutPtr(self.data.as_mut_ptr())
    }
}

// ─── Kernel launch ───────────────────────────────────────────────────────────

/// Issue `grid` thread blocks on each of `num_devices` ranks and join them.
///
/// `body(rank, block)` is the kernel entry; one OS thread runs per block and
/// iterates that block's lanes sequentially. Blocks of the same kernel on
/// different ranks execute concurrently, which is what the cross-device
/// barrier relies on.
pub(crate) fn launch_grid<F>(num_devices: usize, grid: usize, body: F)
where
    F: Fn(usize, usize) + Sync,
{
    std::thread::scope(|s| {
        for rank in 0..num_devices {
            for block in 0..grid {
                let body = &body;
                s.spawn(move || body(rank, block));
            }
        }
    });
}

/// Issue `grid` thread blocks on a single rank and join them.
///
/// Used by the fallback path, whose accumulate kernels involve no
/// cross-device handshake.
pub(crate) fn launch_local<F>(grid: usize, body: F)
where
    F: Fn(usize) + Sync,
{
    std::thread::scope(|s| {
        for block in 0..grid {
            let body = &body;
            s.spawn(move || body(block));
        }
    });
}
