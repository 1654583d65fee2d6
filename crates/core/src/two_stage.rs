//! Bandwidth-optimized two-stage reduction (reduce-scatter + all-gather).
//!
//! # Algorithm
//!
//! The flat element range is split into N contiguous partitions of vector
//! granularity; rank `r` owns partition `r` and the last rank absorbs the
//! remainder of a non-divisible count.
//!
//! *Stage 1 (reduce-scatter)*: each rank computes the full N-way sum for
//! only its own partition, reading every peer's input directly, and writes
//! the partial sums into the scratch region of its own signal — a location
//! every peer can see. A fenced barrier then guarantees all partials are
//! globally visible.
//!
//! *Stage 2 (all-gather)*: each rank walks all N scratch regions and
//! reconstructs the full result locally, applying the epilogue on the final
//! write. A thread gathers exactly the indices the same thread index
//! produced in Stage 1, so the fence's visibility guarantee applies
//! per-thread, not just per-device.
//!
//! Each element crosses each interconnect link exactly once per stage, the
//! theoretical minimum traffic for an all-reduce; the single-stage kernel
//! by contrast re-reads all N inputs on every rank.

use crate::dispatch::P2pArgs;
use crate::element::{Element, MAX_VECTOR_LANES, VECTOR_BYTES};
use crate::runtime::launch_grid;
use crate::signal::barrier;

/// Vector-granular partition owned by `rank`: `(start, len)` in vectors.
///
/// The last rank absorbs the remainder.
pub(crate) fn partition_span(num_vectors: usize, num_devices: usize, rank: usize) -> (usize, usize) {
    let base = num_vectors / num_devices;
    let start = rank * base;
    let len = if rank == num_devices - 1 {
        num_vectors - start
    } else {
        base
    };
    (start, len)
}

/// Scratch bytes rank `rank` needs for its Stage-1 partial sums.
pub(crate) fn partition_scratch_bytes<T: Element>(
    num_elements: usize,
    num_devices: usize,
    rank: usize,
) -> usize {
    let w = T::DTYPE.vector_width();
    let (_, len) = partition_span(num_elements / w, num_devices, rank);
    len * VECTOR_BYTES
}

pub(crate) fn run<T: Element>(args: &P2pArgs<'_, T>) {
    launch_grid(args.num_devices(), args.grid, |rank, block| {
        block_body(args, rank, block)
    });
}

fn block_body<T: Element>(args: &P2pArgs<'_, T>, rank: usize, block: usize) {
    let n = args.num_devices();
    let w = T::DTYPE.vector_width();
    let num_vectors = args.num_elements / w;
    let total_threads = args.grid * args.block_size;

    let (own_start, own_len) = partition_span(num_vectors, n, rank);
    let own_scratch = args.signals[rank].scratch_ptr::<T>();
    let out = args.outputs[rank];

    barrier(args.signals, rank, block, false);

    // Stage 1: N-way sum of the owned partition, into peer-visible scratch.
    for lane in 0..args.block_size {
        let tid = block * args.block_size + lane;
        let mut v = tid;
        while v < own_len {
            let base = (own_start + v) * w;

            // Rotated load order, rank-ordered accumulation (see the
            // single-stage kernel for the rationale).
            let mut staged = [[0f32; MAX_VECTOR_LANES]; crate::config::MAX_DEVICES];
            for i in 0..n {
                let s = (rank + i) % n;
                let src = args.inputs[s].0;
                for e in 0..w {
                    staged[s][e] = unsafe { (*src.add(base + e)).to_accum() };
                }
            }

            for e in 0..w {
                let mut acc = 0f32;
                for peer in staged.iter().take(n) {
                    acc += peer[e];
                }
                unsafe { *own_scratch.add(v * w + e) = T::from_accum(acc) };
            }

            v += total_threads;
        }
    }

    // The one fenced barrier in the engine: Stage 2 consumes data written
    // by other ranks' threads, so the partials must be ordered before the
    // counters that release the waiters.
    barrier(args.signals, rank, block, true);

    // Stage 2: gather all partitions from the scratch regions.
    for i in 0..n {
        let s = (rank + i) % n;
        let (s_start, s_len) = partition_span(num_vectors, n, s);
        let scratch: *const T = args.signals[s].scratch_ptr::<T>();

        for lane in 0..args.block_size {
            let tid = block * args.block_size + lane;
            let mut v = tid;
            while v < s_len {
                for e in 0..w {
                    let acc = unsafe { (*scratch.add(v * w + e)).to_accum() };
                    let idx = (s_start + v) * w + e;
                    let val = match args.epilogue {
                        Some(f) => f(rank, idx, acc),
                        None => acc,
                    };
                    unsafe { *out.0.add(idx) = T::from_accum(val) };
                }
                v += total_threads;
            }
        }
    }

    barrier(args.signals, rank, block, false);
}
