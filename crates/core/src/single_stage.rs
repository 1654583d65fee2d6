//! Latency-optimized single-stage reduction kernel.
//!
//! Every rank reads all peers' inputs directly over the interconnect and
//! writes the full reduced result to its own output in one pass. The
//! payload crosses the interconnect N times per device, which is wasteful
//! for large tensors but unbeatable on latency for small ones: there is no
//! intermediate hand-off, only an opening and closing barrier.

use crate::dispatch::P2pArgs;
use crate::element::{Element, MAX_VECTOR_LANES};
use crate::runtime::launch_grid;
use crate::signal::barrier;

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
    let out = args.outputs[rank];

    barrier(args.signals, rank, block, false);

    for lane in 0..args.block_size {
        let tid = block * args.block_size + lane;
        let mut v = tid;
        while v < num_vectors {
            let base = v * w;

            // Issue peer loads in rotated order (rank, rank+1, ...) so the
            // N concurrent kernels spread interconnect traffic round-robin
            // instead of all hammering rank 0 first. Accumulation then
            // walks rank order, so every device sums in the same order and
            // all outputs are bit-identical.
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
                let idx = base + e;
                let val = match args.epilogue {
                    Some(f) => f(rank, idx, acc),
                    None => acc,
                };
                unsafe { *out.0.add(idx) = T::from_accum(val) };
            }

            v += total_threads;
        }
    }

    // No fence: the result is local to this rank and peers never read it.
    barrier(args.signals, rank, block, false);
}
