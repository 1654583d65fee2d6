//! Staged-copy reduction for meshes without peer access.
//!
//! Each rank's result is built serially: seed the output from source rank
//! 0, then stage every remaining source into a local scratch buffer and
//! accumulate it with an elementwise-add kernel. O(N²) copies and launches,
//! but no kernel ever dereferences remote memory. Every rank applies the
//! additions in the same rank order, so outputs stay bit-identical across
//! ranks. This path exists as a portability guarantee and doubles as the
//! correctness reference for the P2P kernels.

use crate::config::CollectiveConfig;
use crate::element::Element;
use crate::error::Result;
use crate::runtime::{launch_local, ConstPtr, DeviceBuffer, DeviceMesh, MutPtr};

pub(crate) fn run<T: Element>(
    mesh: &DeviceMesh,
    inputs: &[DeviceBuffer<T>],
    outputs: &mut [DeviceBuffer<T>],
    config: &CollectiveConfig,
) -> Result<()> {
    let n = inputs.len();
    let num_elements = inputs[0].len();
    let grid = config.grid_for(num_elements / T::DTYPE.vector_width());

    for rank in 0..n {
        let device = outputs[rank].device();

        mesh.copy_device_to_device(&inputs[0], &mut outputs[rank])?;
        if n == 1 {
            continue;
        }

        let mut scratch = DeviceBuffer::<T>::zeros(mesh, device, num_elements)?;
        for src_rank in 1..n {
            let src = if inputs[src_rank].device() == device {
                // Local source, no staging needed.
                inputs[src_rank].as_ptr()
            } else {
                mesh.copy_device_to_device(&inputs[src_rank], &mut scratch)?;
                scratch.as_ptr()
            };
            accumulate(
                outputs[rank].as_mut_ptr(),
                src,
                num_elements,
                grid,
                config.block_size,
            );
        }
    }
    Ok(())
}

/// Elementwise `out[i] += src[i]` on one device, widened accumulation.
fn accumulate<T: Element>(
    out: MutPtr<T>,
    src: ConstPtr<T>,
    num_elements: usize,
    grid: usize,
    block_size: usize,
) {
    let total_threads = grid * block_size;
    launch_local(grid, |block| {
        // Capture the pointer wrappers whole; closures must not pull out
        // the raw fields or the Send/Sync impls stop applying.
        let (out, src) = (out, src);
        for lane in 0..block_size {
            let tid = block * block_size + lane;
            let mut i = tid;
            while i < num_elements {
                unsafe {
                    let sum = (*out.0.add(i)).to_accum() + (*src.0.add(i)).to_accum();
                    *out.0.add(i) = T::from_accum(sum);
                }
                i += total_threads;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_adds_elementwise() {
        let mesh = DeviceMesh::new(1);
        let mut out = DeviceBuffer::from_slice(&mesh, 0, &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let src = DeviceBuffer::from_slice(&mesh, 0, &[10.0f32, 20.0, 30.0, 40.0]).unwrap();
        accumulate(out.as_mut_ptr(), src.as_ptr(), 4, 2, 2);
        assert_eq!(out.to_vec(), vec![11.0, 22.0, 33.0, 44.0]);
    }
}
