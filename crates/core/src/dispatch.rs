//! All-reduce entry point and algorithm selection.
//!
//! `all_reduce` validates the rank table eagerly (no partial side effects
//! on error), probes peer access, then routes to one of three closed
//! strategies: the single-stage kernel for small latency-bound payloads,
//! the two-stage kernel for large bandwidth-bound ones, or the staged-copy
//! fallback when the interconnect offers no peer access. A probe failure is
//! recovered by fallback substitution and never surfaced to the caller.

use crate::config::{CollectiveConfig, Strategy, MAX_BLOCKS, MAX_DEVICES};
use crate::element::Element;
use crate::error::{CollectiveError, Result};
use crate::p2p::can_enable_p2p;
use crate::runtime::{launch_local, ConstPtr, DeviceBuffer, DeviceMesh, MutPtr};
use crate::signal::Signal;
use crate::{fallback, single_stage, two_stage};

/// Caller-supplied elementwise transform fused into the final write.
///
/// Called as `f(rank, index, accumulated)`; the return value is cast back
/// to the storage type and written to `rank`'s output at `index`.
pub type Epilogue = dyn Fn(usize, usize, f32) -> f32 + Send + Sync;

/// Shared argument block for the P2P kernels.
pub(crate) struct P2pArgs<'a, T: Element> {
    pub inputs: Vec<ConstPtr<T>>,
    pub outputs: Vec<MutPtr<T>>,
    pub signals: &'a [Signal],
    pub num_elements: usize,
    pub grid: usize,
    pub block_size: usize,
    pub epilogue: Option<&'a Epilogue>,
}

impl<T: Element> P2pArgs<'_, T> {
    pub fn num_devices(&self) -> usize {
        self.inputs.len()
    }
}

/// Resolve the algorithm for a given device count and payload, assuming
/// peer access is available.
///
/// The crossover is inclusive: a payload exactly at the threshold still
/// takes the single-stage kernel. Larger device counts pay more
/// synchronization per byte, so their crossover sits lower.
pub fn select_strategy(
    config: &CollectiveConfig,
    num_devices: usize,
    payload_bytes: usize,
) -> Strategy {
    match config.strategy {
        Strategy::Auto => {
            if payload_bytes <= config.single_stage_threshold(num_devices) {
                Strategy::SingleStage
            } else {
                Strategy::TwoStage
            }
        }
        forced => forced,
    }
}

/// Element-wise sum across all ranks, result delivered to every rank.
///
/// See [`all_reduce_with_config`]; this uses [`CollectiveConfig::default`].
pub fn all_reduce<T: Element>(
    mesh: &DeviceMesh,
    inputs: &[DeviceBuffer<T>],
    outputs: &mut [DeviceBuffer<T>],
    signals: &[Signal],
    epilogue: Option<&Epilogue>,
) -> Result<()> {
    all_reduce_with_config(
        mesh,
        inputs,
        outputs,
        signals,
        epilogue,
        &CollectiveConfig::default(),
    )
}

/// Element-wise sum across all ranks with explicit tunables.
///
/// `inputs[i]`, `outputs[i]` and `signals[i]` form rank `i`'s row of the
/// rank table; all buffers must hold the same element count, which must be
/// a multiple of the dtype's vector width. On success every `outputs[i]`
/// holds the sum of all `inputs[*]`, optionally epilogue-transformed.
///
/// The call issues one kernel launch per rank; the launches execute
/// concurrently and are joined before this function returns.
pub fn all_reduce_with_config<T: Element>(
    mesh: &DeviceMesh,
    inputs: &[DeviceBuffer<T>],
    outputs: &mut [DeviceBuffer<T>],
    signals: &[Signal],
    epilogue: Option<&Epilogue>,
    config: &CollectiveConfig,
) -> Result<()> {
    if config.block_size == 0 {
        return Err(CollectiveError::InvalidConfig {
            reason: "block_size must be at least 1",
        });
    }
    if config.max_blocks == 0 {
        return Err(CollectiveError::InvalidConfig {
            reason: "max_blocks must be at least 1",
        });
    }
    // Signals carry a fixed number of per-block counter slots, so the grid
    // can never exceed MAX_BLOCKS regardless of what the caller asks for.
    let config = &CollectiveConfig {
        max_blocks: config.max_blocks.min(MAX_BLOCKS),
        ..config.clone()
    };

    let n = inputs.len();
    if n == 0 {
        return Err(CollectiveError::NoDevices);
    }
    if n > MAX_DEVICES {
        return Err(CollectiveError::TooManyDevices {
            count: n,
            max: MAX_DEVICES,
        });
    }
    if outputs.len() != n || signals.len() != n {
        return Err(CollectiveError::RankTableMismatch {
            inputs: n,
            outputs: outputs.len(),
            signals: signals.len(),
        });
    }

    let num_elements = inputs[0].len();
    let w = T::DTYPE.vector_width();
    if num_elements % w != 0 {
        return Err(CollectiveError::UnalignedElementCount {
            count: num_elements,
            width: w,
        });
    }
    let mut devices = Vec::with_capacity(n);
    for rank in 0..n {
        if inputs[rank].len() != num_elements {
            return Err(CollectiveError::ElementCountMismatch {
                rank,
                expected: num_elements,
                actual: inputs[rank].len(),
            });
        }
        if outputs[rank].len() != num_elements {
            return Err(CollectiveError::ElementCountMismatch {
                rank,
                expected: num_elements,
                actual: outputs[rank].len(),
            });
        }
        if inputs[rank].device() != outputs[rank].device() {
            return Err(CollectiveError::DeviceMismatch {
                rank,
                input_device: inputs[rank].device(),
                output_device: outputs[rank].device(),
            });
        }
        mesh.check_device(inputs[rank].device())?;
        devices.push(inputs[rank].device());
    }

    if n == 1 {
        return single_device(mesh, &inputs[0], &mut outputs[0], epilogue, config);
    }

    let payload_bytes = num_elements * T::DTYPE.size_in_bytes();

    if !can_enable_p2p(mesh, &devices) {
        if epilogue.is_some() {
            return Err(CollectiveError::EpilogueWithFallback);
        }
        if !matches!(config.strategy, Strategy::Auto | Strategy::Fallback) {
            tracing::warn!(
                strategy = ?config.strategy,
                "forced P2P strategy unavailable without peer access; using fallback"
            );
        }
        tracing::debug!(num_devices = n, payload_bytes, "all_reduce via staged-copy fallback");
        return fallback::run(mesh, inputs, outputs, config);
    }

    let strategy = select_strategy(config, n, payload_bytes);
    if strategy == Strategy::Fallback {
        if epilogue.is_some() {
            return Err(CollectiveError::EpilogueWithFallback);
        }
        tracing::debug!(num_devices = n, payload_bytes, "all_reduce forced to fallback");
        return fallback::run(mesh, inputs, outputs, config);
    }

    if strategy == Strategy::TwoStage {
        for rank in 0..n {
            let required = two_stage::partition_scratch_bytes::<T>(num_elements, n, rank);
            let actual = signals[rank].scratch_bytes();
            if actual < required {
                return Err(CollectiveError::SignalScratchTooSmall {
                    rank,
                    required,
                    actual,
                });
            }
        }
    }

    let grid = config.grid_for(num_elements / w);
    tracing::debug!(
        num_devices = n,
        payload_bytes,
        grid,
        block_size = config.block_size,
        strategy = ?strategy,
        "all_reduce dispatch"
    );

    let args = P2pArgs {
        inputs: inputs.iter().map(|b| b.as_ptr()).collect(),
        outputs: outputs.iter_mut().map(|b| b.as_mut_ptr()).collect(),
        signals,
        num_elements,
        grid,
        block_size: config.block_size,
        epilogue,
    };

    match strategy {
        Strategy::SingleStage => single_stage::run(&args),
        Strategy::TwoStage => two_stage::run(&args),
        Strategy::Auto | Strategy::Fallback => unreachable!("resolved above"),
    }
    Ok(())
}

/// N = 1 degenerates to a copy (plus epilogue); no barrier traffic.
fn single_device<T: Element>(
    mesh: &DeviceMesh,
    input: &DeviceBuffer<T>,
    output: &mut DeviceBuffer<T>,
    epilogue: Option<&Epilogue>,
    config: &CollectiveConfig,
) -> Result<()> {
    match epilogue {
        None => mesh.copy_device_to_device(input, output),
        Some(f) => {
            let num_elements = input.len();
            let grid = config.grid_for(num_elements / T::DTYPE.vector_width());
            let total_threads = grid * config.block_size;
            let src = input.as_ptr();
            let dst = output.as_mut_ptr();
            launch_local(grid, |block| {
                // Capture the pointer wrappers whole; closures must not pull
                // out the raw fields or the Send/Sync impls stop applying.
                let (src, dst) = (src, dst);
                for lane in 0..config.block_size {
                    let tid = block * config.block_size + lane;
                    let mut i = tid;
                    while i < num_elements {
                        unsafe {
                            let acc = (*src.0.add(i)).to_accum();
                            *dst.0.add(i) = T::from_accum(f(0, i, acc));
                        }
                        i += total_threads;
                    }
                }
            });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_picks_single_stage_at_threshold() {
        let cfg = CollectiveConfig::default();
        assert_eq!(
            select_strategy(&cfg, 2, 512 * 1024),
            Strategy::SingleStage
        );
        assert_eq!(select_strategy(&cfg, 2, 512 * 1024 + 16), Strategy::TwoStage);
    }

    #[test]
    fn auto_crossover_moves_down_past_four_devices() {
        let cfg = CollectiveConfig::default();
        assert_eq!(select_strategy(&cfg, 4, 400 * 1024), Strategy::SingleStage);
        assert_eq!(select_strategy(&cfg, 8, 400 * 1024), Strategy::TwoStage);
        assert_eq!(select_strategy(&cfg, 8, 256 * 1024), Strategy::SingleStage);
    }

    #[test]
    fn forced_strategy_wins_over_payload() {
        let cfg = CollectiveConfig::with_strategy(Strategy::TwoStage);
        assert_eq!(select_strategy(&cfg, 2, 16), Strategy::TwoStage);
    }

    #[test]
    fn rejects_unaligned_element_count() {
        let mesh = DeviceMesh::new(2);
        let inputs: Vec<_> = (0..2)
            .map(|d| DeviceBuffer::from_slice(&mesh, d, &[1.0f32; 10]).unwrap())
            .collect();
        let mut outputs: Vec<_> = (0..2)
            .map(|d| DeviceBuffer::zeros(&mesh, d, 10).unwrap())
            .collect();
        let signals: Vec<_> = (0..2).map(|_| Signal::new(0)).collect();

        let err = all_reduce(&mesh, &inputs, &mut outputs, &signals, None).unwrap_err();
        assert!(matches!(
            err,
            CollectiveError::UnalignedElementCount { count: 10, width: 4 }
        ));
    }

    #[test]
    fn rejects_rank_table_mismatch() {
        let mesh = DeviceMesh::new(2);
        let inputs: Vec<_> = (0..2)
            .map(|d| DeviceBuffer::from_slice(&mesh, d, &[1.0f32; 4]).unwrap())
            .collect();
        let mut outputs: Vec<_> = (0..2)
            .map(|d| DeviceBuffer::zeros(&mesh, d, 4).unwrap())
            .collect();
        let signals = vec![Signal::new(0)];

        let err = all_reduce(&mesh, &inputs, &mut outputs, &signals, None).unwrap_err();
        assert!(matches!(err, CollectiveError::RankTableMismatch { .. }));
    }

    #[test]
    fn single_device_applies_epilogue() {
        let mesh = DeviceMesh::new(1);
        let inputs = vec![DeviceBuffer::from_slice(&mesh, 0, &[2.0f32; 8]).unwrap()];
        let mut outputs = vec![DeviceBuffer::zeros(&mesh, 0, 8).unwrap()];
        let signals = vec![Signal::new(0)];

        let double: &Epilogue = &|_rank, _idx, v| v * 2.0;
        all_reduce(&mesh, &inputs, &mut outputs, &signals, Some(double)).unwrap();
        assert_eq!(outputs[0].to_vec(), vec![4.0; 8]);
    }

    #[test]
    fn oversized_max_blocks_is_clamped() {
        let mesh = DeviceMesh::new(2);
        let inputs: Vec<_> = (0..2)
            .map(|d| DeviceBuffer::from_slice(&mesh, d, &vec![(d + 1) as f32; 4096]).unwrap())
            .collect();
        let mut outputs: Vec<_> = (0..2)
            .map(|d| DeviceBuffer::zeros(&mesh, d, 4096).unwrap())
            .collect();
        let signals: Vec<_> = (0..2).map(|_| Signal::new(0)).collect();

        // 1024 vectors over block_size 16 wants 64 blocks; the launch must
        // stay within the signals' per-block counter slots.
        let cfg = CollectiveConfig {
            max_blocks: 64,
            block_size: 16,
            strategy: Strategy::SingleStage,
            ..CollectiveConfig::default()
        };
        all_reduce_with_config(&mesh, &inputs, &mut outputs, &signals, None, &cfg).unwrap();
        for out in &outputs {
            assert_eq!(out.to_vec(), vec![3.0; 4096]);
        }
    }

    #[test]
    fn degenerate_launch_config_rejected() {
        let mesh = DeviceMesh::new(2);
        let inputs: Vec<_> = (0..2)
            .map(|d| DeviceBuffer::from_slice(&mesh, d, &[1.0f32; 8]).unwrap())
            .collect();
        let mut outputs: Vec<_> = (0..2)
            .map(|d| DeviceBuffer::zeros(&mesh, d, 8).unwrap())
            .collect();
        let signals: Vec<_> = (0..2).map(|_| Signal::new(0)).collect();

        for cfg in [
            CollectiveConfig {
                block_size: 0,
                ..CollectiveConfig::default()
            },
            CollectiveConfig {
                max_blocks: 0,
                ..CollectiveConfig::default()
            },
        ] {
            let err = all_reduce_with_config(&mesh, &inputs, &mut outputs, &signals, None, &cfg)
                .unwrap_err();
            assert!(matches!(err, CollectiveError::InvalidConfig { .. }));
        }
    }

    #[test]
    fn two_stage_requires_scratch() {
        let mesh = DeviceMesh::new(2);
        let inputs: Vec<_> = (0..2)
            .map(|d| DeviceBuffer::from_slice(&mesh, d, &[1.0f32; 64]).unwrap())
            .collect();
        let mut outputs: Vec<_> = (0..2)
            .map(|d| DeviceBuffer::zeros(&mesh, d, 64).unwrap())
            .collect();
        let signals: Vec<_> = (0..2).map(|_| Signal::new(0)).collect();

        let cfg = CollectiveConfig::with_strategy(Strategy::TwoStage);
        let err = all_reduce_with_config(&mesh, &inputs, &mut outputs, &signals, None, &cfg)
            .unwrap_err();
        assert!(matches!(err, CollectiveError::SignalScratchTooSmall { .. }));
    }
}
