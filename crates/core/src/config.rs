//! Engine tunables for the all-reduce dispatcher.
//!
//! The defaults are the empirically chosen values from the reference kernel
//! family: the single-stage algorithm wins while the payload is small enough
//! that per-element synchronization cost dominates, and the crossover point
//! moves down as the device count grows.

use serde::Deserialize;

/// Maximum number of devices one collective call may span.
pub const MAX_DEVICES: usize = 8;

/// Maximum number of thread blocks per device launch.
///
/// This is a compile-time bound because the per-device [`crate::Signal`]
/// counter tables are sized by it.
pub const MAX_BLOCKS: usize = 16;

/// Which reduction algorithm the dispatcher runs.
///
/// `Auto` picks by payload size and device count; the explicit variants
/// exist so correctness tests can force every path against the same input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Select by `(device_count, payload_bytes)`.
    Auto,
    /// One-pass latency-optimized kernel (requires peer access).
    SingleStage,
    /// Reduce-scatter + all-gather (requires peer access).
    TwoStage,
    /// Staged-copy reduction; works without peer access.
    Fallback,
}

/// Tunables for one collective engine instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectiveConfig {
    /// Thread blocks per device launch, capped at [`MAX_BLOCKS`].
    ///
    /// Kept deliberately low so concurrent launches do not oversubscribe
    /// the interconnect.
    pub max_blocks: usize,
    /// Threads per block.
    pub block_size: usize,
    /// Algorithm override; `Auto` in production.
    pub strategy: Strategy,
    /// Largest payload (bytes) the single-stage kernel handles at <= 4 devices.
    pub single_stage_max_bytes_4: usize,
    /// Largest payload (bytes) the single-stage kernel handles at 5..=8 devices.
    pub single_stage_max_bytes_8: usize,
}

impl Default for CollectiveConfig {
    fn default() -> Self {
        Self {
            max_blocks: 4,
            block_size: 256,
            strategy: Strategy::Auto,
            single_stage_max_bytes_4: 512 * 1024,
            single_stage_max_bytes_8: 256 * 1024,
        }
    }
}

impl CollectiveConfig {
    /// Create a config with an explicit strategy override.
    pub fn with_strategy(strategy: Strategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    /// Single-stage/two-stage crossover threshold for a given device count.
    pub fn single_stage_threshold(&self, num_devices: usize) -> usize {
        if num_devices <= 4 {
            self.single_stage_max_bytes_4
        } else {
            self.single_stage_max_bytes_8
        }
    }

    /// Grid size for a launch covering `num_vectors` vector chunks.
    pub(crate) fn grid_for(&self, num_vectors: usize) -> usize {
        let wanted = num_vectors.div_ceil(self.block_size).max(1);
        wanted.min(self.max_blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_thresholds() {
        let cfg = CollectiveConfig::default();
        assert_eq!(cfg.single_stage_threshold(2), 512 * 1024);
        assert_eq!(cfg.single_stage_threshold(4), 512 * 1024);
        assert_eq!(cfg.single_stage_threshold(5), 256 * 1024);
        assert_eq!(cfg.single_stage_threshold(8), 256 * 1024);
    }

    #[test]
    fn grid_covers_small_payloads_with_one_block() {
        let cfg = CollectiveConfig::default();
        assert_eq!(cfg.grid_for(1), 1);
        assert_eq!(cfg.grid_for(256), 1);
        assert_eq!(cfg.grid_for(257), 2);
        // Capped at max_blocks for large payloads.
        assert_eq!(cfg.grid_for(1 << 20), cfg.max_blocks);
    }

    #[test]
    fn deserializes_from_json() {
        let cfg: CollectiveConfig = serde_json::from_str(
            r#"{ "max_blocks": 2, "block_size": 64, "strategy": "two_stage" }"#,
        )
        .unwrap();
        assert_eq!(cfg.max_blocks, 2);
        assert_eq!(cfg.block_size, 64);
        assert_eq!(cfg.strategy, Strategy::TwoStage);
        // Unspecified fields keep their defaults.
        assert_eq!(cfg.single_stage_max_bytes_4, 512 * 1024);
    }
}
