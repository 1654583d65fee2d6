//! Error types for collective operations.

use thiserror::Error;

use crate::element::DType;

/// Errors that can occur during a collective call.
///
/// Configuration problems are detected before any device work is issued, so
/// a returned error implies no partial side effects. Capability-probe
/// failures are *not* part of this taxonomy: they are recovered internally
/// by routing to the staged-copy fallback path.
#[derive(Error, Debug)]
pub enum CollectiveError {
    /// Element count is not a multiple of the platform vector width.
    #[error("element count {count} is not a multiple of the vector width {width}")]
    UnalignedElementCount { count: usize, width: usize },

    /// More devices than the engine supports.
    #[error("device count {count} exceeds the supported maximum {max}")]
    TooManyDevices { count: usize, max: usize },

    /// A collective call needs at least one participating device.
    #[error("collective call requires at least one device")]
    NoDevices,

    /// Rank table arrays disagree in length.
    #[error("rank table mismatch: {inputs} inputs, {outputs} outputs, {signals} signals")]
    RankTableMismatch {
        inputs: usize,
        outputs: usize,
        signals: usize,
    },

    /// A buffer's element count differs from rank 0's.
    #[error("buffer on rank {rank} has {actual} elements, expected {expected}")]
    ElementCountMismatch {
        rank: usize,
        expected: usize,
        actual: usize,
    },

    /// A buffer's dtype differs from the expected dtype.
    #[error("buffer on rank {rank} has dtype {actual:?}, expected {expected:?}")]
    DTypeMismatch {
        rank: usize,
        expected: DType,
        actual: DType,
    },

    /// Launch tunables that cannot produce a valid grid.
    #[error("invalid launch config: {reason}")]
    InvalidConfig { reason: &'static str },

    /// Input and output for one rank live on different devices.
    #[error("rank {rank}: input is on device {input_device}, output on device {output_device}")]
    DeviceMismatch {
        rank: usize,
        input_device: usize,
        output_device: usize,
    },

    /// Device ordinal outside the mesh.
    #[error("device ordinal {device} out of range (mesh has {num_devices} devices)")]
    InvalidDevice { device: usize, num_devices: usize },

    /// The staged-copy fallback cannot fuse a per-element transform.
    #[error("epilogue transforms cannot be fused with the staged-copy fallback path")]
    EpilogueWithFallback,

    /// Signal allocation cannot hold the two-stage partial sums.
    #[error("signal on rank {rank} holds {actual} scratch bytes, two-stage path needs {required}")]
    SignalScratchTooSmall {
        rank: usize,
        required: usize,
        actual: usize,
    },

    /// Tensor adapter failure.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Tensor dtype with no engine equivalent.
    #[error("unsupported tensor dtype {0:?}")]
    UnsupportedDType(candle_core::DType),
}

pub type Result<T> = std::result::Result<T, CollectiveError>;
