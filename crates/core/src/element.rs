//! Scalar element types supported by the reduction engine.
//!
//! Buffers are flat arrays of a storage type; summation always happens in a
//! wider accumulation type (`f32`) so that 16-bit floats do not lose mass
//! when many ranks are added together.

use half::{bf16, f16};

/// Width in bytes of one vectorized memory transaction.
///
/// Every kernel moves data in chunks of this many bytes, so element counts
/// must be a multiple of [`DType::vector_width`].
pub const VECTOR_BYTES: usize = 16;

/// Maximum number of scalar lanes in one vector chunk (16-bit elements).
pub(crate) const MAX_VECTOR_LANES: usize = VECTOR_BYTES / 2;

/// Scalar storage types the engine can reduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    BF16,
    F32,
}

impl DType {
    /// Size of one scalar in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 => 4,
        }
    }

    /// Number of scalars in one vector chunk.
    pub fn vector_width(self) -> usize {
        VECTOR_BYTES / self.size_in_bytes()
    }
}

/// A storage scalar with a widened accumulation representation.
///
/// All arithmetic inside the kernels goes through [`Element::to_accum`] /
/// [`Element::from_accum`]; the storage type only appears at loads and
/// stores.
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;

    fn to_accum(self) -> f32;
    fn from_accum(v: f32) -> Self;
    fn zero() -> Self;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    #[inline]
    fn to_accum(self) -> f32 {
        self
    }

    #[inline]
    fn from_accum(v: f32) -> Self {
        v
    }

    #[inline]
    fn zero() -> Self {
        0.0
    }
}

impl Element for f16 {
    const DTYPE: DType = DType::F16;

    #[inline]
    fn to_accum(self) -> f32 {
        self.to_f32()
    }

    #[inline]
    fn from_accum(v: f32) -> Self {
        f16::from_f32(v)
    }

    #[inline]
    fn zero() -> Self {
        f16::ZERO
    }
}

impl Element for bf16 {
    const DTYPE: DType = DType::BF16;

    #[inline]
    fn to_accum(self) -> f32 {
        self.to_f32()
    }

    #[inline]
    fn from_accum(v: f32) -> Self {
        bf16::from_f32(v)
    }

    #[inline]
    fn zero() -> Self {
        bf16::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_widths() {
        assert_eq!(DType::F32.vector_width(), 4);
        assert_eq!(DType::F16.vector_width(), 8);
        assert_eq!(DType::BF16.vector_width(), 8);
    }

    #[test]
    fn accum_round_trip_f16() {
        let x = f16::from_f32(1.5);
        assert_eq!(f16::from_accum(x.to_accum()), x);
    }

    #[test]
    fn widened_accumulation_keeps_small_addends() {
        // 2048 + 1 is not representable in f16, but the accumulation type
        // carries it until the final cast.
        let a = f16::from_f32(2048.0);
        let b = f16::from_f32(1.0);
        let sum = a.to_accum() + b.to_accum();
        assert_eq!(sum, 2049.0);
    }
}
